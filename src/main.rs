use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use xrf_compositor::compositor::{RenderBackend, cpu::CpuRenderer, gpu};
use xrf_compositor::config::AppConfig;
use xrf_compositor::resources::{DirectoryFetcher, ResourceCache};
use xrf_compositor::viewer::{Viewer, ViewerState};
use xrf_compositor::workspace::WorkspaceConfig;

const RENDER_BACKEND_ENV: &str = "XRF_RENDER_BACKEND";

/// Composites an XRF workspace into a single PNG.
#[derive(Parser, Debug)]
#[command(name = "xrf-compositor", version)]
struct Cli {
    /// Workspace document (JSON).
    #[arg(short, long, value_name = "FILE")]
    workspace: PathBuf,

    /// Viewer state to apply before rendering: selections, lens, group overrides.
    #[arg(short, long, value_name = "FILE")]
    state: Option<PathBuf>,

    /// Output PNG path.
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// Directory that workspace locations are relative to.
    /// Defaults to the config value, then the workspace file's directory.
    #[arg(long, value_name = "DIR")]
    data_root: Option<PathBuf>,

    /// auto, cpu or gpu.
    #[arg(long, value_name = "BACKEND")]
    backend: Option<String>,

    /// Longest output edge in pixels. Defaults to the canvas size.
    #[arg(long, value_name = "PIXELS")]
    long_edge: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderBackendKind {
    Auto,
    Cpu,
    Gpu,
}

fn parse_render_backend(value: &str) -> RenderBackendKind {
    match value.trim().to_ascii_lowercase().as_str() {
        "cpu" => RenderBackendKind::Cpu,
        "gpu" | "wgpu" => RenderBackendKind::Gpu,
        "auto" => RenderBackendKind::Auto,
        other => {
            tracing::warn!(backend = other, "unknown render backend, using auto");
            RenderBackendKind::Auto
        }
    }
}

/// Command line beats the environment, which beats the config file.
fn resolve_render_backend(cli: Option<&str>, env: Option<&str>, config: &AppConfig) -> RenderBackendKind {
    cli.or(env)
        .or(config.render_backend.as_deref())
        .map_or(RenderBackendKind::Auto, parse_render_backend)
}

fn create_backend(kind: RenderBackendKind) -> anyhow::Result<Box<dyn RenderBackend>> {
    let backend: Box<dyn RenderBackend> = match kind {
        RenderBackendKind::Cpu => Box::new(CpuRenderer::new()),
        RenderBackendKind::Gpu => Box::new(
            gpu::GpuRenderer::new().context("gpu backend requested, but no usable adapter was found")?,
        ),
        RenderBackendKind::Auto => match gpu::GpuRenderer::new() {
            Some(renderer) => Box::new(renderer),
            None => {
                gpu::report_fallback_once();
                Box::new(CpuRenderer::new())
            }
        },
    };
    tracing::info!(backend = backend.name(), "render backend selected");
    Ok(backend)
}

fn data_root(cli: &Cli, config: &AppConfig) -> PathBuf {
    cli.data_root
        .clone()
        .or_else(|| config.data_root.clone())
        .or_else(|| {
            cli.workspace
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from("."))
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load();
    let workspace = WorkspaceConfig::read(&cli.workspace)?;
    let env_backend = std::env::var(RENDER_BACKEND_ENV).ok();
    let backend = create_backend(resolve_render_backend(
        cli.backend.as_deref(),
        env_backend.as_deref(),
        &config,
    ))?;

    let root = data_root(&cli, &config);
    tracing::info!(root = %root.display(), "serving workspace data");
    let cache = Arc::new(ResourceCache::new(Arc::new(DirectoryFetcher::new(root))));
    let mut viewer = Viewer::new(&config, cache, backend);
    let timeout = config.load_timeout();

    viewer.load_workspace(&workspace);
    if !viewer.wait_idle(timeout) {
        tracing::warn!("workspace did not finish loading; rendering what is resident");
    }

    if let Some(path) = &cli.state {
        let state = ViewerState::read(path)?;
        viewer.apply_state(&state);
        if !viewer.wait_idle(timeout) {
            tracing::warn!("selection layers did not finish loading");
        }
    }

    let image = viewer.render(cli.long_edge.or(config.output_long_edge))?;
    image
        .save(&cli.output)
        .with_context(|| format!("failed to write {}", cli.output.display()))?;
    tracing::info!(
        output = %cli.output.display(),
        width = image.width(),
        height = image.height(),
        "wrote composite"
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("xrf-compositor: {err:#}");
            ExitCode::FAILURE
        }
    }
}
