//! Layer registration and compositing for XRF image exploration.
//!
//! A [`viewer::Viewer`] loads a workspace into a [`scene::Scene`] of layer
//! groups, registers secondary images onto the base image, maps selections
//! into bitmasks, and composites everything through a
//! [`compositor::RenderBackend`].

pub mod color;
pub mod compositor;
pub mod config;
pub mod geometry;
pub mod layer;
pub mod registering;
pub mod resources;
pub mod scene;
pub mod selection;
pub mod selection_mapper;
pub mod texture;
pub mod viewer;
pub mod workspace;
