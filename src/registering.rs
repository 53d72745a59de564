use std::fmt;

use serde::{Deserialize, Serialize};

use crate::geometry::{Point2D, Size};
use crate::layer::Layer;

/// Pivots smaller than this are treated as a singular system.
const PIVOT_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
/// Row-major 3×3 projective matrix.
pub struct Matrix3(pub [f64; 9]);

impl Matrix3 {
    pub const IDENTITY: Matrix3 = Matrix3([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);

    pub fn is_identity(&self, tolerance: f64) -> bool {
        self.0
            .iter()
            .zip(Self::IDENTITY.0.iter())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }

    /// Maps a point through the matrix with perspective divide.
    /// Returns `None` when the point lands on the line at infinity.
    pub fn transform_point(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let m = &self.0;
        let w = m[6] * x + m[7] * y + m[8];
        if w.abs() < PIVOT_EPS {
            return None;
        }
        Some((
            (m[0] * x + m[1] * y + m[2]) / w,
            (m[3] * x + m[4] * y + m[5]) / w,
        ))
    }

    pub fn inverse(&self) -> Option<Matrix3> {
        let [a, b, c, d, e, f, g, h, i] = self.0;
        let co00 = e * i - f * h;
        let co01 = f * g - d * i;
        let co02 = d * h - e * g;
        let det = a * co00 + b * co01 + c * co02;
        if det.abs() < PIVOT_EPS || !det.is_finite() {
            return None;
        }
        let inv = 1.0 / det;
        Some(Matrix3([
            co00 * inv,
            (c * h - b * i) * inv,
            (b * f - c * e) * inv,
            co01 * inv,
            (a * i - c * g) * inv,
            (c * d - a * f) * inv,
            co02 * inv,
            (b * g - a * h) * inv,
            (a * e - b * d) * inv,
        ]))
    }

    /// Column-major `f32` copy, laid out for a WGSL `mat3x3` split into padded columns.
    pub fn to_padded_columns(&self) -> [[f32; 4]; 3] {
        let m = &self.0;
        [
            [m[0] as f32, m[3] as f32, m[6] as f32, 0.0],
            [m[1] as f32, m[4] as f32, m[7] as f32, 0.0],
            [m[2] as f32, m[5] as f32, m[8] as f32, 0.0],
        ]
    }
}

impl Default for Matrix3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Four point correspondences between the base (target) image and an image
/// that should be registered onto it (moving). Points use a top-left origin.
pub struct RegisteringRecipe {
    pub target: [[f64; 2]; 4],
    pub moving: [[f64; 2]; 4],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_size: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moving_size: Option<Size>,
}

impl RegisteringRecipe {
    /// Recipe used when the real one cannot be fetched. Solves to the identity.
    pub fn fallback() -> Self {
        let corners = [[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0]];
        Self {
            target: corners,
            moving: corners,
            target_size: Some(Size::new(1, 1)),
            moving_size: Some(Size::new(1, 1)),
        }
    }

    pub fn with_sizes(mut self, target: Size, moving: Size) -> Self {
        self.target_size.get_or_insert(target);
        self.moving_size.get_or_insert(moving);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationError {
    /// Target or moving size was never resolved.
    MissingSize,
    /// An image dimension is zero.
    EmptyImage,
    /// Correspondences are collinear or duplicated.
    Degenerate,
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::MissingSize => write!(f, "registering recipe is missing an image size"),
            RegistrationError::EmptyImage => write!(f, "registering recipe has a zero image dimension"),
            RegistrationError::Degenerate => {
                write!(f, "registering correspondences are degenerate")
            }
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Computes the transform from normalized moving coordinates into the target
/// canvas (bottom-left origin) for `recipe`.
pub fn compute_registration(recipe: &RegisteringRecipe) -> Result<Matrix3, RegistrationError> {
    let (Some(target_size), Some(moving_size)) = (recipe.target_size, recipe.moving_size) else {
        return Err(RegistrationError::MissingSize);
    };
    if target_size.is_empty() || moving_size.is_empty() {
        return Err(RegistrationError::EmptyImage);
    }

    let tw = target_size.width as f64;
    let th = target_size.height as f64;
    let mw = moving_size.width as f64;
    let mh = moving_size.height as f64;

    // Both recipes are stored with a top-left origin; the canvas is bottom-left.
    let target = recipe.target.map(|[x, y]| Point2D::new(x, th - y));
    let mut moving = recipe.moving.map(|[x, y]| Point2D::new(x, mh - y));

    let width_scale = tw / mw;
    let height_scale = th / mh;
    let scale = width_scale.min(height_scale);
    if height_scale > width_scale {
        let padding = th - scale * mh;
        for p in &mut moving {
            p.y -= padding;
        }
    }
    for p in &mut moving {
        p.x /= scale;
        p.y /= scale;
    }

    solve_homography(&moving, &target)
}

/// Solves the 8×8 system for the homography taking each `from[i]` onto `to[i]`.
///
/// Uses LU decomposition with partial pivoting. The bottom-right entry is fixed to 1.
pub fn solve_homography(
    from: &[Point2D; 4],
    to: &[Point2D; 4],
) -> Result<Matrix3, RegistrationError> {
    let mut a = [[0.0_f64; 8]; 8];
    let mut b = [0.0_f64; 8];

    for i in 0..4 {
        let Point2D { x: mx, y: my } = from[i];
        let Point2D { x: tx, y: ty } = to[i];
        a[2 * i] = [mx, my, 1.0, 0.0, 0.0, 0.0, -mx * tx, -my * tx];
        b[2 * i] = tx;
        a[2 * i + 1] = [0.0, 0.0, 0.0, mx, my, 1.0, -mx * ty, -my * ty];
        b[2 * i + 1] = ty;
    }

    let perm = lu_decompose(&mut a).ok_or(RegistrationError::Degenerate)?;
    let h = lu_solve(&a, &perm, &b);
    if h.iter().any(|v| !v.is_finite()) {
        return Err(RegistrationError::Degenerate);
    }

    Ok(Matrix3([h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0]))
}

/// In-place Doolittle LU with row pivoting. `a` ends up holding L (strictly
/// below the diagonal, unit diagonal implied) and U. Returns the row permutation.
fn lu_decompose(a: &mut [[f64; 8]; 8]) -> Option<[usize; 8]> {
    let mut perm = [0, 1, 2, 3, 4, 5, 6, 7];

    for col in 0..8 {
        let pivot_row = (col..8)
            .max_by(|&r, &s| a[r][col].abs().total_cmp(&a[s][col].abs()))
            .unwrap_or(col);
        if a[pivot_row][col].abs() < PIVOT_EPS {
            return None;
        }
        if pivot_row != col {
            a.swap(col, pivot_row);
            perm.swap(col, pivot_row);
        }

        let pivot = a[col][col];
        for row in (col + 1)..8 {
            let factor = a[row][col] / pivot;
            a[row][col] = factor;
            for j in (col + 1)..8 {
                a[row][j] -= factor * a[col][j];
            }
        }
    }

    Some(perm)
}

fn lu_solve(lu: &[[f64; 8]; 8], perm: &[usize; 8], b: &[f64; 8]) -> [f64; 8] {
    let mut y = [0.0_f64; 8];
    for i in 0..8 {
        let mut sum = b[perm[i]];
        for j in 0..i {
            sum -= lu[i][j] * y[j];
        }
        y[i] = sum;
    }

    let mut x = [0.0_f64; 8];
    for i in (0..8).rev() {
        let mut sum = y[i];
        for j in (i + 1)..8 {
            sum -= lu[i][j] * x[j];
        }
        x[i] = sum / lu[i][i];
    }
    x
}

/// Sets `layer.transform` from `recipe`. Degenerate or incomplete recipes
/// leave the layer on the identity transform.
pub fn register_layer(layer: &mut Layer, recipe: &RegisteringRecipe) {
    match compute_registration(recipe) {
        Ok(matrix) => {
            tracing::debug!(layer = %layer.id, "registered layer");
            layer.transform = matrix;
        }
        Err(err) => {
            tracing::warn!(layer = %layer.id, error = %err, "registration failed, using identity");
            layer.transform = Matrix3::IDENTITY;
        }
    }
}
