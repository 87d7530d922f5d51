//! Upper bound on the squared norm of the coupled linear operator `K`.
//!
//! `K` maps the primal blocks `(u_c, u_l, v, w)` to the dual blocks
//! `(P, Q, p, r, q, s)`. Each finite-difference block is bounded by
//! `x = 2 * |1 / voxel_ratio|`, which gives a 4x4 coefficient matrix whose
//! squared spectral norm, plus `L` for the replication into the time stack,
//! bounds `|K|^2`.

use crate::error::{TgvError, TgvResult};

const POWER_ITERATIONS: usize = 1000;
const POWER_TOLERANCE: f64 = 1e-15;

fn coupling_matrix(x: f64) -> [[f64; 4]; 4] {
    [
        [0.0, x, 0.0, 1.0],
        [x, x, 1.0, 0.0],
        [0.0, 0.0, 0.0, x],
        [0.0, 0.0, x, 0.0],
    ]
}

/// `M^T M` for a 4x4 matrix.
fn gram(m: &[[f64; 4]; 4]) -> [[f64; 4]; 4] {
    let mut g = [[0.0; 4]; 4];
    for (i, row) in g.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            *value = (0..4).map(|k| m[k][i] * m[k][j]).sum();
        }
    }
    g
}

fn mat_vec(m: &[[f64; 4]; 4], v: &[f64; 4]) -> [f64; 4] {
    let mut out = [0.0; 4];
    for (o, row) in out.iter_mut().zip(m.iter()) {
        *o = row.iter().zip(v.iter()).map(|(a, b)| a * b).sum();
    }
    out
}

/// Largest eigenvalue of `M^T M` by power iteration, i.e. `|M|_2^2`.
fn spectral_norm_squared(m: &[[f64; 4]; 4]) -> f64 {
    let g = gram(m);
    let mut v = [0.5; 4];
    let mut estimate = 0.0;

    for _ in 0..POWER_ITERATIONS {
        let y = mat_vec(&g, &v);
        let norm = y.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm < 1e-300 {
            return 0.0;
        }
        for (vi, yi) in v.iter_mut().zip(y.iter()) {
            *vi = yi / norm;
        }
        // Rayleigh quotient of the normalised iterate
        let gv = mat_vec(&g, &v);
        let next: f64 = v.iter().zip(gv.iter()).map(|(a, b)| a * b).sum();
        if (next - estimate).abs() <= POWER_TOLERANCE * next.abs() {
            return next;
        }
        estimate = next;
    }
    estimate
}

/// Upper bound on `|K|^2` for `repeats` time points and the given
/// voxel-spacing ratios (each spacing divided by the largest one).
pub fn operator_norm_squared(repeats: usize, voxel_ratio: [f64; 3]) -> TgvResult<f64> {
    if let Some(&bad) = voxel_ratio.iter().find(|r| !(**r > 0.0 && r.is_finite())) {
        return Err(TgvError::InvalidConfig {
            field: "voxel_ratio",
            reason: format!("spacing ratios must be positive and finite, got {bad}"),
        });
    }
    let inverse_norm = voxel_ratio.iter().map(|r| (1.0 / r).powi(2)).sum::<f64>().sqrt();
    let x = 2.0 * inverse_norm;
    Ok(spectral_norm_squared(&coupling_matrix(x)) + repeats as f64)
}
