//! Preparing a raw interleaved acquisition for the solver.

use ndarray::{s, Array4, Axis};

use crate::error::{TgvError, TgvResult};
use crate::field::{GridField, TimeStack};

/// Common intensity scale after [`normalise_pair`].
pub const NORMALISED_MAX: f64 = 1000.0;

/// Split a 4D series into `(label, control)`: label volumes sit at even
/// time indices, control volumes at odd ones.
pub fn split_interleaved(series: &Array4<f64>) -> TgvResult<(TimeStack, TimeStack)> {
    let volumes = series.len_of(Axis(3));
    if volumes == 0 {
        return Err(TgvError::EmptyInput {
            reason: "series has no volumes",
        });
    }
    if volumes % 2 != 0 {
        let shape = series.shape();
        return Err(TgvError::ShapeMismatch {
            operation: "split_interleaved",
            expected: vec![shape[0], shape[1], shape[2], volumes + 1],
            found: shape.to_vec(),
        });
    }
    let label = series.slice(s![.., .., .., 0..;2]).to_owned();
    let control = series.slice(s![.., .., .., 1..;2]).to_owned();
    Ok((TimeStack::new(label)?, TimeStack::new(control)?))
}

fn nan_max(stack: &TimeStack) -> f64 {
    stack
        .data()
        .iter()
        .copied()
        .filter(|x| !x.is_nan())
        .fold(f64::NEG_INFINITY, f64::max)
}

/// Scale both stacks by one factor so the larger of their maxima becomes
/// [`NORMALISED_MAX`]. NaN samples are ignored when taking the maxima and
/// stay NaN.
pub fn normalise_pair(a: &TimeStack, b: &TimeStack) -> TgvResult<(TimeStack, TimeStack)> {
    let peak = nan_max(a).max(nan_max(b));
    if !(peak > 0.0 && peak.is_finite()) {
        return Err(TgvError::InvalidConfig {
            field: "series",
            reason: format!("cannot normalise data whose maximum is {peak}"),
        });
    }
    let scale = NORMALISED_MAX / peak;
    Ok((
        a.with_data(a.data() * scale)?,
        b.with_data(b.data() * scale)?,
    ))
}

/// Each spacing divided by the largest one.
pub fn voxel_ratio(spacing: [f64; 3]) -> TgvResult<[f64; 3]> {
    if let Some(&bad) = spacing.iter().find(|d| !(**d > 0.0 && d.is_finite())) {
        return Err(TgvError::InvalidConfig {
            field: "voxel_sizes",
            reason: format!("voxel spacing must be positive and finite, got {bad}"),
        });
    }
    let largest = spacing.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Ok(spacing.map(|d| d / largest))
}
