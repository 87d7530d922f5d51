//! Pointwise projection onto Euclidean norm balls.
//!
//! Each voxel's trailing-axis vector is divided by `max(|x| / a, 1)`: inside
//! the ball it is left alone, outside it is pulled back onto the sphere of
//! radius `a`. For tensors the nine entries are treated as one flat vector;
//! for time stacks the `L` repeats are.

use ndarray::{Array3, Axis, Zip};

use crate::error::{ensure_same_shape, TgvError, TgvResult};
use crate::field::{GridField, ScalarField, TensorField, TimeStack, VectorField};

/// Ball radius, either one value for the whole grid or one per voxel.
#[derive(Debug, Clone, Copy)]
pub enum Weight<'a> {
    Uniform(f64),
    Voxelwise(&'a ScalarField),
}

fn check_radius(weight: f64) -> TgvResult<()> {
    if weight > 0.0 && weight.is_finite() {
        Ok(())
    } else {
        Err(TgvError::DegenerateWeight { weight })
    }
}

/// `max(sqrt(norm_sq) / weight, 1)` per voxel.
fn shrink_factors(norm_sq: Array3<f64>, weight: &Weight<'_>) -> TgvResult<Array3<f64>> {
    match *weight {
        Weight::Uniform(a) => {
            check_radius(a)?;
            Ok(norm_sq.mapv(|n2| (n2.sqrt() / a).max(1.0)))
        }
        Weight::Voxelwise(radius) => {
            ensure_same_shape("project_onto_ball", norm_sq.shape(), radius.data().shape())?;
            if let Some(&bad) = radius.data().iter().find(|a| !(**a > 0.0 && a.is_finite())) {
                return Err(TgvError::DegenerateWeight { weight: bad });
            }
            Ok(Zip::from(&norm_sq)
                .and(radius.data())
                .par_map_collect(|&n2, &a| (n2.sqrt() / a).max(1.0)))
        }
    }
}

/// Projection onto the per-voxel ball of radius `weight`.
pub trait BallProjection: Sized {
    fn project_onto_ball(&self, weight: &Weight<'_>) -> TgvResult<Self>;
}

impl BallProjection for VectorField {
    fn project_onto_ball(&self, weight: &Weight<'_>) -> TgvResult<Self> {
        let norm_sq = self.data().mapv(|x| x * x).sum_axis(Axis(3));
        let factors = shrink_factors(norm_sq, weight)?.insert_axis(Axis(3));
        self.with_data(self.data() / &factors)
    }
}

impl BallProjection for TimeStack {
    fn project_onto_ball(&self, weight: &Weight<'_>) -> TgvResult<Self> {
        let norm_sq = self.data().mapv(|x| x * x).sum_axis(Axis(3));
        let factors = shrink_factors(norm_sq, weight)?.insert_axis(Axis(3));
        self.with_data(self.data() / &factors)
    }
}

impl BallProjection for TensorField {
    fn project_onto_ball(&self, weight: &Weight<'_>) -> TgvResult<Self> {
        let norm_sq = self.data().mapv(|x| x * x).sum_axis(Axis(4)).sum_axis(Axis(3));
        let factors = shrink_factors(norm_sq, weight)?
            .insert_axis(Axis(3))
            .insert_axis(Axis(4));
        self.with_data(self.data() / &factors)
    }
}

/// Free-function form of [`BallProjection::project_onto_ball`] with a
/// uniform radius.
pub fn project<F: BallProjection>(weight: f64, field: &F) -> TgvResult<F> {
    field.project_onto_ball(&Weight::Uniform(weight))
}
