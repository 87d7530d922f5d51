//! Finite-difference operators on the voxel grid.
//!
//! The forward difference leaves the last slice along its axis at zero. The
//! backward difference zeroes the last input slice, copies the first slice
//! through and differences the rest, which makes it exactly the negative
//! adjoint of the forward difference. From these:
//!
//! - `grad` (forward) and `div` on vectors (backward) are a negative-adjoint pair.
//! - `epsilon` (backward, symmetrised) and `div` on tensors (forward) are a
//!   negative-adjoint pair on symmetric tensors.

use ndarray::{Array3, Array4, Array5, ArrayView3, ArrayViewMut3, Axis, Slice, Zip};

use crate::field::{GridField, ScalarField, TensorField, VectorField, SPATIAL_DIMS};

/// One of the three grid axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialAxis {
    X,
    Y,
    Z,
}

impl SpatialAxis {
    pub const ALL: [SpatialAxis; 3] = [SpatialAxis::X, SpatialAxis::Y, SpatialAxis::Z];

    pub fn index(self) -> usize {
        match self {
            SpatialAxis::X => 0,
            SpatialAxis::Y => 1,
            SpatialAxis::Z => 2,
        }
    }

    fn axis(self) -> Axis {
        Axis(self.index())
    }
}

fn forward_diff_into(src: ArrayView3<'_, f64>, mut dst: ArrayViewMut3<'_, f64>, axis: SpatialAxis) {
    let ax = axis.axis();
    let n = src.len_of(ax);
    dst.fill(0.0);
    if n < 2 {
        return;
    }
    Zip::from(dst.slice_axis_mut(ax, Slice::from(..n - 1)))
        .and(src.slice_axis(ax, Slice::from(1..)))
        .and(src.slice_axis(ax, Slice::from(..n - 1)))
        .par_for_each(|d, &ahead, &here| *d = ahead - here);
}

fn backward_diff_into(src: ArrayView3<'_, f64>, mut dst: ArrayViewMut3<'_, f64>, axis: SpatialAxis) {
    let ax = axis.axis();
    let n = src.len_of(ax);
    if n < 2 {
        // the only slice is also the last one, which is zeroed
        dst.fill(0.0);
        return;
    }
    dst.index_axis_mut(ax, 0).assign(&src.index_axis(ax, 0));
    Zip::from(dst.slice_axis_mut(ax, Slice::from(1..n - 1)))
        .and(src.slice_axis(ax, Slice::from(1..n - 1)))
        .and(src.slice_axis(ax, Slice::from(..n - 2)))
        .par_for_each(|d, &here, &behind| *d = here - behind);
    Zip::from(dst.index_axis_mut(ax, n - 1))
        .and(src.index_axis(ax, n - 2))
        .for_each(|d, &behind| *d = -behind);
}

/// Forward difference along one spatial axis, channel by channel.
pub trait ForwardDiff {
    fn forward_diff(&self, axis: SpatialAxis) -> Self;
}

/// Backward difference along one spatial axis, channel by channel.
pub trait BackwardDiff {
    fn backward_diff(&self, axis: SpatialAxis) -> Self;
}

impl ForwardDiff for ScalarField {
    fn forward_diff(&self, axis: SpatialAxis) -> Self {
        let mut out = Array3::zeros(self.data().raw_dim());
        forward_diff_into(self.data().view(), out.view_mut(), axis);
        ScalarField::new(out)
    }
}

impl ForwardDiff for VectorField {
    fn forward_diff(&self, axis: SpatialAxis) -> Self {
        let mut out = Array4::zeros(self.data().raw_dim());
        for (src, dst) in self.data().axis_iter(Axis(3)).zip(out.axis_iter_mut(Axis(3))) {
            forward_diff_into(src, dst, axis);
        }
        VectorField::from_raw(out)
    }
}

impl ForwardDiff for TensorField {
    fn forward_diff(&self, axis: SpatialAxis) -> Self {
        let mut out = Array5::zeros(self.data().raw_dim());
        for (rows_src, mut rows_dst) in self.data().axis_iter(Axis(3)).zip(out.axis_iter_mut(Axis(3))) {
            for (src, dst) in rows_src.axis_iter(Axis(3)).zip(rows_dst.axis_iter_mut(Axis(3))) {
                forward_diff_into(src, dst, axis);
            }
        }
        TensorField::from_raw(out)
    }
}

impl BackwardDiff for ScalarField {
    fn backward_diff(&self, axis: SpatialAxis) -> Self {
        let mut out = Array3::zeros(self.data().raw_dim());
        backward_diff_into(self.data().view(), out.view_mut(), axis);
        ScalarField::new(out)
    }
}

impl BackwardDiff for VectorField {
    fn backward_diff(&self, axis: SpatialAxis) -> Self {
        let mut out = Array4::zeros(self.data().raw_dim());
        for (src, dst) in self.data().axis_iter(Axis(3)).zip(out.axis_iter_mut(Axis(3))) {
            backward_diff_into(src, dst, axis);
        }
        VectorField::from_raw(out)
    }
}

/// Gradient: channel `c` is the forward difference along axis `c`.
pub fn grad(u: &ScalarField) -> VectorField {
    let (nx, ny, nz) = u.spatial_shape();
    let mut out = Array4::zeros((nx, ny, nz, SPATIAL_DIMS));
    for (axis, dst) in SpatialAxis::ALL.into_iter().zip(out.axis_iter_mut(Axis(3))) {
        forward_diff_into(u.data().view(), dst, axis);
    }
    VectorField::from_raw(out)
}

/// Symmetrised gradient of a vector field, built from backward differences.
///
/// `M[i][i] = d_i v_i`, `M[i][j] = (d_i v_j + d_j v_i) / 2`.
pub fn epsilon(v: &VectorField) -> TensorField {
    let partials = SpatialAxis::ALL.map(|axis| v.backward_diff(axis));
    let (nx, ny, nz) = v.spatial_shape();
    let mut m = Array5::zeros((nx, ny, nz, SPATIAL_DIMS, SPATIAL_DIMS));
    for i in 0..SPATIAL_DIMS {
        for j in 0..SPATIAL_DIMS {
            let entry = m.slice_mut(ndarray::s![.., .., .., i, j]);
            if i == j {
                Zip::from(entry)
                    .and(partials[i].component(i))
                    .for_each(|e, &d| *e = d);
            } else {
                Zip::from(entry)
                    .and(partials[i].component(j))
                    .and(partials[j].component(i))
                    .for_each(|e, &dij, &dji| *e = 0.5 * (dij + dji));
            }
        }
    }
    TensorField::from_raw(m)
}

/// Discrete divergence, the negative adjoint of [`grad`] for vectors and of
/// [`epsilon`] for (symmetric) tensors.
pub trait Divergence {
    type Output;

    fn divergence(&self) -> Self::Output;
}

impl Divergence for VectorField {
    type Output = ScalarField;

    fn divergence(&self) -> ScalarField {
        let mut out = Array3::zeros(self.spatial_shape());
        let mut partial = Array3::zeros(out.raw_dim());
        for axis in SpatialAxis::ALL {
            backward_diff_into(self.component(axis.index()), partial.view_mut(), axis);
            out += &partial;
        }
        ScalarField::new(out)
    }
}

/// For output channel `c`, the tensor entry differenced along x, y and z.
///
/// Rows 1 and 2 read the transposed entry for some terms; on symmetric
/// tensors every channel `c` reduces to `sum_k d_k M[c][k]`.
const TENSOR_DIV_ENTRIES: [[(usize, usize); 3]; 3] = [
    [(0, 0), (0, 1), (0, 2)],
    [(0, 1), (1, 1), (2, 1)],
    [(0, 2), (1, 2), (2, 2)],
];

impl Divergence for TensorField {
    type Output = VectorField;

    fn divergence(&self) -> VectorField {
        let (nx, ny, nz) = self.spatial_shape();
        let mut out = Array4::zeros((nx, ny, nz, SPATIAL_DIMS));
        let mut partial = Array3::zeros((nx, ny, nz));
        for (entries, mut channel) in TENSOR_DIV_ENTRIES.iter().zip(out.axis_iter_mut(Axis(3))) {
            for (axis, &(i, j)) in SpatialAxis::ALL.into_iter().zip(entries.iter()) {
                forward_diff_into(self.entry(i, j), partial.view_mut(), axis);
                channel += &partial;
            }
        }
        VectorField::from_raw(out)
    }
}

/// Free-function form of [`Divergence::divergence`].
pub fn div<F: Divergence>(field: &F) -> F::Output {
    field.divergence()
}
