//! Field kinds over a 3D voxel grid.
//!
//! Every field is a standard-layout `f64` array whose leading three axes are
//! the spatial axes (x, y, z). The kind decides what the trailing axes mean:
//!
//! - [`ScalarField`]: `(x, y, z)`
//! - [`VectorField`]: `(x, y, z, c)`, `c` in `0..3`
//! - [`TensorField`]: `(x, y, z, i, j)`, `i, j` in `0..3`
//! - [`TimeStack`]:   `(x, y, z, t)`, `t` in `0..L`
//!
//! The kind is carried by the type, never inferred from the array rank, so a
//! vector field with three repeats cannot be mistaken for a time stack.

use ndarray::{s, Array, Array3, Array4, Array5, ArrayView3, Axis, Dimension, Ix3, Ix4, Ix5, Zip};

use tracing::debug;

use crate::error::{ensure_same_shape, TgvError, TgvResult};

/// Spatial extent `(nx, ny, nz)`.
pub type Shape3 = (usize, usize, usize);

/// Number of spatial axes, and channels of a vector field.
pub const SPATIAL_DIMS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    Vector,
    Tensor,
    Stack,
}

/// Behaviour shared by every field kind.
///
/// All combinators are pure: they allocate a new field and leave both inputs
/// untouched, and they fail with [`TgvError::ShapeMismatch`] when the two
/// operands do not have identical shapes.
pub trait GridField: Sized {
    type Dim: Dimension;
    const KIND: FieldKind;

    fn data(&self) -> &Array<f64, Self::Dim>;

    fn into_data(self) -> Array<f64, Self::Dim>;

    /// A field of the same kind and shape as `self`, holding `data`.
    fn with_data(&self, data: Array<f64, Self::Dim>) -> TgvResult<Self>;

    fn spatial_shape(&self) -> Shape3 {
        let shape = self.data().shape();
        (shape[0], shape[1], shape[2])
    }

    /// Elementwise `f(self, other)`.
    fn zip_with<F>(&self, other: &Self, operation: &'static str, f: F) -> TgvResult<Self>
    where
        F: Fn(f64, f64) -> f64 + Sync + Send,
    {
        ensure_same_shape(operation, self.data().shape(), other.data().shape())?;
        let combined = Zip::from(self.data())
            .and(other.data())
            .par_map_collect(|&a, &b| f(a, b));
        self.with_data(combined)
    }

    fn add(&self, other: &Self) -> TgvResult<Self> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    fn sub(&self, other: &Self) -> TgvResult<Self> {
        self.zip_with(other, "sub", |a, b| a - b)
    }

    /// `self + alpha * other`
    fn scaled_add(&self, alpha: f64, other: &Self) -> TgvResult<Self> {
        self.zip_with(other, "scaled_add", move |a, b| a + alpha * b)
    }

    /// Over-relaxation `2 * self - previous`.
    fn extrapolate(&self, previous: &Self) -> TgvResult<Self> {
        self.zip_with(previous, "extrapolate", |a, b| 2.0 * a - b)
    }

    /// Euclidean inner product over every element.
    fn inner(&self, other: &Self) -> TgvResult<f64> {
        ensure_same_shape("inner", self.data().shape(), other.data().shape())?;
        Ok(Zip::from(self.data())
            .and(other.data())
            .fold(0.0, |acc, &a, &b| acc + a * b))
    }

    /// Euclidean norm over every element.
    fn norm(&self) -> f64 {
        self.data().iter().map(|x| x * x).sum::<f64>().sqrt()
    }
}

macro_rules! impl_grid_field {
    ($ty:ident, $dim:ty, $kind:expr) => {
        impl GridField for $ty {
            type Dim = $dim;
            const KIND: FieldKind = $kind;

            fn data(&self) -> &Array<f64, $dim> {
                &self.0
            }

            fn into_data(self) -> Array<f64, $dim> {
                self.0
            }

            fn with_data(&self, data: Array<f64, $dim>) -> TgvResult<Self> {
                ensure_same_shape(concat!(stringify!($ty), "::with_data"), self.0.shape(), data.shape())?;
                Ok($ty(data))
            }
        }
    };
}

/// One real value per voxel.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarField(Array3<f64>);

/// One 3-vector per voxel.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorField(Array4<f64>);

/// One 3x3 matrix per voxel. Operators in this crate only produce
/// symmetric tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorField(Array5<f64>);

/// `L` repeated scalar volumes; also the shape of the data-fidelity duals.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeStack(Array4<f64>);

impl_grid_field!(ScalarField, Ix3, FieldKind::Scalar);
impl_grid_field!(VectorField, Ix4, FieldKind::Vector);
impl_grid_field!(TensorField, Ix5, FieldKind::Tensor);
impl_grid_field!(TimeStack, Ix4, FieldKind::Stack);

impl ScalarField {
    pub fn new(data: Array3<f64>) -> Self {
        Self(data)
    }

    pub fn zeros(shape: Shape3) -> Self {
        Self::from_elem(shape, 0.0)
    }

    pub fn from_elem(shape: Shape3, value: f64) -> Self {
        Self(Array3::from_elem(shape, value))
    }

    /// Copy the volume `repeats` times along a new trailing axis.
    pub fn replicate(&self, repeats: usize) -> TgvResult<TimeStack> {
        if repeats == 0 {
            return Err(TgvError::EmptyInput {
                reason: "cannot replicate a volume zero times",
            });
        }
        let (nx, ny, nz) = self.spatial_shape();
        Ok(TimeStack(Array4::from_shape_fn(
            (nx, ny, nz, repeats),
            |(i, j, k, _)| self.0[[i, j, k]],
        )))
    }
}

impl VectorField {
    pub fn new(data: Array4<f64>) -> TgvResult<Self> {
        let shape = data.shape();
        let expected = [shape[0], shape[1], shape[2], SPATIAL_DIMS];
        ensure_same_shape("VectorField::new", &expected, shape)?;
        Ok(Self(data))
    }

    pub fn zeros(shape: Shape3) -> Self {
        let (nx, ny, nz) = shape;
        Self(Array4::zeros((nx, ny, nz, SPATIAL_DIMS)))
    }

    /// Wrap an array whose trailing axis is already known to have length 3.
    pub(crate) fn from_raw(data: Array4<f64>) -> Self {
        debug_assert_eq!(data.len_of(Axis(3)), SPATIAL_DIMS);
        Self(data)
    }

    /// Channel `c` as a scalar volume.
    pub fn component(&self, c: usize) -> ArrayView3<'_, f64> {
        self.0.index_axis(Axis(3), c)
    }
}

impl TensorField {
    pub fn new(data: Array5<f64>) -> TgvResult<Self> {
        let shape = data.shape();
        let expected = [shape[0], shape[1], shape[2], SPATIAL_DIMS, SPATIAL_DIMS];
        ensure_same_shape("TensorField::new", &expected, shape)?;
        Ok(Self(data))
    }

    pub fn zeros(shape: Shape3) -> Self {
        let (nx, ny, nz) = shape;
        Self(Array5::zeros((nx, ny, nz, SPATIAL_DIMS, SPATIAL_DIMS)))
    }

    pub(crate) fn from_raw(data: Array5<f64>) -> Self {
        debug_assert_eq!(&data.shape()[3..], &[SPATIAL_DIMS, SPATIAL_DIMS]);
        Self(data)
    }

    /// Entry `(i, j)` of every voxel's matrix.
    pub fn entry(&self, i: usize, j: usize) -> ArrayView3<'_, f64> {
        self.0.slice(s![.., .., .., i, j])
    }

    pub fn is_symmetric(&self, tol: f64) -> bool {
        (0..SPATIAL_DIMS).all(|i| {
            (i + 1..SPATIAL_DIMS).all(|j| {
                Zip::from(self.entry(i, j))
                    .and(self.entry(j, i))
                    .all(|&a, &b| (a - b).abs() <= tol)
            })
        })
    }
}

impl TimeStack {
    pub fn new(data: Array4<f64>) -> TgvResult<Self> {
        if data.len_of(Axis(3)) == 0 {
            return Err(TgvError::EmptyInput {
                reason: "time stack has no repeats",
            });
        }
        Ok(Self(data))
    }

    /// Repeat count `L`.
    pub fn repeats(&self) -> usize {
        self.0.len_of(Axis(3))
    }

    /// Average over the repeat axis.
    pub fn mean_over_repeats(&self) -> ScalarField {
        ScalarField(self.0.sum_axis(Axis(3)) / self.repeats() as f64)
    }

    /// Per-voxel median over the repeats that are not NaN. A voxel with no
    /// valid repeat is NaN.
    pub fn nan_median_over_repeats(&self) -> ScalarField {
        let median = Zip::from(self.0.lanes(Axis(3))).par_map_collect(|samples| {
            let mut present: Vec<f64> = samples.iter().copied().filter(|x| !x.is_nan()).collect();
            median_in_place(&mut present)
        });
        ScalarField(median)
    }
}

fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_unstable_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        0.5 * (values[mid - 1] + values[mid])
    }
}

/// A borrowed field of any kind, tagged with what it is.
#[derive(Debug, Clone, Copy)]
pub enum FieldRef<'a> {
    Scalar(&'a ScalarField),
    Vector(&'a VectorField),
    Tensor(&'a TensorField),
    Stack(&'a TimeStack),
}

impl<'a> FieldRef<'a> {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldRef::Scalar(_) => ScalarField::KIND,
            FieldRef::Vector(_) => VectorField::KIND,
            FieldRef::Tensor(_) => TensorField::KIND,
            FieldRef::Stack(_) => TimeStack::KIND,
        }
    }

    pub fn spatial_shape(&self) -> Shape3 {
        match self {
            FieldRef::Scalar(f) => f.spatial_shape(),
            FieldRef::Vector(f) => f.spatial_shape(),
            FieldRef::Tensor(f) => f.spatial_shape(),
            FieldRef::Stack(f) => f.spatial_shape(),
        }
    }
}

impl<'a> From<&'a ScalarField> for FieldRef<'a> {
    fn from(field: &'a ScalarField) -> Self {
        FieldRef::Scalar(field)
    }
}

impl<'a> From<&'a VectorField> for FieldRef<'a> {
    fn from(field: &'a VectorField) -> Self {
        FieldRef::Vector(field)
    }
}

impl<'a> From<&'a TensorField> for FieldRef<'a> {
    fn from(field: &'a TensorField) -> Self {
        FieldRef::Tensor(field)
    }
}

impl<'a> From<&'a TimeStack> for FieldRef<'a> {
    fn from(field: &'a TimeStack) -> Self {
        FieldRef::Stack(field)
    }
}

/// Check that every field shares one spatial extent and return it.
pub fn ensure_common_extent(operation: &'static str, fields: &[FieldRef<'_>]) -> TgvResult<Shape3> {
    let Some(first) = fields.first() else {
        return Err(TgvError::EmptyInput {
            reason: "no fields to compare",
        });
    };
    let (nx, ny, nz) = first.spatial_shape();
    for (index, field) in fields.iter().enumerate().skip(1) {
        let (mx, my, mz) = field.spatial_shape();
        ensure_same_shape(operation, &[nx, ny, nz], &[mx, my, mz]).map_err(|err| {
            debug!(operation, index, kind = ?field.kind(), "field off the common grid");
            err
        })?;
    }
    Ok((nx, ny, nz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    #[test]
    fn vector_field_rejects_wrong_channel_count() {
        let err = VectorField::new(Array4::zeros((4, 4, 4, 2))).unwrap_err();
        assert!(matches!(err, TgvError::ShapeMismatch { .. }));
    }

    #[test]
    fn tensor_field_rejects_wrong_channel_count() {
        let err = TensorField::new(Array5::zeros((4, 4, 4, 3, 2))).unwrap_err();
        assert!(matches!(err, TgvError::ShapeMismatch { .. }));
    }

    #[test]
    fn time_stack_needs_a_repeat() {
        let err = TimeStack::new(Array4::zeros((2, 2, 2, 0))).unwrap_err();
        assert!(matches!(err, TgvError::EmptyInput { .. }));
    }

    #[test]
    fn combinators_reject_mismatched_extent() {
        let a = ScalarField::zeros((4, 4, 4));
        let b = ScalarField::zeros((4, 4, 5));
        assert!(matches!(a.sub(&b), Err(TgvError::ShapeMismatch { .. })));
        assert!(matches!(a.inner(&b), Err(TgvError::ShapeMismatch { .. })));
    }

    #[test]
    fn extrapolate_is_two_new_minus_old() {
        let new = ScalarField::from_elem((2, 2, 2), 3.0);
        let old = ScalarField::from_elem((2, 2, 2), 1.0);
        let bar = new.extrapolate(&old).unwrap();
        assert!(bar.data().iter().all(|&x| x == 5.0));
    }

    #[test]
    fn replicate_then_mean_recovers_volume() {
        let volume = ScalarField::new(Array::from_shape_fn((3, 2, 2), |(i, j, k)| (i * 4 + j * 2 + k) as f64));
        let stack = volume.replicate(5).unwrap();
        assert_eq!(stack.repeats(), 5);
        assert_eq!(stack.data().index_axis(Axis(3), 3), volume.data().view());
        assert_eq!(stack.mean_over_repeats(), volume);
    }

    #[test]
    fn nan_median_skips_missing_repeats() {
        let mut data = Array4::zeros((1, 1, 3, 4));
        data.slice_mut(s![0, 0, 0, ..]).assign(&array![4.0, 1.0, 3.0, 2.0]);
        data.slice_mut(s![0, 0, 1, ..]).assign(&array![5.0, f64::NAN, 1.0, 9.0]);
        data.slice_mut(s![0, 0, 2, ..]).fill(f64::NAN);
        let median = TimeStack::new(data).unwrap().nan_median_over_repeats();
        assert_eq!(median.data()[[0, 0, 0]], 2.5);
        assert_eq!(median.data()[[0, 0, 1]], 5.0);
        assert!(median.data()[[0, 0, 2]].is_nan());
    }

    #[test]
    fn common_extent_detects_disagreeing_field() {
        let u = ScalarField::zeros((3, 3, 3));
        let v = VectorField::zeros((3, 3, 3));
        let q = TensorField::zeros((3, 2, 3));
        assert_eq!(FieldRef::from(&q).kind(), FieldKind::Tensor);
        assert_eq!(ensure_common_extent("test", &[(&u).into(), (&v).into()]).unwrap(), (3, 3, 3));
        assert!(ensure_common_extent("test", &[(&u).into(), (&v).into(), (&q).into()]).is_err());
    }

    #[test]
    fn symmetric_check() {
        let mut q = Array5::zeros((1, 1, 1, 3, 3));
        q[[0, 0, 0, 0, 1]] = 2.0;
        let q = TensorField::new(q).unwrap();
        assert!(!q.is_symmetric(1e-12));
        assert!(TensorField::zeros((2, 2, 2)).is_symmetric(0.0));
    }
}
