//! One iteration of the primal-dual scheme.
//!
//! The state is replaced as a whole on every step: the extrapolation needs
//! the previous primal variables next to the new ones, so nothing is updated
//! in place.

use serde::Serialize;

use crate::config::DenoiseConfig;
use crate::diff::{div, epsilon, grad};
use crate::error::{ensure_same_shape, TgvError, TgvResult};
use crate::field::{ensure_common_extent, GridField, ScalarField, Shape3, TensorField, TimeStack, VectorField};
use crate::prox::project;

/// The two normalised measurement series, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct Measurements {
    control: TimeStack,
    label: TimeStack,
}

impl Measurements {
    pub fn new(control: TimeStack, label: TimeStack) -> TgvResult<Self> {
        ensure_same_shape("Measurements::new", control.data().shape(), label.data().shape())?;
        let (nx, ny, nz) = control.spatial_shape();
        if nx * ny * nz == 0 {
            return Err(TgvError::EmptyInput {
                reason: "measurement grid has no voxels",
            });
        }
        Ok(Self { control, label })
    }

    pub fn control(&self) -> &TimeStack {
        &self.control
    }

    pub fn label(&self) -> &TimeStack {
        &self.label
    }

    pub fn repeats(&self) -> usize {
        self.control.repeats()
    }

    pub fn spatial_shape(&self) -> Shape3 {
        self.control.spatial_shape()
    }
}

/// Regularisation weights `{lambda, alpha0, alpha1, gamma1, gamma2}`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegularizationWeights {
    pub lambda: f64,
    pub alpha0: f64,
    pub alpha1: f64,
    pub gamma1: f64,
    pub gamma2: f64,
}

impl From<&DenoiseConfig> for RegularizationWeights {
    fn from(cfg: &DenoiseConfig) -> Self {
        Self {
            lambda: cfg.lambda,
            alpha0: cfg.alpha0,
            alpha1: cfg.alpha1,
            gamma1: cfg.gamma1,
            gamma2: cfg.gamma2,
        }
    }
}

/// Dual (`sigma`) and primal (`tau`) step sizes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepSizes {
    pub sigma: f64,
    pub tau: f64,
}

impl StepSizes {
    /// `sigma = tau = 1 / sqrt(safety * |K|^2)`, so `sigma * tau * |K|^2 < 1`
    /// whenever `safety > 1`.
    pub fn from_norm_bound(norm_squared: f64, safety: f64) -> Self {
        let step = 1.0 / (norm_squared * safety).sqrt();
        Self { sigma: step, tau: step }
    }
}

/// Primal estimates `(u_c, u_l)` with their auxiliary fields `(v, w)`. The
/// same record holds the over-relaxed copies.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimalVariables {
    pub control: ScalarField,
    pub label: ScalarField,
    pub v: VectorField,
    pub w: VectorField,
}

impl PrimalVariables {
    /// `2 * self - previous`, block by block.
    pub fn extrapolate(&self, previous: &PrimalVariables) -> TgvResult<Self> {
        Ok(Self {
            control: self.control.extrapolate(&previous.control)?,
            label: self.label.extrapolate(&previous.label)?,
            v: self.v.extrapolate(&previous.v)?,
            w: self.w.extrapolate(&previous.w)?,
        })
    }
}

/// Dual variables: data fidelity `(P, Q)`, first order `(p, r)`, second
/// order `(q, s)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DualVariables {
    pub fidelity_control: TimeStack,
    pub fidelity_label: TimeStack,
    pub p: VectorField,
    pub r: VectorField,
    pub q: TensorField,
    pub s: TensorField,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrimalDualState {
    pub primal: PrimalVariables,
    pub dual: DualVariables,
    pub extrapolated: PrimalVariables,
}

impl PrimalDualState {
    /// Starting point: primal estimates are the per-voxel NaN-aware median
    /// of each series, both fidelity duals start from the control series,
    /// everything else is zero and the over-relaxed copies equal the primal
    /// variables.
    pub fn seed(data: &Measurements) -> Self {
        let shape = data.spatial_shape();
        let primal = PrimalVariables {
            control: data.control.nan_median_over_repeats(),
            label: data.label.nan_median_over_repeats(),
            v: VectorField::zeros(shape),
            w: VectorField::zeros(shape),
        };
        let dual = DualVariables {
            fidelity_control: data.control.clone(),
            fidelity_label: data.control.clone(),
            p: VectorField::zeros(shape),
            r: VectorField::zeros(shape),
            q: TensorField::zeros(shape),
            s: TensorField::zeros(shape),
        };
        Self {
            extrapolated: primal.clone(),
            primal,
            dual,
        }
    }

    /// Every field must share the measurement grid, and the fidelity duals
    /// must have the measurement repeat count.
    pub fn validate(&self, data: &Measurements) -> TgvResult<()> {
        let (nx, ny, nz) = ensure_common_extent(
            "PrimalDualState::validate",
            &[
                data.control().into(),
                (&self.primal.control).into(),
                (&self.primal.label).into(),
                (&self.primal.v).into(),
                (&self.primal.w).into(),
                (&self.dual.p).into(),
                (&self.dual.r).into(),
                (&self.dual.q).into(),
                (&self.dual.s).into(),
                (&self.extrapolated.control).into(),
                (&self.extrapolated.label).into(),
                (&self.extrapolated.v).into(),
                (&self.extrapolated.w).into(),
            ],
        )?;
        let expected = [nx, ny, nz, data.repeats()];
        ensure_same_shape("PrimalDualState::validate", &expected, self.dual.fidelity_control.data().shape())?;
        ensure_same_shape("PrimalDualState::validate", &expected, self.dual.fidelity_label.data().shape())?;
        Ok(())
    }
}

/// Advance `state` by one iteration.
///
/// Dual ascent with projection, then primal descent using the freshly
/// projected duals, then over-relaxation of the primal blocks. Every other
/// read comes from `state`.
pub fn primal_dual_step(
    state: &PrimalDualState,
    data: &Measurements,
    weights: &RegularizationWeights,
    steps: StepSizes,
) -> TgvResult<PrimalDualState> {
    let StepSizes { sigma, tau } = steps;
    let PrimalDualState {
        primal,
        dual,
        extrapolated: bar,
    } = state;
    let repeats = data.repeats();

    // data fidelity
    let fidelity_control = project(
        weights.lambda,
        &dual
            .fidelity_control
            .scaled_add(sigma, &bar.control.replicate(repeats)?.sub(&data.control)?)?,
    )?;
    let fidelity_label = project(
        weights.lambda,
        &dual
            .fidelity_label
            .scaled_add(sigma, &bar.label.replicate(repeats)?.sub(&data.label)?)?,
    )?;

    // first order
    let p = project(
        weights.gamma1 * weights.alpha1,
        &dual.p.scaled_add(sigma, &grad(&bar.label).sub(&bar.v)?)?,
    )?;
    let r = project(
        weights.gamma2 * weights.alpha1,
        &dual
            .r
            .scaled_add(sigma, &grad(&bar.control.sub(&bar.label)?).sub(&bar.w)?)?,
    )?;

    // second order
    let q = project(
        weights.gamma1 * weights.alpha0,
        &dual.q.scaled_add(sigma, &epsilon(&bar.v))?,
    )?;
    let s = project(
        weights.gamma2 * weights.alpha0,
        &dual.s.scaled_add(sigma, &epsilon(&bar.w))?,
    )?;
    // tensor `div` is only adjoint to `epsilon` on symmetric tensors
    debug_assert!(q.is_symmetric(1e-9) && s.is_symmetric(1e-9));

    // mean over repeats stands in for the adjoint of replication
    let control = primal
        .control
        .scaled_add(tau, &div(&r).sub(&fidelity_control.mean_over_repeats())?)?;
    let label = primal
        .label
        .scaled_add(tau, &div(&p.sub(&r)?).sub(&fidelity_label.mean_over_repeats())?)?;
    let v = primal.v.scaled_add(tau, &p.add(&div(&q))?)?;
    let w = primal.w.scaled_add(tau, &r.add(&div(&s))?)?;

    let next = PrimalVariables { control, label, v, w };
    let extrapolated = next.extrapolate(primal)?;

    Ok(PrimalDualState {
        primal: next,
        dual: DualVariables {
            fidelity_control,
            fidelity_label,
            p,
            r,
            q,
            s,
        },
        extrapolated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array4};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn default_weights() -> RegularizationWeights {
        RegularizationWeights::from(&DenoiseConfig::default())
    }

    fn constant_measurements(value: f64, repeats: usize) -> Measurements {
        let stack = TimeStack::new(Array4::from_elem((4, 4, 4, repeats), value)).unwrap();
        Measurements::new(stack.clone(), stack).unwrap()
    }

    fn random_measurements(seed: u64) -> Measurements {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut stack = || {
            TimeStack::new(Array::random_using((5, 4, 3, 4), Uniform::new(0.0, 100.0), &mut rng)).unwrap()
        };
        let control = stack();
        let label = stack();
        Measurements::new(control, label).unwrap()
    }

    #[test]
    fn zero_input_is_a_fixed_point() {
        let data = constant_measurements(0.0, 6);
        let state = PrimalDualState::seed(&data);
        let next = primal_dual_step(&state, &data, &default_weights(), StepSizes { sigma: 0.15, tau: 0.15 }).unwrap();
        assert_eq!(next, state);
    }

    #[test]
    fn constant_input_only_moves_through_the_fidelity_term() {
        let (value, repeats) = (500.0, 6);
        let data = constant_measurements(value, repeats);
        let weights = default_weights();
        let steps = StepSizes { sigma: 0.15, tau: 0.15 };
        let state = PrimalDualState::seed(&data);
        let next = primal_dual_step(&state, &data, &weights, steps).unwrap();

        for zero in [&next.dual.p, &next.dual.r, &next.primal.v, &next.primal.w] {
            assert_eq!(zero.norm(), 0.0);
        }
        assert_eq!(next.dual.q.norm(), 0.0);
        assert_eq!(next.dual.s.norm(), 0.0);

        // the fidelity dual saturates at radius lambda spread over L repeats
        let entry = weights.lambda / (repeats as f64).sqrt();
        assert!(next.dual.fidelity_control.data().iter().all(|&x| (x - entry).abs() < 1e-12));
        let expected = value - steps.tau * entry;
        for u in [&next.primal.control, &next.primal.label] {
            assert!(u.data().iter().all(|&x| (x - expected).abs() < 1e-9), "{expected}");
        }
        assert_eq!(next.primal.control, next.primal.label);
    }

    #[test]
    fn extrapolated_blocks_are_two_new_minus_old() {
        let data = random_measurements(9);
        let weights = default_weights();
        let steps = StepSizes { sigma: 0.1, tau: 0.1 };
        let first = primal_dual_step(&PrimalDualState::seed(&data), &data, &weights, steps).unwrap();
        let second = primal_dual_step(&first, &data, &weights, steps).unwrap();
        assert_eq!(second.extrapolated, second.primal.extrapolate(&first.primal).unwrap());
        let control_gap = second
            .extrapolated
            .control
            .sub(&second.primal.control)
            .unwrap()
            .sub(&second.primal.control.sub(&first.primal.control).unwrap())
            .unwrap()
            .norm();
        assert!(control_gap < 1e-9, "{control_gap}");
    }

    #[test]
    fn duals_stay_inside_their_balls() {
        let data = random_measurements(4);
        let weights = default_weights();
        let steps = StepSizes::from_norm_bound(40.0, 1.1);
        let mut state = PrimalDualState::seed(&data);
        for _ in 0..5 {
            state = primal_dual_step(&state, &data, &weights, steps).unwrap();
        }
        let q_norms = state.dual.q.data().mapv(|x| x * x).sum_axis(ndarray::Axis(4)).sum_axis(ndarray::Axis(3));
        assert!(q_norms.iter().all(|&n2| n2.sqrt() <= weights.gamma1 * weights.alpha0 + 1e-9));
        let p_norms = state.dual.p.data().mapv(|x| x * x).sum_axis(ndarray::Axis(3));
        assert!(p_norms.iter().all(|&n2| n2.sqrt() <= weights.gamma1 * weights.alpha1 + 1e-9));
        assert!(state.dual.q.is_symmetric(1e-12));
        assert!(state.dual.s.is_symmetric(1e-12));
    }

    #[test]
    fn mean_over_repeats_is_adjoint_of_replication_up_to_l() {
        let mut rng = StdRng::seed_from_u64(21);
        let repeats = 5;
        let x = ScalarField::new(Array::random_using((3, 4, 2), Uniform::new(-1.0, 1.0), &mut rng));
        let y = TimeStack::new(Array::random_using((3, 4, 2, repeats), Uniform::new(-1.0, 1.0), &mut rng)).unwrap();
        let lhs = x.replicate(repeats).unwrap().inner(&y).unwrap();
        let rhs = repeats as f64 * x.inner(&y.mean_over_repeats()).unwrap();
        assert!((lhs - rhs).abs() < 1e-12, "{lhs} vs {rhs}");
    }

    #[test]
    fn measurements_must_agree_in_shape() {
        let control = TimeStack::new(Array4::zeros((4, 4, 4, 6))).unwrap();
        let fewer_repeats = TimeStack::new(Array4::zeros((4, 4, 4, 5))).unwrap();
        let other_grid = TimeStack::new(Array4::zeros((4, 4, 3, 6))).unwrap();
        assert!(matches!(
            Measurements::new(control.clone(), fewer_repeats),
            Err(TgvError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            Measurements::new(control, other_grid),
            Err(TgvError::ShapeMismatch { .. })
        ));
        let empty = TimeStack::new(Array4::zeros((0, 4, 4, 2))).unwrap();
        assert!(matches!(
            Measurements::new(empty.clone(), empty),
            Err(TgvError::EmptyInput { .. })
        ));
    }

    #[test]
    fn state_validation_catches_foreign_fields() {
        let data = constant_measurements(1.0, 3);
        let mut state = PrimalDualState::seed(&data);
        assert!(state.validate(&data).is_ok());
        state.dual.q = TensorField::zeros((4, 4, 5));
        assert!(matches!(state.validate(&data), Err(TgvError::ShapeMismatch { .. })));
    }
}
