//! Fixed-budget driver around [`primal_dual_step`].
//!
//! The loop is a two-phase state machine: `Iterating` until the iteration
//! budget is spent (or, when configured, both relative changes fall below
//! the tolerance), then `Finished`. The per-iteration relative changes are
//! reported to the caller and logged; by default they never end the run.

use ndarray::Array4;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DenoiseConfig;
use crate::error::TgvResult;
use crate::field::{GridField, ScalarField, TimeStack};
use crate::operator_norm::operator_norm_squared;
use crate::step::{primal_dual_step, Measurements, PrimalDualState, RegularizationWeights, StepSizes};

/// Relative change of the over-relaxed estimates after one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IterationReport {
    pub iteration: usize,
    pub control_change: f64,
    pub label_change: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    IterationBudget,
    Tolerance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Iterating,
    Finished(StopReason),
}

/// Denoised control and label volumes plus the run's diagnostics.
#[derive(Debug, Clone)]
pub struct DenoiseOutput {
    pub control: ScalarField,
    pub label: ScalarField,
    pub history: Vec<IterationReport>,
    pub steps: StepSizes,
    pub stop_reason: StopReason,
}

impl DenoiseOutput {
    pub fn iterations_run(&self) -> usize {
        self.history.len()
    }

    /// `(nx, ny, nz, 2)` with control at index 0 and label at index 1 of the
    /// trailing axis.
    pub fn to_volume_pair(&self) -> Array4<f64> {
        let (nx, ny, nz) = self.control.spatial_shape();
        let control = self.control.data();
        let label = self.label.data();
        Array4::from_shape_fn((nx, ny, nz, 2), |(i, j, k, c)| {
            if c == 0 {
                control[[i, j, k]]
            } else {
                label[[i, j, k]]
            }
        })
    }
}

/// `|current - previous| / |previous restricted to its nonzero voxels|`.
///
/// NaN when `previous` has no nonzero voxel.
pub fn relative_change(current: &ScalarField, previous: &ScalarField) -> TgvResult<f64> {
    let numerator = current.sub(previous)?.norm();
    let (support, sum_sq) = previous
        .data()
        .iter()
        .filter(|&&x| x != 0.0)
        .fold((0usize, 0.0), |(n, acc), &x| (n + 1, acc + x * x));
    if support == 0 {
        return Ok(f64::NAN);
    }
    Ok(numerator / sum_sq.sqrt())
}

/// Owns every field of the run and advances it one iteration at a time.
pub struct ConvergenceLoop {
    data: Measurements,
    weights: RegularizationWeights,
    steps: StepSizes,
    iterations: usize,
    tolerance: Option<f64>,
    state: PrimalDualState,
    history: Vec<IterationReport>,
    phase: LoopPhase,
}

impl ConvergenceLoop {
    /// Validate the inputs, derive the step sizes and seed the state.
    pub fn new(
        control: TimeStack,
        label: TimeStack,
        voxel_ratio: [f64; 3],
        config: &DenoiseConfig,
    ) -> TgvResult<Self> {
        config.validate()?;
        let data = Measurements::new(control, label)?;
        let norm_squared = operator_norm_squared(data.repeats(), voxel_ratio)?;
        let steps = StepSizes::from_norm_bound(norm_squared, config.norm_safety);
        let state = PrimalDualState::seed(&data);
        state.validate(&data)?;

        info!(
            shape = ?data.spatial_shape(),
            repeats = data.repeats(),
            norm_squared,
            sigma = steps.sigma,
            tau = steps.tau,
            "seeded primal-dual state"
        );

        Ok(Self {
            weights: RegularizationWeights::from(config),
            steps,
            iterations: config.iterations,
            tolerance: config.tolerance,
            history: Vec::with_capacity(config.iterations),
            phase: LoopPhase::Iterating,
            state,
            data,
        })
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn steps(&self) -> StepSizes {
        self.steps
    }

    pub fn state(&self) -> &PrimalDualState {
        &self.state
    }

    /// Run one iteration. Returns `None` once the loop has finished.
    pub fn advance(&mut self) -> TgvResult<Option<IterationReport>> {
        if let LoopPhase::Finished(_) = self.phase {
            return Ok(None);
        }

        let next = primal_dual_step(&self.state, &self.data, &self.weights, self.steps)?;
        let report = IterationReport {
            iteration: self.history.len(),
            control_change: relative_change(&next.extrapolated.control, &self.state.extrapolated.control)?,
            label_change: relative_change(&next.extrapolated.label, &self.state.extrapolated.label)?,
        };
        self.state = next;
        self.history.push(report);

        if report.control_change.is_nan() || report.label_change.is_nan() {
            warn!(iteration = report.iteration, "relative change undefined, previous estimate is all zero");
        }
        debug!(
            iteration = report.iteration,
            control_change = report.control_change,
            label_change = report.label_change,
            "iteration finished"
        );

        let converged = self
            .tolerance
            .is_some_and(|tol| report.control_change < tol && report.label_change < tol);
        if converged {
            self.phase = LoopPhase::Finished(StopReason::Tolerance);
        } else if self.history.len() >= self.iterations {
            self.phase = LoopPhase::Finished(StopReason::IterationBudget);
        }
        Ok(Some(report))
    }

    /// Final over-relaxed estimates. Stopping before the loop has finished
    /// counts as exhausting the budget.
    pub fn finish(self) -> DenoiseOutput {
        let stop_reason = match self.phase {
            LoopPhase::Finished(reason) => reason,
            LoopPhase::Iterating => StopReason::IterationBudget,
        };
        info!(iterations = self.history.len(), ?stop_reason, "primal-dual iterations done");
        DenoiseOutput {
            control: self.state.extrapolated.control,
            label: self.state.extrapolated.label,
            history: self.history,
            steps: self.steps,
            stop_reason,
        }
    }
}

/// Jointly denoise a control and a label series.
pub fn denoise(
    control: TimeStack,
    label: TimeStack,
    voxel_ratio: [f64; 3],
    config: &DenoiseConfig,
) -> TgvResult<DenoiseOutput> {
    denoise_with_progress(control, label, voxel_ratio, config, |_| {})
}

/// [`denoise`], calling `progress` after every iteration.
pub fn denoise_with_progress<F>(
    control: TimeStack,
    label: TimeStack,
    voxel_ratio: [f64; 3],
    config: &DenoiseConfig,
    mut progress: F,
) -> TgvResult<DenoiseOutput>
where
    F: FnMut(&IterationReport),
{
    let mut run = ConvergenceLoop::new(control, label, voxel_ratio, config)?;
    while let Some(report) = run.advance()? {
        progress(&report);
    }
    Ok(run.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TgvError;
    use ndarray::{Array, Array3};
    use ndarray_rand::rand_distr::Normal;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn noisy_pair(seed: u64) -> (TimeStack, TimeStack) {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 5.0).unwrap();
        let base = Array::from_shape_fn((5, 5, 5, 4), |(i, j, k, _)| 400.0 + 20.0 * (i + j) as f64 - 5.0 * k as f64);
        let control = &base + &Array::random_using(base.raw_dim(), noise, &mut rng);
        let label = &base * 0.97 + &Array::random_using(base.raw_dim(), noise, &mut rng);
        (TimeStack::new(control).unwrap(), TimeStack::new(label).unwrap())
    }

    #[test]
    fn relative_change_uses_nonzero_support_of_previous() {
        let previous = ScalarField::new(Array3::from_shape_vec((1, 1, 4), vec![0.0, 3.0, 0.0, 4.0]).unwrap());
        let current = ScalarField::new(Array3::from_shape_vec((1, 1, 4), vec![1.0, 3.0, 0.0, 4.0]).unwrap());
        assert!((relative_change(&current, &previous).unwrap() - 0.2).abs() < 1e-15);
    }

    #[test]
    fn relative_change_of_all_zero_previous_is_nan() {
        let previous = ScalarField::zeros((2, 2, 2));
        let current = ScalarField::from_elem((2, 2, 2), 1.0);
        assert!(relative_change(&current, &previous).unwrap().is_nan());
    }

    #[test]
    fn runs_the_whole_budget_by_default() {
        let (control, label) = noisy_pair(1);
        let cfg = DenoiseConfig { iterations: 7, ..Default::default() };
        let mut seen = Vec::new();
        let out = denoise_with_progress(control, label, [1.0, 1.0, 1.0], &cfg, |r| seen.push(r.iteration)).unwrap();
        assert_eq!(out.iterations_run(), 7);
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert_eq!(out.stop_reason, StopReason::IterationBudget);
        assert_eq!(out.control.spatial_shape(), (5, 5, 5));
    }

    #[test]
    fn optional_tolerance_stops_early() {
        let (control, label) = noisy_pair(2);
        let cfg = DenoiseConfig { iterations: 50, tolerance: Some(1.0), ..Default::default() };
        let out = denoise(control, label, [1.0, 1.0, 1.0], &cfg).unwrap();
        assert_eq!(out.stop_reason, StopReason::Tolerance);
        assert_eq!(out.iterations_run(), 1);
    }

    #[test]
    fn finished_loop_does_not_advance() {
        let (control, label) = noisy_pair(3);
        let cfg = DenoiseConfig { iterations: 2, ..Default::default() };
        let mut run = ConvergenceLoop::new(control, label, [1.0, 1.0, 1.0], &cfg).unwrap();
        assert!(run.advance().unwrap().is_some());
        assert_eq!(run.phase(), LoopPhase::Iterating);
        assert!(run.advance().unwrap().is_some());
        assert_eq!(run.phase(), LoopPhase::Finished(StopReason::IterationBudget));
        let before = run.state().clone();
        assert!(run.advance().unwrap().is_none());
        assert_eq!(run.state(), &before);
    }

    #[test]
    fn step_sizes_follow_the_norm_bound() {
        let (control, label) = noisy_pair(4);
        let run = ConvergenceLoop::new(control, label, [1.0, 1.0, 1.0], &DenoiseConfig::default()).unwrap();
        let k2 = operator_norm_squared(4, [1.0, 1.0, 1.0]).unwrap();
        let steps = run.steps();
        assert_eq!(steps.sigma, steps.tau);
        assert!(steps.sigma * steps.tau * k2 < 1.0);
        assert!((steps.sigma - 1.0 / (1.1 * k2).sqrt()).abs() < 1e-15);
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        let (control, label) = noisy_pair(5);
        let cfg = DenoiseConfig { lambda: -4.0, ..Default::default() };
        let err = denoise(control, label, [1.0, 1.0, 1.0], &cfg).unwrap_err();
        assert!(matches!(err, TgvError::InvalidConfig { field: "lambda", .. }));
    }

    #[test]
    fn volume_pair_stacks_control_then_label() {
        let (control, label) = noisy_pair(6);
        let out = denoise(control, label, [1.0, 1.0, 1.0], &DenoiseConfig { iterations: 1, ..Default::default() }).unwrap();
        let pair = out.to_volume_pair();
        assert_eq!(pair.dim(), (5, 5, 5, 2));
        assert_eq!(pair[[1, 2, 3, 0]], out.control.data()[[1, 2, 3]]);
        assert_eq!(pair[[1, 2, 3, 1]], out.label.data()[[1, 2, 3]]);
    }
}
