use serde::{Deserialize, Serialize};

use crate::error::{TgvError, TgvResult};

/// Solver settings. The defaults reproduce the reference run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseConfig {
    /// Number of primal-dual iterations.
    pub iterations: usize,
    /// Radius of the data-fidelity dual balls.
    pub lambda: f64,
    /// Second-order (symmetrised gradient) regulariser weight.
    pub alpha0: f64,
    /// First-order (gradient) regulariser weight.
    pub alpha1: f64,
    /// Scale of the label regulariser.
    pub gamma1: f64,
    /// Scale of the control-minus-label regulariser.
    pub gamma2: f64,
    /// Factor applied to the operator-norm bound before deriving step sizes.
    pub norm_safety: f64,
    /// Stop early once both relative changes drop below this. `None` runs
    /// the full iteration budget.
    pub tolerance: Option<f64>,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            iterations: 100,
            lambda: 4.0,
            alpha0: 3f64.sqrt(),
            alpha1: 1.0,
            gamma1: 1.0,
            gamma2: 1.0,
            norm_safety: 1.1,
            tolerance: None,
        }
    }
}

fn positive(field: &'static str, value: f64) -> TgvResult<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(TgvError::InvalidConfig {
            field,
            reason: format!("must be positive and finite, got {value}"),
        })
    }
}

impl DenoiseConfig {
    pub fn validate(&self) -> TgvResult<()> {
        if self.iterations == 0 {
            return Err(TgvError::InvalidConfig {
                field: "iterations",
                reason: "at least one iteration is required".into(),
            });
        }
        positive("lambda", self.lambda)?;
        positive("alpha0", self.alpha0)?;
        positive("alpha1", self.alpha1)?;
        positive("gamma1", self.gamma1)?;
        positive("gamma2", self.gamma2)?;
        if !(self.norm_safety >= 1.0 && self.norm_safety.is_finite()) {
            return Err(TgvError::InvalidConfig {
                field: "norm_safety",
                reason: format!("must be at least 1, got {}", self.norm_safety),
            });
        }
        if let Some(tol) = self.tolerance {
            positive("tolerance", tol)?;
        }
        Ok(())
    }
}
