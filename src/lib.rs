//! Joint denoising of paired ASL control/label series with a primal-dual
//! scheme and a second-order (TGV-style) regulariser.
//!
//! # Modules
//! - `field`: scalar, vector, tensor and time-stack fields on a voxel grid
//! - `diff`: forward/backward differences, `grad`, `div`, `epsilon`
//! - `prox`: pointwise projection onto norm balls
//! - `operator_norm`: step-size bound for the coupled operator
//! - `step`: one primal-dual iteration and its state record
//! - `solver`: the iteration loop and its diagnostics
//! - `archive`: loading the interleaved series from an NPZ file
//! - `preprocess`: splitting and normalising raw interleaved series
//! - `config`: solver settings

pub mod archive;
pub mod config;
pub mod diff;
pub mod error;
pub mod field;
pub mod operator_norm;
pub mod preprocess;
pub mod prox;
pub mod solver;
pub mod step;

pub use config::DenoiseConfig;
pub use error::{TgvError, TgvResult};
pub use field::{FieldKind, FieldRef, GridField, ScalarField, TensorField, TimeStack, VectorField};
pub use solver::{denoise, denoise_with_progress, ConvergenceLoop, DenoiseOutput, IterationReport, StopReason};
