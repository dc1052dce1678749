//! Numerical Hessian workflow: perturb a molecular geometry along every
//! Cartesian coordinate, run one single-point gradient job per perturbation
//! on the batch system, and assemble the second-derivative matrix by central
//! differences.
//!
//! The quantum-chemistry application's text formats stay behind the
//! [`SinglePointCodec`] port; this crate only decides *which* computations to
//! run and how to combine their gradients.

pub mod codec;
#[cfg(feature = "harmonic")]
pub mod harmonic;
pub mod workflow;

pub use codec::{CodecError, Geometry, JobParams, RunKind, SinglePointCodec, SinglePointOutput};
pub use workflow::{hessian_result, HessianWorkflow, WORKFLOW_KIND};
