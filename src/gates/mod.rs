//! Quality gates: per-stage policy and its evaluation.

pub mod evaluator;
pub mod registry;

pub use evaluator::{ArtifactChecker, FsArtifactChecker, GateEvaluator, GateReport};
pub use registry::{GateOverride, GateRegistry, GateStatus, GateSummary, QualityGate};
