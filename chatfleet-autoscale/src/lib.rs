pub mod autoscaler;
pub mod orchestrator;
pub mod policy;

pub use autoscaler::{Autoscaler, TickOutcome};
pub use orchestrator::{KubernetesOrchestrator, Orchestrator};
pub use policy::{ScaleDecision, ScalePolicy};
