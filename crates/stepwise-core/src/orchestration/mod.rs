//! Multi-step orchestration: definitions, runtime sessions and the engine
//! that advances them.

pub mod definition;
pub mod engine;
pub mod locks;
pub mod registry;
pub mod session;

pub use definition::{
    find_first_step, find_next_eligible_step, validate_orchestration, validate_steps,
    CompletionTarget, DefinitionDraft, OrchestrationDefinition, OrchestrationStep,
    ValidationError, ValidationOutcome,
};
pub use engine::{Advance, Engine, EngineSettings, IgnoreReason, Observed, StartedOrchestration};
pub use registry::DefinitionRegistry;
pub use session::{OrchestrationSession, StepCompletion, StepResult};
