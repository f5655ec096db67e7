pub mod evaluator;
pub mod event;
pub mod rule;
pub mod state;

pub use evaluator::{AlertEvaluator, EvaluationReport, EvaluatorConfig};
pub use event::{AlertEvent, AlertStatus, AlertTransition, TransitionKind};
pub use rule::{AlertThreshold, Comparison, Severity};
pub use state::{AlertStateManager, RaiseOutcome, StateConfig};
