pub mod orchestrator;
pub mod probe;
pub mod status;

pub use orchestrator::{HealthCheckOrchestrator, HealthConfig};
pub use probe::{BlockingProbe, HealthProbe, HttpProbe, ProbeOutcome};
pub use status::{HealthCheckResult, HealthStatus, OverallHealth};
