pub mod api;
pub mod engine;
pub mod worker;

pub use api::create_router;
pub use engine::{Engine, SchedulerStatus};
