pub mod bus;
pub mod error;
pub mod task;

pub use bus::{EventBus, SharedEventBus};
pub use error::{Result, VigilError};
pub use task::{PeriodicTask, TaskHandle};
