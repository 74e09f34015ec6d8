pub mod actions;
pub mod engine;
pub mod trigger;

pub use actions::{ActionError, ActionExecutor, ActionScope, MessagingActionExecutor};
pub use engine::{TickReport, WorkflowEngine};
pub use trigger::evaluate_trigger;
