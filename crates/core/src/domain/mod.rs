pub mod business;
pub mod call;
pub mod conversation;
pub mod routing;
pub mod workflow;
