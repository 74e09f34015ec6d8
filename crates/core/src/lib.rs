pub mod audit;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod ports;
pub mod workflow;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use context::ContextCache;
pub use domain::business::{BusinessContext, BusinessId};
pub use domain::call::{Call, CallId, CallMetrics, CallStatus, IncomingCall};
pub use domain::conversation::{
    Channel, Conversation, ConversationAction, ConversationId, ConversationStatus, Intent,
    Message, MessageType,
};
pub use domain::routing::{Route, RouteId, RoutingRule, RuleId};
pub use domain::workflow::{
    ExecutionId, ExecutionRequest, ExecutionStatus, WorkflowDefinition, WorkflowExecution,
    WorkflowId,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use workflow::WorkflowEngine;
