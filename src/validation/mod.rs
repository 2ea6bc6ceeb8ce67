//! Pre-flight checks for workflow graphs and error routing configuration.
//!
//! Neither validator touches a running [`Runner`](crate::runner::Runner);
//! both report findings as data so callers decide what to do with them.

pub mod error_routing;
pub mod workflow;

pub use error_routing::{ErrorRoutingValidator, ValidationResult, RECOMMENDED_HANDLERS};
pub use workflow::{
    AgentNode, AgentType, WorkflowError, WorkflowIssue, WorkflowIssueKind,
    WorkflowValidationResult, WorkflowValidator,
};
