//! Approval-gated form workflows for a collection-agency compliance portal.
//!
//! Agencies fill in forms as drafts and submit them, which locks them. A
//! locked form is reopened only through an approval request decided by an
//! admin, and the reopened form is locked again on resubmission. Some form
//! types also need every row approved by a collection manager, who signs in
//! through a short-lived session delegated from the agency's own.

pub mod action;
pub mod activity;
pub mod approval;
pub mod auth;
pub mod clock;
pub mod cm_approval;
pub mod cm_session;
pub mod config;
pub mod directory;
pub mod error;
pub mod form;
pub mod lifecycle;
pub mod portal;
pub mod store;
pub mod types;
pub mod utils;

pub use action::{ActionResponse, respond};
pub use approval::{ApprovalRequest, ApprovalWorkflow, Decision, RequestType};
pub use cm_session::{DelegatedApprovals, LoginGrant, RowApproval, RowApprovalRequest};
pub use config::WorkflowConfig;
pub use error::WorkflowError;
pub use form::{DetailRow, Editability, FormKind, FormStatus, RowInput};
pub use lifecycle::{FormLifecycle, SaveOutcome, Transition};
pub use portal::Portal;
pub use types::{Role, Session};
