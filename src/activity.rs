//! Append-only activity trail and the per-user notification queue.
use std::fmt;

use crate::approval::{Decision, RequestType};
use crate::cm_approval::CmApproval;
use crate::error::WorkflowError;
use crate::form::{Editability, FormStatus};
use crate::types::{ClientInfo, TimeStamp};
use crate::utils::{ACTIVITY_HRP, NOTIFICATION_HRP, new_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ActivityAction {
    #[n(0)]
    FormCreated,
    #[n(1)]
    FormUpdated,
    #[n(2)]
    FormSubmitted,
    #[n(3)]
    FormResubmitted,
    #[n(4)]
    FormDeleted,
    #[n(5)]
    ApprovalRequested,
    #[n(6)]
    ApprovalDecided,
    #[n(7)]
    ApprovalWithdrawn,
    #[n(8)]
    ApprovalConsumed,
    #[n(9)]
    CmLogin,
    #[n(10)]
    CmLogout,
    #[n(11)]
    ApprovalGranted,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::FormCreated => "FORM_CREATED",
            ActivityAction::FormUpdated => "FORM_UPDATED",
            ActivityAction::FormSubmitted => "FORM_SUBMITTED",
            ActivityAction::FormResubmitted => "FORM_RESUBMITTED",
            ActivityAction::FormDeleted => "FORM_DELETED",
            ActivityAction::ApprovalRequested => "APPROVAL_REQUESTED",
            ActivityAction::ApprovalDecided => "APPROVAL_DECIDED",
            ActivityAction::ApprovalWithdrawn => "APPROVAL_WITHDRAWN",
            ActivityAction::ApprovalConsumed => "APPROVAL_CONSUMED",
            ActivityAction::CmLogin => "CM_LOGIN",
            ActivityAction::CmLogout => "CM_LOGOUT",
            ActivityAction::ApprovalGranted => "APPROVAL_GRANTED",
        }
    }
}

impl fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum EntityType {
    #[n(0)]
    Form,
    #[n(1)]
    ApprovalRequest,
    #[n(2)]
    CmSession,
    #[n(3)]
    CmApproval,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Form => "form",
            EntityType::ApprovalRequest => "approval_request",
            EntityType::CmSession => "cm_session",
            EntityType::CmApproval => "cm_approval",
        }
    }
}

/// Form state captured before and after a transition.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct FormSnapshot {
    #[n(0)]
    pub status: FormStatus,
    #[n(1)]
    pub editability: Editability,
    #[n(2)]
    pub row_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ActivityMetadata {
    #[n(0)]
    Transition {
        #[n(0)]
        old: Option<FormSnapshot>,
        #[n(1)]
        new: Option<FormSnapshot>,
        #[n(2)]
        was_resubmission: bool,
    },
    #[n(1)]
    Request {
        #[n(0)]
        request_id: String,
        #[n(1)]
        form_id: String,
        #[n(2)]
        request_type: RequestType,
        #[n(3)]
        decision: Decision,
    },
    #[n(2)]
    Session {
        #[n(0)]
        session_ref: String, // digest of the token, never the token itself
        #[n(1)]
        cm_user_id: String,
        #[n(2)]
        agency_user_id: String,
        #[n(3)]
        product_tag: String,
    },
    #[n(3)]
    Approval(#[n(0)] CmApproval),
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ActivityLogEntry {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub actor_id: String,
    #[n(2)]
    pub action: ActivityAction,
    #[n(3)]
    pub entity_type: EntityType,
    #[n(4)]
    pub entity_id: String,
    #[n(5)]
    pub description: String,
    #[n(6)]
    pub metadata: ActivityMetadata,
    #[n(7)]
    pub created_at: TimeStamp,
    #[n(8)]
    pub ip_address: Option<String>,
    #[n(9)]
    pub user_agent: Option<String>,
}

impl ActivityLogEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        actor_id: &str,
        action: ActivityAction,
        entity_type: EntityType,
        entity_id: &str,
        description: impl Into<String>,
        metadata: ActivityMetadata,
        client: &ClientInfo,
        created_at: TimeStamp,
    ) -> Result<Self, WorkflowError> {
        Ok(Self {
            id: new_id(ACTIVITY_HRP)?,
            actor_id: actor_id.to_string(),
            action,
            entity_type,
            entity_id: entity_id.to_string(),
            description: description.into(),
            metadata,
            created_at,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        })
    }

    pub fn was_resubmission(&self) -> bool {
        matches!(
            self.metadata,
            ActivityMetadata::Transition {
                was_resubmission: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum NotificationKind {
    #[n(0)]
    FormSubmitted,
    #[n(1)]
    FormResubmitted,
    #[n(2)]
    ApprovalRequested,
    #[n(3)]
    ApprovalApproved,
    #[n(4)]
    ApprovalRejected,
    #[n(5)]
    CmLogin,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::FormSubmitted => "FORM_SUBMITTED",
            NotificationKind::FormResubmitted => "FORM_RESUBMITTED",
            NotificationKind::ApprovalRequested => "APPROVAL_REQUESTED",
            NotificationKind::ApprovalApproved => "APPROVAL_APPROVED",
            NotificationKind::ApprovalRejected => "APPROVAL_REJECTED",
            NotificationKind::CmLogin => "CM_LOGIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Notification {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub recipient_id: String,
    #[n(2)]
    pub kind: NotificationKind,
    #[n(3)]
    pub title: String,
    #[n(4)]
    pub message: String,
    #[n(5)]
    pub entity_id: Option<String>,
    #[n(6)]
    pub read: bool,
    #[n(7)]
    pub created_at: TimeStamp,
}

impl Notification {
    pub fn new(
        recipient_id: &str,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        entity_id: Option<&str>,
        created_at: TimeStamp,
    ) -> Result<Self, WorkflowError> {
        Ok(Self {
            id: new_id(NOTIFICATION_HRP)?,
            recipient_id: recipient_id.to_string(),
            kind,
            title: title.into(),
            message: message.into(),
            entity_id: entity_id.map(str::to_string),
            read: false,
            created_at,
        })
    }
}
