//! Approval requests: how an agency gets a locked form reopened.
//!
//! A form points at the single request that governs it (`open_request`).
//! Filing, deciding and consuming a request all rewrite that pointer in the
//! same transaction as the request itself, so editability never has to be
//! re-derived from request history.
use std::fmt;
use std::str::FromStr;

use sled::Transactional;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use tracing::{info, warn};

use crate::activity::{
    ActivityAction, ActivityLogEntry, ActivityMetadata, EntityType, NotificationKind,
};
use crate::auth::{Capability, authorize, can_view};
use crate::error::WorkflowError;
use crate::form::{Editability, FormHeader, FormStatus};
use crate::portal::Portal;
use crate::store::{FormTrees, abort, remove_form_tx, tx_read, tx_write};
use crate::types::{Session, TimeStamp};
use crate::utils::{REQUEST_HRP, new_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum RequestType {
    #[n(0)]
    UpdateSubmittedForm,
    #[n(1)]
    UpdatePreviousMonth,
    #[n(2)]
    DeleteRecord,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::UpdateSubmittedForm => "UPDATE_SUBMITTED_FORM",
            RequestType::UpdatePreviousMonth => "UPDATE_PREVIOUS_MONTH",
            RequestType::DeleteRecord => "DELETE_RECORD",
        }
    }
    fn reopens_form(&self) -> bool {
        !matches!(self, RequestType::DeleteRecord)
    }
}

impl FromStr for RequestType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPDATE_SUBMITTED_FORM" => Ok(RequestType::UpdateSubmittedForm),
            "UPDATE_PREVIOUS_MONTH" => Ok(RequestType::UpdatePreviousMonth),
            "DELETE_RECORD" => Ok(RequestType::DeleteRecord),
            other => Err(WorkflowError::validation(format!(
                "Unknown request type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Decision {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    /// Cancelled by the requester before an admin decided.
    #[n(3)]
    Withdrawn,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pending => "PENDING",
            Decision::Approved => "APPROVED",
            Decision::Rejected => "REJECTED",
            Decision::Withdrawn => "WITHDRAWN",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ApprovalRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub form_type: String,
    #[n(2)]
    pub form_id: String,
    #[n(3)]
    pub requester_id: String,
    #[n(4)]
    pub request_type: RequestType,
    #[n(5)]
    pub reason: String,
    #[n(6)]
    pub supporting_document_path: String,
    #[n(7)]
    pub decision: Decision,
    #[n(8)]
    pub admin_response: Option<String>,
    #[n(9)]
    pub decided_by: Option<String>,
    #[n(10)]
    pub consumed: bool, // set once the reopened form is resubmitted
    #[n(11)]
    pub created_at: TimeStamp,
    #[n(12)]
    pub decided_at: Option<TimeStamp>,
    #[n(13)]
    pub consumed_at: Option<TimeStamp>,
}

impl ApprovalRequest {
    /// Pending, or approved and still waiting for the resubmission it allows.
    pub fn is_open(&self) -> bool {
        match self.decision {
            Decision::Pending => true,
            Decision::Approved => !self.consumed,
            Decision::Rejected | Decision::Withdrawn => false,
        }
    }

    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::Request {
            request_id: self.id.clone(),
            form_id: self.form_id.clone(),
            request_type: self.request_type,
            decision: self.decision,
        }
    }
}

/// Consumes the approved request that reopened `header` and re-locks it.
///
/// Idempotent: a form with no approved open request is only re-locked.
pub(crate) fn close_open_request_tx(
    requests: &TransactionalTree,
    header: &mut FormHeader,
    now: TimeStamp,
) -> ConflictableTransactionResult<Option<ApprovalRequest>, WorkflowError> {
    header.editability = Editability::Locked;
    let Some(request_id) = header.open_request.clone() else {
        return Ok(None);
    };

    match tx_read::<ApprovalRequest>(requests, &request_id)? {
        Some(mut request) if request.decision == Decision::Approved && !request.consumed => {
            request.consumed = true;
            request.consumed_at = Some(now);
            tx_write(requests, &request.id, &request)?;
            header.open_request = None;
            Ok(Some(request))
        }
        // a pending request still governs the form
        Some(request) if request.is_open() => Ok(None),
        _ => {
            header.open_request = None;
            Ok(None)
        }
    }
}

pub struct ApprovalWorkflow {
    portal: Portal,
}

impl ApprovalWorkflow {
    pub(crate) fn new(portal: Portal) -> Self {
        Self { portal }
    }

    /// File a request to edit (or delete) one of the caller's submitted forms.
    pub fn submit_request(
        &self,
        session: &Session,
        form_type: &str,
        form_id: &str,
        request_type: RequestType,
        reason: &str,
        document_path: &str,
    ) -> Result<ApprovalRequest, WorkflowError> {
        authorize(session, Capability::RequestEditAccess)?;

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(WorkflowError::validation(
                "Please provide a reason for the request.",
            ));
        }
        let document_path = document_path.trim();
        if document_path.is_empty() {
            return Err(WorkflowError::validation(
                "A supporting document is required.",
            ));
        }

        let now = self.portal.now();
        let request = ApprovalRequest {
            id: new_id(REQUEST_HRP)?,
            form_type: form_type.to_string(),
            form_id: form_id.to_string(),
            requester_id: session.user_id.clone(),
            request_type,
            reason: reason.to_string(),
            supporting_document_path: document_path.to_string(),
            decision: Decision::Pending,
            admin_response: None,
            decided_by: None,
            consumed: false,
            created_at: now,
            decided_at: None,
            consumed_at: None,
        };

        let store = self.portal.store();
        let budget = self.portal.budget();
        let result = (&store.forms, &store.requests).transaction(|(forms, requests)| {
            let header = match tx_read::<FormHeader>(forms, form_id)? {
                Some(h) if h.form_type == form_type && h.owner_id == session.user_id => h,
                _ => return abort(WorkflowError::not_found("Form")),
            };

            if let Some(open_id) = &header.open_request {
                if let Some(open) = tx_read::<ApprovalRequest>(requests, open_id)? {
                    if open.is_open() {
                        return abort(WorkflowError::conflict(
                            "An approval request for this form is already open. Wait for the admin decision.",
                        ));
                    }
                }
            }
            if header.status != FormStatus::Submitted {
                return abort(WorkflowError::state(
                    "Only submitted forms need an approval request. Drafts can be edited directly.",
                ));
            }

            let mut header = header;
            header.open_request = Some(request.id.clone());
            tx_write(requests, &request.id, &request)?;
            tx_write(forms, &header.id, &header)?;
            budget.check()
        });
        if let Err(err) = result.map_err(WorkflowError::from) {
            warn!(form_id, user = %session.user_id, error = %err, "approval request rejected");
            return Err(err);
        }

        self.portal.record_activity(ActivityLogEntry::new(
            &session.user_id,
            ActivityAction::ApprovalRequested,
            EntityType::ApprovalRequest,
            &request.id,
            format!(
                "Requested {} for form {}",
                request.request_type.as_str(),
                form_id
            ),
            request.metadata(),
            &session.client,
            now,
        ));
        self.portal.notify_admins(
            NotificationKind::ApprovalRequested,
            "New approval request",
            &format!(
                "An agency requested {} on a {} form: {}",
                request.request_type.as_str(),
                form_type,
                request.reason
            ),
            Some(&request.id),
        );
        info!(request_id = %request.id, form_id, "approval request filed");

        Ok(request)
    }

    /// Approve or reject a pending request.
    ///
    /// Approving an update request reopens the form for resubmission;
    /// approving a delete request removes the form.
    pub fn decide_request(
        &self,
        session: &Session,
        request_id: &str,
        decision: Decision,
        admin_response: Option<&str>,
    ) -> Result<ApprovalRequest, WorkflowError> {
        authorize(session, Capability::DecideApprovalRequests)?;
        if !matches!(decision, Decision::Approved | Decision::Rejected) {
            return Err(WorkflowError::validation(
                "A decision must be APPROVED or REJECTED.",
            ));
        }

        let now = self.portal.now();
        let store = self.portal.store();
        let budget = self.portal.budget();
        let response = admin_response
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        let (request, removed_form) = (
            &store.forms,
            &store.rows,
            &store.owners,
            &store.unique_keys,
            &store.requests,
            &store.cm_approvals,
        )
            .transaction(
                |(forms, rows, owners, unique_keys, requests, cm_approvals)| {
                    let Some(mut request) = tx_read::<ApprovalRequest>(requests, request_id)?
                    else {
                        return abort(WorkflowError::not_found("Approval request"));
                    };
                    if request.decision != Decision::Pending {
                        return abort(WorkflowError::state(
                            "This approval request has already been decided.",
                        ));
                    }
                    let header = tx_read::<FormHeader>(forms, &request.form_id)?;
                    let mut removed_form = None;

                    match (decision, header) {
                        (Decision::Approved, None) => {
                            return abort(WorkflowError::not_found("Form"));
                        }
                        (Decision::Approved, Some(mut header)) => {
                            if request.request_type.reopens_form() {
                                header.status = FormStatus::Draft;
                                header.editability = Editability::EditablePendingResubmission;
                                header.open_request = Some(request.id.clone());
                                header.updated_at = now;
                                tx_write(forms, &header.id, &header)?;
                            } else {
                                let trees = FormTrees {
                                    forms,
                                    rows,
                                    owners,
                                    unique_keys,
                                    cm_approvals,
                                };
                                remove_form_tx(&trees, &header)?;
                                request.consumed = true;
                                request.consumed_at = Some(now);
                                removed_form = Some(header);
                            }
                        }
                        (_, Some(mut header)) => {
                            if header.open_request.as_deref() == Some(request.id.as_str()) {
                                header.open_request = None;
                                tx_write(forms, &header.id, &header)?;
                            }
                        }
                        (_, None) => {}
                    }

                    request.decision = decision;
                    request.admin_response = response.clone();
                    request.decided_by = Some(session.user_id.clone());
                    request.decided_at = Some(now);
                    tx_write(requests, &request.id, &request)?;
                    budget.check()?;
                    Ok((request, removed_form))
                },
            )
            .map_err(WorkflowError::from)
            .inspect_err(|err| {
                warn!(request_id, admin = %session.user_id, error = %err, "approval decision rejected");
            })?;

        self.portal.record_activity(ActivityLogEntry::new(
            &session.user_id,
            ActivityAction::ApprovalDecided,
            EntityType::ApprovalRequest,
            &request.id,
            format!("{} request {}", decision, request.id),
            request.metadata(),
            &session.client,
            now,
        ));
        if let Some(header) = &removed_form {
            self.portal.record_activity(ActivityLogEntry::new(
                &session.user_id,
                ActivityAction::FormDeleted,
                EntityType::Form,
                &header.id,
                format!("Deleted under approved request {}", request.id),
                ActivityMetadata::Transition {
                    old: Some(header.snapshot()),
                    new: None,
                    was_resubmission: false,
                },
                &session.client,
                now,
            ));
        }

        let (kind, title) = match decision {
            Decision::Approved => (NotificationKind::ApprovalApproved, "Request approved"),
            _ => (NotificationKind::ApprovalRejected, "Request rejected"),
        };
        let mut message = format!(
            "Your {} request was {}.",
            request.request_type.as_str(),
            decision.as_str().to_lowercase()
        );
        if let Some(response) = &request.admin_response {
            message.push_str(&format!(" Admin response: {response}"));
        }
        self.portal.notify(
            &request.requester_id,
            kind,
            title,
            &message,
            Some(&request.form_id),
        );
        info!(request_id = %request.id, decision = %decision, "approval request decided");

        Ok(request)
    }

    /// Cancel one of the caller's pending requests.
    pub fn withdraw_request(
        &self,
        session: &Session,
        request_id: &str,
    ) -> Result<ApprovalRequest, WorkflowError> {
        authorize(session, Capability::RequestEditAccess)?;
        let now = self.portal.now();
        let store = self.portal.store();
        let budget = self.portal.budget();

        let request = (&store.forms, &store.requests)
            .transaction(|(forms, requests)| {
                let mut request = match tx_read::<ApprovalRequest>(requests, request_id)? {
                    Some(r) if r.requester_id == session.user_id => r,
                    _ => return abort(WorkflowError::not_found("Approval request")),
                };
                if request.decision != Decision::Pending {
                    return abort(WorkflowError::state(
                        "Only pending requests can be withdrawn.",
                    ));
                }
                if let Some(mut header) = tx_read::<FormHeader>(forms, &request.form_id)? {
                    if header.open_request.as_deref() == Some(request.id.as_str()) {
                        header.open_request = None;
                        tx_write(forms, &header.id, &header)?;
                    }
                }
                request.decision = Decision::Withdrawn;
                request.decided_at = Some(now);
                tx_write(requests, &request.id, &request)?;
                budget.check()?;
                Ok(request)
            })
            .map_err(WorkflowError::from)?;

        self.portal.record_activity(ActivityLogEntry::new(
            &session.user_id,
            ActivityAction::ApprovalWithdrawn,
            EntityType::ApprovalRequest,
            &request.id,
            "Request withdrawn by the agency",
            request.metadata(),
            &session.client,
            now,
        ));
        Ok(request)
    }

    /// Consumes an approved request still attached to a resubmitted form.
    ///
    /// The lifecycle engine does this inside its resubmission transaction;
    /// this admin entry point repairs forms where that did not happen and is
    /// safe to repeat. A reopened form that has not been resubmitted yet is
    /// refused, so the agency keeps the edit it was granted.
    pub fn handle_form_resubmission(
        &self,
        session: &Session,
        form_type: &str,
        form_id: &str,
    ) -> Result<Option<ApprovalRequest>, WorkflowError> {
        authorize(session, Capability::DecideApprovalRequests)?;
        let now = self.portal.now();
        let store = self.portal.store();
        let budget = self.portal.budget();

        let (header, closed) = (&store.forms, &store.requests)
            .transaction(|(forms, requests)| {
                let mut header = match tx_read::<FormHeader>(forms, form_id)? {
                    Some(h) if h.form_type == form_type => h,
                    _ => return abort(WorkflowError::not_found("Form")),
                };
                if header.status != FormStatus::Submitted {
                    return abort(WorkflowError::state(
                        "This form has not been resubmitted yet. Its edit access stays open.",
                    ));
                }
                let closed = close_open_request_tx(requests, &mut header, now)?;
                tx_write(forms, &header.id, &header)?;
                budget.check()?;
                Ok((header, closed))
            })
            .map_err(WorkflowError::from)?;

        if let Some(request) = &closed {
            self.record_consumed(&session.user_id, request, &session.client, now);
            info!(request_id = %request.id, form_id = %header.id, "approval request consumed by repair");
        }
        Ok(closed)
    }

    /// Follow-up once the lifecycle engine committed a resubmission.
    pub(crate) fn after_resubmission(
        &self,
        session: &Session,
        header: &FormHeader,
        closed: Option<&ApprovalRequest>,
    ) {
        let now = self.portal.now();
        if let Some(request) = closed {
            self.record_consumed(&session.user_id, request, &session.client, now);
        }
        self.portal.notify_admins(
            NotificationKind::FormResubmitted,
            "Form resubmitted",
            &format!(
                "A {} form was resubmitted after an approved edit.",
                header.form_type
            ),
            Some(&header.id),
        );
    }

    fn record_consumed(
        &self,
        actor_id: &str,
        request: &ApprovalRequest,
        client: &crate::types::ClientInfo,
        now: TimeStamp,
    ) {
        self.portal.record_activity(ActivityLogEntry::new(
            actor_id,
            ActivityAction::ApprovalConsumed,
            EntityType::ApprovalRequest,
            &request.id,
            format!("Form {} resubmitted; edit access closed", request.form_id),
            request.metadata(),
            client,
            now,
        ));
    }

    /// Admin queue of undecided requests, oldest first.
    pub fn pending_requests(&self, session: &Session) -> Result<Vec<ApprovalRequest>, WorkflowError> {
        authorize(session, Capability::DecideApprovalRequests)?;
        Ok(self
            .portal
            .store()
            .approval_requests()?
            .into_iter()
            .filter(|r| r.decision == Decision::Pending)
            .collect())
    }

    pub fn requests_for_form(
        &self,
        session: &Session,
        form_type: &str,
        form_id: &str,
    ) -> Result<Vec<ApprovalRequest>, WorkflowError> {
        self.visible_header(session, form_type, form_id)?;
        Ok(self
            .portal
            .store()
            .approval_requests()?
            .into_iter()
            .filter(|r| r.form_type == form_type && r.form_id == form_id)
            .collect())
    }

    pub fn is_editable(
        &self,
        session: &Session,
        form_type: &str,
        form_id: &str,
    ) -> Result<bool, WorkflowError> {
        Ok(self.visible_header(session, form_type, form_id)?.is_editable())
    }

    fn visible_header(
        &self,
        session: &Session,
        form_type: &str,
        form_id: &str,
    ) -> Result<FormHeader, WorkflowError> {
        match self.portal.store().form_header(form_id)? {
            Some(h) if h.form_type == form_type && can_view(session, &h.owner_id) => Ok(h),
            _ => Err(WorkflowError::not_found("Form")),
        }
    }
}
