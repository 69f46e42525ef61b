//! Capability policy evaluated once at every entry point.
use crate::error::WorkflowError;
use crate::types::{Role, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Create, save, submit and delete the caller's own forms.
    EditOwnForms,
    /// File or withdraw an edit request for one of the caller's forms.
    RequestEditAccess,
    /// Approve or reject approval requests.
    DecideApprovalRequests,
    /// Read any agency's forms and requests.
    ReviewForms,
    /// Host a delegated collection-manager session inside the agency session.
    HostCmSession,
}

impl Capability {
    fn allows(&self, role: Role) -> bool {
        match self {
            Capability::EditOwnForms
            | Capability::RequestEditAccess
            | Capability::HostCmSession => role == Role::User,
            Capability::DecideApprovalRequests => {
                matches!(role, Role::Admin | Role::SuperAdmin)
            }
            Capability::ReviewForms => {
                matches!(role, Role::Admin | Role::SuperAdmin | Role::Auditor)
            }
        }
    }

    fn denial(&self) -> &'static str {
        match self {
            Capability::EditOwnForms => "only agency users can edit forms",
            Capability::RequestEditAccess => "only agency users can request edit access",
            Capability::DecideApprovalRequests => "only admins can decide approval requests",
            Capability::ReviewForms => "only admins and auditors can review agency forms",
            Capability::HostCmSession => {
                "collection manager sessions can only be opened from an agency session"
            }
        }
    }
}

pub fn authorize(session: &Session, capability: Capability) -> Result<(), WorkflowError> {
    if session.user_id.trim().is_empty() {
        return Err(WorkflowError::Unauthorized);
    }
    if !capability.allows(session.role) {
        tracing::warn!(
            user = %session.user_id,
            role = %session.role,
            ?capability,
            "rejected action for role"
        );
        return Err(WorkflowError::forbidden(capability.denial()));
    }
    Ok(())
}

/// Callers that may read a form owned by `owner_id`.
pub fn can_view(session: &Session, owner_id: &str) -> bool {
    session.user_id == owner_id || Capability::ReviewForms.allows(session.role)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agency_capabilities_are_user_only() {
        let agency = Session::new("agency_1", Role::User);
        let admin = Session::new("admin_1", Role::Admin);

        assert!(authorize(&agency, Capability::EditOwnForms).is_ok());
        assert!(authorize(&agency, Capability::HostCmSession).is_ok());
        assert!(matches!(
            authorize(&admin, Capability::EditOwnForms),
            Err(WorkflowError::Forbidden(_))
        ));
    }

    #[test]
    fn both_admin_roles_decide_requests() {
        for role in [Role::Admin, Role::SuperAdmin] {
            let session = Session::new("someone", role);
            assert!(authorize(&session, Capability::DecideApprovalRequests).is_ok());
        }
        let auditor = Session::new("auditor", Role::Auditor);
        assert!(authorize(&auditor, Capability::DecideApprovalRequests).is_err());
        assert!(authorize(&auditor, Capability::ReviewForms).is_ok());
    }

    #[test]
    fn blank_user_is_unauthorized() {
        let session = Session::new("  ", Role::Admin);
        assert!(matches!(
            authorize(&session, Capability::ReviewForms),
            Err(WorkflowError::Unauthorized)
        ));
    }

    #[test]
    fn owners_and_reviewers_can_view() {
        assert!(can_view(&Session::new("agency_1", Role::User), "agency_1"));
        assert!(!can_view(&Session::new("agency_2", Role::User), "agency_1"));
        assert!(can_view(&Session::new("auditor", Role::Auditor), "agency_1"));
        assert!(!can_view(
            &Session::new("cm", Role::CollectionManager),
            "agency_1"
        ));
    }
}
