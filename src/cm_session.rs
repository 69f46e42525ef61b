//! Delegated collection-manager sessions.
//!
//! A CM signs in inside an agency's own session and approves individual
//! rows. The grant lives only in this process: a keyed map with a sliding
//! time-to-live. Expiry is checked on every access, and the portal's
//! sweeper thread removes expired sessions on a fixed interval. A late
//! sweep can delay the removal of a dead session but never lets one act.
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sled::Transactional;
use tracing::{debug, info, warn};

use crate::activity::{
    ActivityAction, ActivityLogEntry, ActivityMetadata, EntityType, NotificationKind,
};
use crate::auth::{Capability, authorize};
use crate::cm_approval::{CmApproval, Signatory, signature_digest};
use crate::error::WorkflowError;
use crate::form::FormHeader;
use crate::portal::Portal;
use crate::store::{abort, row_key, tx_read, tx_write};
use crate::types::{Session, TimeStamp};
use crate::utils::{CM_APPROVAL_HRP, new_id, new_session_token, session_reference};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatedSession {
    pub session_id: String,
    pub cm_profile_id: String,
    pub cm_user_id: String,
    pub cm_name: String,
    pub cm_email: String,
    pub cm_designation: String,
    pub product_tag: String,
    /// The agency user whose session hosts this one.
    pub agency_user_id: String,
    pub login_time: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl DelegatedSession {
    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        self.login_time + ttl
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.login_time >= ttl
    }

    /// Whole minutes left, rounded up.
    pub fn remaining_minutes(&self, now: DateTime<Utc>, ttl: Duration) -> i64 {
        let seconds = (self.expires_at(ttl) - now).num_seconds().max(0);
        (seconds + 59) / 60
    }

    fn reference(&self) -> String {
        session_reference(&self.session_id)
    }
}

/// Process-local map of live delegated sessions.
///
/// Its methods are the only way sessions change. Operations on one id are
/// serialised by the map's entry lock; a later touch wins.
#[derive(Debug)]
pub struct CmSessionStore {
    sessions: DashMap<String, DelegatedSession>,
    ttl: Duration,
    cleanup_every: Duration,
    last_cleanup: AtomicI64,
}

impl CmSessionStore {
    pub fn new(ttl: Duration, cleanup_every: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            cleanup_every,
            last_cleanup: AtomicI64::new(i64::MIN),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, session: DelegatedSession) {
        self.sessions.insert(session.session_id.clone(), session);
    }

    /// Drops earlier sessions the same CM opened inside the same agency session.
    fn supersede(&self, agency_user_id: &str, cm_profile_id: &str) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, s| {
            let keep = !(s.agency_user_id == agency_user_id && s.cm_profile_id == cm_profile_id);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// The session behind `session_id` if `agency_user_id` hosts it and it is
    /// still live. An expired session is removed on the way out.
    pub fn validate(
        &self,
        session_id: &str,
        agency_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DelegatedSession, WorkflowError> {
        // the read guard must be released before any removal on the same shard
        let outcome = match self.sessions.get(session_id) {
            None => return Err(WorkflowError::SessionNotFound),
            Some(entry) if entry.agency_user_id != agency_user_id => {
                Err(WorkflowError::SessionMismatch)
            }
            Some(entry) if entry.is_expired(now, self.ttl) => Err(WorkflowError::SessionExpired),
            Some(entry) => Ok(entry.clone()),
        };

        if matches!(outcome, Err(WorkflowError::SessionExpired)) {
            self.sessions
                .remove_if(session_id, |_, s| s.is_expired(now, self.ttl));
            debug!(session_ref = %session_reference(session_id), "expired CM session removed");
        }
        outcome
    }

    /// Slide the expiry window of a live session forward to `now`.
    pub fn touch(&self, session_id: &str, agency_user_id: &str, now: DateTime<Utc>) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry)
                if entry.agency_user_id == agency_user_id && !entry.is_expired(now, self.ttl) =>
            {
                if now > entry.login_time {
                    entry.login_time = now;
                }
                true
            }
            _ => false,
        }
    }

    pub fn remove_owned(
        &self,
        session_id: &str,
        agency_user_id: &str,
    ) -> Result<DelegatedSession, WorkflowError> {
        match self
            .sessions
            .remove_if(session_id, |_, s| s.agency_user_id == agency_user_id)
        {
            Some((_, session)) => Ok(session),
            None if self.sessions.contains_key(session_id) => Err(WorkflowError::SessionMismatch),
            None => Err(WorkflowError::SessionNotFound),
        }
    }

    /// Live sessions hosted by `agency_user_id`, oldest login first. Expired
    /// ones found along the way are removed.
    pub fn active_for(&self, agency_user_id: &str, now: DateTime<Utc>) -> Vec<DelegatedSession> {
        let mut active = vec![];
        let mut expired = vec![];
        for entry in self.sessions.iter() {
            if entry.agency_user_id != agency_user_id {
                continue;
            }
            if entry.is_expired(now, self.ttl) {
                expired.push(entry.key().clone());
            } else {
                active.push(entry.value().clone());
            }
        }
        for id in expired {
            self.sessions.remove_if(&id, |_, s| s.is_expired(now, self.ttl));
        }
        active.sort_by_key(|s| s.login_time);
        active
    }

    /// Sweep expired sessions unless a sweep ran within the cleanup interval.
    pub fn maybe_cleanup(&self, now: DateTime<Utc>) -> usize {
        let now_nanos = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let last = self.last_cleanup.load(Ordering::Acquire);
        let gap = self.cleanup_every.num_nanoseconds().unwrap_or(i64::MAX);
        if last != i64::MIN && now_nanos.saturating_sub(last) < gap {
            return 0;
        }
        if self
            .last_cleanup
            .compare_exchange(last, now_nanos, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // another caller is sweeping
            return 0;
        }
        self.cleanup(now)
    }

    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, s| {
            let keep = !s.is_expired(now, self.ttl);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Returned to the agency after a successful CM login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginGrant {
    pub session_id: String,
    pub cm_name: String,
    pub cm_email: String,
    pub product_tag: String,
    pub expires_in_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowApprovalRequest {
    pub session_id: String,
    pub form_type: String,
    pub form_id: String,
    pub row_id: String,
    pub field: String,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionManagerSummary {
    pub name: String,
    pub email: String,
    pub designation: String,
    pub product_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowApproval {
    pub approval_id: String,
    pub approval_signature: String,
    pub timestamp: TimeStamp,
    pub collection_manager: CollectionManagerSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub session_id: String,
    pub cm_name: String,
    pub cm_email: String,
    pub product_tag: String,
    pub login_time: TimeStamp,
    pub expires_at: TimeStamp,
    pub remaining_minutes: i64,
}

pub struct DelegatedApprovals {
    portal: Portal,
}

impl DelegatedApprovals {
    pub(crate) fn new(portal: Portal) -> Self {
        Self { portal }
    }

    pub fn login(
        &self,
        session: &Session,
        email: &str,
        password: &str,
        product_tag: &str,
    ) -> Result<LoginGrant, WorkflowError> {
        authorize(session, Capability::HostCmSession)?;
        let product_tag = product_tag.trim();
        if product_tag.is_empty() {
            return Err(WorkflowError::validation("A product tag is required."));
        }
        if email.trim().is_empty() || password.is_empty() {
            return Err(WorkflowError::InvalidCredentials);
        }

        let Some(cm) = self
            .portal
            .identity()
            .verify_collection_manager(email, password)?
        else {
            warn!(agency = %session.user_id, "collection manager login failed");
            return Err(WorkflowError::InvalidCredentials);
        };
        if !cm.covers(product_tag) {
            warn!(agency = %session.user_id, cm = %cm.profile_id, product_tag, "product not assigned to collection manager");
            return Err(WorkflowError::forbidden(format!(
                "collection manager is not assigned to {product_tag}"
            )));
        }

        let sessions = self.portal.sessions();
        let now = self.portal.clock_now();
        let swept = sessions.maybe_cleanup(now);
        let superseded = sessions.supersede(&session.user_id, &cm.profile_id);
        if swept + superseded > 0 {
            debug!(swept, superseded, "CM sessions dropped before login");
        }

        let delegated = DelegatedSession {
            session_id: new_session_token(),
            cm_profile_id: cm.profile_id.clone(),
            cm_user_id: cm.user_id.clone(),
            cm_name: cm.name.clone(),
            cm_email: cm.email.clone(),
            cm_designation: cm.designation.clone(),
            product_tag: product_tag.to_string(),
            agency_user_id: session.user_id.clone(),
            login_time: now,
            ip_address: session.client.ip_address.clone(),
            user_agent: session.client.user_agent.clone(),
        };
        sessions.insert(delegated.clone());

        let session_ref = delegated.reference();
        self.portal.record_activity(ActivityLogEntry::new(
            &cm.user_id,
            ActivityAction::CmLogin,
            EntityType::CmSession,
            &session_ref,
            format!("{} signed in for {}", cm.name, product_tag),
            session_metadata(&delegated),
            &session.client,
            now.into(),
        ));
        self.portal.notify(
            &cm.user_id,
            NotificationKind::CmLogin,
            "Collection manager login",
            &format!("You signed in to approve {product_tag} records for an agency."),
            None,
        );
        self.portal.notify(
            &session.user_id,
            NotificationKind::CmLogin,
            "Collection manager login",
            &format!("{} signed in to approve {product_tag} records.", cm.name),
            None,
        );
        info!(%session_ref, agency = %session.user_id, cm = %cm.profile_id, "CM session opened");

        Ok(LoginGrant {
            session_id: delegated.session_id,
            cm_name: delegated.cm_name,
            cm_email: delegated.cm_email,
            product_tag: delegated.product_tag,
            expires_in_minutes: sessions.ttl().num_minutes(),
        })
    }

    /// Record the CM's approval of one row and extend the session.
    pub fn approve_row(
        &self,
        session: &Session,
        request: &RowApprovalRequest,
    ) -> Result<RowApproval, WorkflowError> {
        authorize(session, Capability::HostCmSession)?;
        let now = self.portal.clock_now();
        let delegated = self
            .portal
            .sessions()
            .validate(&request.session_id, &session.user_id, now)
            .inspect_err(|err| {
                warn!(
                    session_ref = %session_reference(&request.session_id),
                    agency = %session.user_id,
                    error = %err,
                    "CM approval rejected"
                )
            })?;
        let field = request.field.trim();
        if field.is_empty() {
            return Err(WorkflowError::validation("The field being approved is required."));
        }

        let at = TimeStamp::from(now);
        let signatory = Signatory {
            name: delegated.cm_name.clone(),
            email: delegated.cm_email.clone(),
            designation: delegated.cm_designation.clone(),
            product_tag: delegated.product_tag.clone(),
        };
        let signature = signatory.signature(at);
        let approval = CmApproval {
            id: new_id(CM_APPROVAL_HRP)?,
            cm_profile_id: delegated.cm_profile_id.clone(),
            agency_id: session.user_id.clone(),
            form_type: request.form_type.clone(),
            form_id: request.form_id.clone(),
            row_id: request.row_id.clone(),
            field: field.to_string(),
            signature_digest: signature_digest(&signature, &request.form_id, &request.row_id),
            approval_signature: signature,
            product_tag: delegated.product_tag.clone(),
            remarks: request
                .remarks
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
            ip_address: session.client.ip_address.clone(),
            user_agent: session.client.user_agent.clone(),
            created_at: at,
        };

        let store = self.portal.store();
        let budget = self.portal.budget();
        (&store.forms, &store.cm_approvals)
            .transaction(|(forms, approvals)| {
                let header = match tx_read::<FormHeader>(forms, &request.form_id)? {
                    Some(h) if h.form_type == request.form_type && h.owner_id == session.user_id => h,
                    _ => return abort(WorkflowError::not_found("Form")),
                };
                if !header.is_editable() {
                    return abort(WorkflowError::state(
                        "This form is locked. Rows can only be approved while it is editable.",
                    ));
                }
                if !header.row_ids.contains(&request.row_id) {
                    return abort(WorkflowError::not_found("Row"));
                }
                // latest approval for a row replaces the previous one
                let key = row_key(&request.form_type, &request.form_id, &request.row_id);
                tx_write(approvals, &key, &approval)?;
                budget.check()
            })
            .map_err(WorkflowError::from)?;

        self.portal
            .sessions()
            .touch(&request.session_id, &session.user_id, now);

        self.portal.record_activity(ActivityLogEntry::new(
            &delegated.cm_user_id,
            ActivityAction::ApprovalGranted,
            EntityType::CmApproval,
            &approval.id,
            format!(
                "{} approved {} on row {} of form {}",
                delegated.cm_name, approval.field, approval.row_id, approval.form_id
            ),
            ActivityMetadata::Approval(approval.clone()),
            &session.client,
            at,
        ));
        info!(
            approval_id = %approval.id,
            form_id = %approval.form_id,
            row_id = %approval.row_id,
            "row approved by collection manager"
        );

        Ok(RowApproval {
            approval_id: approval.id,
            approval_signature: approval.approval_signature,
            timestamp: at,
            collection_manager: CollectionManagerSummary {
                name: signatory.name,
                email: signatory.email,
                designation: signatory.designation,
                product_tag: signatory.product_tag,
            },
        })
    }

    pub fn check_status(
        &self,
        session: &Session,
        session_id: &str,
    ) -> Result<SessionStatus, WorkflowError> {
        authorize(session, Capability::HostCmSession)?;
        let now = self.portal.clock_now();
        let sessions = self.portal.sessions();
        let delegated = sessions.validate(session_id, &session.user_id, now)?;
        Ok(status_of(&delegated, now, sessions.ttl()))
    }

    pub fn list_active_sessions(&self, session: &Session) -> Result<Vec<SessionStatus>, WorkflowError> {
        authorize(session, Capability::HostCmSession)?;
        let now = self.portal.clock_now();
        let sessions = self.portal.sessions();
        Ok(sessions
            .active_for(&session.user_id, now)
            .iter()
            .map(|s| status_of(s, now, sessions.ttl()))
            .collect())
    }

    pub fn logout(&self, session: &Session, session_id: &str) -> Result<(), WorkflowError> {
        authorize(session, Capability::HostCmSession)?;
        let delegated = self
            .portal
            .sessions()
            .remove_owned(session_id, &session.user_id)?;

        let session_ref = delegated.reference();
        self.portal.record_activity(ActivityLogEntry::new(
            &delegated.cm_user_id,
            ActivityAction::CmLogout,
            EntityType::CmSession,
            &session_ref,
            format!("{} signed out", delegated.cm_name),
            session_metadata(&delegated),
            &session.client,
            self.portal.now(),
        ));
        info!(%session_ref, agency = %session.user_id, "CM session closed");
        Ok(())
    }

    /// Sessions still held in memory, including expired ones not yet swept.
    pub fn tracked_sessions(&self) -> usize {
        self.portal.sessions().len()
    }

    /// Remove every expired session now. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        let removed = self.portal.sessions().cleanup(self.portal.clock_now());
        if removed > 0 {
            debug!(removed, "expired CM sessions swept");
        }
        removed
    }
}

fn session_metadata(session: &DelegatedSession) -> ActivityMetadata {
    ActivityMetadata::Session {
        session_ref: session.reference(),
        cm_user_id: session.cm_user_id.clone(),
        agency_user_id: session.agency_user_id.clone(),
        product_tag: session.product_tag.clone(),
    }
}

fn status_of(session: &DelegatedSession, now: DateTime<Utc>, ttl: Duration) -> SessionStatus {
    SessionStatus {
        session_id: session.session_id.clone(),
        cm_name: session.cm_name.clone(),
        cm_email: session.cm_email.clone(),
        product_tag: session.product_tag.clone(),
        login_time: session.login_time.into(),
        expires_at: session.expires_at(ttl).into(),
        remaining_minutes: session.remaining_minutes(now, ttl),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, agency: &str, login_time: DateTime<Utc>) -> DelegatedSession {
        DelegatedSession {
            session_id: id.to_string(),
            cm_profile_id: "cm_1".into(),
            cm_user_id: "cm_user_1".into(),
            cm_name: "Asha Rao".into(),
            cm_email: "asha@bank.example".into(),
            cm_designation: "Collection Manager".into(),
            product_tag: "Personal Loan".into(),
            agency_user_id: agency.to_string(),
            login_time,
            ip_address: None,
            user_agent: None,
        }
    }

    fn store() -> CmSessionStore {
        CmSessionStore::new(Duration::minutes(15), Duration::minutes(5))
    }

    #[test]
    fn validate_distinguishes_missing_foreign_and_expired() {
        let t0 = Utc::now();
        let store = store();
        store.insert(session("s1", "agency_a", t0));

        assert!(store.validate("s1", "agency_a", t0).is_ok());
        assert!(matches!(
            store.validate("nope", "agency_a", t0),
            Err(WorkflowError::SessionNotFound)
        ));
        assert!(matches!(
            store.validate("s1", "agency_b", t0),
            Err(WorkflowError::SessionMismatch)
        ));
        assert_eq!(store.len(), 1);

        let later = t0 + Duration::minutes(15);
        assert!(matches!(
            store.validate("s1", "agency_a", later),
            Err(WorkflowError::SessionExpired)
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn touch_slides_the_window() {
        let t0 = Utc::now();
        let store = store();
        store.insert(session("s1", "agency_a", t0));

        assert!(store.touch("s1", "agency_a", t0 + Duration::minutes(10)));
        assert!(!store.touch("s1", "agency_b", t0 + Duration::minutes(11)));
        assert!(store.validate("s1", "agency_a", t0 + Duration::minutes(20)).is_ok());
        assert!(store.validate("s1", "agency_a", t0 + Duration::minutes(25)).is_err());
    }

    #[test]
    fn remaining_minutes_round_up() {
        let t0 = Utc::now();
        let s = session("s1", "agency_a", t0);
        let ttl = Duration::minutes(15);
        assert_eq!(s.remaining_minutes(t0, ttl), 15);
        assert_eq!(s.remaining_minutes(t0 + Duration::seconds(61), ttl), 14);
        assert_eq!(s.remaining_minutes(t0 + Duration::minutes(30), ttl), 0);
    }

    #[test]
    fn only_the_host_can_remove() {
        let store = store();
        store.insert(session("s1", "agency_a", Utc::now()));
        assert!(matches!(
            store.remove_owned("s1", "agency_b"),
            Err(WorkflowError::SessionMismatch)
        ));
        assert!(store.remove_owned("s1", "agency_a").is_ok());
        assert!(matches!(
            store.remove_owned("s1", "agency_a"),
            Err(WorkflowError::SessionNotFound)
        ));
    }

    #[test]
    fn sweeps_are_rate_limited() {
        let t0 = Utc::now();
        let store = store();
        store.insert(session("old", "agency_a", t0 - Duration::minutes(30)));
        assert_eq!(store.maybe_cleanup(t0), 1);

        store.insert(session("older", "agency_a", t0 - Duration::minutes(30)));
        assert_eq!(store.maybe_cleanup(t0 + Duration::minutes(1)), 0);
        assert_eq!(store.maybe_cleanup(t0 + Duration::minutes(6)), 1);
    }

    #[test]
    fn listing_drops_expired_sessions() {
        let t0 = Utc::now();
        let store = store();
        store.insert(session("live", "agency_a", t0));
        store.insert(session("dead", "agency_a", t0 - Duration::minutes(20)));
        store.insert(session("other", "agency_b", t0));

        let active = store.active_for("agency_a", t0);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "live");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn relogin_supersedes_the_same_managers_session() {
        let t0 = Utc::now();
        let store = store();
        store.insert(session("s1", "agency_a", t0));
        store.insert(session("s2", "agency_b", t0));
        assert_eq!(store.supersede("agency_a", "cm_1"), 1);
        assert_eq!(store.len(), 1);
    }
}
