//! The form lifecycle shared by every form type.
//!
//! `save` classifies the request against the stored form, runs the
//! submission guards and writes header, rows and indexes in one
//! transaction. Activity and notifications follow the commit.
use std::collections::HashSet;
use std::marker::PhantomData;

use sled::Transactional;
use sled::transaction::ConflictableTransactionError;
use tracing::{info, warn};

use crate::activity::{ActivityAction, ActivityLogEntry, ActivityMetadata, EntityType, NotificationKind};
use crate::approval::{ApprovalRequest, close_open_request_tx};
use crate::auth::{Capability, authorize, can_view};
use crate::error::{REVERT_SUBMITTED_MESSAGE, WorkflowError};
use crate::form::{
    DetailRow, Form, FormHeader, FormKind, FormStatus, RowInput, RowPersistence, StoredRow,
};
use crate::portal::Portal;
use crate::store::{
    FormTrees, abort, encode, owner_key, remove_form_tx, row_key, tx_read, tx_write,
    unique_index_key,
};
use crate::types::Session;
use crate::utils::{FORM_HRP, ROW_HRP, new_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Create,
    CreateAndSubmit,
    Update,
    Submit,
    Resubmission,
}

impl Transition {
    pub fn action(&self) -> ActivityAction {
        match self {
            Transition::Create => ActivityAction::FormCreated,
            Transition::Update => ActivityAction::FormUpdated,
            Transition::CreateAndSubmit | Transition::Submit => ActivityAction::FormSubmitted,
            Transition::Resubmission => ActivityAction::FormResubmitted,
        }
    }
    pub fn was_resubmission(&self) -> bool {
        *self == Transition::Resubmission
    }
    fn message(&self, label: &str) -> String {
        match self {
            Transition::Create => format!("{label} saved as draft"),
            Transition::Update => format!("{label} draft updated"),
            Transition::CreateAndSubmit | Transition::Submit => {
                format!("{label} submitted successfully")
            }
            Transition::Resubmission => format!("{label} resubmitted successfully"),
        }
    }
}

/// Decide what a save request means for the stored form.
pub fn classify(
    existing: Option<&FormHeader>,
    requested: FormStatus,
) -> Result<Transition, WorkflowError> {
    match (existing, requested) {
        (None, FormStatus::Draft) => Ok(Transition::Create),
        (None, FormStatus::Submitted) => Ok(Transition::CreateAndSubmit),
        (Some(h), FormStatus::Draft) if h.status == FormStatus::Draft => Ok(Transition::Update),
        (Some(h), FormStatus::Submitted) if h.status == FormStatus::Draft => {
            if h.is_resubmission_target() {
                Ok(Transition::Resubmission)
            } else {
                Ok(Transition::Submit)
            }
        }
        (Some(_), FormStatus::Draft) => Err(WorkflowError::state(REVERT_SUBMITTED_MESSAGE)),
        (Some(_), FormStatus::Submitted) => Err(WorkflowError::state(
            "This form has already been submitted and is locked. Request edit access to make changes.",
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub form_id: String,
    pub status: FormStatus,
    pub transition: Transition,
    pub row_ids: Vec<String>,
    pub message: String,
}

/// How many rows of a form carry a collection-manager approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalProgress {
    pub total: usize,
    pub approved: usize,
    pub pending_row_ids: Vec<String>,
}

impl ApprovalProgress {
    pub fn is_complete(&self) -> bool {
        self.pending_row_ids.is_empty()
    }
}

struct Committed {
    old: Option<FormHeader>,
    header: FormHeader,
    transition: Transition,
    closed_request: Option<ApprovalRequest>,
}

pub struct FormLifecycle<K: FormKind> {
    portal: Portal,
    _kind: PhantomData<fn() -> K>,
}

impl<K: FormKind> FormLifecycle<K> {
    pub(crate) fn new(portal: Portal) -> Self {
        Self {
            portal,
            _kind: PhantomData,
        }
    }

    /// Save the caller's form with the requested status.
    ///
    /// Without `form_id` the caller's existing form of this type is used, or
    /// a new one is created.
    pub fn save(
        &self,
        session: &Session,
        rows: Vec<RowInput<K::Row>>,
        status: FormStatus,
        form_id: Option<&str>,
    ) -> Result<SaveOutcome, WorkflowError> {
        authorize(session, Capability::EditOwnForms)?;
        self.try_save(session, rows, status, form_id)
            .inspect_err(|err| {
                if !err.is_unexpected() {
                    warn!(
                        form_type = K::FORM_TYPE,
                        user = %session.user_id,
                        requested = %status,
                        error = %err,
                        "form save rejected"
                    );
                }
            })
    }

    fn try_save(
        &self,
        session: &Session,
        rows: Vec<RowInput<K::Row>>,
        status: FormStatus,
        form_id: Option<&str>,
    ) -> Result<SaveOutcome, WorkflowError> {
        let store = self.portal.store();
        let existing = match form_id {
            Some(id) => Some(self.owned_header(session, id)?),
            None => store.form_for_owner(K::FORM_TYPE, &session.user_id)?,
        };

        // fail fast; repeated against the fresh header inside the transaction
        classify(existing.as_ref(), status)?;
        if status == FormStatus::Submitted {
            validate_for_submission::<K>(&rows)?;
        }
        let unique_keys = unique_keys_of::<K>(&rows)?;

        let form_id = match &existing {
            Some(h) => h.id.clone(),
            None => new_id(FORM_HRP)?,
        };
        let previous_rows: Vec<StoredRow<K::Row>> = match &existing {
            Some(h) => store.form_rows(&h.id)?,
            None => vec![],
        };
        let stored = assign_row_ids::<K>(rows, &previous_rows)?;
        let row_ids: Vec<String> = stored.iter().map(|r| r.id.clone()).collect();
        let encoded_rows = encode(&stored)?;
        let owner_index = owner_key(K::FORM_TYPE, &session.user_id);
        let now = self.portal.now();
        let budget = self.portal.budget();

        let committed = (
            &store.forms,
            &store.rows,
            &store.owners,
            &store.unique_keys,
            &store.requests,
            &store.cm_approvals,
        )
            .transaction(|(forms, rows, owners, unique, requests, approvals)| {
                let current = tx_read::<FormHeader>(forms, &form_id)?;
                if existing.is_some() && current.is_none() {
                    return abort(WorkflowError::not_found(K::LABEL));
                }
                if current.is_none() {
                    if let Some(other) = owners.get(owner_index.as_bytes())? {
                        if other.as_ref() != form_id.as_bytes() {
                            return abort(WorkflowError::conflict(format!(
                                "A {} already exists for this agency.",
                                K::LABEL
                            )));
                        }
                    }
                }
                let transition = classify(current.as_ref(), status)
                    .map_err(ConflictableTransactionError::Abort)?;

                for value in &unique_keys {
                    let key = unique_index_key(K::FORM_TYPE, value);
                    if let Some(holder) = unique.get(key.as_bytes())? {
                        if holder.as_ref() != form_id.as_bytes() {
                            return abort(WorkflowError::conflict(format!(
                                "Duplicate {}: {} is already registered.",
                                K::UNIQUE_FIELD,
                                value
                            )));
                        }
                    }
                }

                if status == FormStatus::Submitted && K::REQUIRES_CM_APPROVAL {
                    let mut unapproved = 0usize;
                    for row_id in &row_ids {
                        let key = row_key(K::FORM_TYPE, &form_id, row_id);
                        if approvals.get(key.as_bytes())?.is_none() {
                            unapproved += 1;
                        }
                    }
                    if unapproved > 0 {
                        return abort(WorkflowError::state(format!(
                            "{unapproved} row(s) still need collection manager approval before submission."
                        )));
                    }
                }

                if let Some(old) = &current {
                    for value in old.unique_keys.iter().filter(|v| !unique_keys.contains(v)) {
                        unique.remove(unique_index_key(K::FORM_TYPE, value).as_bytes())?;
                    }
                    // approvals on rows that no longer exist
                    for row_id in old.row_ids.iter().filter(|id| !row_ids.contains(id)) {
                        approvals.remove(row_key(K::FORM_TYPE, &form_id, row_id).as_bytes())?;
                    }
                }
                for value in &unique_keys {
                    unique.insert(
                        unique_index_key(K::FORM_TYPE, value).as_bytes(),
                        form_id.as_bytes(),
                    )?;
                }

                let mut header = current.clone().unwrap_or_else(|| {
                    FormHeader::new(form_id.clone(), K::FORM_TYPE, &session.user_id, now)
                });
                header.status = status;
                header.row_ids = row_ids.clone();
                header.unique_keys = unique_keys.clone();
                header.updated_at = now;
                if status == FormStatus::Submitted {
                    header.submitted_at = Some(now);
                }
                let closed_request = if transition.was_resubmission() {
                    close_open_request_tx(requests, &mut header, now)?
                } else {
                    None
                };

                tx_write(forms, &form_id, &header)?;
                rows.insert(form_id.as_bytes(), encoded_rows.clone())?;
                if current.is_none() {
                    owners.insert(owner_index.as_bytes(), form_id.as_bytes())?;
                }
                budget.check()?;

                Ok(Committed {
                    old: current,
                    header,
                    transition,
                    closed_request,
                })
            })
            .map_err(WorkflowError::from)?;

        let Committed {
            old,
            header,
            transition,
            closed_request,
        } = committed;

        self.portal.record_activity(ActivityLogEntry::new(
            &session.user_id,
            transition.action(),
            EntityType::Form,
            &header.id,
            format!("{} ({} rows)", transition.message(K::LABEL), header.row_ids.len()),
            ActivityMetadata::Transition {
                old: old.as_ref().map(FormHeader::snapshot),
                new: Some(header.snapshot()),
                was_resubmission: transition.was_resubmission(),
            },
            &session.client,
            now,
        ));

        match transition {
            Transition::Submit | Transition::CreateAndSubmit => self.portal.notify(
                &header.owner_id,
                NotificationKind::FormSubmitted,
                "Form submitted",
                &format!("Your {} has been submitted.", K::LABEL),
                Some(&header.id),
            ),
            Transition::Resubmission => {
                self.portal
                    .approvals()
                    .after_resubmission(session, &header, closed_request.as_ref())
            }
            Transition::Create | Transition::Update => {}
        }

        info!(
            form_id = %header.id,
            form_type = K::FORM_TYPE,
            transition = ?transition,
            rows = header.row_ids.len(),
            "form saved"
        );

        Ok(SaveOutcome {
            form_id: header.id,
            status: header.status,
            transition,
            row_ids: header.row_ids,
            message: transition.message(K::LABEL),
        })
    }

    /// Delete one of the caller's drafts. Submitted forms go through a
    /// `DELETE_RECORD` approval request instead.
    pub fn delete_draft(&self, session: &Session, form_id: &str) -> Result<(), WorkflowError> {
        authorize(session, Capability::EditOwnForms)?;
        self.owned_header(session, form_id)?;

        let store = self.portal.store();
        let budget = self.portal.budget();
        let removed = (
            &store.forms,
            &store.rows,
            &store.owners,
            &store.unique_keys,
            &store.cm_approvals,
        )
            .transaction(|(forms, rows, owners, unique_keys, cm_approvals)| {
                let Some(header) = tx_read::<FormHeader>(forms, form_id)? else {
                    return abort(WorkflowError::not_found(K::LABEL));
                };
                if header.status != FormStatus::Draft {
                    return abort(WorkflowError::state(
                        "Only draft forms can be deleted. Request DELETE_RECORD approval for a submitted form.",
                    ));
                }
                if header.is_resubmission_target() {
                    return abort(WorkflowError::state(
                        "This form was reopened for resubmission and cannot be deleted.",
                    ));
                }
                let trees = FormTrees {
                    forms,
                    rows,
                    owners,
                    unique_keys,
                    cm_approvals,
                };
                remove_form_tx(&trees, &header)?;
                budget.check()?;
                Ok(header)
            })
            .map_err(WorkflowError::from)
            .inspect_err(|err| warn!(form_id, error = %err, "draft deletion rejected"))?;

        self.portal.record_activity(ActivityLogEntry::new(
            &session.user_id,
            ActivityAction::FormDeleted,
            EntityType::Form,
            form_id,
            format!("{} draft deleted", K::LABEL),
            ActivityMetadata::Transition {
                old: Some(removed.snapshot()),
                new: None,
                was_resubmission: false,
            },
            &session.client,
            self.portal.now(),
        ));
        info!(form_id, form_type = K::FORM_TYPE, "draft deleted");
        Ok(())
    }

    /// Load a form with its rows.
    ///
    /// Agencies load their own form (by id or implicitly); admins and
    /// auditors must name the form.
    pub fn load(
        &self,
        session: &Session,
        form_id: Option<&str>,
    ) -> Result<Option<Form<K::Row>>, WorkflowError> {
        let store = self.portal.store();
        let header = match form_id {
            Some(id) => match store.form_header(id)? {
                Some(h) if h.form_type == K::FORM_TYPE && can_view(session, &h.owner_id) => h,
                _ => return Err(WorkflowError::not_found(K::LABEL)),
            },
            None => {
                authorize(session, Capability::EditOwnForms)?;
                match store.form_for_owner(K::FORM_TYPE, &session.user_id)? {
                    Some(h) => h,
                    None => return Ok(None),
                }
            }
        };
        let rows = store.form_rows(&header.id)?;
        Ok(Some(Form { header, rows }))
    }

    /// Which rows of the form still lack a collection-manager approval.
    pub fn approval_progress(
        &self,
        session: &Session,
        form_id: &str,
    ) -> Result<ApprovalProgress, WorkflowError> {
        let header = match self.portal.store().form_header(form_id)? {
            Some(h) if h.form_type == K::FORM_TYPE && can_view(session, &h.owner_id) => h,
            _ => return Err(WorkflowError::not_found(K::LABEL)),
        };
        let store = self.portal.store();
        let mut pending_row_ids = vec![];
        for row_id in &header.row_ids {
            if store.cm_approval(K::FORM_TYPE, &header.id, row_id)?.is_none() {
                pending_row_ids.push(row_id.clone());
            }
        }
        Ok(ApprovalProgress {
            total: header.row_ids.len(),
            approved: header.row_ids.len() - pending_row_ids.len(),
            pending_row_ids,
        })
    }

    fn owned_header(&self, session: &Session, form_id: &str) -> Result<FormHeader, WorkflowError> {
        match self.portal.store().form_header(form_id)? {
            Some(h) if h.form_type == K::FORM_TYPE && h.owner_id == session.user_id => Ok(h),
            _ => Err(WorkflowError::not_found(K::LABEL)),
        }
    }
}

fn validate_for_submission<K: FormKind>(rows: &[RowInput<K::Row>]) -> Result<(), WorkflowError> {
    if rows.is_empty() {
        return Err(WorkflowError::validation(format!(
            "Add at least one row before submitting the {}.",
            K::LABEL
        )));
    }
    for (index, row) in rows.iter().enumerate() {
        let missing = row.data.missing_fields();
        if !missing.is_empty() {
            return Err(WorkflowError::validation(format!(
                "Row {}: missing required fields: {}",
                index + 1,
                missing.join(", ")
            )));
        }
    }
    Ok(())
}

fn unique_keys_of<K: FormKind>(rows: &[RowInput<K::Row>]) -> Result<Vec<String>, WorkflowError> {
    let mut keys: Vec<String> = vec![];
    for value in rows.iter().filter_map(|row| row.data.unique_key()) {
        let value = value.trim().to_string();
        if value.is_empty() {
            continue;
        }
        if keys.contains(&value) {
            return Err(WorkflowError::conflict(format!(
                "Duplicate {}: {} appears more than once.",
                K::UNIQUE_FIELD,
                value
            )));
        }
        keys.push(value);
    }
    Ok(keys)
}

/// Give every incoming row its persisted id.
fn assign_row_ids<K: FormKind>(
    rows: Vec<RowInput<K::Row>>,
    previous: &[StoredRow<K::Row>],
) -> Result<Vec<StoredRow<K::Row>>, WorkflowError> {
    let known: HashSet<&str> = previous.iter().map(|r| r.id.as_str()).collect();
    let mut seen = HashSet::new();

    rows.into_iter()
        .map(|row| {
            let id = match (K::row_persistence(), row.id) {
                (RowPersistence::Upsert, Some(id)) => {
                    if !known.contains(id.as_str()) {
                        return Err(WorkflowError::validation(format!(
                            "Row {id} does not belong to this form."
                        )));
                    }
                    if !seen.insert(id.clone()) {
                        return Err(WorkflowError::validation(format!(
                            "Row {id} appears more than once."
                        )));
                    }
                    id
                }
                _ => new_id(ROW_HRP)?,
            };
            Ok(StoredRow { id, data: row.data })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::Editability;
    use crate::types::TimeStamp;

    #[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
    struct Account {
        #[n(0)]
        number: String,
    }

    impl DetailRow for Account {
        fn missing_fields(&self) -> Vec<&'static str> {
            if self.number.is_empty() { vec!["number"] } else { vec![] }
        }
        fn unique_key(&self) -> Option<String> {
            Some(self.number.clone())
        }
    }

    struct Accounts;
    impl FormKind for Accounts {
        const FORM_TYPE: &'static str = "accounts";
        const LABEL: &'static str = "Accounts";
        const REQUIRES_CM_APPROVAL: bool = true;
        const UNIQUE_FIELD: &'static str = "account number";
        type Row = Account;
    }

    struct Branches;
    impl FormKind for Branches {
        const FORM_TYPE: &'static str = "branches";
        const LABEL: &'static str = "Branches";
        type Row = Account;
    }

    fn header(status: FormStatus, editability: Editability) -> FormHeader {
        let mut h = FormHeader::new("form_1".into(), "accounts", "agency_1", TimeStamp::now());
        h.status = status;
        h.editability = editability;
        h
    }

    #[test]
    fn decision_table() {
        use Editability::*;
        use FormStatus::*;

        assert_eq!(classify(None, Draft).unwrap(), Transition::Create);
        assert_eq!(classify(None, Submitted).unwrap(), Transition::CreateAndSubmit);
        assert_eq!(
            classify(Some(&header(Draft, Locked)), Draft).unwrap(),
            Transition::Update
        );
        assert_eq!(
            classify(Some(&header(Draft, Locked)), Submitted).unwrap(),
            Transition::Submit
        );
        assert_eq!(
            classify(Some(&header(Draft, EditablePendingResubmission)), Submitted).unwrap(),
            Transition::Resubmission
        );
        assert_eq!(
            classify(Some(&header(Draft, EditablePendingResubmission)), Draft).unwrap(),
            Transition::Update
        );

        let revert = classify(Some(&header(Submitted, Locked)), Draft).unwrap_err();
        assert_eq!(revert.to_string(), REVERT_SUBMITTED_MESSAGE);
        assert!(matches!(
            classify(Some(&header(Submitted, Locked)), Submitted),
            Err(WorkflowError::State(_))
        ));
    }

    #[test]
    fn transitions_map_to_activity_actions() {
        assert_eq!(Transition::Create.action(), ActivityAction::FormCreated);
        assert_eq!(Transition::CreateAndSubmit.action(), ActivityAction::FormSubmitted);
        assert_eq!(Transition::Resubmission.action(), ActivityAction::FormResubmitted);
        assert!(Transition::Resubmission.was_resubmission());
        assert!(!Transition::Submit.was_resubmission());
    }

    #[test]
    fn submission_requires_complete_rows() {
        let rows = vec![
            RowInput::new(Account { number: "A-1".into() }),
            RowInput::new(Account { number: String::new() }),
        ];
        let err = validate_for_submission::<Accounts>(&rows).unwrap_err();
        assert_eq!(err.to_string(), "Row 2: missing required fields: number");
        assert!(validate_for_submission::<Accounts>(&[]).is_err());
    }

    #[test]
    fn duplicate_identifiers_conflict() {
        let rows = vec![
            RowInput::new(Account { number: "A-1".into() }),
            RowInput::new(Account { number: " A-1 ".into() }),
        ];
        let err = unique_keys_of::<Accounts>(&rows).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        assert!(err.to_string().contains("account number"));
    }

    #[test]
    fn upsert_keeps_known_ids_and_rejects_foreign_ones() {
        let previous = vec![StoredRow {
            id: "row_a".to_string(),
            data: Account { number: "A-1".into() },
        }];
        let rows = vec![
            RowInput::new(Account { number: "A-2".into() }),
            RowInput::existing("row_a", Account { number: "A-1b".into() }),
        ];
        let stored = assign_row_ids::<Accounts>(rows, &previous).unwrap();
        assert_eq!(stored[1].id, "row_a");
        assert!(stored[0].id.starts_with("row_1"));

        let foreign = vec![RowInput::existing("row_z", Account { number: "A-9".into() })];
        assert!(assign_row_ids::<Accounts>(foreign, &previous).is_err());
    }

    #[test]
    fn replace_all_forms_get_fresh_ids() {
        let previous = vec![StoredRow {
            id: "row_a".to_string(),
            data: Account { number: "A-1".into() },
        }];
        let rows = vec![RowInput::existing("row_a", Account { number: "A-1".into() })];
        let stored = assign_row_ids::<Branches>(rows, &previous).unwrap();
        assert_ne!(stored[0].id, "row_a");
    }
}
