//! Property-based tests for the form lifecycle
//!
//! Every case opens its own sled database, so case counts are kept low.

mod common;

use std::collections::HashSet;
use std::fmt::Display;

use common::*;
use compliance_workflow::cm_session::RowApprovalRequest;
use compliance_workflow::{FormStatus, Session, WorkflowError};
use proptest::prelude::*;

fn check<T, E: Display>(result: Result<T, E>) -> Result<T, TestCaseError> {
    result.map_err(|e| TestCaseError::fail(e.to_string()))
}

/// Open a CM session for `host` and approve the given rows of its no-dues form.
fn approve_rows(
    h: &Harness,
    host: &Session,
    form_id: &str,
    row_ids: &[String],
) -> Result<(), WorkflowError> {
    let cm = h.portal.cm_sessions();
    let grant = cm.login(host, CM_EMAIL, CM_PASSWORD, "Personal Loan")?;
    for row_id in row_ids {
        cm.approve_row(
            host,
            &RowApprovalRequest {
                session_id: grant.session_id.clone(),
                form_type: "no_dues_declaration".into(),
                form_id: form_id.to_string(),
                row_id: row_id.clone(),
                field: "amount_cleared".into(),
                remarks: None,
            },
        )?;
    }
    Ok(())
}

/// Row count plus a shuffled order of those rows.
fn shuffled_rows_strategy() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (1usize..=6).prop_flat_map(|n| (Just(n), Just((0..n).collect::<Vec<_>>()).prop_shuffle()))
}

/// Row count plus which of those rows a collection manager approves.
fn approval_mask_strategy() -> impl Strategy<Value = Vec<bool>> {
    (1usize..=6).prop_flat_map(|n| prop::collection::vec(prop::bool::ANY, n))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_submitted_forms_never_revert_to_draft(
        rows in 1usize..=5,
        attempts in 1usize..=4,
        pass_form_id in prop::bool::ANY,
    ) {
        let h = check(harness())?;
        let host = agency("agency_a");
        let forms = h.portal.forms::<AgencyBranches>();
        let submitted = check(forms.save(&host, branches(rows), FormStatus::Submitted, None))?;
        let before = check(h.portal.store().form_header(&submitted.form_id))?;
        let rows_before: Vec<_> = check(h.portal.store().form_rows::<Branch>(&submitted.form_id))?;

        for attempt in 0..attempts {
            let form_id = pass_form_id.then_some(submitted.form_id.as_str());
            let result = forms.save(&host, branches(rows + attempt), FormStatus::Draft, form_id);
            prop_assert!(
                matches!(result, Err(WorkflowError::State(_))),
                "draft save on a submitted form should be a state error"
            );
        }

        prop_assert_eq!(check(h.portal.store().form_header(&submitted.form_id))?, before);
        let rows_after: Vec<_> = check(h.portal.store().form_rows::<Branch>(&submitted.form_id))?;
        prop_assert_eq!(rows_after, rows_before);
    }

    #[test]
    fn prop_resaving_approved_rows_keeps_their_ids((count, order) in shuffled_rows_strategy()) {
        let h = check(harness())?;
        let host = agency("agency_a");
        let forms = h.portal.forms::<NoDuesDeclaration>();
        let draft = check(forms.save(&host, (1..=count).map(no_dues).collect(), FormStatus::Draft, None))?;
        check(approve_rows(&h, &host, &draft.form_id, &draft.row_ids))?;

        let loaded = check(forms.load(&host, None))?;
        let loaded = loaded.ok_or_else(|| TestCaseError::fail("form missing"))?;
        let inputs = loaded.row_inputs();
        let reordered: Vec<_> = order.iter().map(|&i| inputs[i].clone()).collect();
        let saved = check(forms.save(&host, reordered, FormStatus::Draft, Some(&draft.form_id)))?;

        let expected: Vec<_> = order.iter().map(|&i| draft.row_ids[i].clone()).collect();
        prop_assert_eq!(&saved.row_ids, &expected);

        // every row still carries its data under the original id
        let stored = check(h.portal.store().form_rows::<NoDuesRow>(&draft.form_id))?;
        for row in &stored {
            let original = loaded.rows.iter().find(|r| r.id == row.id);
            prop_assert_eq!(original.map(|r| &r.data), Some(&row.data));
        }

        let progress = check(forms.approval_progress(&host, &draft.form_id))?;
        prop_assert!(progress.is_complete());
        prop_assert_eq!(progress.approved, count);
    }

    #[test]
    fn prop_submission_reports_every_unapproved_row(mask in approval_mask_strategy()) {
        let h = check(harness())?;
        let host = agency("agency_a");
        let forms = h.portal.forms::<NoDuesDeclaration>();
        let draft = check(forms.save(&host, (1..=mask.len()).map(no_dues).collect(), FormStatus::Draft, None))?;

        let approved: Vec<String> = draft
            .row_ids
            .iter()
            .zip(&mask)
            .filter(|(_, approve)| **approve)
            .map(|(id, _)| id.clone())
            .collect();
        check(approve_rows(&h, &host, &draft.form_id, &approved))?;

        let loaded = check(forms.load(&host, None))?;
        let inputs = loaded.ok_or_else(|| TestCaseError::fail("form missing"))?.row_inputs();
        let result = forms.save(&host, inputs, FormStatus::Submitted, Some(&draft.form_id));

        let approved: HashSet<_> = approved.into_iter().collect();
        let unapproved = draft.row_ids.iter().filter(|id| !approved.contains(*id)).count();
        if unapproved == 0 {
            prop_assert!(result.is_ok());
        } else {
            let err = result.err().ok_or_else(|| TestCaseError::fail("submission should fail"))?;
            prop_assert!(matches!(err, WorkflowError::State(_)));
            let expected = format!("{unapproved} row(s) still need collection manager approval");
            prop_assert!(err.to_string().starts_with(&expected));
        }
    }
}
