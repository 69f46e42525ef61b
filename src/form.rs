//! Form submissions and their detail rows.
//!
//! Every form type shares one header layout (status, editability, the open
//! approval request and the ids of its rows). The rows themselves are
//! type-specific and stored separately so the approval workflow can flip a
//! form's state without knowing its schema.
use std::fmt;

use crate::activity::FormSnapshot;
use crate::types::TimeStamp;

/// One detail row of a form type.
pub trait DetailRow:
    Clone + fmt::Debug + PartialEq + minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>
{
    /// Names of required fields left empty. Checked before submission only.
    fn missing_fields(&self) -> Vec<&'static str>;

    /// Value that has to be unique across every form of this type.
    fn unique_key(&self) -> Option<String> {
        None
    }
}

/// Static description of a form type.
pub trait FormKind {
    const FORM_TYPE: &'static str;
    /// Human readable name used in messages.
    const LABEL: &'static str;
    /// Rows must each carry a collection-manager approval before submission.
    const REQUIRES_CM_APPROVAL: bool = false;
    /// Name of the field behind [`DetailRow::unique_key`], for conflict messages.
    const UNIQUE_FIELD: &'static str = "identifier";

    type Row: DetailRow;

    fn row_persistence() -> RowPersistence {
        if Self::REQUIRES_CM_APPROVAL {
            RowPersistence::Upsert
        } else {
            RowPersistence::ReplaceAll
        }
    }
}

/// How saved rows are matched against what is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowPersistence {
    /// Every save gets fresh row ids.
    ReplaceAll,
    /// Rows presenting an existing id keep it, so approvals keyed by row id stay valid.
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum FormStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Submitted,
}

impl FormStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormStatus::Draft => "DRAFT",
            FormStatus::Submitted => "SUBMITTED",
        }
    }
}

impl fmt::Display for FormStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Editability {
    #[n(0)]
    Locked,
    /// Reopened by an approved request; the next submit is a resubmission.
    #[n(1)]
    EditablePendingResubmission,
}

/// A row as handed in by the caller. `id` is present for rows loaded earlier.
#[derive(Debug, Clone, PartialEq)]
pub struct RowInput<R> {
    pub id: Option<String>,
    pub data: R,
}

impl<R> RowInput<R> {
    pub fn new(data: R) -> Self {
        Self { id: None, data }
    }
    pub fn existing(id: impl Into<String>, data: R) -> Self {
        Self {
            id: Some(id.into()),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct StoredRow<R> {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub data: R,
}

impl<R: Clone> StoredRow<R> {
    /// Turn a stored row back into input, keeping its id.
    pub fn to_input(&self) -> RowInput<R> {
        RowInput::existing(self.id.clone(), self.data.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct FormHeader {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub form_type: String,
    #[n(2)]
    pub owner_id: String,
    #[n(3)]
    pub status: FormStatus,
    #[n(4)]
    pub editability: Editability,
    #[n(5)]
    pub open_request: Option<String>, // the one approval request governing this form
    #[n(6)]
    pub row_ids: Vec<String>,
    #[n(7)]
    pub unique_keys: Vec<String>,
    #[n(8)]
    pub created_at: TimeStamp,
    #[n(9)]
    pub updated_at: TimeStamp,
    #[n(10)]
    pub submitted_at: Option<TimeStamp>,
}

impl FormHeader {
    pub fn new(id: String, form_type: &str, owner_id: &str, now: TimeStamp) -> Self {
        Self {
            id,
            form_type: form_type.to_string(),
            owner_id: owner_id.to_string(),
            status: FormStatus::Draft,
            editability: Editability::Locked,
            open_request: None,
            row_ids: vec![],
            unique_keys: vec![],
            created_at: now,
            updated_at: now,
            submitted_at: None,
        }
    }
    pub fn is_editable(&self) -> bool {
        self.status == FormStatus::Draft
    }
    pub fn is_resubmission_target(&self) -> bool {
        self.editability == Editability::EditablePendingResubmission
    }
    pub fn snapshot(&self) -> FormSnapshot {
        FormSnapshot {
            status: self.status,
            editability: self.editability,
            row_ids: self.row_ids.clone(),
        }
    }
}

/// A loaded form: header plus its rows in saved order.
#[derive(Debug, Clone, PartialEq)]
pub struct Form<R> {
    pub header: FormHeader,
    pub rows: Vec<StoredRow<R>>,
}

impl<R: Clone> Form<R> {
    pub fn row_inputs(&self) -> Vec<RowInput<R>> {
        self.rows.iter().map(StoredRow::to_input).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
    struct Branch {
        #[n(0)]
        name: String,
    }

    impl DetailRow for Branch {
        fn missing_fields(&self) -> Vec<&'static str> {
            if self.name.trim().is_empty() { vec!["name"] } else { vec![] }
        }
    }

    #[test]
    fn header_encoding() {
        let mut header = FormHeader::new("form_1".into(), "branches", "agency_1", TimeStamp::now());
        header.row_ids = vec!["row_a".into(), "row_b".into()];
        header.open_request = Some("req_1".into());

        let encoding = minicbor::to_vec(&header).unwrap();
        let decoded: FormHeader = minicbor::decode(&encoding).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn stored_rows_decode_with_their_schema() {
        let rows = vec![StoredRow {
            id: "row_a".to_string(),
            data: Branch { name: "Pune".into() },
        }];
        let encoding = minicbor::to_vec(&rows).unwrap();
        let decoded: Vec<StoredRow<Branch>> = minicbor::decode(&encoding).unwrap();
        assert_eq!(rows, decoded);
        assert_eq!(decoded[0].to_input().id.as_deref(), Some("row_a"));
    }

    #[test]
    fn new_header_is_a_locked_draft() {
        let header = FormHeader::new("form_1".into(), "branches", "agency_1", TimeStamp::now());
        assert!(header.is_editable());
        assert!(!header.is_resubmission_target());
        assert_eq!(header.snapshot().status, FormStatus::Draft);
    }
}
