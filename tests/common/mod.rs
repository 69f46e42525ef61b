#![allow(dead_code)]

use std::sync::Arc;

use compliance_workflow::clock::ManualClock;
use compliance_workflow::directory::{CmIdentity, IdentityProvider};
use compliance_workflow::form::{DetailRow, FormKind, RowInput};
use compliance_workflow::store::Store;
use compliance_workflow::{Portal, Role, Session, WorkflowConfig, WorkflowError};
use tempfile::{TempDir, tempdir};

pub const CM_EMAIL: &str = "asha@bank.example";
pub const CM_PASSWORD: &str = "correct-horse";
pub const CM_USER_ID: &str = "cm_user_asha";
pub const ADMIN_ID: &str = "admin_1";

/// Branch offices of an agency; registration numbers are unique across agencies.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Branch {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub registration_number: String,
    #[n(2)]
    pub city: String,
}

impl DetailRow for Branch {
    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = vec![];
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.registration_number.trim().is_empty() {
            missing.push("registration_number");
        }
        missing
    }
    fn unique_key(&self) -> Option<String> {
        Some(self.registration_number.clone())
    }
}

pub struct AgencyBranches;

impl FormKind for AgencyBranches {
    const FORM_TYPE: &'static str = "agency_branches";
    const LABEL: &'static str = "Agency branches";
    const UNIQUE_FIELD: &'static str = "registration number";
    type Row = Branch;
}

/// Accounts the agency declares closed; each needs a collection-manager sign-off.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct NoDuesRow {
    #[n(0)]
    pub account_number: String,
    #[n(1)]
    pub customer_name: String,
    #[n(2)]
    pub amount_cleared: u64,
}

impl DetailRow for NoDuesRow {
    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = vec![];
        if self.account_number.trim().is_empty() {
            missing.push("account_number");
        }
        if self.customer_name.trim().is_empty() {
            missing.push("customer_name");
        }
        missing
    }
}

pub struct NoDuesDeclaration;

impl FormKind for NoDuesDeclaration {
    const FORM_TYPE: &'static str = "no_dues_declaration";
    const LABEL: &'static str = "No dues declaration";
    const REQUIRES_CM_APPROVAL: bool = true;
    type Row = NoDuesRow;
}

pub fn branch(n: usize) -> RowInput<Branch> {
    RowInput::new(Branch {
        name: format!("Branch {n}"),
        registration_number: format!("REG-{n:04}"),
        city: "Pune".into(),
    })
}

pub fn branches(count: usize) -> Vec<RowInput<Branch>> {
    (1..=count).map(branch).collect()
}

pub fn no_dues(n: usize) -> RowInput<NoDuesRow> {
    RowInput::new(NoDuesRow {
        account_number: format!("ACC-{n:06}"),
        customer_name: format!("Customer {n}"),
        amount_cleared: 1_000 * n as u64,
    })
}

/// One collection manager with a plain-text password and a fixed admin roster.
#[derive(Debug)]
pub struct StaticDirectory {
    pub admins: Vec<String>,
}

impl IdentityProvider for StaticDirectory {
    fn verify_collection_manager(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<CmIdentity>, WorkflowError> {
        if email.eq_ignore_ascii_case(CM_EMAIL) && password == CM_PASSWORD {
            return Ok(Some(CmIdentity {
                profile_id: "cm_profile_asha".into(),
                user_id: CM_USER_ID.into(),
                name: "Asha Rao".into(),
                email: CM_EMAIL.into(),
                designation: "Collection Manager".into(),
                product_tags: vec!["Personal Loan".into(), "Credit Card".into()],
            }));
        }
        Ok(None)
    }

    fn admin_ids(&self) -> Result<Vec<String>, WorkflowError> {
        Ok(self.admins.clone())
    }
}

pub struct Harness {
    pub portal: Portal,
    pub clock: Arc<ManualClock>,
    // keeps the database directory alive for the test
    _dir: TempDir,
}

pub fn harness() -> anyhow::Result<Harness> {
    harness_with(|config| config)
}

/// A harness whose configuration is adjusted before the portal starts.
pub fn harness_with(
    adjust: impl FnOnce(WorkflowConfig) -> WorkflowConfig,
) -> anyhow::Result<Harness> {
    // sled locks its directory, so every test gets its own
    let dir = tempdir()?;
    let config = adjust(WorkflowConfig::default()).with_db_path(dir.path().join("portal.db"));
    let store = Store::open(&config.db_path)?;
    let clock = Arc::new(ManualClock::starting_now());
    let directory = Arc::new(StaticDirectory {
        admins: vec![ADMIN_ID.to_string()],
    });
    let portal = Portal::new(store, config, clock.clone(), directory);
    Ok(Harness {
        portal,
        clock,
        _dir: dir,
    })
}

pub fn agency(user_id: &str) -> Session {
    Session::new(user_id, Role::User).with_client("10.0.0.7", "portal-tests")
}

pub fn admin() -> Session {
    Session::new(ADMIN_ID, Role::Admin)
}
