//! Row-level approvals recorded by a collection manager.
use crate::types::TimeStamp;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct CmApproval {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub cm_profile_id: String,
    #[n(2)]
    pub agency_id: String,
    #[n(3)]
    pub form_type: String,
    #[n(4)]
    pub form_id: String,
    #[n(5)]
    pub row_id: String,
    #[n(6)]
    pub field: String, // the row field this approval stands for
    #[n(7)]
    pub approval_signature: String,
    #[n(8)]
    pub signature_digest: String,
    #[n(9)]
    pub product_tag: String,
    #[n(10)]
    pub remarks: Option<String>,
    #[n(11)]
    pub ip_address: Option<String>,
    #[n(12)]
    pub user_agent: Option<String>,
    #[n(13)]
    pub created_at: TimeStamp,
}

/// Who signed, as printed into the approval signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signatory {
    pub name: String,
    pub email: String,
    pub designation: String,
    pub product_tag: String,
}

impl Signatory {
    pub fn signature(&self, at: TimeStamp) -> String {
        format!(
            "Approved by {} ({}), {} for {} at {}",
            self.name, self.email, self.designation, self.product_tag, at
        )
    }
}

/// sha256 over the signature and the row it covers, so a copied signature
/// cannot be passed off for a different row.
pub fn signature_digest(signature: &str, form_id: &str, row_id: &str) -> String {
    sha256::digest(format!("{signature}|{form_id}|{row_id}"))
}
