//! Identifier helpers

use bech32::Bech32m;
use rand::RngCore;
use uuid7::uuid7;

use crate::error::WorkflowError;

pub const FORM_HRP: &str = "form_";
pub const ROW_HRP: &str = "row_";
pub const REQUEST_HRP: &str = "req_";
pub const CM_APPROVAL_HRP: &str = "cmap_";
pub const ACTIVITY_HRP: &str = "act_";
pub const NOTIFICATION_HRP: &str = "ntf_";
pub const CM_PROFILE_HRP: &str = "cm_";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub fn new_id(hrp: &str) -> Result<String, WorkflowError> {
    Ok(new_uuid_to_bech32(hrp)?)
}

/// Opaque bearer token for a delegated collection-manager session.
pub fn new_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("cms_{}", hex::encode(bytes))
}

/// Short non-reversible reference to a session token, safe to write into the activity log.
pub fn session_reference(token: &str) -> String {
    sha256::digest(token)[..16].to_string()
}
