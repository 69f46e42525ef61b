//! Collection-manager profiles and the admin roster.
//!
//! The portal only needs two answers from identity: whether a CM's
//! credentials are good, and who the admins are. [`IdentityProvider`] is that
//! seam; [`Directory`] answers it from the sled store.
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::WorkflowError;
use crate::store::{Store, decode, encode};
use crate::types::TimeStamp;
use crate::utils::{CM_PROFILE_HRP, new_id};

const MIN_PASSWORD_LEN: usize = 8;

pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` for unknown emails, wrong passwords and deactivated profiles alike.
    fn verify_collection_manager(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<CmIdentity>, WorkflowError>;

    fn admin_ids(&self) -> Result<Vec<String>, WorkflowError>;
}

/// A verified collection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmIdentity {
    pub profile_id: String,
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub designation: String,
    pub product_tags: Vec<String>,
}

impl CmIdentity {
    /// A profile without tags may approve for any product.
    pub fn covers(&self, product_tag: &str) -> bool {
        self.product_tags.is_empty()
            || self
                .product_tags
                .iter()
                .any(|t| t.eq_ignore_ascii_case(product_tag))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct CmProfile {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub email: String,
    #[n(4)]
    pub designation: String,
    #[n(5)]
    pub product_tags: Vec<String>,
    #[n(6)]
    pub password_hash: String,
    #[n(7)]
    pub active: bool,
    #[n(8)]
    pub created_at: TimeStamp,
}

impl CmProfile {
    fn identity(&self) -> CmIdentity {
        CmIdentity {
            profile_id: self.id.clone(),
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            designation: self.designation.clone(),
            product_tags: self.product_tags.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCollectionManager {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub designation: String,
    pub password: String,
    pub product_tags: Vec<String>,
}

#[derive(Clone)]
pub struct Directory {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl Directory {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp registrations from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register_collection_manager(
        &self,
        new: NewCollectionManager,
    ) -> Result<CmProfile, WorkflowError> {
        let email = normalize_email(&new.email);
        if email.is_empty() || !email.contains('@') {
            return Err(WorkflowError::validation("A valid email is required."));
        }
        if new.name.trim().is_empty() || new.user_id.trim().is_empty() {
            return Err(WorkflowError::validation(
                "Name and user id are required for a collection manager.",
            ));
        }
        if new.password.len() < MIN_PASSWORD_LEN {
            return Err(WorkflowError::validation(format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters."
            )));
        }

        let profile = CmProfile {
            id: new_id(CM_PROFILE_HRP)?,
            user_id: new.user_id.trim().to_string(),
            name: new.name.trim().to_string(),
            email: email.clone(),
            designation: new.designation.trim().to_string(),
            product_tags: new
                .product_tags
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            password_hash: hash_password(&new.password)?,
            active: true,
            created_at: self.clock.now().into(),
        };

        let inserted = self.store.cm_profiles.compare_and_swap(
            email.as_bytes(),
            None as Option<&[u8]>,
            Some(encode(&profile)?),
        )?;
        if inserted.is_err() {
            return Err(WorkflowError::conflict(format!(
                "A collection manager with email {email} is already registered."
            )));
        }
        info!(profile_id = %profile.id, "collection manager registered");
        Ok(profile)
    }

    /// Returns false when no profile exists for the email.
    pub fn deactivate_collection_manager(&self, email: &str) -> Result<bool, WorkflowError> {
        let Some(mut profile) = self.collection_manager(email)? else {
            return Ok(false);
        };
        profile.active = false;
        self.store
            .cm_profiles
            .insert(profile.email.as_bytes(), encode(&profile)?)?;
        info!(profile_id = %profile.id, "collection manager deactivated");
        Ok(true)
    }

    pub fn collection_manager(&self, email: &str) -> Result<Option<CmProfile>, WorkflowError> {
        match self
            .store
            .cm_profiles
            .get(normalize_email(email).as_bytes())?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn register_admin(&self, user_id: &str) -> Result<(), WorkflowError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(WorkflowError::validation("Admin user id is required."));
        }
        self.store.admins.insert(user_id.as_bytes(), Vec::<u8>::new())?;
        Ok(())
    }
}

impl IdentityProvider for Directory {
    fn verify_collection_manager(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<CmIdentity>, WorkflowError> {
        let Some(profile) = self.collection_manager(email)? else {
            debug!("collection manager login for unknown email");
            return Ok(None);
        };
        if !profile.active || !verify_password(password, &profile.password_hash)? {
            return Ok(None);
        }
        Ok(Some(profile.identity()))
    }

    fn admin_ids(&self) -> Result<Vec<String>, WorkflowError> {
        self.store
            .admins
            .iter()
            .keys()
            .map(|key| -> Result<String, WorkflowError> {
                Ok(String::from_utf8_lossy(&key?).into_owned())
            })
            .collect()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Argon2id PHC string with a fresh salt.
pub fn hash_password(password: &str) -> Result<String, WorkflowError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}").into())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, WorkflowError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| anyhow::anyhow!("invalid password hash format: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;
    use crate::clock::ManualClock;

    fn asha() -> NewCollectionManager {
        NewCollectionManager {
            user_id: "cm_user_1".into(),
            name: "Asha Rao".into(),
            email: "Asha@Bank.example".into(),
            designation: "Collection Manager".into(),
            password: "correct-horse".into(),
            product_tags: vec!["Personal Loan".into(), " ".into()],
        }
    }

    #[test]
    fn hash_and_verify() {
        let hash = hash_password("correct-horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct-horse", &hash).unwrap());
        assert!(!verify_password("wrong-horse", &hash).unwrap());
        assert!(verify_password("x", "not-a-hash").is_err());
    }

    #[test]
    fn registered_manager_verifies_case_insensitively() -> anyhow::Result<()> {
        let directory = Directory::new(Store::temporary()?);
        let profile = directory.register_collection_manager(asha())?;
        assert_eq!(profile.email, "asha@bank.example");
        assert_eq!(profile.product_tags, vec!["Personal Loan".to_string()]);

        let identity = directory
            .verify_collection_manager("ASHA@bank.example", "correct-horse")?
            .expect("valid credentials");
        assert_eq!(identity.user_id, "cm_user_1");
        assert!(identity.covers("personal loan"));
        assert!(!identity.covers("Home Loan"));

        assert!(directory
            .verify_collection_manager("asha@bank.example", "wrong-horse")?
            .is_none());
        assert!(directory
            .verify_collection_manager("nobody@bank.example", "correct-horse")?
            .is_none());
        Ok(())
    }

    #[test]
    fn registration_is_stamped_by_the_injected_clock() -> anyhow::Result<()> {
        let at = TimeStamp::new_with(2024, 5, 2, 11, 0, 0).context("valid date")?;
        let clock = Arc::new(ManualClock::new(at.to_datetime_utc()));
        let directory = Directory::new(Store::temporary()?).with_clock(clock.clone());

        let profile = directory.register_collection_manager(asha())?;
        assert_eq!(profile.created_at, at);
        let stored = directory
            .collection_manager("asha@bank.example")?
            .context("profile missing")?;
        assert_eq!(stored.created_at, at);
        Ok(())
    }

    #[test]
    fn duplicate_email_conflicts() -> anyhow::Result<()> {
        let directory = Directory::new(Store::temporary()?);
        directory.register_collection_manager(asha())?;
        let err = directory.register_collection_manager(asha()).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        Ok(())
    }

    #[test]
    fn short_password_is_rejected() -> anyhow::Result<()> {
        let directory = Directory::new(Store::temporary()?);
        let mut new = asha();
        new.password = "short".into();
        assert!(matches!(
            directory.register_collection_manager(new),
            Err(WorkflowError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn deactivated_manager_cannot_log_in() -> anyhow::Result<()> {
        let directory = Directory::new(Store::temporary()?);
        directory.register_collection_manager(asha())?;
        assert!(directory.deactivate_collection_manager("asha@bank.example")?);
        assert!(directory
            .verify_collection_manager("asha@bank.example", "correct-horse")?
            .is_none());
        Ok(())
    }

    #[test]
    fn admins_are_listed() -> anyhow::Result<()> {
        let directory = Directory::new(Store::temporary()?);
        directory.register_admin("admin_1")?;
        directory.register_admin("admin_2")?;
        assert_eq!(directory.admin_ids()?, vec!["admin_1", "admin_2"]);
        Ok(())
    }
}
