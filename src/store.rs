//! sled-backed persistence.
//!
//! One tree per record kind. Records are CBOR encoded; keys are plain
//! strings, with `/`-separated scopes where a prefix scan is needed.
use std::path::Path;
use std::time::{Duration, Instant};

use sled::Tree;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};

use crate::activity::{ActivityLogEntry, EntityType, Notification};
use crate::approval::ApprovalRequest;
use crate::cm_approval::CmApproval;
use crate::error::WorkflowError;
use crate::form::{FormHeader, StoredRow};

#[derive(Clone)]
pub struct Store {
    pub(crate) forms: Tree,
    pub(crate) rows: Tree,
    pub(crate) owners: Tree,
    pub(crate) unique_keys: Tree,
    pub(crate) requests: Tree,
    pub(crate) cm_approvals: Tree,
    pub(crate) activity: Tree,
    pub(crate) notifications: Tree,
    pub(crate) cm_profiles: Tree,
    pub(crate) admins: Tree,
    db: sled::Db,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        Self::from_db(sled::open(path)?)
    }

    /// A store that disappears when dropped.
    pub fn temporary() -> Result<Self, WorkflowError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    pub fn from_db(db: sled::Db) -> Result<Self, WorkflowError> {
        Ok(Self {
            forms: db.open_tree("forms")?,
            rows: db.open_tree("form_rows")?,
            owners: db.open_tree("form_owners")?,
            unique_keys: db.open_tree("form_unique_keys")?,
            requests: db.open_tree("approval_requests")?,
            cm_approvals: db.open_tree("cm_approvals")?,
            activity: db.open_tree("activity_log")?,
            notifications: db.open_tree("notifications")?,
            cm_profiles: db.open_tree("cm_profiles")?,
            admins: db.open_tree("admins")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), WorkflowError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn form_header(&self, form_id: &str) -> Result<Option<FormHeader>, WorkflowError> {
        read(&self.forms, form_id)
    }

    pub fn form_for_owner(
        &self,
        form_type: &str,
        owner_id: &str,
    ) -> Result<Option<FormHeader>, WorkflowError> {
        match self.owners.get(owner_key(form_type, owner_id).as_bytes())? {
            Some(form_id) => self.form_header(&String::from_utf8_lossy(&form_id)),
            None => Ok(None),
        }
    }

    pub fn form_rows<R>(&self, form_id: &str) -> Result<Vec<StoredRow<R>>, WorkflowError>
    where
        R: for<'b> minicbor::Decode<'b, ()>,
    {
        Ok(read(&self.rows, form_id)?.unwrap_or_default())
    }

    pub fn approval_request(
        &self,
        request_id: &str,
    ) -> Result<Option<ApprovalRequest>, WorkflowError> {
        read(&self.requests, request_id)
    }

    /// Every approval request, oldest first.
    pub fn approval_requests(&self) -> Result<Vec<ApprovalRequest>, WorkflowError> {
        let mut requests: Vec<ApprovalRequest> = scan(&self.requests, "")?;
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    pub fn cm_approval(
        &self,
        form_type: &str,
        form_id: &str,
        row_id: &str,
    ) -> Result<Option<CmApproval>, WorkflowError> {
        read(&self.cm_approvals, &row_key(form_type, form_id, row_id))
    }

    pub fn cm_approvals_for_form(
        &self,
        form_type: &str,
        form_id: &str,
    ) -> Result<Vec<CmApproval>, WorkflowError> {
        scan(&self.cm_approvals, &format!("{form_type}/{form_id}/"))
    }

    /// Entries recorded at the same instant keep their append order.
    pub fn append_activity(&self, entry: &ActivityLogEntry) -> Result<(), WorkflowError> {
        let key = format!(
            "{}/{}/{:020}/{:020}",
            entry.entity_type.as_str(),
            entry.entity_id,
            entry.created_at.sort_key(),
            self.db.generate_id()?
        );
        self.activity.insert(key.as_bytes(), encode(entry)?)?;
        Ok(())
    }

    /// Activity recorded against one entity, in the order it happened.
    pub fn history(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<ActivityLogEntry>, WorkflowError> {
        scan(
            &self.activity,
            &format!("{}/{}/", entity_type.as_str(), entity_id),
        )
    }

    /// The whole trail, oldest first.
    pub fn activity(&self) -> Result<Vec<ActivityLogEntry>, WorkflowError> {
        let mut entries: Vec<ActivityLogEntry> = scan(&self.activity, "")?;
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    pub fn push_notification(&self, notification: &Notification) -> Result<(), WorkflowError> {
        let key = format!(
            "{}/{:020}/{:020}",
            notification.recipient_id,
            notification.created_at.sort_key(),
            self.db.generate_id()?
        );
        self.notifications
            .insert(key.as_bytes(), encode(notification)?)?;
        Ok(())
    }

    pub fn notifications_for(&self, recipient_id: &str) -> Result<Vec<Notification>, WorkflowError> {
        scan(&self.notifications, &format!("{recipient_id}/"))
    }

    pub fn mark_notification_read(
        &self,
        recipient_id: &str,
        notification_id: &str,
    ) -> Result<bool, WorkflowError> {
        for item in self
            .notifications
            .scan_prefix(format!("{recipient_id}/").as_bytes())
        {
            let (key, bytes) = item?;
            let mut notification: Notification = decode(&bytes)?;
            if notification.id == notification_id {
                notification.read = true;
                self.notifications.insert(key, encode(&notification)?)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

pub(crate) fn owner_key(form_type: &str, owner_id: &str) -> String {
    format!("{form_type}/{owner_id}")
}

pub(crate) fn unique_index_key(form_type: &str, value: &str) -> String {
    format!("{form_type}/{value}")
}

pub(crate) fn row_key(form_type: &str, form_id: &str, row_id: &str) -> String {
    format!("{form_type}/{form_id}/{row_id}")
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, WorkflowError> {
    Ok(minicbor::to_vec(value)?)
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, WorkflowError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

fn read<T>(tree: &Tree, key: &str) -> Result<Option<T>, WorkflowError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key.as_bytes())? {
        Some(bytes) => decode(&bytes).map(Some),
        None => Ok(None),
    }
}

fn scan<T>(tree: &Tree, prefix: &str) -> Result<Vec<T>, WorkflowError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    tree.scan_prefix(prefix.as_bytes())
        .values()
        .map(|bytes| {
            let bytes = bytes?;
            decode::<T>(&bytes)
        })
        .collect()
}

pub(crate) fn abort<T>(err: WorkflowError) -> ConflictableTransactionResult<T, WorkflowError> {
    Err(ConflictableTransactionError::Abort(err))
}

pub(crate) fn tx_read<T>(
    tree: &TransactionalTree,
    key: &str,
) -> ConflictableTransactionResult<Option<T>, WorkflowError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key.as_bytes())? {
        Some(bytes) => decode(&bytes)
            .map(Some)
            .map_err(ConflictableTransactionError::Abort),
        None => Ok(None),
    }
}

pub(crate) fn tx_write<T: minicbor::Encode<()>>(
    tree: &TransactionalTree,
    key: &str,
    value: &T,
) -> ConflictableTransactionResult<(), WorkflowError> {
    let bytes = encode(value).map_err(ConflictableTransactionError::Abort)?;
    tree.insert(key.as_bytes(), bytes)?;
    Ok(())
}

/// The trees a form spans, as seen from inside one transaction.
pub(crate) struct FormTrees<'a> {
    pub forms: &'a TransactionalTree,
    pub rows: &'a TransactionalTree,
    pub owners: &'a TransactionalTree,
    pub unique_keys: &'a TransactionalTree,
    pub cm_approvals: &'a TransactionalTree,
}

/// Removes a form with its rows, index entries and the CM approvals on its rows.
pub(crate) fn remove_form_tx(
    trees: &FormTrees<'_>,
    header: &FormHeader,
) -> ConflictableTransactionResult<(), WorkflowError> {
    trees.forms.remove(header.id.as_bytes())?;
    trees.rows.remove(header.id.as_bytes())?;
    trees
        .owners
        .remove(owner_key(&header.form_type, &header.owner_id).as_bytes())?;
    for value in &header.unique_keys {
        trees
            .unique_keys
            .remove(unique_index_key(&header.form_type, value).as_bytes())?;
    }
    for row_id in &header.row_ids {
        trees
            .cm_approvals
            .remove(row_key(&header.form_type, &header.id, row_id).as_bytes())?;
    }
    Ok(())
}

/// Wall-clock allowance for one transaction. Checked before the closure
/// returns, so an overrun aborts without writing anything.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TxBudget {
    started: Instant,
    limit: Duration,
}

impl TxBudget {
    pub fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }
    pub fn check(&self) -> ConflictableTransactionResult<(), WorkflowError> {
        if self.started.elapsed() > self.limit {
            return abort(WorkflowError::TransactionTimeout(self.limit));
        }
        Ok(())
    }
}
