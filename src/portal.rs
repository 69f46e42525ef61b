//! The handle every workflow service is built from.
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::activity::{ActivityLogEntry, Notification, NotificationKind};
use crate::approval::ApprovalWorkflow;
use crate::clock::{Clock, SystemClock};
use crate::cm_session::{CmSessionStore, DelegatedApprovals};
use crate::config::WorkflowConfig;
use crate::directory::{Directory, IdentityProvider};
use crate::error::WorkflowError;
use crate::form::FormKind;
use crate::lifecycle::FormLifecycle;
use crate::store::{Store, TxBudget};
use crate::types::TimeStamp;

#[derive(Clone)]
pub struct Portal {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    config: WorkflowConfig,
    clock: Arc<dyn Clock>,
    identity: Arc<dyn IdentityProvider>,
    sessions: CmSessionStore,
    // dropping the sender stops the sweeper thread
    _stop_sweeper: Sender<()>,
}

impl Portal {
    /// Open the store at `config.db_path` with the sled-backed directory and the system clock.
    pub fn open(config: WorkflowConfig) -> Result<Self, WorkflowError> {
        config.validate()?;
        let store = Store::open(&config.db_path)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let directory = Directory::new(store.clone()).with_clock(clock.clone());
        Ok(Self::new(store, config, clock, Arc::new(directory)))
    }

    /// Builds the portal and starts the thread that sweeps expired CM
    /// sessions every `config.cleanup_interval`.
    pub fn new(
        store: Store,
        config: WorkflowConfig,
        clock: Arc<dyn Clock>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let sessions = CmSessionStore::new(config.cm_session_ttl(), config.cleanup_every());
        let (stop, stopped) = mpsc::channel();
        let inner = Arc::new(Inner {
            store,
            config,
            clock,
            identity,
            sessions,
            _stop_sweeper: stop,
        });
        spawn_sweeper(Arc::downgrade(&inner), stopped, inner.config.cleanup_interval);
        Self { inner }
    }

    pub fn forms<K: FormKind>(&self) -> FormLifecycle<K> {
        FormLifecycle::new(self.clone())
    }

    pub fn approvals(&self) -> ApprovalWorkflow {
        ApprovalWorkflow::new(self.clone())
    }

    pub fn cm_sessions(&self) -> DelegatedApprovals {
        DelegatedApprovals::new(self.clone())
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.config
    }

    pub fn now(&self) -> TimeStamp {
        self.inner.clock.now().into()
    }

    pub(crate) fn clock_now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub(crate) fn identity(&self) -> &dyn IdentityProvider {
        self.inner.identity.as_ref()
    }

    pub(crate) fn sessions(&self) -> &CmSessionStore {
        &self.inner.sessions
    }

    pub(crate) fn budget(&self) -> TxBudget {
        TxBudget::start(self.inner.config.transaction_timeout)
    }

    /// Appends after the state change has committed. A failure here loses the
    /// entry but must not undo or fail the action that produced it.
    pub(crate) fn record_activity(&self, entry: Result<ActivityLogEntry, WorkflowError>) {
        let result = entry.and_then(|entry| self.inner.store.append_activity(&entry));
        if let Err(err) = result {
            error!(error = %err, "failed to append activity log entry");
        }
    }

    pub(crate) fn notify(
        &self,
        recipient_id: &str,
        kind: NotificationKind,
        title: &str,
        message: &str,
        entity_id: Option<&str>,
    ) {
        let result = Notification::new(recipient_id, kind, title, message, entity_id, self.now())
            .and_then(|n| self.inner.store.push_notification(&n));
        if let Err(err) = result {
            error!(error = %err, recipient = recipient_id, kind = kind.as_str(), "failed to queue notification");
        }
    }

    pub(crate) fn notify_admins(
        &self,
        kind: NotificationKind,
        title: &str,
        message: &str,
        entity_id: Option<&str>,
    ) {
        match self.identity().admin_ids() {
            Ok(admins) => {
                for admin in admins {
                    self.notify(&admin, kind, title, message, entity_id);
                }
            }
            Err(err) => error!(error = %err, "failed to look up admins for notification"),
        }
    }
}

/// Removes expired CM sessions on a fixed interval, independent of traffic.
/// Exits once the portal is dropped.
fn spawn_sweeper(portal: Weak<Inner>, stopped: Receiver<()>, interval: Duration) {
    if interval.is_zero() {
        warn!("CM session sweeper disabled: cleanup interval is zero");
        return;
    }
    let spawned = thread::Builder::new()
        .name("cm-session-sweeper".into())
        .spawn(move || {
            while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                let Some(inner) = portal.upgrade() else {
                    break;
                };
                let removed = inner.sessions.cleanup(inner.clock.now());
                if removed > 0 {
                    debug!(removed, "expired CM sessions swept");
                }
            }
        });
    if let Err(err) = spawned {
        // expiry is still enforced on every access
        error!(error = %err, "failed to start CM session sweeper");
    }
}
