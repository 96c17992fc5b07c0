//! Shared wiring for the dispatcher, receipt poller and drift detector.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use regsync_core::{ConnectionId, TenantId};
use regsync_outbox::{Alert, AlertCategory, AlertSeverity, Connection};

use crate::alerts::AlertSink;
use crate::registry::RegistryClient;
use crate::store::SyncStore;
use crate::vault::{CredentialVault, RegistryCredentials, VaultError};

/// Collaborators every engine component needs.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn SyncStore>,
    pub registry: Arc<dyn RegistryClient>,
    pub vault: Arc<CredentialVault>,
    pub alerts: Arc<dyn AlertSink>,
    halted: Arc<RwLock<HashSet<ConnectionId>>>,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn SyncStore>,
        registry: Arc<dyn RegistryClient>,
        vault: Arc<CredentialVault>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            registry,
            vault,
            alerts,
            halted: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn open_credentials(&self, connection: &Connection) -> Result<RegistryCredentials, VaultError> {
        self.vault.open(connection.tenant_id, &connection.credentials)
    }

    pub fn is_halted(&self, id: ConnectionId) -> bool {
        match self.halted.read() {
            Ok(set) => set.contains(&id),
            Err(poisoned) => poisoned.into_inner().contains(&id),
        }
    }

    /// Lift an in-process halt (operator reactivation).
    pub fn resume(&self, id: ConnectionId) {
        match self.halted.write() {
            Ok(mut set) => set.remove(&id),
            Err(poisoned) => poisoned.into_inner().remove(&id),
        };
    }

    fn mark_halted(&self, id: ConnectionId) {
        match self.halted.write() {
            Ok(mut set) => set.insert(id),
            Err(poisoned) => poisoned.into_inner().insert(id),
        };
    }

    /// Stop all work for a connection after an engine fault. The store write
    /// is best effort: the fault may be the store itself.
    pub async fn halt(
        &self,
        tenant_id: TenantId,
        connection_id: ConnectionId,
        reason: &str,
        now: DateTime<Utc>,
    ) {
        self.mark_halted(connection_id);
        error!(%tenant_id, %connection_id, reason, "connection halted after engine fault");

        let detail = format!("engine fault: {reason}");
        if let Err(e) = self
            .store
            .mark_connection_error(connection_id, &detail, now)
            .await
        {
            warn!(%connection_id, error = %e, "could not mark halted connection as error");
        }

        self.alerts
            .raise(
                Alert::new(tenant_id, AlertSeverity::Critical, AlertCategory::SyncFailure, detail)
                    .for_connection(connection_id),
            )
            .await;
    }

    /// The connection's credentials are unusable: move it to `error` until an
    /// operator fixes them.
    pub async fn fail_connection(&self, connection: &Connection, reason: &str, now: DateTime<Utc>) {
        if let Err(e) = self
            .store
            .mark_connection_error(connection.id, reason, now)
            .await
        {
            warn!(connection_id = %connection.id, error = %e, "could not mark connection as error");
        }
        self.alerts
            .raise(
                Alert::new(
                    connection.tenant_id,
                    AlertSeverity::Critical,
                    AlertCategory::SyncFailure,
                    format!("connection {} disabled: {reason}", connection.id),
                )
                .for_connection(connection.id),
            )
            .await;
    }
}
