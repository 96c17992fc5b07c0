//! Registry connection: one per (organization, Registry employer) pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use regsync_core::{ConnectionId, DomainError, DomainResult, TenantId, Versioned};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Inactive,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Inactive => "inactive",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ConnectionStatus::Active),
            "inactive" => Some(ConnectionStatus::Inactive),
            "error" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }
}

impl core::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encrypted credential blob plus the key version that sealed it.
///
/// The layout of `ciphertext` belongs to the vault; the domain never looks
/// inside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedCredentials {
    pub key_version: u32,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub tenant_id: TenantId,
    pub registry_employer_id: String,
    pub registry_establishment_id: Option<String>,
    #[serde(skip_serializing, default)]
    pub credentials: EncryptedCredentials,
    pub status: ConnectionStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Versioned for Connection {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Connection {
    /// Onboard a new connection. Connections start `active`.
    pub fn new(
        tenant_id: TenantId,
        registry_employer_id: impl Into<String>,
        credentials: EncryptedCredentials,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            tenant_id,
            registry_employer_id: registry_employer_id.into(),
            registry_establishment_id: None,
            credentials,
            status: ConnectionStatus::Active,
            last_sync_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn with_establishment(mut self, establishment_id: impl Into<String>) -> Self {
        self.registry_establishment_id = Some(establishment_id.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }

    /// Halt the connection after an authentication, decryption or engine fault.
    pub fn mark_error(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = ConnectionStatus::Error;
        self.last_error = Some(reason.into());
        self.updated_at = now;
    }

    /// Operator action returning a halted or inactive connection to service.
    pub fn reactivate(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status == ConnectionStatus::Active {
            return Err(DomainError::illegal_transition(self.status, ConnectionStatus::Active));
        }
        self.status = ConnectionStatus::Active;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.status = ConnectionStatus::Inactive;
        self.updated_at = now;
    }

    pub fn record_sync(&mut self, now: DateTime<Utc>) {
        self.last_sync_at = Some(match self.last_sync_at {
            Some(prev) if prev > now => prev,
            _ => now,
        });
        self.updated_at = now;
    }

    /// Replace the credential blob. Key versions never go backwards.
    pub fn rotate_credentials(
        &mut self,
        credentials: EncryptedCredentials,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if credentials.key_version < self.credentials.key_version {
            return Err(DomainError::validation(format!(
                "credential key version {} is older than current {}",
                credentials.key_version, self.credentials.key_version
            )));
        }
        self.credentials = credentials;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        Connection::new(
            TenantId::new(),
            "EMP-001",
            EncryptedCredentials { key_version: 2, ciphertext: vec![1, 2, 3] },
            Utc::now(),
        )
    }

    #[test]
    fn error_then_reactivate() {
        let mut c = connection();
        c.mark_error("401 from registry", Utc::now());
        assert_eq!(c.status, ConnectionStatus::Error);
        assert_eq!(c.last_error.as_deref(), Some("401 from registry"));

        c.reactivate(Utc::now()).unwrap();
        assert!(c.is_active());
        assert!(c.last_error.is_none());
        assert!(c.reactivate(Utc::now()).is_err());
    }

    #[test]
    fn credentials_are_not_serialized() {
        let json = serde_json::to_value(connection()).unwrap();
        assert!(json.get("credentials").is_none());
    }

    #[test]
    fn rotation_rejects_older_key() {
        let mut c = connection();
        let older = EncryptedCredentials { key_version: 1, ciphertext: vec![9] };
        assert!(c.rotate_credentials(older, Utc::now()).is_err());
        let newer = EncryptedCredentials { key_version: 3, ciphertext: vec![9] };
        c.rotate_credentials(newer, Utc::now()).unwrap();
        assert_eq!(c.credentials.key_version, 3);
    }
}
