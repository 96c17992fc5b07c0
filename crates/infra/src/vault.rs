//! Connection credential encryption.
//!
//! AES-256-GCM with a per-tenant key derived (HKDF-SHA256, tenant id as salt)
//! from a versioned master key. Blobs are `nonce || ciphertext || tag` and
//! carry the key version they were sealed with, so keys can rotate while old
//! blobs stay readable.

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use regsync_core::TenantId;
use regsync_outbox::EncryptedCredentials;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;
const HKDF_INFO: &[u8] = b"regsync-registry-credentials-v1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    #[error("no credential key with version {0}")]
    UnknownKeyVersion(u32),
    #[error("no credential keys configured")]
    NoKeys,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Plaintext Registry credentials. Only ever held in memory for one call.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub secret: String,
}

impl RegistryCredentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Keyring of master keys by version. New blobs use the highest version.
#[derive(Clone)]
pub struct CredentialVault {
    keys: BTreeMap<u32, [u8; KEY_LENGTH]>,
}

impl CredentialVault {
    pub fn new(keys: BTreeMap<u32, [u8; KEY_LENGTH]>) -> Result<Self, VaultError> {
        if keys.is_empty() {
            return Err(VaultError::NoKeys);
        }
        Ok(Self { keys })
    }

    pub fn single(version: u32, key: [u8; KEY_LENGTH]) -> Self {
        Self {
            keys: BTreeMap::from([(version, key)]),
        }
    }

    /// Parse `version:base64key` pairs separated by commas.
    pub fn from_key_list(list: &str) -> Result<Self, VaultError> {
        let mut keys = BTreeMap::new();
        for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (version, encoded) = part
                .split_once(':')
                .ok_or_else(|| VaultError::InvalidKey(format!("expected version:key, got '{part}'")))?;
            let version: u32 = version
                .trim()
                .parse()
                .map_err(|e| VaultError::InvalidKey(format!("bad key version '{version}': {e}")))?;
            keys.insert(version, decode_key(encoded.trim())?);
        }
        Self::new(keys)
    }

    pub fn current_version(&self) -> u32 {
        self.keys.keys().next_back().copied().unwrap_or_default()
    }

    fn derive_tenant_key(&self, version: u32, tenant_id: TenantId) -> Result<[u8; KEY_LENGTH], VaultError> {
        let master = self
            .keys
            .get(&version)
            .ok_or(VaultError::UnknownKeyVersion(version))?;
        let hkdf = Hkdf::<Sha256>::new(Some(tenant_id.as_uuid().as_bytes()), master);
        let mut derived = [0u8; KEY_LENGTH];
        hkdf.expand(HKDF_INFO, &mut derived)
            .map_err(|e| VaultError::InvalidKey(format!("key derivation failed: {e}")))?;
        Ok(derived)
    }

    pub fn seal(
        &self,
        tenant_id: TenantId,
        credentials: &RegistryCredentials,
    ) -> Result<EncryptedCredentials, VaultError> {
        let version = self.current_version();
        let key = self.derive_tenant_key(version, tenant_id)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| VaultError::Encryption(format!("failed to create cipher: {e}")))?;

        let plaintext = serde_json::to_vec(credentials)
            .map_err(|e| VaultError::Encryption(format!("failed to encode credentials: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let encrypted = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut ciphertext = Vec::with_capacity(NONCE_LENGTH + encrypted.len());
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&encrypted);

        Ok(EncryptedCredentials {
            key_version: version,
            ciphertext,
        })
    }

    pub fn open(
        &self,
        tenant_id: TenantId,
        blob: &EncryptedCredentials,
    ) -> Result<RegistryCredentials, VaultError> {
        if blob.ciphertext.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(VaultError::Decryption("ciphertext too short".to_string()));
        }
        let key = self.derive_tenant_key(blob.key_version, tenant_id)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| VaultError::Decryption(format!("failed to create cipher: {e}")))?;

        let (nonce_bytes, encrypted) = blob.ciphertext.split_at(NONCE_LENGTH);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), encrypted)
            .map_err(|e| VaultError::Decryption(e.to_string()))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::Decryption(format!("malformed credentials: {e}")))
    }

    /// Re-seal a blob under the current key version.
    pub fn rotate(
        &self,
        tenant_id: TenantId,
        blob: &EncryptedCredentials,
    ) -> Result<EncryptedCredentials, VaultError> {
        let credentials = self.open(tenant_id, blob)?;
        self.seal(tenant_id, &credentials)
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("versions", &self.keys.keys().collect::<Vec<_>>())
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LENGTH], VaultError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| VaultError::InvalidKey(format!("invalid base64 key: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        VaultError::InvalidKey(format!("key must be {KEY_LENGTH} bytes, got {}", b.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> RegistryCredentials {
        RegistryCredentials::new("employer-7", "s3cret")
    }

    #[test]
    fn seal_then_open_for_same_tenant() {
        let vault = CredentialVault::single(1, [7u8; 32]);
        let tenant = TenantId::new();

        let blob = vault.seal(tenant, &creds()).unwrap();
        assert_eq!(blob.key_version, 1);
        assert_eq!(vault.open(tenant, &blob).unwrap(), creds());
    }

    #[test]
    fn other_tenant_cannot_open() {
        let vault = CredentialVault::single(1, [7u8; 32]);
        let blob = vault.seal(TenantId::new(), &creds()).unwrap();

        let err = vault.open(TenantId::new(), &blob).unwrap_err();
        assert!(matches!(err, VaultError::Decryption(_)));
    }

    #[test]
    fn rotation_keeps_old_blobs_readable() {
        let tenant = TenantId::new();
        let old = CredentialVault::single(1, [1u8; 32]);
        let blob = old.seal(tenant, &creds()).unwrap();

        let vault = CredentialVault::new(BTreeMap::from([(1, [1u8; 32]), (2, [2u8; 32])])).unwrap();
        assert_eq!(vault.current_version(), 2);
        assert_eq!(vault.open(tenant, &blob).unwrap(), creds());

        let rotated = vault.rotate(tenant, &blob).unwrap();
        assert_eq!(rotated.key_version, 2);
        assert_eq!(vault.open(tenant, &rotated).unwrap(), creds());
    }

    #[test]
    fn retired_key_version_is_reported() {
        let tenant = TenantId::new();
        let blob = CredentialVault::single(1, [1u8; 32]).seal(tenant, &creds()).unwrap();
        let vault = CredentialVault::single(2, [2u8; 32]);

        assert_eq!(vault.open(tenant, &blob).unwrap_err(), VaultError::UnknownKeyVersion(1));
    }

    #[test]
    fn parses_keyring_spec() {
        let k1 = STANDARD.encode([1u8; 32]);
        let k3 = STANDARD.encode([3u8; 32]);
        let vault = CredentialVault::from_key_list(&format!("1:{k1}, 3:{k3}")).unwrap();
        assert_eq!(vault.current_version(), 3);

        assert!(matches!(
            CredentialVault::from_key_list("1:AAAA"),
            Err(VaultError::InvalidKey(_))
        ));
        assert_eq!(CredentialVault::from_key_list("").unwrap_err(), VaultError::NoKeys);
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", creds());
        assert!(!rendered.contains("s3cret"));
    }
}
