//! Secret storage for connection passwords and SSH credentials.
//!
//! Secrets never live in `ConnectionSpec` on disk. Callers keep them in a
//! [`SecretStore`] keyed by connection id and resolve them into a spec right
//! before `connect`.
//!
//! ## Provider Selection
//!
//! - **Default**: OS keychain (macOS Keychain, Windows Credential Manager, Linux Secret Service)
//! - **`SLUICE_SECRET_STORE=memory`**: in-process map, lost on exit

use crate::error::{EngineError, EngineResult};
use crate::models::ConnectionSpec;

use keyring::Entry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Service name used for keychain entries.
const KEYRING_SERVICE: &str = "dev.sluice.Sluice";

/// Environment variable selecting the secret store provider.
const SECRET_STORE_ENV: &str = "SLUICE_SECRET_STORE";

/// Entry looked up once to check that the keychain answers.
const PROBE_KEY: &str = "sluice:probe";

const KEYCHAIN_HINT: &str = "Grant Sluice access in system preferences";

/// Key/value store for plaintext secrets.
pub trait SecretStore: Send + Sync {
    /// Store a secret, replacing any previous value.
    fn save(&self, id: &str, plaintext: &str) -> EngineResult<()>;

    /// Get a secret, `None` if nothing is stored under `id`.
    fn get(&self, id: &str) -> EngineResult<Option<String>>;

    /// Delete a secret. Deleting a missing id succeeds.
    fn delete(&self, id: &str) -> EngineResult<()>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

/// OS keychain storage via the `keyring` crate.
#[derive(Debug)]
pub struct KeychainSecretStore {
    service: String,
}

impl Default for KeychainSecretStore {
    fn default() -> Self {
        Self { service: KEYRING_SERVICE.to_string() }
    }
}

impl KeychainSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom keychain service name.
    pub fn with_service(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, id: &str) -> EngineResult<Entry> {
        Entry::new(&self.service, id).map_err(|e| EngineError::secret(e.to_string(), None))
    }
}

impl SecretStore for KeychainSecretStore {
    fn save(&self, id: &str, plaintext: &str) -> EngineResult<()> {
        self.entry(id)?
            .set_password(plaintext)
            .map_err(|e| EngineError::secret(e.to_string(), Some(KEYCHAIN_HINT)))?;
        tracing::debug!(key = id, "Secret stored in keychain");
        Ok(())
    }

    fn get(&self, id: &str) -> EngineResult<Option<String>> {
        match self.entry(id)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(EngineError::secret(e.to_string(), Some(KEYCHAIN_HINT))),
        }
    }

    fn delete(&self, id: &str) -> EngineResult<()> {
        match self.entry(id)?.delete_credential() {
            Ok(()) => {
                tracing::debug!(key = id, "Secret deleted from keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(EngineError::from(e)),
        }
    }

    fn name(&self) -> &'static str {
        "KeychainSecretStore"
    }
}

/// In-memory storage. Secrets are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }
}

impl SecretStore for MemorySecretStore {
    fn save(&self, id: &str, plaintext: &str) -> EngineResult<()> {
        self.secrets.write().insert(id.to_string(), plaintext.to_string());
        tracing::debug!(key = id, "Secret stored in memory");
        Ok(())
    }

    fn get(&self, id: &str) -> EngineResult<Option<String>> {
        Ok(self.secrets.read().get(id).cloned())
    }

    fn delete(&self, id: &str) -> EngineResult<()> {
        self.secrets.write().remove(id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MemorySecretStore"
    }
}

/// Select the provider from `SLUICE_SECRET_STORE`.
///
/// Falls back to the in-memory store when the keychain cannot be reached.
pub fn default_secret_store() -> Arc<dyn SecretStore> {
    let requested = std::env::var(SECRET_STORE_ENV).unwrap_or_default();
    let store = select_store(&requested);

    if let Err(e) = store.get(PROBE_KEY) {
        tracing::warn!(
            provider = store.name(),
            error = %e,
            "Secret store unavailable, secrets will only be kept for this session"
        );
        return Arc::new(MemorySecretStore::new());
    }
    store
}

fn select_store(requested: &str) -> Arc<dyn SecretStore> {
    let store: Arc<dyn SecretStore> = match requested.trim().to_lowercase().as_str() {
        "memory" => Arc::new(MemorySecretStore::new()),
        "" | "keychain" => Arc::new(KeychainSecretStore::new()),
        other => {
            tracing::warn!(value = other, "Unknown {SECRET_STORE_ENV} value, using keychain");
            Arc::new(KeychainSecretStore::new())
        }
    };
    tracing::debug!(provider = store.name(), "Secret store selected");
    store
}

/// Maps connection ids to secret ids and fills specs from a [`SecretStore`].
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn SecretStore>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    /// Secret id of a connection's database password.
    pub fn password_key(connection_id: Uuid) -> String {
        format!("db:{connection_id}")
    }

    /// Secret id of a connection's SSH password.
    pub fn ssh_password_key(connection_id: Uuid) -> String {
        format!("ssh:{connection_id}")
    }

    /// Secret id of a connection's SSH key passphrase.
    pub fn ssh_passphrase_key(connection_id: Uuid) -> String {
        format!("ssh-passphrase:{connection_id}")
    }

    /// Save every non-empty secret carried by `spec`.
    pub fn store_spec_secrets(&self, spec: &ConnectionSpec) -> EngineResult<()> {
        if !spec.password.is_empty() {
            self.store.save(&Self::password_key(spec.id), &spec.password)?;
        }
        if let Some(ssh) = &spec.ssh {
            if let Some(password) = ssh.password.as_deref().filter(|p| !p.is_empty()) {
                self.store.save(&Self::ssh_password_key(spec.id), password)?;
            }
            if let Some(passphrase) = ssh.passphrase.as_deref().filter(|p| !p.is_empty()) {
                self.store.save(&Self::ssh_passphrase_key(spec.id), passphrase)?;
            }
        }
        tracing::debug!(connection_id = %spec.id, "Connection secrets stored");
        Ok(())
    }

    /// Return a copy of `spec` with missing secrets filled from the store.
    ///
    /// Secrets already present in `spec` win. The SSH password is only
    /// filled when no key is configured, so auth stays unambiguous.
    pub fn resolve(&self, spec: &ConnectionSpec) -> EngineResult<ConnectionSpec> {
        let mut resolved = spec.clone();

        if resolved.password.is_empty() {
            if let Some(password) = self.store.get(&Self::password_key(spec.id))? {
                resolved.password = password;
            }
        }

        if let Some(ssh) = resolved.ssh.as_mut() {
            let has_key = ssh.private_key.as_deref().is_some_and(|k| !k.is_empty())
                || ssh.private_key_path.is_some();
            let has_password = ssh.password.as_deref().is_some_and(|p| !p.is_empty());

            if has_key {
                if !ssh.passphrase.as_deref().is_some_and(|p| !p.is_empty()) {
                    ssh.passphrase = self.store.get(&Self::ssh_passphrase_key(spec.id))?;
                }
            } else if !has_password {
                ssh.password = self.store.get(&Self::ssh_password_key(spec.id))?;
            }
        }

        Ok(resolved)
    }

    /// Delete every secret stored for a connection.
    pub fn forget(&self, connection_id: Uuid) -> EngineResult<()> {
        self.store.delete(&Self::password_key(connection_id))?;
        self.store.delete(&Self::ssh_password_key(connection_id))?;
        self.store.delete(&Self::ssh_passphrase_key(connection_id))?;
        tracing::debug!(connection_id = %connection_id, "Connection secrets deleted");
        Ok(())
    }
}

impl std::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResolver").field("store", &self.store.name()).finish()
    }
}
