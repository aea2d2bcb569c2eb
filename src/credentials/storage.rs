//! Encrypted credential storage in a single JSON document.
//!
//! The whole store is one versioned file. Every write goes through a temp
//! file that is fsynced and renamed over the target, after the previous
//! good state has been copied to `<path>.bak`.

use super::encryption::{EncryptedBlob, Scheme, TokenEncryptor};
use super::{Credential, CredentialMetadata, Expiry, Principal, PrincipalType};
use crate::config::StorageConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Current on-disk schema version
const STORE_VERSION: u32 = 1;

/// On-disk document.
///
/// ```json
/// {
///   "version": 1,
///   "credentials": {
///     "page:1234": {
///       "principal_type": "page",
///       "principal_id": "1234",
///       "access_secret": "AESGCM:<nonce>:<ciphertext>",
///       "scheme": "strong",
///       "encrypted": true,
///       "updated_at": "2024-05-01T10:00:00Z",
///       "scopes": ["ads_read"],
///       "owner_id": "42",
///       "expires_at": { "kind": "at", "at": "2024-06-30T10:00:00Z" }
///     }
///   }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    credentials: BTreeMap<String, StoredRecord>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            credentials: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredRecord {
    principal_type: PrincipalType,
    principal_id: String,
    access_secret: String,
    /// Absent on legacy records; filled in by `classify` when read
    #[serde(default)]
    scheme: Option<Scheme>,
    #[serde(default)]
    encrypted: bool,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    scopes: BTreeSet<String>,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    expires_at: Expiry,
}

impl StoredRecord {
    fn new(principal: &Principal, blob: EncryptedBlob, metadata: CredentialMetadata) -> Self {
        Self {
            principal_type: principal.principal_type,
            principal_id: principal.principal_id.clone(),
            encrypted: blob.scheme.is_encrypted(),
            access_secret: blob.value,
            scheme: Some(blob.scheme),
            updated_at: Utc::now(),
            scopes: metadata.scopes,
            owner_id: metadata.owner_id,
            expires_at: metadata.expires_at,
        }
    }

    fn principal(&self) -> Principal {
        Principal::new(self.principal_type, self.principal_id.clone())
    }

    fn blob(&self) -> EncryptedBlob {
        EncryptedBlob {
            value: self.access_secret.clone(),
            scheme: self
                .scheme
                .unwrap_or_else(|| TokenEncryptor::classify(&self.access_secret)),
        }
    }

    fn to_credential(&self, secret: String) -> Credential {
        Credential {
            principal: self.principal(),
            secret,
            scopes: self.scopes.clone(),
            owner_id: self.owner_id.clone(),
            expires_at: self.expires_at,
            updated_at: self.updated_at,
        }
    }
}

/// Result of a re-encryption migration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReencryptReport {
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Credential storage backed by a JSON file.
///
/// # Thread Safety
/// - The in-memory document is wrapped in a Mutex held across each write,
///   so concurrent saves of the same principal are ordered (last write wins)
/// - No cross-process coordination
pub struct CredentialStore {
    path: PathBuf,
    backup_path: PathBuf,
    encryptor: TokenEncryptor,
    fallback_secret: Option<String>,
    fallback_principal: Option<Principal>,
    state: Mutex<StoreFile>,
}

impl CredentialStore {
    /// Opens (or creates) the store described by `config`.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        Self::with_encryptor(config, TokenEncryptor::from_config(config))
    }

    /// Opens the store with an explicit encryptor.
    ///
    /// Unparsable content never fails the open: the file is quarantined as
    /// `<path>.corrupt`, the backup is restored if it parses, and the
    /// fallback principal is seeded from the fallback secret.
    ///
    /// # Returns
    /// * `Ok(CredentialStore)` - Initialized store
    /// * `Err` - If the parent directory cannot be created
    pub fn with_encryptor(config: &StorageConfig, encryptor: TokenEncryptor) -> Result<Self> {
        let path = config.path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory {}", parent.display())
            })?;
        }

        let fallback_principal = match config.fallback_principal.parse::<Principal>() {
            Ok(principal) => Some(principal),
            Err(e) => {
                warn!(error = %e, "Invalid fallback principal, seeding disabled");
                None
            }
        };

        let backup_path = sibling(&path, ".bak");
        let (state, mut dirty) = read_state(&path, &backup_path);

        let store = Self {
            path,
            backup_path,
            encryptor,
            fallback_secret: config.fallback_secret.clone().filter(|s| !s.is_empty()),
            fallback_principal,
            state: Mutex::new(state),
        };

        {
            let mut state = store.lock();
            if let (Some(secret), Some(principal)) =
                (&store.fallback_secret, &store.fallback_principal)
            {
                if !state.credentials.contains_key(&principal.key()) {
                    info!(principal = %principal, "Seeding fallback credential");
                    let record = StoredRecord::new(
                        principal,
                        store.encryptor.encrypt(secret),
                        CredentialMetadata::default(),
                    );
                    state.credentials.insert(principal.key(), record);
                    dirty = true;
                }
            }

            if dirty {
                if let Err(e) = store.persist(&state) {
                    error!(error = %e, path = %store.path.display(), "Failed to persist recovered store");
                }
            }
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn encryptor(&self) -> &TokenEncryptor {
        &self.encryptor
    }

    /// Retrieves the credential for a principal.
    ///
    /// A secret that cannot be decrypted is replaced by the configured
    /// fallback secret, if any, before the principal is reported absent.
    ///
    /// # Returns
    /// * `Some(Credential)` - Credential found and decrypted
    /// * `None` - Nothing stored, or unreadable with no fallback
    pub fn load(&self, principal: &Principal) -> Option<Credential> {
        let record = self.lock().credentials.get(&principal.key()).cloned()?;

        match self.encryptor.decrypt(&record.blob()) {
            Ok(secret) => Some(record.to_credential(secret)),
            Err(e) => {
                warn!(principal = %principal, error = %e, "Stored secret unreadable");
                let secret = self.fallback_secret.clone()?;
                info!(principal = %principal, "Using fallback secret");
                let mut credential = record.to_credential(secret);
                credential.expires_at = Expiry::Unknown;
                Some(credential)
            }
        }
    }

    /// Stores a secret for a principal, replacing any existing credential.
    ///
    /// Encryption never fails the save; it degrades to fallback encoding or
    /// plaintext with the scheme recorded.
    ///
    /// # Returns
    /// * `Ok(Credential)` - The credential as now stored
    /// * `Err` - If the store file could not be written
    pub fn save(
        &self,
        principal: &Principal,
        secret: &str,
        metadata: CredentialMetadata,
    ) -> Result<Credential> {
        let blob = self.encryptor.encrypt(secret);
        let scheme = blob.scheme;
        let record = StoredRecord::new(principal, blob, metadata);
        let credential = record.to_credential(secret.to_string());

        let mut state = self.lock();
        let previous = state.credentials.insert(principal.key(), record);
        if let Err(e) = self.persist(&state) {
            match previous {
                Some(previous) => state.credentials.insert(principal.key(), previous),
                None => state.credentials.remove(&principal.key()),
            };
            return Err(e).with_context(|| format!("Failed to save credential for {}", principal));
        }

        debug!(principal = %principal, scheme = ?scheme, "Credential saved");
        Ok(credential)
    }

    /// All stored principals, ordered by key.
    pub fn list_principals(&self) -> Vec<Principal> {
        self.lock()
            .credentials
            .values()
            .map(StoredRecord::principal)
            .collect()
    }

    /// Principals whose credential was obtained through `owner_id`.
    pub fn owned_by(&self, owner_id: &str) -> Vec<Principal> {
        self.lock()
            .credentials
            .values()
            .filter(|record| record.owner_id.as_deref() == Some(owner_id))
            .map(StoredRecord::principal)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-encrypts fallback and plaintext records (every record when
    /// `force`) with the strong scheme.
    pub fn reencrypt_all(&self, force: bool) -> Result<ReencryptReport> {
        let mut report = ReencryptReport::default();
        let mut state = self.lock();

        if !self.encryptor.has_key() {
            warn!("No encryption key configured, nothing migrated");
            report.skipped = state.credentials.len();
            return Ok(report);
        }

        for (key, record) in state.credentials.iter_mut() {
            let blob = record.blob();
            if blob.scheme == Scheme::Strong && !force {
                report.skipped += 1;
                continue;
            }

            let secret = match self.encryptor.decrypt(&blob) {
                Ok(secret) => secret,
                Err(e) => {
                    warn!(principal = %key, error = %e, "Cannot re-encrypt unreadable secret");
                    report.failed += 1;
                    continue;
                }
            };

            let sealed = self.encryptor.encrypt(&secret);
            if sealed.scheme != Scheme::Strong {
                report.failed += 1;
                continue;
            }

            record.access_secret = sealed.value;
            record.scheme = Some(Scheme::Strong);
            record.encrypted = true;
            report.migrated += 1;
        }

        if report.migrated > 0 {
            self.persist(&state)
                .context("Failed to persist re-encrypted store")?;
        }

        info!(
            migrated = report.migrated,
            skipped = report.skipped,
            failed = report.failed,
            "Re-encryption finished"
        );
        Ok(report)
    }

    /// [`save`](Self::save) on the blocking thread pool, for async callers.
    ///
    /// Each save fsyncs and renames files, which must not stall a runtime
    /// worker.
    pub async fn save_async(
        self: &Arc<Self>,
        principal: &Principal,
        secret: &str,
        metadata: CredentialMetadata,
    ) -> Result<Credential> {
        let store = Arc::clone(self);
        let principal = principal.clone();
        let secret = secret.to_string();
        tokio::task::spawn_blocking(move || store.save(&principal, &secret, metadata))
            .await
            .context("Credential save task failed")?
    }

    fn lock(&self) -> MutexGuard<'_, StoreFile> {
        // A panic while holding the lock never leaves a half-written document
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes the document atomically, backing up the current on-disk state
    /// first if it parses.
    fn persist(&self, state: &StoreFile) -> Result<()> {
        match fs::read_to_string(&self.path) {
            Ok(current) if serde_json::from_str::<StoreFile>(&current).is_ok() => {
                write_atomic(&self.backup_path, current.as_bytes())
                    .context("Failed to write store backup")?;
            }
            Ok(_) => warn!(path = %self.path.display(), "Current store unparsable, keeping previous backup"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to read current store"),
        }

        let json = serde_json::to_string_pretty(state).context("Failed to serialize store")?;
        write_atomic(&self.path, json.as_bytes())
    }
}

/// Reads the store document, recovering from corruption.
///
/// Returns the document and whether it differs from what is on disk.
fn read_state(path: &Path, backup_path: &Path) -> (StoreFile, bool) {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "No credential store yet, starting empty");
            return (StoreFile::default(), false);
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read credential store");
            return (read_backup(backup_path).unwrap_or_default(), true);
        }
    };

    match serde_json::from_str::<StoreFile>(&contents) {
        Ok(mut state) => {
            if state.version > STORE_VERSION {
                warn!(version = state.version, "Store written by a newer version");
            }
            let legacy = tag_legacy_records(&mut state);
            if legacy > 0 {
                info!(count = legacy, "Tagged legacy records with their scheme");
            }
            (state, legacy > 0)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Credential store corrupted, quarantining");
            let quarantine = sibling(path, ".corrupt");
            if let Err(e) = fs::rename(path, &quarantine) {
                error!(error = %e, "Failed to quarantine corrupted store");
            }

            match read_backup(backup_path) {
                Some(state) => {
                    info!(path = %backup_path.display(), "Restored credential store from backup");
                    (state, true)
                }
                None => (StoreFile::default(), true),
            }
        }
    }
}

fn read_backup(backup_path: &Path) -> Option<StoreFile> {
    let contents = fs::read_to_string(backup_path).ok()?;
    let mut state: StoreFile = serde_json::from_str(&contents).ok()?;
    tag_legacy_records(&mut state);
    Some(state)
}

fn tag_legacy_records(state: &mut StoreFile) -> usize {
    let mut tagged = 0;
    for record in state.credentials.values_mut() {
        if record.scheme.is_none() {
            let scheme = TokenEncryptor::classify(&record.access_secret);
            record.scheme = Some(scheme);
            record.encrypted = scheme.is_encrypted();
            tagged += 1;
        }
    }
    tagged
}

/// `<path><suffix>` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Writes to a temp file, fsyncs, then renames over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = sibling(path, ".tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(bytes).context("Failed to write store data")?;
        file.sync_all().context("Failed to sync store file to disk")?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename {} into place", tmp_path.display()))?;
    Ok(())
}
