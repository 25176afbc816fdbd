use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use arc_swap::ArcSwap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::types::{OAuthCredential, Provider, ProviderAuth, Rule, Snapshot, validate_rules};
use crate::error::AppError;

const NONCE_SIZE: usize = 12;
const KEY_DOMAIN: &str = "polygate-config-sealing-v1";

type Subscriber = Box<dyn Fn(Arc<Snapshot>) + Send + Sync>;

/// Encrypted single-file configuration store. Readers take a lock-free
/// snapshot; mutations go through a single writer lock, persist the new
/// file, then swap the snapshot pointer.
pub struct ConfigStore {
    path: PathBuf,
    cipher: Aes256Gcm,
    current: ArcSwap<Snapshot>,
    write_lock: Mutex<()>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl ConfigStore {
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".polygate")
            .join("config.enc")
    }

    /// Opens (or initializes) the store at `path`. A missing file yields a
    /// fresh snapshot with generated secrets, persisted immediately.
    pub fn open(path: PathBuf) -> Result<Self, AppError> {
        let cipher = build_cipher();
        let store = Self {
            path,
            cipher,
            current: ArcSwap::from_pointee(Snapshot::initialized()),
            write_lock: Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
        };

        if store.path.exists() {
            let snapshot = store.read_file()?;
            validate_rules(&snapshot.rules).map_err(AppError::BadRequest)?;
            store.current.store(Arc::new(snapshot));
        } else {
            let initial = store.current.load_full();
            store.write_file(&initial)?;
            info!("initialized new config at {}", store.path.display());
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock-free read of the current immutable snapshot. The returned Arc
    /// stays internally consistent for as long as the caller holds it.
    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Called with the new snapshot after every successful mutation or
    /// external reload.
    pub fn subscribe(&self, cb: impl Fn(Arc<Snapshot>) + Send + Sync + 'static) {
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(Box::new(cb));
    }

    pub async fn add_provider(&self, provider: Provider) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.current.load().as_ref().clone();
        if snapshot.providers.iter().any(|p| p.name == provider.name) {
            return Err(AppError::Conflict(format!(
                "provider '{}' already exists",
                provider.name
            )));
        }
        snapshot.providers.push(provider);
        self.commit(snapshot)
    }

    pub async fn update_provider(&self, id: &str, updated: Provider) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.current.load().as_ref().clone();
        if snapshot
            .providers
            .iter()
            .any(|p| p.id != id && p.name == updated.name)
        {
            return Err(AppError::Conflict(format!(
                "provider '{}' already exists",
                updated.name
            )));
        }
        let slot = snapshot
            .providers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::NotFound("provider".to_string()))?;
        *slot = updated;
        self.commit(snapshot)
    }

    pub async fn delete_provider(&self, id: &str) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.current.load().as_ref().clone();
        let before = snapshot.providers.len();
        snapshot.providers.retain(|p| p.id != id);
        if snapshot.providers.len() == before {
            return Err(AppError::NotFound("provider".to_string()));
        }
        self.commit(snapshot)
    }

    /// Flips the enabled flag; returns the new state.
    pub async fn toggle_provider(&self, id: &str) -> Result<bool, AppError> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.current.load().as_ref().clone();
        let provider = snapshot
            .providers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::NotFound("provider".to_string()))?;
        provider.enabled = !provider.enabled;
        let enabled = provider.enabled;
        self.commit(snapshot)?;
        Ok(enabled)
    }

    /// Atomically replaces the rule set. An invalid set aborts before
    /// anything is persisted and the old rules remain in force.
    pub async fn replace_rules(&self, rules: Vec<Rule>) -> Result<(), AppError> {
        validate_rules(&rules).map_err(AppError::BadRequest)?;
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.current.load().as_ref().clone();
        snapshot.rules = rules;
        self.commit(snapshot)
    }

    /// Persists a refreshed OAuth bundle for a provider.
    pub async fn update_oauth(
        &self,
        provider_id: &str,
        credential: OAuthCredential,
    ) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.current.load().as_ref().clone();
        let provider = snapshot
            .providers
            .iter_mut()
            .find(|p| p.id == provider_id)
            .ok_or_else(|| AppError::NotFound("provider".to_string()))?;
        provider.auth = ProviderAuth::OAuth(credential);
        self.commit(snapshot)
    }

    /// Re-reads the file (after an external change), validates, and swaps.
    /// A file that fails to decrypt or validate leaves the current snapshot
    /// untouched.
    pub fn reload_from_disk(&self) -> Result<(), AppError> {
        let snapshot = self.read_file()?;
        if let Err(e) = validate_rules(&snapshot.rules) {
            warn!("rejecting reloaded config: {e}");
            return Err(AppError::BadRequest(e));
        }
        let snapshot = Arc::new(snapshot);
        self.current.store(snapshot.clone());
        self.notify(snapshot);
        info!("configuration reloaded");
        Ok(())
    }

    fn commit(&self, snapshot: Snapshot) -> Result<(), AppError> {
        self.write_file(&snapshot)?;
        let snapshot = Arc::new(snapshot);
        self.current.store(snapshot.clone());
        self.notify(snapshot);
        Ok(())
    }

    fn notify(&self, snapshot: Arc<Snapshot>) {
        let subscribers = self.subscribers.read().expect("subscriber lock poisoned");
        for cb in subscribers.iter() {
            cb(snapshot.clone());
        }
    }

    fn read_file(&self) -> Result<Snapshot, AppError> {
        let encoded = std::fs::read_to_string(&self.path)
            .map_err(|e| AppError::Internal(format!("failed to read config file: {e}")))?;
        let sealed = BASE64
            .decode(encoded.trim())
            .map_err(|e| AppError::Internal(format!("failed to decode config: {e}")))?;
        if sealed.len() < NONCE_SIZE {
            return Err(AppError::Internal("config ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AppError::Internal("failed to decrypt config".to_string()))?;
        let snapshot = serde_json::from_slice(&plaintext)
            .map_err(|e| AppError::Internal(format!("failed to parse config: {e}")))?;
        Ok(snapshot)
    }

    /// Seals and writes the snapshot: base64(nonce || AES-GCM ciphertext),
    /// written to a sibling temp file and renamed into place.
    fn write_file(&self, snapshot: &Snapshot) -> Result<(), AppError> {
        let plaintext = serde_json::to_vec(snapshot)?;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| AppError::Internal("failed to encrypt config".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        let encoded = BASE64.encode(sealed);

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| AppError::Internal(format!("failed to create config dir: {e}")))?;
            restrict_permissions(dir, 0o700);
        }
        let tmp = self.path.with_extension("enc.tmp");
        std::fs::write(&tmp, encoded)
            .map_err(|e| AppError::Internal(format!("failed to write config file: {e}")))?;
        restrict_permissions(&tmp, 0o600);
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| AppError::Internal(format!("failed to replace config file: {e}")))?;
        Ok(())
    }
}

/// AES-256 key derived from a machine-stable identifier plus a fixed
/// domain-separation string, mirroring what ties the file to this host.
fn build_cipher() -> Aes256Gcm {
    let hostname = gethostname::gethostname();
    let mut hasher = Sha256::new();
    hasher.update(hostname.to_string_lossy().as_bytes());
    hasher.update(KEY_DOMAIN.as_bytes());
    let digest = hasher.finalize();
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&digest))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        warn!("failed to set permissions on {}: {e}", path.display());
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) {}
