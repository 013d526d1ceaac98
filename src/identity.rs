//! Per-installation device identity.
//!
//! The gateway authenticates clients by an Ed25519 signature over a short
//! connect proof.  The keypair lives in a small JSON file (mode 0600) and
//! the device id is the hex SHA-256 of the raw 32-byte public key.  Any
//! problem with the file results in a fresh identity rather than an error:
//! a client that cannot persist its identity still works for the lifetime
//! of the process.
//!
//! Device tokens handed out by the gateway during pairing are kept in a
//! sibling `device-auth.json`, keyed by role.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use log::{debug, info, warn};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const IDENTITY_VERSION: u32 = 1;
const DEVICE_AUTH_FILE: &str = "device-auth.json";

static SHARED: OnceLock<Mutex<HashMap<PathBuf, DeviceIdentity>>> = OnceLock::new();

/// On-disk shape of the identity file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    version: u32,
    device_id: String,
    public_key: String,
    private_key: String,
    created_at: u64,
}

/// A loaded device identity, ready to sign connect proofs.
#[derive(Clone)]
pub struct DeviceIdentity {
    device_id: String,
    signing_key: SigningKey,
    created_at: u64,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    /// Generate a brand new keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            device_id: derive_device_id(&signing_key.verifying_key()),
            signing_key,
            created_at: now_ms(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Raw public key, base64url without padding, as the gateway expects it.
    pub fn public_key_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign `payload` and return the signature as base64url.
    pub fn sign(&self, payload: &str) -> String {
        let signature = self.signing_key.sign(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }

    fn to_stored(&self) -> io::Result<StoredIdentity> {
        let private_key = self
            .signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let public_key = self
            .signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(StoredIdentity {
            version: IDENTITY_VERSION,
            device_id: self.device_id.clone(),
            public_key,
            private_key: private_key.to_string(),
            created_at: self.created_at,
        })
    }
}

/// Hex SHA-256 of the raw public key bytes.
pub fn derive_device_id(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// The process-wide identity for `path`.
///
/// Loaded from disk on first use and reused afterwards, so an identity that
/// could not be persisted keeps the same device id until the process exits.
pub fn shared(path: &Path) -> DeviceIdentity {
    let cache = SHARED.get_or_init(Default::default);
    let mut cache = match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    cache
        .entry(path.to_path_buf())
        .or_insert_with(|| load_or_create(path))
        .clone()
}

/// Load the identity at `path`, creating or repairing it as needed.
pub fn load_or_create(path: &Path) -> DeviceIdentity {
    match read_identity(path) {
        Ok(Some((identity, stored_id))) => {
            if stored_id != identity.device_id {
                warn!(
                    "Device id in {} does not match its public key, repairing",
                    path.display()
                );
                persist(path, &identity);
            }
            identity
        }
        Ok(None) => {
            let identity = DeviceIdentity::generate();
            info!(
                "Generated device identity {} at {}",
                identity.device_id,
                path.display()
            );
            persist(path, &identity);
            identity
        }
        Err(e) => {
            warn!(
                "Device identity at {} is unusable ({}), generating a new one",
                path.display(),
                e
            );
            let identity = DeviceIdentity::generate();
            persist(path, &identity);
            identity
        }
    }
}

/// Returns the parsed identity and the device id as stored in the file.
fn read_identity(path: &Path) -> io::Result<Option<(DeviceIdentity, String)>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let stored: StoredIdentity = serde_json::from_str(&raw)?;
    if stored.version != IDENTITY_VERSION {
        return Err(invalid(format!("unsupported version {}", stored.version)));
    }
    let signing_key = SigningKey::from_pkcs8_pem(&stored.private_key)
        .map_err(|e| invalid(format!("private key: {}", e)))?;
    let public_key = VerifyingKey::from_public_key_pem(&stored.public_key)
        .map_err(|e| invalid(format!("public key: {}", e)))?;
    if public_key != signing_key.verifying_key() {
        return Err(invalid("public key does not belong to private key"));
    }
    let identity = DeviceIdentity {
        device_id: derive_device_id(&public_key),
        signing_key,
        created_at: stored.created_at,
    };
    Ok(Some((identity, stored.device_id)))
}

fn persist(path: &Path, identity: &DeviceIdentity) {
    let result = identity
        .to_stored()
        .and_then(|stored| write_private_json(path, &stored));
    if let Err(e) = result {
        warn!(
            "Could not persist device identity to {}: {}; using it in memory only",
            path.display(),
            e
        );
    }
}

/// Write `value` as pretty JSON with owner-only permissions.
fn write_private_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(&body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAuthStore {
    version: u32,
    device_id: String,
    #[serde(default)]
    tokens: BTreeMap<String, StoredDeviceToken>,
}

/// A device token issued by the gateway for one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDeviceToken {
    pub token: String,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub updated_at_ms: u64,
}

/// Path of the device token file that sits next to the identity file.
pub fn device_auth_path(identity_path: &Path) -> PathBuf {
    identity_path
        .parent()
        .map(|dir| dir.join(DEVICE_AUTH_FILE))
        .unwrap_or_else(|| PathBuf::from(DEVICE_AUTH_FILE))
}

fn read_device_auth(identity_path: &Path) -> Option<DeviceAuthStore> {
    let path = device_auth_path(identity_path);
    let raw = fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<DeviceAuthStore>(&raw) {
        Ok(store) if store.version == IDENTITY_VERSION => Some(store),
        Ok(store) => {
            debug!(
                "Ignoring {} with unsupported version {}",
                path.display(),
                store.version
            );
            None
        }
        Err(e) => {
            debug!("Ignoring malformed {}: {}", path.display(), e);
            None
        }
    }
}

/// Look up a stored device token for `role`, issued to `device_id`.
pub fn load_device_auth_token(identity_path: &Path, device_id: &str, role: &str) -> Option<String> {
    let store = read_device_auth(identity_path)?;
    if store.device_id != device_id {
        return None;
    }
    store
        .tokens
        .get(role)
        .map(|entry| entry.token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Remember a device token the gateway issued for `role`.
pub fn store_device_auth_token(
    identity_path: &Path,
    device_id: &str,
    role: &str,
    token: &str,
    scopes: &[String],
) -> io::Result<()> {
    let mut store = match read_device_auth(identity_path) {
        Some(store) if store.device_id == device_id => store,
        _ => DeviceAuthStore {
            version: IDENTITY_VERSION,
            device_id: device_id.to_string(),
            tokens: BTreeMap::new(),
        },
    };
    store.tokens.insert(
        role.to_string(),
        StoredDeviceToken {
            token: token.to_string(),
            role: role.to_string(),
            scopes: scopes.to_vec(),
            updated_at_ms: now_ms(),
        },
    );
    write_private_json(&device_auth_path(identity_path), &store)
}
