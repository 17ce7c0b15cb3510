//! Key storage
//!
//! The `KeyChain` holds three tables of symmetric key material:
//!
//! - the static table, indexed by the key slot a server names in its session
//!   offer, loaded once at startup and read-only afterwards;
//! - the client table, the same slots as seen by a client patched to seal its
//!   session accept under proxy-owned keys (optional, read-only);
//! - the session table, indexed by session id, seeded from disk and extended
//!   as handshakes complete.
//!
//! Session bindings are write-once: the first material bound to an id wins and
//! later binds for the same id are no-ops. Nothing in here knows about ciphers.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use log::{debug, info};

use crate::common::{read_to_string, ProxyError, Result};

/// File in the keys directory holding the static key table
pub const STATIC_KEYS_FILE: &str = "static_keys.json";

/// File in the keys directory holding the initial session keys
pub const SESSION_KEYS_FILE: &str = "session_keys.json";

/// Optional file in the keys directory holding the client-facing keys
pub const CLIENT_KEYS_FILE: &str = "client_keys.json";

/// Length of a static AES-128 key
pub const STATIC_KEY_LEN: usize = 16;

/// Length of session material: AES-128 key followed by a 16-byte nonce
pub const SESSION_KEY_LEN: usize = 32;

/// Identifier of a static key (the key slot of a session offer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub u8);

/// Identifier of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u16);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for KeyId {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u8>()
            .map(KeyId)
            .map_err(|e| ProxyError::InvalidKey(format!("bad static key id '{}': {}", s, e)))
    }
}

impl FromStr for SessionId {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u16>()
            .map(SessionId)
            .map_err(|e| ProxyError::InvalidKey(format!("bad session id '{}': {}", s, e)))
    }
}

/// Opaque symmetric key bytes
///
/// Cheap to clone. The `Debug` output never shows the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Bytes);

impl KeyMaterial {
    /// Wrap raw key bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Decode base64 key bytes
    pub fn from_base64(encoded: &str) -> Result<Self> {
        STANDARD
            .decode(encoded.trim())
            .map(Self::new)
            .map_err(|e| ProxyError::InvalidKey(format!("invalid base64: {}", e)))
    }

    /// The raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of key bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the material is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// FNV-1a hash of the key bytes, as carried in a session accept
    pub fn key_hash(&self) -> u32 {
        fnv_1a(&self.0)
    }
}

fn fnv_1a(data: &[u8]) -> u32 {
    data.iter().fold(0x811C_9DC5, |state: u32, b| {
        (state ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial(<{} bytes>)", self.0.len())
    }
}

/// Store of static and per-session key material
pub struct KeyChain {
    static_keys: HashMap<KeyId, KeyMaterial>,
    client_keys: HashMap<KeyId, KeyMaterial>,
    session_keys: Mutex<HashMap<SessionId, KeyMaterial>>,
}

impl KeyChain {
    /// Create a key chain from already-decoded tables
    ///
    /// # Parameters
    ///
    /// * `static_keys` - Static key table, read-only from now on
    /// * `session_seed` - Initial session bindings
    pub fn new(
        static_keys: HashMap<KeyId, KeyMaterial>,
        session_seed: HashMap<SessionId, KeyMaterial>,
    ) -> Self {
        Self {
            static_keys,
            client_keys: HashMap::new(),
            session_keys: Mutex::new(session_seed),
        }
    }

    /// Add the keys a patched client seals its session accept with
    ///
    /// A slot with a client key has its accept opened with that key and
    /// resealed under the static key before it reaches the server.
    pub fn with_client_keys(mut self, client_keys: HashMap<KeyId, KeyMaterial>) -> Self {
        self.client_keys = client_keys;
        self
    }

    /// Load the key tables from a keys directory
    ///
    /// Reads `static_keys.json`, `session_keys.json` and, if present,
    /// `client_keys.json`. Each maps a decimal id to base64 key bytes. Static
    /// and client keys must be 16 bytes and session keys 32 bytes.
    ///
    /// # Errors
    ///
    /// Fails if a required file is missing, or if any file is not a JSON
    /// object of strings or holds an id or key of the wrong shape.
    pub fn load(dir: &Path) -> Result<Self> {
        let static_path = dir.join(STATIC_KEYS_FILE);
        let session_path = dir.join(SESSION_KEYS_FILE);
        let client_path = dir.join(CLIENT_KEYS_FILE);

        let static_keys: HashMap<KeyId, KeyMaterial> =
            load_table(&static_path, STATIC_KEY_LEN)?;
        let session_seed: HashMap<SessionId, KeyMaterial> =
            load_table(&session_path, SESSION_KEY_LEN)?;
        let client_keys: HashMap<KeyId, KeyMaterial> = if client_path.exists() {
            load_table(&client_path, STATIC_KEY_LEN)?
        } else {
            HashMap::new()
        };

        info!(
            "Loaded {} static keys, {} client keys and {} session keys from {}",
            static_keys.len(),
            client_keys.len(),
            session_seed.len(),
            dir.display()
        );

        Ok(Self::new(static_keys, session_seed).with_client_keys(client_keys))
    }

    /// Look up a static key
    ///
    /// # Errors
    ///
    /// `ProxyError::KeyNotFound` if the slot is not in the table.
    pub fn lookup_static(&self, id: KeyId) -> Result<KeyMaterial> {
        self.static_keys
            .get(&id)
            .cloned()
            .ok_or_else(|| ProxyError::KeyNotFound { table: "static", id: id.to_string() })
    }

    /// Look up the client-facing key of a slot
    ///
    /// # Errors
    ///
    /// `ProxyError::KeyNotFound` if the slot has no client key.
    pub fn lookup_client(&self, id: KeyId) -> Result<KeyMaterial> {
        self.client_keys
            .get(&id)
            .cloned()
            .ok_or_else(|| ProxyError::KeyNotFound { table: "client", id: id.to_string() })
    }

    /// Look up the material bound to a session
    ///
    /// # Errors
    ///
    /// `ProxyError::KeyNotFound` if nothing has been bound for the session yet.
    pub fn lookup_session(&self, id: SessionId) -> Result<KeyMaterial> {
        self.sessions()
            .get(&id)
            .cloned()
            .ok_or_else(|| ProxyError::KeyNotFound { table: "session", id: id.to_string() })
    }

    /// Bind material to a session unless one is already bound
    ///
    /// Returns whichever material is bound once the call completes, so the
    /// caller can derive state from the winning binding.
    pub fn bind_session(&self, id: SessionId, material: KeyMaterial) -> KeyMaterial {
        let mut sessions = self.sessions();
        let bound = sessions.entry(id).or_insert_with(|| {
            debug!("Bound session key for session {}", id);
            material
        });
        bound.clone()
    }

    /// Number of static keys
    pub fn static_len(&self) -> usize {
        self.static_keys.len()
    }

    /// Number of client keys
    pub fn client_len(&self) -> usize {
        self.client_keys.len()
    }

    /// Number of bound sessions
    pub fn session_len(&self) -> usize {
        self.sessions().len()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, KeyMaterial>> {
        // The table stays consistent even if a holder panicked
        self.session_keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for KeyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyChain")
            .field("static_keys", &self.static_keys.len())
            .field("client_keys", &self.client_keys.len())
            .field("session_keys", &self.session_len())
            .finish()
    }
}

/// Read one `{ "<id>": "<base64>" }` table
fn load_table<K>(path: &Path, expected_len: usize) -> Result<HashMap<K, KeyMaterial>>
where
    K: FromStr<Err = ProxyError> + Eq + std::hash::Hash,
{
    let contents = read_to_string(path)?;
    let raw: HashMap<String, String> = serde_json::from_str(&contents).map_err(|e| {
        ProxyError::InvalidKey(format!("malformed key file {}: {}", path.display(), e))
    })?;

    let mut table = HashMap::with_capacity(raw.len());
    for (id, encoded) in raw {
        let key = id.parse::<K>()?;
        let material = KeyMaterial::from_base64(&encoded)?;
        if material.len() != expected_len {
            return Err(ProxyError::InvalidKey(format!(
                "key '{}' in {} is {} bytes, expected {}",
                id,
                path.display(),
                material.len(),
                expected_len
            )));
        }
        table.insert(key, material);
    }

    Ok(table)
}
