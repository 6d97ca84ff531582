//! Signing key store with rotation and grace periods
//!
//! The store holds an immutable [`KeySnapshot`] behind an `Arc`. Readers clone
//! the `Arc` and see a consistent key set for as long as they hold it; writers
//! build a new snapshot and swap it in with a bumped version (copy-on-write).
//!
//! Key lifecycle:
//! 1. `rotate()` / `import_pem()` installs a new key as `Active`
//! 2. The previously active key becomes `Retiring` until `now + grace_period`
//! 3. Once the grace period elapses the key is `Revoked`: excluded from the
//!    JWKS document and from verification lookups
//!
//! Rotations are serialized by a dedicated mutex so two concurrent calls can
//! never leave two keys active.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rcgen::{KeyPair, PKCS_ECDSA_P256_SHA256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};

/// The only signing algorithm issued or accepted.
pub const ALGORITHM: &str = "ES256";

/// Length of a key id (base64url characters of the public key digest).
const KID_LEN: usize = 16;

/// Uncompressed SEC1 point: 0x04 || X (32 bytes) || Y (32 bytes)
const P256_POINT_LEN: usize = 65;

/// Observable status of a key at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Retiring,
    Revoked,
}

/// An ES256 key pair.
///
/// Private material never leaves this crate; callers outside it can only
/// read the key id and the public half.
pub struct SigningKey {
    kid: String,
    private_der: Secret<Vec<u8>>,
    decoding_key: DecodingKey,
    x: String,
    y: String,
    created_at: u64,
}

impl SigningKey {
    fn from_key_pair(key_pair: &KeyPair, created_at: u64) -> Result<Self> {
        let point = key_pair.public_key_raw();
        if point.len() != P256_POINT_LEN || point[0] != 0x04 {
            return Err(Error::KeyGeneration(format!(
                "expected an uncompressed P-256 point, got {} bytes",
                point.len()
            )));
        }

        let x = URL_SAFE_NO_PAD.encode(&point[1..33]);
        let y = URL_SAFE_NO_PAD.encode(&point[33..]);
        let decoding_key = DecodingKey::from_ec_components(&x, &y)
            .map_err(|e| Error::KeyGeneration(format!("invalid public key: {e}")))?;

        let digest = Sha256::digest(&point[1..]);
        let mut kid = URL_SAFE_NO_PAD.encode(digest);
        kid.truncate(KID_LEN);

        Ok(Self {
            kid,
            private_der: Secret::new(key_pair.serialize_der()),
            decoding_key,
            x,
            y,
            created_at,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    /// Creation time, unix milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// The public half as a JWK.
    pub fn public_jwk(&self) -> Jwk {
        Jwk {
            kty: "EC".into(),
            crv: "P-256".into(),
            kid: self.kid.clone(),
            alg: ALGORITHM.into(),
            key_use: "sig".into(),
            x: self.x.clone(),
            y: self.y.clone(),
        }
    }

    pub(crate) fn encoding_key(&self) -> EncodingKey {
        EncodingKey::from_ec_der(self.private_der.expose())
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &ALGORITHM)
            .field("private_der", &self.private_der)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// A public key in JWKS form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub kid: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub x: String,
    pub y: String,
}

/// The published verification key set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Copy)]
enum KeyState {
    Active,
    /// Verification-only until this unix-millisecond deadline
    Retiring { until: u64 },
    Revoked,
}

impl KeyState {
    fn status_at(self, now: u64) -> KeyStatus {
        match self {
            KeyState::Active => KeyStatus::Active,
            KeyState::Retiring { until } if now < until => KeyStatus::Retiring,
            KeyState::Retiring { .. } | KeyState::Revoked => KeyStatus::Revoked,
        }
    }
}

#[derive(Debug, Clone)]
struct KeyEntry {
    key: Arc<SigningKey>,
    state: KeyState,
}

/// Summary of one key for health and admin views.
#[derive(Debug, Clone, Serialize)]
pub struct KeySummary {
    pub kid: String,
    pub status: KeyStatus,
    pub created_at: u64,
    /// When a retiring key stops verifying, unix milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifies_until: Option<u64>,
}

/// An immutable, versioned view of the key set.
#[derive(Debug, Default)]
pub struct KeySnapshot {
    version: u64,
    entries: Vec<KeyEntry>,
}

impl KeySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    fn active(&self) -> Option<&Arc<SigningKey>> {
        self.entries
            .iter()
            .find(|e| matches!(e.state, KeyState::Active))
            .map(|e| &e.key)
    }

    fn verifying(&self, now: u64) -> impl Iterator<Item = &Arc<SigningKey>> {
        self.entries
            .iter()
            .filter(move |e| e.state.status_at(now) != KeyStatus::Revoked)
            .map(|e| &e.key)
    }

    pub fn summaries(&self, now: u64) -> Vec<KeySummary> {
        self.entries
            .iter()
            .map(|e| KeySummary {
                kid: e.key.kid.clone(),
                status: e.state.status_at(now),
                created_at: e.key.created_at,
                verifies_until: match e.state {
                    KeyState::Retiring { until } if now < until => Some(until),
                    _ => None,
                },
            })
            .collect()
    }
}

/// Holds the signing keys and publishes their public halves.
pub struct KeyStore {
    snapshot: RwLock<Arc<KeySnapshot>>,
    rotation: Mutex<()>,
    grace_period: Duration,
    clock: Arc<dyn Clock>,
}

impl KeyStore {
    /// Create an empty store. Issuance fails with `KeyUnavailable` until a
    /// key is rotated in or imported.
    pub fn new(grace_period: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(KeySnapshot::default())),
            rotation: Mutex::new(()),
            grace_period,
            clock,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Current consistent view of the key set.
    pub async fn snapshot(&self) -> Arc<KeySnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn version(&self) -> u64 {
        self.snapshot().await.version
    }

    /// The key new tokens are signed with.
    pub async fn current_signing_key(&self) -> Result<Arc<SigningKey>> {
        self.snapshot()
            .await
            .active()
            .cloned()
            .ok_or(Error::KeyUnavailable)
    }

    /// Public keys that currently verify: the active key plus retiring keys
    /// still inside their grace period.
    pub async fn public_key_set(&self) -> Jwks {
        let now = self.clock.now_millis();
        let snapshot = self.snapshot().await;
        Jwks {
            keys: snapshot.verifying(now).map(|k| k.public_jwk()).collect(),
        }
    }

    /// Look up a key that may verify a token signed at any point up to now.
    pub async fn verification_key(&self, kid: &str) -> Result<Arc<SigningKey>> {
        let now = self.clock.now_millis();
        let snapshot = self.snapshot().await;
        snapshot
            .verifying(now)
            .find(|k| k.kid == kid)
            .cloned()
            .ok_or_else(|| Error::UnknownKey(kid.to_owned()))
    }

    /// Generate a fresh key, make it active, and retire the previous one.
    pub async fn rotate(&self) -> Result<Arc<SigningKey>> {
        let _guard = self.rotation.lock().await;
        let key = self.generate()?;
        Ok(self.install(key).await)
    }

    /// Rotate only if nobody else has changed the key set since `expected_version`.
    ///
    /// Returns `Ok(None)` when another writer got there first, so two
    /// schedulers racing on the same tick produce one rotation, not two.
    pub async fn rotate_from(&self, expected_version: u64) -> Result<Option<Arc<SigningKey>>> {
        let _guard = self.rotation.lock().await;
        let current = self.version().await;
        if current != expected_version {
            debug!(
                expected_version,
                current, "key set changed concurrently, skipping rotation"
            );
            return Ok(None);
        }
        let key = self.generate()?;
        Ok(Some(self.install(key).await))
    }

    /// Install a PKCS#8 PEM P-256 key as the active signing key.
    ///
    /// Used at start-up so a restarted server keeps signing with (and
    /// verifying against) the same key. Importing the key that is already
    /// active is a no-op.
    pub async fn import_pem(&self, pem: &str) -> Result<Arc<SigningKey>> {
        let _guard = self.rotation.lock().await;
        let key_pair = KeyPair::from_pem(pem)
            .map_err(|e| Error::KeyGeneration(format!("invalid signing key PEM: {e}")))?;
        let key = SigningKey::from_key_pair(&key_pair, self.clock.now_millis())?;

        let snapshot = self.snapshot().await;
        if let Some(active) = snapshot.active().filter(|a| a.kid == key.kid) {
            return Ok(active.clone());
        }
        Ok(self.install(key).await)
    }

    /// Revoke a key immediately, skipping any remaining grace period.
    ///
    /// Revoking the active key leaves the store without a signing key until
    /// the next rotation.
    pub async fn revoke(&self, kid: &str) -> Result<()> {
        let _guard = self.rotation.lock().await;
        let mut slot = self.snapshot.write().await;
        if !slot.entries.iter().any(|e| e.key.kid == kid) {
            return Err(Error::UnknownKey(kid.to_owned()));
        }

        let entries = slot
            .entries
            .iter()
            .map(|e| KeyEntry {
                key: e.key.clone(),
                state: if e.key.kid == kid {
                    KeyState::Revoked
                } else {
                    e.state
                },
            })
            .collect();
        *slot = Arc::new(KeySnapshot {
            version: slot.version + 1,
            entries,
        });
        warn!(kid, version = slot.version, "signing key revoked");
        Ok(())
    }

    fn generate(&self) -> Result<SigningKey> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::KeyGeneration(e.to_string()))?;
        SigningKey::from_key_pair(&key_pair, self.clock.now_millis())
    }

    /// Swap in a new snapshot with `key` active. Caller holds the rotation lock.
    async fn install(&self, key: SigningKey) -> Arc<SigningKey> {
        let now = self.clock.now_millis();
        let retire_until = now + self.grace_period.as_millis() as u64;
        let key = Arc::new(key);

        let mut slot = self.snapshot.write().await;
        let mut entries: Vec<KeyEntry> = slot
            .entries
            .iter()
            .map(|e| {
                let state = match e.state {
                    KeyState::Active => KeyState::Retiring {
                        until: retire_until,
                    },
                    state if state.status_at(now) == KeyStatus::Revoked => KeyState::Revoked,
                    state => state,
                };
                KeyEntry {
                    key: e.key.clone(),
                    state,
                }
            })
            .collect();
        entries.push(KeyEntry {
            key: key.clone(),
            state: KeyState::Active,
        });

        let version = slot.version + 1;
        *slot = Arc::new(KeySnapshot { version, entries });
        info!(kid = %key.kid, version, "signing key activated");
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock(grace: Duration) -> (Arc<KeyStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        (Arc::new(KeyStore::new(grace, clock.clone())), clock)
    }

    #[tokio::test]
    async fn empty_store_has_no_signing_key() {
        let (store, _) = store_with_clock(Duration::from_secs(60));
        assert_eq!(
            store.current_signing_key().await.unwrap_err(),
            Error::KeyUnavailable
        );
        assert!(store.public_key_set().await.keys.is_empty());
        assert_eq!(store.version().await, 0);
    }

    #[tokio::test]
    async fn rotate_activates_new_key() {
        let (store, _) = store_with_clock(Duration::from_secs(60));
        let key = store.rotate().await.unwrap();
        assert_eq!(key.kid().len(), KID_LEN);
        assert_eq!(store.current_signing_key().await.unwrap().kid(), key.kid());

        let jwks = store.public_key_set().await;
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(jwks.keys[0].kid, key.kid());
        assert_eq!(jwks.keys[0].alg, "ES256");
        assert_eq!(jwks.keys[0].crv, "P-256");
    }

    #[tokio::test]
    async fn previous_key_verifies_until_grace_elapses() {
        let (store, clock) = store_with_clock(Duration::from_secs(60));
        let old = store.rotate().await.unwrap();
        let new = store.rotate().await.unwrap();
        assert_ne!(old.kid(), new.kid());
        assert_eq!(store.current_signing_key().await.unwrap().kid(), new.kid());

        // Inside the grace period: both keys published, old still verifies
        assert_eq!(store.public_key_set().await.keys.len(), 2);
        assert!(store.verification_key(old.kid()).await.is_ok());

        clock.advance(Duration::from_secs(60));
        assert_eq!(
            store.verification_key(old.kid()).await.unwrap_err(),
            Error::UnknownKey(old.kid().to_owned())
        );
        let jwks = store.public_key_set().await;
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(jwks.keys[0].kid, new.kid());

        let statuses: Vec<KeyStatus> = store
            .snapshot()
            .await
            .summaries(clock.now_millis())
            .into_iter()
            .map(|s| s.status)
            .collect();
        assert_eq!(statuses, vec![KeyStatus::Revoked, KeyStatus::Active]);
    }

    #[tokio::test]
    async fn concurrent_rotations_leave_exactly_one_active_key() {
        let (store, clock) = store_with_clock(Duration::from_secs(3600));

        let mut handles = vec![];
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.rotate().await.unwrap() }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.version(), 8);
        let summaries = snapshot.summaries(clock.now_millis());
        let active = summaries
            .iter()
            .filter(|s| s.status == KeyStatus::Active)
            .count();
        assert_eq!(active, 1, "exactly one key may be active");
        assert_eq!(summaries.len(), 8);
    }

    #[tokio::test]
    async fn rotate_from_skips_when_version_moved() {
        let (store, _) = store_with_clock(Duration::from_secs(60));
        store.rotate().await.unwrap();
        let seen = store.version().await;

        assert!(store.rotate_from(seen).await.unwrap().is_some());
        // Second scheduler still holding the old version loses the race
        assert!(store.rotate_from(seen).await.unwrap().is_none());
        assert_eq!(store.version().await, seen + 1);
    }

    #[tokio::test]
    async fn revoke_removes_key_immediately() {
        let (store, _) = store_with_clock(Duration::from_secs(3600));
        let old = store.rotate().await.unwrap();
        let new = store.rotate().await.unwrap();

        store.revoke(old.kid()).await.unwrap();
        assert!(matches!(
            store.verification_key(old.kid()).await,
            Err(Error::UnknownKey(_))
        ));

        store.revoke(new.kid()).await.unwrap();
        assert_eq!(
            store.current_signing_key().await.unwrap_err(),
            Error::KeyUnavailable
        );
        assert!(matches!(
            store.revoke("nope").await,
            Err(Error::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn import_pem_keeps_kid_stable() {
        let pem = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .unwrap()
            .serialize_pem();

        let (first, _) = store_with_clock(Duration::from_secs(60));
        let (second, _) = store_with_clock(Duration::from_secs(60));
        let a = first.import_pem(&pem).await.unwrap();
        let b = second.import_pem(&pem).await.unwrap();
        assert_eq!(a.kid(), b.kid());

        // Re-importing the active key doesn't rotate
        first.import_pem(&pem).await.unwrap();
        assert_eq!(first.version().await, 1);

        assert!(matches!(
            first.import_pem("not a pem").await,
            Err(Error::KeyGeneration(_))
        ));
    }

    #[tokio::test]
    async fn debug_output_redacts_private_material() {
        let (store, _) = store_with_clock(Duration::from_secs(60));
        let key = store.rotate().await.unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains(key.kid()));
    }
}
