use quark::crypto;
use std::time::{Duration, Instant};

/// How long an expired key remains usable for decryption after rotation, so
/// datagrams encoded under the old key still decode while in flight.
const KEY_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// A derived symmetric key block: the first half obfuscates datagrams, the
/// second half keys the MAC. An expired key is read-only; it may still
/// decrypt but never encrypts new messages.
#[derive(Clone)]
pub struct SymmetricKey {
    data: [u8; crypto::KEY_BLOCK_LEN],
    expired_at: Option<Instant>,
}

impl SymmetricKey {
    /// Derives a key from the supplied shared secret; an empty secret
    /// selects the built-in default block.
    #[inline]
    pub fn from_secret(secret: &[u8]) -> SymmetricKey {
        SymmetricKey {
            data: crypto::derive_key_block(secret),
            expired_at: None,
        }
    }

    #[inline]
    pub fn from_block(data: [u8; crypto::KEY_BLOCK_LEN]) -> SymmetricKey {
        SymmetricKey { data, expired_at: None }
    }

    /// Obfuscation half of the key block.
    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.data[..crypto::KEY_LEN]
    }

    /// MAC half of the key block.
    #[inline]
    pub fn auth_key(&self) -> &[u8] {
        &self.data[crypto::KEY_LEN..]
    }

    #[inline]
    pub fn expire(&mut self, now: Instant) {
        if self.expired_at.is_none() {
            self.expired_at = Some(now);
        }
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expired_at.is_some()
    }

    #[inline]
    fn is_evictable(&self, now: Instant) -> bool {
        match self.expired_at {
            Some(at) => now.duration_since(at) >= KEY_GRACE_PERIOD,
            None => false,
        }
    }
}

/// The two key slots of a connection: the current key and, for a grace
/// period after rotation, the prior key. At most one slot is non-expired.
pub struct KeySlots {
    current: SymmetricKey,
    previous: Option<SymmetricKey>,
}

impl KeySlots {
    #[inline]
    pub fn new(secret: &[u8]) -> KeySlots {
        KeySlots {
            current: SymmetricKey::from_secret(secret),
            previous: None,
        }
    }

    /// The key used to encrypt new outgoing messages.
    #[inline]
    pub fn current(&self) -> &SymmetricKey {
        &self.current
    }

    /// The prior key, still valid for decryption until evicted.
    #[inline]
    pub fn previous(&self) -> Option<&SymmetricKey> {
        self.previous.as_ref()
    }

    /// Installs a freshly derived key. The old current key is expired and
    /// retained in the second slot for the grace period.
    pub fn install(&mut self, key: SymmetricKey, now: Instant) {
        let mut old = std::mem::replace(&mut self.current, key);
        old.expire(now);
        self.previous = Some(old);
    }

    /// Drops the prior key once its grace period has passed.
    pub fn prune(&mut self, now: Instant) {
        if let Some(previous) = &self.previous {
            if previous.is_evictable(now) {
                self.previous = None;
            }
        }
    }
}
