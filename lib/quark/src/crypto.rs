use rand::rngs::OsRng;
use rand::RngCore;
use siphasher::sip::SipHasher13;
use siphasher::sip128::{Hasher128, SipHasher24};
use std::hash::Hasher;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Length of one symmetric key half (obfuscation or MAC).
pub const KEY_LEN: usize = 8;
/// Length of a full derived key block (obfuscation key followed by MAC key).
pub const KEY_BLOCK_LEN: usize = KEY_LEN * 2;
/// Length of the public half of an ephemeral key exchange.
pub const EXCHANGE_PUBLIC_LEN: usize = 32;

/// Key block substituted when no shared secret has been configured. Provides
/// basic obfuscation and MAC checks but won't fool a determined traffic
/// analyzer.
const DEFAULT_KEY_BLOCK: [u8; KEY_BLOCK_LEN] = [
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
];

/// Derives a key block from the supplied shared secret using a keyed 128-bit
/// SipHash. An empty secret yields the hard-coded default block.
#[inline]
pub fn derive_key_block(secret: &[u8]) -> [u8; KEY_BLOCK_LEN] {
    if secret.is_empty() {
        return DEFAULT_KEY_BLOCK;
    }

    let (k0, k1) = split_key(&DEFAULT_KEY_BLOCK);
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(secret);
    hasher.finish128().as_bytes()
}

/// Computes the 32-bit keyed MAC used to authenticate datagrams. The 8-byte
/// key is used for both SipHash key halves; the 64-bit output is truncated.
#[inline]
pub fn mac32(key: &[u8], data: &[u8]) -> u32 {
    assert_eq!(key.len(), KEY_LEN);

    let k = read_u64_le(key);
    let mut hasher = SipHasher13::new_with_keys(k, k);
    hasher.write(data);
    hasher.finish() as u32
}

/// Computes a 64-bit keyed hash, used for stateless cookie ids.
#[inline]
pub fn hash64(key: u64, data: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(key, key);
    hasher.write(data);
    hasher.finish()
}

/// Fills the provided buffer with random bytes from the OS generator.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

#[inline]
pub fn random_u64() -> u64 {
    OsRng.next_u64()
}

#[inline]
fn split_key(block: &[u8; KEY_BLOCK_LEN]) -> (u64, u64) {
    (read_u64_le(&block[..KEY_LEN]), read_u64_le(&block[KEY_LEN..]))
}

#[inline]
fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

/// One half of an ephemeral Diffie-Hellman exchange. The public key travels
/// inside the handshake; once the peer's public key is known the exchange is
/// consumed to derive a post-handshake key block.
pub struct KeyExchange {
    secret: Option<EphemeralSecret>,
    public: PublicKey,
    peer_public: Option<PublicKey>,
}

impl KeyExchange {
    pub fn new() -> KeyExchange {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        KeyExchange {
            secret: Some(secret),
            public,
            peer_public: None,
        }
    }

    /// The local handshake data to be sent to the peer.
    #[inline]
    pub fn handshake_data(&self) -> &[u8] {
        self.public.as_bytes()
    }

    /// Installs the peer's handshake data. Fails if the data is not a valid
    /// public key encoding.
    pub fn set_peer_data(&mut self, data: &[u8]) -> bool {
        if data.len() != EXCHANGE_PUBLIC_LEN {
            return false;
        }

        let mut raw = [0u8; EXCHANGE_PUBLIC_LEN];
        raw.copy_from_slice(data);
        self.peer_public = Some(PublicKey::from(raw));

        true
    }

    #[inline]
    pub fn has_peer_data(&self) -> bool {
        self.peer_public.is_some()
    }

    /// Derives the post-handshake key block from the exchanged material and
    /// the shared secret. Consumes the ephemeral secret; returns `None` when
    /// the peer's handshake data has not been installed.
    pub fn derive(mut self, shared_secret: &[u8]) -> Option<[u8; KEY_BLOCK_LEN]> {
        let secret = self.secret.take()?;
        let peer_public = self.peer_public.take()?;

        let dh = secret.diffie_hellman(&peer_public);

        let mut input = Vec::with_capacity(dh.as_bytes().len() + shared_secret.len());
        input.extend_from_slice(dh.as_bytes());
        input.extend_from_slice(shared_secret);

        Some(derive_key_block(&input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_empty_secret_uses_default_block() {
        assert_eq!(derive_key_block(&[]), DEFAULT_KEY_BLOCK);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let a = derive_key_block(b"correct horse battery staple");
        let b = derive_key_block(b"correct horse battery staple");
        let c = derive_key_block(b"correct horse battery stapl3");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, DEFAULT_KEY_BLOCK);
    }

    #[test]
    fn test_mac_depends_on_key_and_data() {
        let key_a = [1u8; KEY_LEN];
        let key_b = [2u8; KEY_LEN];

        assert_eq!(mac32(&key_a, b"payload"), mac32(&key_a, b"payload"));
        assert_ne!(mac32(&key_a, b"payload"), mac32(&key_b, b"payload"));
        assert_ne!(mac32(&key_a, b"payload"), mac32(&key_a, b"payloae"));
    }

    #[test]
    fn test_exchange_both_sides_derive_same_block() {
        let mut alice = KeyExchange::new();
        let mut bob = KeyExchange::new();

        let alice_data = alice.handshake_data().to_vec();
        let bob_data = bob.handshake_data().to_vec();

        assert!(alice.set_peer_data(&bob_data));
        assert!(bob.set_peer_data(&alice_data));

        let a = alice.derive(b"secret").unwrap();
        let b = bob.derive(b"secret").unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn test_exchange_rejects_short_peer_data() {
        let mut exchange = KeyExchange::new();

        assert!(!exchange.set_peer_data(&[0u8; 16]));
        assert!(!exchange.has_peer_data());
    }

    #[test]
    fn test_exchange_without_peer_data_yields_nothing() {
        let exchange = KeyExchange::new();

        assert!(exchange.derive(b"secret").is_none());
    }
}
