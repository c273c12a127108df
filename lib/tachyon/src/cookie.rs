use crate::message::{ConnectionId, CookieId};
use quark::crypto;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

struct CookieKey {
    created_at: Instant,
    secret: u64,
}

/// Listener-side SYN-cookie state: two rotating keyed-hash secrets. Cookies
/// issued under the previous key remain valid for a grace period so peers
/// caught mid-rotation can still complete their handshake.
pub struct CookieJar {
    keys: [Option<CookieKey>; 2],
}

impl CookieJar {
    pub fn new(now: Instant) -> CookieJar {
        let mut jar = CookieJar { keys: [None, None] };
        jar.rotate(now, Duration::MAX);

        jar
    }

    /// Computes the cookie a peer must echo before its connection attempt is
    /// accepted under cookie pressure.
    pub fn issue(
        &mut self,
        connection_id: ConnectionId,
        endpoint: SocketAddr,
        now: Instant,
        expiration_interval: Duration,
    ) -> CookieId {
        self.check_key_expiration(now, expiration_interval);

        let key = self.keys[0].as_ref().expect("primary cookie key must exist");

        cookie_id(key, connection_id, endpoint)
    }

    /// Accepts a cookie minted under either the current or the previous key.
    pub fn verify(
        &mut self,
        cookie: CookieId,
        connection_id: ConnectionId,
        endpoint: SocketAddr,
        now: Instant,
        expiration_interval: Duration,
    ) -> bool {
        self.check_key_expiration(now, expiration_interval);

        self.keys
            .iter()
            .flatten()
            .any(|key| cookie_id(key, connection_id, endpoint) == cookie)
    }

    /// Replaces the primary key once half the expiration interval has
    /// elapsed since its creation.
    fn check_key_expiration(&mut self, now: Instant, expiration_interval: Duration) {
        let created_at = self.keys[0]
            .as_ref()
            .expect("primary cookie key must exist")
            .created_at;

        if now.duration_since(created_at) > expiration_interval / 2 {
            self.rotate(now, expiration_interval);
        }
    }

    fn rotate(&mut self, now: Instant, expiration_interval: Duration) {
        let fresh = CookieKey {
            created_at: now,
            secret: crypto::random_u64(),
        };

        // Old primary becomes secondary, the fresh key becomes primary
        self.keys[1] = std::mem::replace(&mut self.keys[0], Some(fresh));

        // Drop the secondary key once it has outlived the full interval
        if let Some(previous) = &self.keys[1] {
            if now.duration_since(previous.created_at) > expiration_interval {
                self.keys[1] = None;
            }
        }
    }
}

/// Hashes the connection id and endpoint into a cookie id. The input struct
/// is serialized into a zero-initialized fixed-width buffer so padding never
/// varies between calls.
fn cookie_id(key: &CookieKey, connection_id: ConnectionId, endpoint: SocketAddr) -> CookieId {
    let mut input = [0u8; 27];

    input[..8].copy_from_slice(&connection_id.to_be_bytes());

    match endpoint.ip() {
        IpAddr::V4(addr) => {
            input[8] = 4;
            input[9..13].copy_from_slice(&addr.octets());
        }
        IpAddr::V6(addr) => {
            input[8] = 6;
            input[9..25].copy_from_slice(&addr.octets());
        }
    }

    input[25..27].copy_from_slice(&endpoint.port().to_be_bytes());

    crypto::hash64(key.secret, &input)
}
