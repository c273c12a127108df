use std::net::IpAddr;

/// Severity of a reputation adjustment for a source address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Penalty {
    Minimal,
    Moderate,
    Severe,
}

/// Standing of an address after a reputation adjustment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Standing {
    Acceptable,
    Unacceptable,
}

/// Access-control collaborator supplied by the embedding runtime. All
/// methods may be called concurrently from listener and worker threads;
/// implementations are expected to be internally synchronized and penalty
/// application idempotent with respect to score deltas.
pub trait AccessPolicy: Send + Sync {
    /// Records a connection attempt; returns false when the address has
    /// exceeded its attempt budget.
    fn connection_attempt(&self, _addr: IpAddr) -> bool {
        true
    }

    /// Whether traffic from the address is currently allowed.
    fn is_allowed(&self, _addr: IpAddr) -> bool {
        true
    }

    /// Applies a graded reputation penalty, returning the resulting standing.
    fn penalize(&self, _addr: IpAddr, _penalty: Penalty) -> Standing {
        Standing::Acceptable
    }
}

/// Policy that admits everything; the default when the embedding runtime
/// does not provide one.
pub struct AllowAll;

impl AccessPolicy for AllowAll {}
