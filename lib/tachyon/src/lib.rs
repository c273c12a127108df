//! A reliable, authenticated, connection-oriented transport on top of UDP
//! datagrams: per-connection sequencing with selective acknowledgement and
//! retransmission, path-MTU discovery, an AIMD send-window estimator,
//! SYN-cookie flood protection, endpoint migration and a suspend state that
//! tolerates long blackouts.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod access;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod cookie;
pub mod keys;
pub mod listener;
pub mod manager;
pub mod message;
pub mod mtud;
pub mod send_queue;
pub mod socket;
pub mod stats;
pub mod support;
pub mod window;

pub use crate::access::{AccessPolicy, AllowAll, Penalty, Standing};
pub use crate::config::Settings;
pub use crate::connection::{CloseCondition, ConnectionType, Status};
pub use crate::listener::Listener;
pub use crate::manager::ConnectionManager;
pub use crate::message::{ConnectionId, SequenceNumber};
pub use crate::socket::Socket;
pub use crate::support::{ErrorType, NetworkError, NetworkResult};
