use crate::access::{AccessPolicy, Penalty, Standing};
use crate::config::Settings;
use crate::keys::{KeySlots, SymmetricKey};
use crate::listener::{ListenerSendQueue, SendQueueItem};
use crate::manager::HandshakeGuard;
use crate::message::{
    Message, MessageType, Payload, SequenceNumber, StatePayload, SynPayload, PROTOCOL_VERSION_MAJOR,
    PROTOCOL_VERSION_MINOR,
};
use crate::message::{AckRange, ConnectionId};
use crate::mtud::{self, MtuDiscovery, MtudStatus, ProbeTransport};
use crate::send_queue::{
    Item, SendQueue, Transmit, MAX_RECEIVE_WINDOW_BYTES, MAX_RECEIVE_WINDOW_ITEMS,
    MIN_RECEIVE_WINDOW_ITEMS,
};
use crate::socket::SharedConnectionData;
use crate::support::{bind_udp_socket, NetworkResult, SendStatus};
use crate::window::{self, ReceiveWindow};
use hashbrown::HashMap;
use mio::net::UdpSocket;
use quark::crypto::{self, KeyExchange};
use quark::logging::{debug, error, o, trace, warn, Logger};
use rand::Rng;
use std::collections::BinaryHeap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Slack added on top of the suspend timeout before a quiet connection is
/// actually suspended.
const SUSPEND_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Largest datagram the receive path must accommodate.
const MAX_DATAGRAM_SIZE: usize = 65535;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionType {
    Inbound,
    Outbound,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Open,
    Handshake,
    Connected,
    Suspended,
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseCondition {
    GeneralFailure,
    TimedOut,
    ReceiveError,
    SendError,
    UnknownMessage,
    LocalCloseRequest,
    PeerCloseRequest,
    PeerNotAllowed,
}

/// The last in-order received sequence number together with whether an ack
/// covering it has been put on the wire.
struct InOrderTracker {
    seqnum: SequenceNumber,
    acked: bool,
}

impl InOrderTracker {
    fn new(seqnum: SequenceNumber) -> InOrderTracker {
        InOrderTracker { seqnum, acked: false }
    }

    #[inline]
    fn seqnum(&self) -> SequenceNumber {
        self.seqnum
    }

    #[inline]
    fn set(&mut self, seqnum: SequenceNumber) {
        self.seqnum = seqnum;
        self.acked = false;
    }

    #[inline]
    fn mark_acked(&mut self) {
        self.acked = true;
    }

    #[inline]
    fn reset_acked(&mut self) {
        self.acked = false;
    }

    #[inline]
    fn is_acked(&self) -> bool {
        self.acked
    }
}

/// A message scheduled for later transmission; used by decoy traffic.
struct DelayedSend {
    scheduled_at: Instant,
    message_type: MessageType,
    seqnum: Option<SequenceNumber>,
    endpoint: Option<SocketAddr>,
    data: Vec<u8>,
}

impl PartialEq for DelayedSend {
    fn eq(&self, other: &Self) -> bool {
        self.scheduled_at == other.scheduled_at
    }
}

impl Eq for DelayedSend {}

impl PartialOrd for DelayedSend {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedSend {
    // Reversed so the earliest schedule sits on top of the max-heap
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.scheduled_at.cmp(&self.scheduled_at)
    }
}

/// The transmission half of a connection: the bound socket, the pinned peer
/// endpoint and, while an inbound handshake runs, the listener's shared
/// send queue so replies leave from the port the peer first contacted.
pub(crate) struct Channel {
    conn_type: ConnectionType,
    socket: UdpSocket,
    is_v4: bool,
    peer_endpoint: SocketAddr,
    original_peer_endpoint: SocketAddr,
    listener_queue: Option<Arc<ListenerSendQueue>>,
    last_send_time: Instant,
}

impl Channel {
    fn route_via_listener(&self, message_type: MessageType) -> bool {
        // Syn replies and handshake-phase decoys must come from the
        // listener's port, or a peer behind NAT will never see them. The
        // queue reference is dropped the moment the handshake completes.
        self.listener_queue.is_some()
            && self.conn_type == ConnectionType::Inbound
            && matches!(message_type, MessageType::Syn | MessageType::Null)
    }

    fn transmit_to(
        &mut self,
        endpoint: SocketAddr,
        message_type: MessageType,
        data: &[u8],
        now: Instant,
    ) -> NetworkResult<SendStatus> {
        self.last_send_time = now;

        if self.route_via_listener(message_type) {
            let queue = self.listener_queue.as_ref().expect("listener queue checked above");

            queue
                .lock()
                .expect("listener send queue lock poisoned")
                .push_back(SendQueueItem {
                    endpoint,
                    data: data.to_vec(),
                });

            return Ok(SendStatus::Sent);
        }

        send_datagram(&self.socket, endpoint, data)
    }

    fn set_dont_fragment(&mut self, enabled: bool) -> bool {
        set_dont_fragment(&self.socket, self.is_v4, enabled)
    }
}

impl Transmit for Channel {
    fn transmit(&mut self, message_type: MessageType, data: &[u8], now: Instant) -> NetworkResult<SendStatus> {
        let endpoint = self.peer_endpoint;

        self.transmit_to(endpoint, message_type, data, now)
    }
}

/// Adapter handing the channel and the current key to MTU discovery.
struct Probe<'a> {
    channel: &'a mut Channel,
    key: &'a SymmetricKey,
}

impl ProbeTransport for Probe<'_> {
    fn current_key(&self) -> &SymmetricKey {
        self.key
    }

    fn send(&mut self, data: &[u8], now: Instant) -> NetworkResult<SendStatus> {
        let endpoint = self.channel.peer_endpoint;

        self.channel.transmit_to(endpoint, MessageType::Mtud, data, now)
    }

    fn set_dont_fragment(&mut self, enabled: bool) -> bool {
        self.channel.set_dont_fragment(enabled)
    }
}

fn send_datagram(socket: &UdpSocket, endpoint: SocketAddr, data: &[u8]) -> NetworkResult<SendStatus> {
    match socket.send_to(data, endpoint) {
        Ok(_) => Ok(SendStatus::Sent),
        Err(err) => classify_send_error(err),
    }
}

fn classify_send_error(err: io::Error) -> NetworkResult<SendStatus> {
    if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(SendStatus::Deferred);
    }

    #[cfg(unix)]
    match err.raw_os_error() {
        Some(libc::EMSGSIZE) => return Ok(SendStatus::TooLarge),
        // The peer may be temporarily offline while changing address or
        // network; keep retrying until it reappears with a new endpoint.
        // Left alone the liveness timer will eventually suspend us.
        Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) => return Ok(SendStatus::Deferred),
        _ => {}
    }

    Err(err.into())
}

#[cfg(target_os = "linux")]
fn set_dont_fragment(socket: &UdpSocket, is_v4: bool, enabled: bool) -> bool {
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();

    let (level, option, value): (libc::c_int, libc::c_int, libc::c_int) = if is_v4 {
        (
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            if enabled { libc::IP_PMTUDISC_DO } else { libc::IP_PMTUDISC_WANT },
        )
    } else {
        (
            libc::IPPROTO_IPV6,
            libc::IPV6_MTU_DISCOVER,
            if enabled { libc::IPV6_PMTUDISC_DO } else { libc::IPV6_PMTUDISC_WANT },
        )
    };

    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    result == 0
}

#[cfg(not(target_os = "linux"))]
fn set_dont_fragment(_socket: &UdpSocket, _is_v4: bool, _enabled: bool) -> bool {
    true
}

/// Per-connection protocol engine. Owned by exactly one worker thread; the
/// only state shared with other threads is the `ConnectionData` handoff.
pub struct Connection {
    log: Logger,
    settings: Arc<Settings>,
    access: Arc<dyn AccessPolicy>,

    id: ConnectionId,
    status: Status,
    close_condition: Option<CloseCondition>,

    channel: Channel,
    keys: KeySlots,
    key_exchange: Option<KeyExchange>,
    shared_secret: Option<Vec<u8>>,

    connection_data: SharedConnectionData,

    mtu_discovery: Option<MtuDiscovery>,
    send_queue: SendQueue,

    last_in_order_received: InOrderTracker,
    receive_window_size: usize,
    receive_queue: HashMap<SequenceNumber, Message>,
    pending_acks: Vec<SequenceNumber>,

    delayed_sends: BinaryHeap<DelayedSend>,
    recv_buf: Vec<u8>,

    last_receive_time: Instant,
    last_status_change: Instant,
    keepalive_timeout: Duration,

    handshake_guard: Option<HandshakeGuard>,
}

impl Connection {
    /// Creates a connection and binds its socket. Inbound connections carry
    /// the peer's handshake data from the accepted SYN; `seqnum` seeds the
    /// last in-order received sequence number.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log: &Logger,
        settings: Arc<Settings>,
        access: Arc<dyn AccessPolicy>,
        connection_data: SharedConnectionData,
        conn_type: ConnectionType,
        id: ConnectionId,
        seqnum: SequenceNumber,
        peer_handshake_data: Option<&[u8]>,
        shared_secret: Option<Vec<u8>>,
        handshake_guard: Option<HandshakeGuard>,
        is_v4: bool,
        now: Instant,
    ) -> NetworkResult<Connection> {
        let log = log.new(o!("connection_id" => id));

        let bind_addr: SocketAddr = if is_v4 {
            "0.0.0.0:0".parse().expect("valid any address")
        } else {
            "[::]:0".parse().expect("valid any address")
        };
        let socket = bind_udp_socket(bind_addr, settings.nat_traversal)?;
        let local_endpoint = socket.local_addr()?;

        let effective_secret = shared_secret
            .as_deref()
            .unwrap_or(&settings.global_shared_secret)
            .to_vec();

        let mut key_exchange = KeyExchange::new();
        if let Some(data) = peer_handshake_data {
            if !key_exchange.set_peer_data(data) {
                return Err(crate::support::NetworkError::Fatal(crate::support::ErrorType::Crypto));
            }
        }

        connection_data
            .write()
            .expect("connection data lock poisoned")
            .set_local_endpoint(local_endpoint);

        let unspecified: SocketAddr = if is_v4 {
            "0.0.0.0:0".parse().expect("valid any address")
        } else {
            "[::]:0".parse().expect("valid any address")
        };

        let mut connection = Connection {
            log: log.clone(),
            settings,
            access,
            id,
            status: Status::Open,
            close_condition: None,
            channel: Channel {
                conn_type,
                socket,
                is_v4,
                peer_endpoint: unspecified,
                original_peer_endpoint: unspecified,
                listener_queue: None,
                last_send_time: now,
            },
            keys: KeySlots::new(&effective_secret),
            key_exchange: Some(key_exchange),
            shared_secret,
            connection_data,
            mtu_discovery: None,
            send_queue: SendQueue::new(log, now),
            last_in_order_received: InOrderTracker::new(seqnum),
            receive_window_size: MIN_RECEIVE_WINDOW_ITEMS,
            receive_queue: HashMap::new(),
            pending_acks: Vec::new(),
            delayed_sends: BinaryHeap::new(),
            recv_buf: vec![0; MAX_DATAGRAM_SIZE],
            last_receive_time: now,
            last_status_change: now,
            keepalive_timeout: Duration::ZERO,
            handshake_guard,
        };

        connection.reset_mtu(now);

        Ok(connection)
    }

    /// A fresh uniformly random connection identifier.
    pub fn make_connection_id() -> ConnectionId {
        crypto::random_u64()
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn conn_type(&self) -> ConnectionType {
        self.channel.conn_type
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn peer_endpoint(&self) -> SocketAddr {
        self.channel.peer_endpoint
    }

    #[inline]
    pub fn should_close(&self) -> bool {
        self.close_condition.is_some()
    }

    pub(crate) fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> NetworkResult<()> {
        registry
            .register(&mut self.channel.socket, token, mio::Interest::READABLE)
            .map_err(Into::into)
    }

    pub(crate) fn deregister(&mut self, registry: &mio::Registry) -> NetworkResult<()> {
        registry.deregister(&mut self.channel.socket).map_err(Into::into)
    }

    /// Tears the connection down, emitting a reset unless the close was
    /// requested by the peer or the local socket already asked for one.
    pub fn close(&mut self, now: Instant) {
        if self.status == Status::Closed {
            return;
        }

        let close_requested = self
            .connection_data
            .read()
            .expect("connection data lock poisoned")
            .has_close_request();

        if !close_requested {
            self.send_immediate_reset(now);
        }

        let _ = self.set_status(Status::Closed, now);
    }

    /// A local interface change invalidates the discovered path MTU; start
    /// over and nudge the peer so it can pick up the new endpoint.
    pub fn on_local_interface_changed(&mut self, now: Instant) {
        self.reset_mtu(now);

        let _ = self.send_keepalive(now);
    }

    /// One scheduling tick: drains socket requests, receives and dispatches
    /// datagrams, runs retransmission, MTU discovery and the liveness
    /// machinery, and flushes pending acknowledgements.
    pub fn process_events(&mut self, now: Instant) {
        self.keys.prune(now);

        self.process_socket_events(now);

        if self.should_close() {
            return;
        }

        if !self.send_delayed_items(now) {
            self.set_close_condition(CloseCondition::SendError);
        }

        if !self.receive_to_queue(now) {
            self.set_close_condition(CloseCondition::ReceiveError);
        }

        let max_keepalive_timeout = self.settings.suspend_timeout + SUSPEND_TIMEOUT_MARGIN;

        match self.status {
            Status::Handshake => {
                if now.duration_since(self.last_status_change) >= self.settings.connect_timeout {
                    debug!(self.log, "handshake timed out");

                    self.set_close_condition(CloseCondition::TimedOut);

                    // Possibly a slowloris-style attack; cap how often one
                    // address can make us wait out the full timeout
                    self.update_reputation(self.channel.peer_endpoint, Penalty::Minimal);
                }

                let rto = Some(self.settings.connect_retransmission_timeout);
                if self.send_queue.process(now, rto, &mut self.channel).is_err() {
                    self.set_close_condition(CloseCondition::SendError);
                }
            }
            Status::Connected => {
                if self.send_queue.process(now, None, &mut self.channel).is_err() {
                    self.set_close_condition(CloseCondition::SendError);
                }

                if !self.check_keepalive(now) || !self.process_mtu_discovery(now) {
                    self.set_close_condition(CloseCondition::GeneralFailure);
                }

                if !self.receive_pending_socket_data() {
                    self.set_close_condition(CloseCondition::ReceiveError);
                }

                if !self.send_pending_socket_data(now) {
                    self.set_close_condition(CloseCondition::SendError);
                }

                if now.duration_since(self.last_receive_time) >= max_keepalive_timeout && !self.suspend(now) {
                    self.set_close_condition(CloseCondition::GeneralFailure);
                }
            }
            Status::Suspended => {
                let suspended_at = self.last_receive_time + max_keepalive_timeout;
                if now.duration_since(suspended_at) >= self.settings.max_suspend_duration {
                    debug!(self.log, "suspend duration timed out");

                    self.set_close_condition(CloseCondition::TimedOut);
                } else if !self.check_keepalive(now) {
                    // Keep probing so contact can be reestablished
                    self.set_close_condition(CloseCondition::GeneralFailure);
                }
            }
            Status::Open | Status::Closed => {}
        }

        if !self.send_pending_acks(now) {
            self.set_close_condition(CloseCondition::SendError);
        }
    }

    fn process_socket_events(&mut self, now: Instant) {
        let (connect_request, close_request, requested_endpoint, listener_queue) = {
            let data = self.connection_data.read().expect("connection data lock poisoned");

            (
                self.status == Status::Open && data.has_connect_request(),
                data.has_close_request(),
                data.peer_endpoint(),
                data.listener_send_queue(),
            )
        };

        if connect_request {
            let success = match requested_endpoint {
                Some(endpoint) => {
                    self.channel.original_peer_endpoint = endpoint;
                    self.channel.peer_endpoint = endpoint;
                    self.channel.listener_queue = listener_queue;

                    if self.settings.max_num_decoy_messages > 0 && rand::thread_rng().gen::<bool>() {
                        self.send_decoy_messages(now);
                    }

                    let sent = match self.channel.conn_type {
                        ConnectionType::Inbound => self.send_inbound_syn(now),
                        ConnectionType::Outbound => self.send_outbound_syn(None, now),
                    };

                    sent && self.set_status(Status::Handshake, now)
                }
                None => false,
            };

            if !success {
                self.set_close_condition(CloseCondition::GeneralFailure);
            }
        }

        if close_request {
            self.send_immediate_reset(now);

            self.set_close_condition(CloseCondition::LocalCloseRequest);
        }
    }

    fn set_status(&mut self, status: Status, now: Instant) -> bool {
        let allowed = match status {
            Status::Open => false,
            Status::Handshake => self.status == Status::Open,
            Status::Connected => matches!(self.status, Status::Handshake | Status::Suspended),
            Status::Suspended => self.status == Status::Connected,
            Status::Closed => self.status != Status::Closed,
        };

        let mut success = allowed;

        if allowed {
            let old_status = std::mem::replace(&mut self.status, status);
            self.last_status_change = now;

            success = self.on_status_change(old_status, status, now);
        }

        if !success {
            // A refused transition is a protocol violation; get rid of the
            // connection as soon as possible
            error!(self.log, "failed to change connection status"; "status" => ?status);
            self.set_close_condition(CloseCondition::GeneralFailure);
        }

        success
    }

    fn on_status_change(&mut self, old_status: Status, new_status: Status, now: Instant) -> bool {
        match new_status {
            Status::Handshake => {
                if self.channel.conn_type == ConnectionType::Inbound {
                    return self.finalize_key_exchange(now);
                }

                true
            }
            Status::Connected => {
                self.reset_keepalive_timeout(now);
                self.handshake_guard = None;

                if self.channel.conn_type == ConnectionType::Outbound && old_status == Status::Handshake {
                    return self.finalize_key_exchange(now);
                }

                true
            }
            _ => true,
        }
    }

    /// Swaps the handshake-derived key block in as the current key; the
    /// pre-handshake key stays readable for its grace period.
    fn finalize_key_exchange(&mut self, now: Instant) -> bool {
        let exchange = match self.key_exchange.take() {
            Some(exchange) => exchange,
            None => return false,
        };

        let secret = self.effective_shared_secret().to_vec();

        match exchange.derive(&secret) {
            Some(block) => {
                self.keys.install(SymmetricKey::from_block(block), now);
                true
            }
            None => false,
        }
    }

    fn effective_shared_secret(&self) -> &[u8] {
        match &self.shared_secret {
            Some(secret) => secret,
            None => &self.settings.global_shared_secret,
        }
    }

    fn set_close_condition(&mut self, condition: CloseCondition) {
        if self.should_close() {
            return;
        }

        self.close_condition = Some(condition);

        let error = match condition {
            CloseCondition::GeneralFailure
            | CloseCondition::ReceiveError
            | CloseCondition::SendError
            | CloseCondition::UnknownMessage => Some(io::ErrorKind::ConnectionAborted),
            CloseCondition::TimedOut => Some(io::ErrorKind::TimedOut),
            CloseCondition::PeerNotAllowed => Some(io::ErrorKind::PermissionDenied),
            CloseCondition::LocalCloseRequest | CloseCondition::PeerCloseRequest => None,
        };

        let mut data = self.connection_data.write().expect("connection data lock poisoned");

        if let Some(error) = error {
            data.set_exception(error);
        }

        data.signal_receive_event();
    }

    fn update_reputation(&mut self, endpoint: SocketAddr, penalty: Penalty) {
        let standing = self.access.penalize(endpoint.ip(), penalty);

        if standing == Standing::Unacceptable && self.channel.peer_endpoint == endpoint {
            // The pinned peer no longer has an acceptable reputation
            self.set_close_condition(CloseCondition::PeerNotAllowed);
        }
    }

    fn check_keepalive(&mut self, now: Instant) -> bool {
        if now.duration_since(self.channel.last_send_time) >= self.keepalive_timeout {
            self.reset_keepalive_timeout(now);

            return self.send_keepalive(now);
        }

        true
    }

    /// The keepalive interval is redrawn uniformly from [0, SuspendTimeout]
    /// after every use so idle traffic carries no fixed cadence.
    fn reset_keepalive_timeout(&mut self, _now: Instant) {
        self.keepalive_timeout = self.settings.suspend_timeout.mul_f64(rand::thread_rng().gen::<f64>());
    }

    fn suspend(&mut self, now: Instant) -> bool {
        debug!(self.log, "entering suspended state");

        if self.set_status(Status::Suspended, now) {
            let mut data = self.connection_data.write().expect("connection data lock poisoned");
            data.set_suspended(true);
            data.signal_receive_event();

            return true;
        }

        false
    }

    fn resume(&mut self, now: Instant) -> bool {
        debug!(self.log, "resuming from suspended state");

        if self.set_status(Status::Connected, now) {
            let mut data = self.connection_data.write().expect("connection data lock poisoned");
            data.set_suspended(false);
            data.signal_receive_event();

            return true;
        }

        false
    }

    fn reset_mtu(&mut self, now: Instant) {
        self.mtu_discovery = Some(MtuDiscovery::new(
            self.log.clone(),
            self.settings.max_mtu_discovery_delay,
            now,
        ));

        if !self.on_mtu_update(mtud::MIN_MESSAGE_SIZE, now) {
            self.set_close_condition(CloseCondition::GeneralFailure);
        }
    }

    fn process_mtu_discovery(&mut self, now: Instant) -> bool {
        let mut discovery = match self.mtu_discovery.take() {
            Some(discovery) => discovery,
            None => return true,
        };

        let status = {
            let mut probe = Probe {
                channel: &mut self.channel,
                key: self.keys.current(),
            };

            discovery.process(&mut probe, now)
        };

        match status {
            MtudStatus::Finished | MtudStatus::Failed => {
                let new_mtu = discovery.max_message_size();

                self.on_mtu_update(new_mtu, now)
            }
            _ => {
                self.mtu_discovery = Some(discovery);
                true
            }
        }
    }

    /// Applies a confirmed maximum datagram size: resizes the send queue's
    /// messages, recomputes the receive window and advertises the change.
    fn on_mtu_update(&mut self, mtu: usize, now: Instant) -> bool {
        debug_assert!(mtu >= mtud::MIN_MESSAGE_SIZE);

        self.send_queue.set_max_message_size(mtu);

        self.receive_window_size =
            (MAX_RECEIVE_WINDOW_BYTES / mtu).clamp(MIN_RECEIVE_WINDOW_ITEMS, MAX_RECEIVE_WINDOW_ITEMS);

        trace!(self.log, "maximum message size updated";
               "mtu" => mtu,
               "receive_window_size" => self.receive_window_size);

        if self.status == Status::Connected {
            // Let the peer know about the new receive window
            return self.send_state_update(now);
        }

        true
    }

    fn send_outbound_syn(&mut self, cookie: Option<u64>, now: Instant) -> bool {
        debug!(self.log, "sending outbound syn"; "seqnum" => self.send_queue.next_send_seqnum());

        let handshake_data = match &self.key_exchange {
            Some(exchange) => exchange.handshake_data().to_vec(),
            None => return false,
        };

        let message = Message::syn(
            self.send_queue.next_send_seqnum(),
            None,
            SynPayload {
                version_major: PROTOCOL_VERSION_MAJOR,
                version_minor: PROTOCOL_VERSION_MINOR,
                connection_id: self.id,
                // Unused by the receiving side for outbound connects
                port: rand::thread_rng().gen(),
                cookie,
                handshake_data,
            },
        );

        if !self.send(message, Duration::ZERO, false, now) {
            error!(self.log, "failed to send outbound syn");
            return false;
        }

        true
    }

    fn send_inbound_syn(&mut self, now: Instant) -> bool {
        debug!(self.log, "sending inbound syn"; "seqnum" => self.send_queue.next_send_seqnum());

        let handshake_data = match &self.key_exchange {
            Some(exchange) => exchange.handshake_data().to_vec(),
            None => return false,
        };

        let port = match self.channel.socket.local_addr() {
            Ok(addr) => addr.port(),
            Err(_) => return false,
        };

        let message = Message::syn(
            self.send_queue.next_send_seqnum(),
            Some(self.last_in_order_received.seqnum()),
            SynPayload {
                version_major: PROTOCOL_VERSION_MAJOR,
                version_minor: PROTOCOL_VERSION_MINOR,
                connection_id: self.id,
                // The peer should switch from the listener port to ours
                port,
                cookie: None,
                handshake_data,
            },
        );

        if self.send(message, Duration::ZERO, false, now) {
            self.last_in_order_received.mark_acked();
            return true;
        }

        error!(self.log, "failed to send inbound syn");

        false
    }

    fn send_data(&mut self, bytes: Vec<u8>, now: Instant) -> bool {
        trace!(self.log, "sending data"; "seqnum" => self.send_queue.next_send_seqnum());

        let message = Message::data(
            self.send_queue.next_send_seqnum(),
            self.last_in_order_received.seqnum(),
            bytes,
        );

        if self.send(message, Duration::ZERO, false, now) {
            self.last_in_order_received.mark_acked();
            return true;
        }

        error!(self.log, "failed to send data message");

        false
    }

    fn send_state_update(&mut self, now: Instant) -> bool {
        debug!(self.log, "sending state update"; "seqnum" => self.send_queue.next_send_seqnum());

        let message = Message::state(
            self.send_queue.next_send_seqnum(),
            self.last_in_order_received.seqnum(),
            StatePayload {
                max_window_items: self.receive_window_size as u32,
                max_window_bytes: MAX_RECEIVE_WINDOW_BYTES as u32,
            },
        );

        if self.send(message, Duration::ZERO, false, now) {
            self.last_in_order_received.mark_acked();
            return true;
        }

        error!(self.log, "failed to send state update");

        false
    }

    fn send_keepalive(&mut self, now: Instant) -> bool {
        trace!(self.log, "sending keepalive");

        if !self.send(Message::null(), Duration::ZERO, false, now) {
            error!(self.log, "failed to send keepalive");
            return false;
        }

        true
    }

    fn send_immediate_reset(&mut self, now: Instant) {
        if self.status != Status::Connected {
            return;
        }

        debug!(self.log, "sending reset");

        if !self.send(Message::reset(), Duration::ZERO, false, now) {
            error!(self.log, "failed to send reset");
        }
    }

    /// Emits a random number of delayed Null messages ahead of the real
    /// handshake to blunt traffic analysis.
    fn send_decoy_messages(&mut self, now: Instant) {
        let mut rng = rand::thread_rng();
        let num = rng.gen_range(0..=self.settings.max_num_decoy_messages);

        for _ in 0..num {
            let delay = self.settings.max_decoy_message_interval.mul_f64(rng.gen::<f64>());

            // Decoys are pinned to the endpoint they were created for
            let _ = self.send(Message::null(), delay, true, now);
        }
    }

    fn send_delayed_items(&mut self, now: Instant) -> bool {
        while let Some(item) = self.delayed_sends.peek() {
            if item.scheduled_at > now {
                break;
            }

            let item = self.delayed_sends.pop().expect("peeked item must exist");

            if !self.dispatch_send(item.message_type, item.seqnum, item.data, item.endpoint, now) {
                return false;
            }
        }

        true
    }

    /// Encodes and transmits a message, optionally delayed. Sequenced
    /// messages enter the send queue for retransmission tracking.
    fn send(&mut self, message: Message, delay: Duration, save_endpoint: bool, now: Instant) -> bool {
        let data = match message.write(self.send_queue.max_message_size(), self.keys.current()) {
            Ok(data) => data,
            Err(err) => {
                error!(self.log, "failed to encode message"; "error" => ?err);
                return false;
            }
        };

        let message_type = message.message_type();
        let seqnum = message.seqnum();

        // Messages intended for a specific endpoint keep it across peer
        // endpoint migrations
        let endpoint = if save_endpoint {
            Some(self.channel.peer_endpoint)
        } else {
            None
        };

        if delay > Duration::ZERO {
            self.delayed_sends.push(DelayedSend {
                scheduled_at: now + delay,
                message_type,
                seqnum,
                endpoint,
                data,
            });

            return true;
        }

        self.dispatch_send(message_type, seqnum, data, endpoint, now)
    }

    fn dispatch_send(
        &mut self,
        message_type: MessageType,
        seqnum: Option<SequenceNumber>,
        data: Vec<u8>,
        endpoint: Option<SocketAddr>,
        now: Instant,
    ) -> bool {
        if let Some(seqnum) = seqnum {
            // Sequenced messages are tracked until acknowledged
            let item = Item {
                message_type,
                seqnum,
                num_tries: 0,
                time_sent: now,
                time_resent: now,
                data,
                acked: false,
                time_acked: None,
            };

            if let Err(err) = self.send_queue.add(item, &mut self.channel) {
                error!(self.log, "send failed"; "error" => ?err);
                return false;
            }

            return true;
        }

        // Unsequenced messages get one best-effort try
        let endpoint = endpoint.unwrap_or(self.channel.peer_endpoint);
        match self.channel.transmit_to(endpoint, message_type, &data, now) {
            Ok(_) => true,
            Err(err) => {
                error!(self.log, "send failed"; "error" => ?err);
                false
            }
        }
    }

    fn receive_to_queue(&mut self, now: Instant) -> bool {
        loop {
            match self.channel.socket.recv_from(&mut self.recv_buf) {
                Ok((len, endpoint)) => {
                    if len == 0 {
                        break;
                    }

                    if endpoint != self.channel.peer_endpoint && !self.access.is_allowed(endpoint.ip()) {
                        // Discard data from unknown endpoints that are not
                        // allowed by the access configuration
                        continue;
                    }

                    let bytes = self.recv_buf[..len].to_vec();

                    if !self.process_received_data(now, endpoint, &bytes) {
                        return false;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    // Port unreachable; not fatal, the connection will
                    // suspend until the peer reappears
                    debug!(self.log, "peer port unreachable");
                    break;
                }
                Err(err) => {
                    error!(self.log, "receive failed"; "error" => ?err);
                    return false;
                }
            }
        }

        true
    }

    fn process_received_data(&mut self, now: Instant, endpoint: SocketAddr, bytes: &[u8]) -> bool {
        match Message::read(bytes, &self.keys) {
            Ok(message) => {
                let success = match self.status {
                    Status::Handshake => self.process_message_handshake(endpoint, message, now),
                    Status::Suspended => {
                        // Receiving data while suspended; wake up first
                        if !self.resume(now) {
                            self.set_close_condition(CloseCondition::GeneralFailure);
                            return false;
                        }

                        self.process_message_connected(endpoint, message, now)
                    }
                    Status::Connected => self.process_message_connected(endpoint, message, now),
                    Status::Open | Status::Closed => true,
                };

                if success {
                    self.last_receive_time = now;
                }

                success
            }
            Err(_) => {
                // Unrecognized message; may well be an attack
                self.update_reputation(endpoint, Penalty::Severe);

                if self.channel.peer_endpoint == endpoint {
                    error!(self.log, "received invalid message from peer"; "endpoint" => %endpoint);

                    self.set_close_condition(CloseCondition::UnknownMessage);

                    false
                } else {
                    // Someone else sending garbage; drop it and keep the
                    // connection alive
                    warn!(self.log, "received invalid message from unknown endpoint";
                          "endpoint" => %endpoint);

                    true
                }
            }
        }
    }

    fn process_message_handshake(&mut self, endpoint: SocketAddr, message: Message, now: Instant) -> bool {
        // During the handshake only the endpoint we are connecting with may
        // talk to us
        if endpoint != self.channel.peer_endpoint {
            warn!(self.log, "handshake response from unexpected endpoint"; "endpoint" => %endpoint);

            self.update_reputation(endpoint, Penalty::Minimal);

            return true;
        }

        match self.channel.conn_type {
            ConnectionType::Outbound => self.process_handshake_outbound(endpoint, message, now),
            ConnectionType::Inbound => match message.message_type() {
                // Retransmitted handshake traffic; our own syn reply is
                // still being retransmitted from the send queue
                MessageType::Syn | MessageType::Cookie | MessageType::Null => true,
                _ => {
                    if !self.process_message_connected(endpoint, message, now) {
                        return false;
                    }

                    if !self.set_status(Status::Connected, now) {
                        return false;
                    }

                    self.complete_handshake();

                    true
                }
            },
        }
    }

    fn process_handshake_outbound(&mut self, endpoint: SocketAddr, message: Message, now: Instant) -> bool {
        let seqnum = message.seqnum();
        let acknum = message.acknum();

        match message.into_payload() {
            Payload::Syn(syn) => {
                if syn.version_major != PROTOCOL_VERSION_MAJOR {
                    error!(self.log, "unsupported protocol version";
                           "version_major" => syn.version_major,
                           "version_minor" => syn.version_minor);
                    return false;
                }

                if syn.connection_id != self.id {
                    error!(self.log, "syn with unexpected connection id";
                           "received_id" => syn.connection_id);
                    return false;
                }

                let exchange = match self.key_exchange.as_mut() {
                    Some(exchange) => exchange,
                    None => return false,
                };

                if !exchange.set_peer_data(&syn.handshake_data) {
                    error!(self.log, "invalid handshake data in syn");
                    return false;
                }

                let seqnum = match seqnum {
                    Some(seqnum) => seqnum,
                    None => return false,
                };

                self.last_in_order_received.set(seqnum);

                if let Some(acknum) = acknum {
                    self.send_queue.process_in_order_ack(acknum, now);
                }

                self.pending_acks.push(seqnum);

                if !self.set_status(Status::Connected, now) {
                    return false;
                }

                // The peer advertised the port it wants the rest of the
                // conversation on
                self.channel.peer_endpoint = SocketAddr::new(endpoint.ip(), syn.port);

                self.complete_handshake();

                true
            }
            Payload::Cookie(cookie_id) => {
                // Challenged; discard the previous connect message and send
                // the syn again carrying the cookie
                self.send_queue.reset();

                if self.send_outbound_syn(Some(cookie_id), now) {
                    true
                } else {
                    self.set_close_condition(CloseCondition::GeneralFailure);
                    false
                }
            }
            Payload::Null => true,
            _ => {
                warn!(self.log, "unexpected message type during handshake");

                self.update_reputation(endpoint, Penalty::Minimal);
                self.set_close_condition(CloseCondition::UnknownMessage);

                true
            }
        }
    }

    /// Shared tail of both handshake flows: release the listener queue,
    /// open the socket for writing and wake the application.
    fn complete_handshake(&mut self) {
        let local_endpoint = self.channel.socket.local_addr().ok();

        {
            let mut data = self.connection_data.write().expect("connection data lock poisoned");

            if let Some(endpoint) = local_endpoint {
                data.set_local_endpoint(endpoint);
            }
            data.set_peer_endpoint(self.channel.peer_endpoint);
            let _ = data.take_listener_send_queue();
            data.set_write(true);
            data.signal_receive_event();
        }

        self.channel.listener_queue = None;

        debug!(self.log, "connection established"; "peer" => %self.channel.peer_endpoint);
    }

    fn process_message_connected(&mut self, endpoint: SocketAddr, message: Message, now: Instant) -> bool {
        let mut endpoint_check = true;

        let success = match message.message_type() {
            MessageType::Data | MessageType::State => {
                let seqnum = match message.seqnum() {
                    Some(seqnum) => seqnum,
                    None => return false,
                };

                match window::classify(seqnum, self.last_in_order_received.seqnum(), self.receive_window_size) {
                    ReceiveWindow::Current => {
                        // The piggybacked ack is processed before the
                        // payload is handed on
                        if let Some(acknum) = message.acknum() {
                            self.send_queue.process_in_order_ack(acknum, now);
                        }

                        self.pending_acks.push(seqnum);

                        // A duplicate still in the receive map gets
                        // re-acked above but is not enqueued twice
                        self.receive_queue.entry(seqnum).or_insert(message);

                        true
                    }
                    ReceiveWindow::Previous => {
                        // Retransmitted because of delays or a lost ack;
                        // ack it again and drop the message
                        self.last_in_order_received.reset_acked();
                        self.pending_acks.push(seqnum);

                        true
                    }
                    ReceiveWindow::Unknown => true,
                }
            }
            MessageType::EAck => {
                if let Some(acknum) = message.acknum() {
                    self.send_queue.process_in_order_ack(acknum, now);
                }

                if let Payload::EAck(ranges) = message.into_payload() {
                    self.send_queue.process_ack_ranges(&ranges, now);
                }

                true
            }
            MessageType::Mtud => {
                match message.acknum() {
                    None => {
                        // A probe from the peer; answer with a minimal ack
                        if let Some(seqnum) = message.seqnum() {
                            let mut probe = Probe {
                                channel: &mut self.channel,
                                key: self.keys.current(),
                            };

                            mtud::send_probe_ack(&mut probe, &self.log, seqnum, now);
                        }
                    }
                    Some(acknum) => {
                        if let Some(discovery) = self.mtu_discovery.as_mut() {
                            discovery.process_received_ack(acknum, now);
                        }
                    }
                }

                true
            }
            MessageType::Reset => {
                debug!(self.log, "received reset from peer");

                self.connection_data
                    .write()
                    .expect("connection data lock poisoned")
                    .set_close_request();
                self.set_close_condition(CloseCondition::PeerCloseRequest);

                true
            }
            MessageType::Null => true,
            MessageType::Syn | MessageType::Cookie => {
                if self.channel.peer_endpoint == endpoint {
                    // Retransmitted duplicate from the handshake; ignore
                } else {
                    // Someone else trying to interfere
                    self.update_reputation(endpoint, Penalty::Minimal);
                }

                endpoint_check = false;

                true
            }
        };

        if success && endpoint_check {
            self.check_endpoint_change(endpoint);
        }

        success
    }

    /// Rebinds the pinned peer endpoint when the peer shows up from a new
    /// allowed address. Outbound connections never migrate back to the
    /// listener endpoint they first connected to.
    fn check_endpoint_change(&mut self, endpoint: SocketAddr) {
        if self.channel.conn_type == ConnectionType::Outbound && endpoint == self.channel.original_peer_endpoint {
            return;
        }

        if self.channel.peer_endpoint == endpoint {
            return;
        }

        if self.access.is_allowed(endpoint.ip()) {
            warn!(self.log, "peer endpoint changed";
                  "old" => %self.channel.peer_endpoint,
                  "new" => %endpoint);

            self.channel.peer_endpoint = endpoint;

            self.connection_data
                .write()
                .expect("connection data lock poisoned")
                .set_peer_endpoint(endpoint);
        } else {
            error!(self.log, "peer endpoint change refused by access configuration";
                   "old" => %self.channel.peer_endpoint,
                   "new" => %endpoint);
        }
    }

    /// Moves contiguously received messages into the application stream.
    fn receive_pending_socket_data(&mut self) -> bool {
        if self.receive_queue.is_empty() {
            return true;
        }

        let mut next = window::next_seqnum(self.last_in_order_received.seqnum());
        if !self.receive_queue.contains_key(&next) {
            return true;
        }

        let mut data = self.connection_data.write().expect("connection data lock poisoned");
        let mut receive_event = false;

        loop {
            enum Step {
                Deliver,
                WindowFull,
                Corrupt,
            }

            let step = match self.receive_queue.get(&next) {
                None => break,
                Some(message) => match message.payload() {
                    Payload::Data(bytes) => {
                        if data.receive_buffer().free_capacity() >= bytes.len() {
                            if data.receive_buffer().write(bytes) == bytes.len() {
                                receive_event = true;
                                Step::Deliver
                            } else {
                                Step::Corrupt
                            }
                        } else {
                            Step::WindowFull
                        }
                    }
                    Payload::State(state) => {
                        self.send_queue.set_peer_advertised_window(
                            state.max_window_items as usize,
                            state.max_window_bytes as usize,
                        );

                        Step::Deliver
                    }
                    _ => Step::Corrupt,
                },
            };

            match step {
                Step::Deliver => {
                    self.last_in_order_received.set(next);
                    self.receive_queue.remove(&next);
                    next = window::next_seqnum(next);
                }
                Step::WindowFull => break,
                Step::Corrupt => {
                    error!(self.log, "unhandled message type in receive queue");
                    return false;
                }
            }
        }

        if receive_event {
            data.set_read(true);
            data.signal_receive_event();
        }

        true
    }

    /// Packs application stream bytes into Data messages as long as the
    /// send window has room.
    fn send_pending_socket_data(&mut self, now: Instant) -> bool {
        let max_message_size = self.send_queue.max_message_size();
        let max_data_size = Message::max_data_size(max_message_size);

        loop {
            if self.send_queue.available_window() < max_message_size {
                break;
            }

            let buffer = {
                let mut data = self.connection_data.write().expect("connection data lock poisoned");

                let pending = data.send_buffer().len();
                if pending == 0 {
                    break;
                }

                let read_size = pending.min(max_data_size);
                let mut buffer = vec![0u8; read_size];

                if data.send_buffer().read(&mut buffer) != read_size {
                    return false;
                }

                buffer
            };

            if !self.send_data(buffer, now) {
                return false;
            }
        }

        true
    }

    /// Collapses the pending-ack set into ranges and flushes them as one or
    /// more EAck messages.
    fn send_pending_acks(&mut self, now: Instant) -> bool {
        if self.pending_acks.is_empty() {
            return true;
        }

        let mut pending = std::mem::take(&mut self.pending_acks);
        pending.sort_unstable();

        // If the highest pending number was already covered by an in-order
        // ack there is nothing new to tell the peer
        let last = *pending.last().expect("pending acks not empty");
        if last <= self.last_in_order_received.seqnum() && self.last_in_order_received.is_acked() {
            return true;
        }

        let mut ranges = collapse_ack_ranges(&pending);

        let max_ranges = Message::max_ack_ranges(self.send_queue.max_message_size());

        while !ranges.is_empty() {
            let batch: Vec<AckRange> = if ranges.len() <= max_ranges {
                std::mem::take(&mut ranges)
            } else {
                ranges.drain(..max_ranges).collect()
            };

            trace!(self.log, "sending acks"; "ranges" => batch.len());

            let message = Message::eack(self.last_in_order_received.seqnum(), batch);

            if self.send(message, Duration::ZERO, false, now) {
                self.last_in_order_received.mark_acked();
            } else {
                error!(self.log, "failed to send acks");
                return false;
            }
        }

        true
    }
}

/// Collapses a sorted list of sequence numbers into inclusive ranges;
/// duplicates and directly adjacent numbers share a range.
fn collapse_ack_ranges(sorted: &[SequenceNumber]) -> Vec<AckRange> {
    let mut ranges = Vec::new();
    let mut iter = sorted.iter().copied();

    let mut current = match iter.next() {
        Some(first) => AckRange { begin: first, end: first },
        None => return ranges,
    };

    for seqnum in iter {
        if current.end < SequenceNumber::MAX && (seqnum == current.end || seqnum == current.end + 1) {
            current.end = seqnum;
        } else {
            ranges.push(current);
            current = AckRange {
                begin: seqnum,
                end: seqnum,
            };
        }
    }

    ranges.push(current);

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AllowAll;
    use crate::socket::ConnectionData;
    use quark::logging;
    use std::sync::RwLock;

    fn make_connection() -> Connection {
        let data: SharedConnectionData = Arc::new(RwLock::new(ConnectionData::new()));

        Connection::new(
            &logging::discard(),
            Arc::new(Settings::default()),
            Arc::new(AllowAll),
            data,
            ConnectionType::Outbound,
            Connection::make_connection_id(),
            0,
            None,
            None,
            None,
            true,
            Instant::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_collapse_ack_ranges() {
        let ranges = collapse_ack_ranges(&[2, 3, 4, 6, 7, 8, 9]);
        assert_eq!(
            ranges,
            vec![AckRange { begin: 2, end: 4 }, AckRange { begin: 6, end: 9 }]
        );

        let ranges = collapse_ack_ranges(&[5]);
        assert_eq!(ranges, vec![AckRange { begin: 5, end: 5 }]);

        let ranges = collapse_ack_ranges(&[]);
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_collapse_ack_ranges_with_duplicates() {
        let ranges = collapse_ack_ranges(&[1, 1, 2, 2, 3, 7]);
        assert_eq!(
            ranges,
            vec![AckRange { begin: 1, end: 3 }, AckRange { begin: 7, end: 7 }]
        );
    }

    #[test]
    fn test_collapse_ack_ranges_at_numeric_max() {
        let ranges = collapse_ack_ranges(&[0xFFFE, 0xFFFF]);
        assert_eq!(ranges, vec![AckRange { begin: 0xFFFE, end: 0xFFFF }]);
    }

    #[test]
    fn test_new_connection_starts_open() {
        let connection = make_connection();

        assert_eq!(connection.status(), Status::Open);
        assert!(!connection.should_close());
        assert_eq!(connection.receive_window_size, MAX_RECEIVE_WINDOW_BYTES / mtud::MIN_MESSAGE_SIZE);
    }

    #[test]
    fn test_status_transition_matrix() {
        let now = Instant::now();

        let mut connection = make_connection();
        assert!(!connection.set_status(Status::Connected, now));
        assert!(connection.should_close());

        let mut connection = make_connection();
        assert!(!connection.set_status(Status::Suspended, now));

        let mut connection = make_connection();
        assert!(connection.set_status(Status::Handshake, now));
        assert!(connection.set_status(Status::Connected, now));
        assert!(connection.set_status(Status::Suspended, now));
        assert!(connection.set_status(Status::Connected, now));
        assert!(connection.set_status(Status::Closed, now));
        assert!(!connection.should_close());
    }

    #[test]
    fn test_close_condition_maps_to_socket_exception() {
        let mut connection = make_connection();
        connection.set_close_condition(CloseCondition::TimedOut);

        let data = connection.connection_data.read().unwrap();
        assert_eq!(data.exception(), Some(io::ErrorKind::TimedOut));
        assert!(data.receive_event().is_set());
    }

    #[test]
    fn test_first_close_condition_wins() {
        let mut connection = make_connection();

        connection.set_close_condition(CloseCondition::PeerNotAllowed);
        connection.set_close_condition(CloseCondition::TimedOut);

        assert_eq!(connection.close_condition, Some(CloseCondition::PeerNotAllowed));

        let data = connection.connection_data.read().unwrap();
        assert_eq!(data.exception(), Some(io::ErrorKind::PermissionDenied));
    }

    #[test]
    fn test_mtu_update_recomputes_receive_window() {
        let now = Instant::now();
        let mut connection = make_connection();

        assert!(connection.on_mtu_update(2048, now));
        assert_eq!(connection.receive_window_size, MAX_RECEIVE_WINDOW_BYTES / 2048);

        // A huge MTU pushes the quotient below the floor
        assert!(connection.on_mtu_update(mtud::MAX_MESSAGE_SIZE, now));
        assert_eq!(connection.receive_window_size, MIN_RECEIVE_WINDOW_ITEMS);
    }

    #[test]
    fn test_pending_acks_produce_expected_eack_count() {
        let now = Instant::now();
        let mut connection = make_connection();

        // Pin the peer endpoint to a live local socket so the acks have
        // somewhere to go
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let endpoint = receiver.local_addr().unwrap();
        connection.channel.peer_endpoint = endpoint;
        connection.channel.original_peer_endpoint = endpoint;

        // 129 isolated sequence numbers collapse into 129 singleton ranges
        for index in 0..129u16 {
            connection.pending_acks.push(1 + index * 2);
        }

        let max_ranges = Message::max_ack_ranges(connection.send_queue.max_message_size());
        let expected_messages = (129 + max_ranges - 1) / max_ranges;

        assert!(connection.send_pending_acks(now));
        assert!(connection.pending_acks.is_empty());

        let keys = KeySlots::new(&Settings::default().global_shared_secret);
        let mut buf = [0u8; 65535];
        let mut received = 0usize;
        let mut total_ranges = 0usize;

        while let Ok(len) = receiver.recv(&mut buf) {
            let message = Message::read(&buf[..len], &keys).unwrap();
            assert_eq!(message.message_type(), MessageType::EAck);

            if let Payload::EAck(ranges) = message.into_payload() {
                total_ranges += ranges.len();
            }

            received += 1;
            if received == expected_messages {
                break;
            }
        }

        assert_eq!(received, expected_messages);
        assert_eq!(total_ranges, 129);
    }

    #[test]
    fn test_interface_change_restarts_mtu_discovery() {
        let now = Instant::now();
        let mut connection = make_connection();

        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let endpoint = receiver.local_addr().unwrap();
        connection.channel.peer_endpoint = endpoint;
        connection.channel.original_peer_endpoint = endpoint;

        // Pretend discovery had finished on a larger size
        connection.mtu_discovery = None;
        assert!(connection.on_mtu_update(2048, now));
        assert_eq!(connection.send_queue.max_message_size(), 2048);

        connection.on_local_interface_changed(now);

        // Discovery starts over from the smallest size and the peer is
        // nudged with an immediate keepalive
        assert!(connection.mtu_discovery.is_some());
        assert_eq!(connection.send_queue.max_message_size(), mtud::MIN_MESSAGE_SIZE);

        let keys = KeySlots::new(&Settings::default().global_shared_secret);
        let mut buf = [0u8; 65535];
        let len = receiver.recv(&mut buf).unwrap();
        let message = Message::read(&buf[..len], &keys).unwrap();
        assert_eq!(message.message_type(), MessageType::Null);
    }

    #[test]
    fn test_redundant_pending_acks_are_skipped() {
        let now = Instant::now();
        let mut connection = make_connection();

        connection.last_in_order_received.set(100);
        connection.last_in_order_received.mark_acked();

        // Everything pending is at or below the acked in-order number
        connection.pending_acks.extend_from_slice(&[98, 99, 100]);

        assert!(connection.send_pending_acks(now));
        assert!(connection.pending_acks.is_empty());
    }
}
