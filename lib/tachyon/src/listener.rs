use crate::access::{AccessPolicy, Penalty};
use crate::config::Settings;
use crate::cookie::CookieJar;
use crate::keys::KeySlots;
use crate::manager::{AddQuery, ConnectionManager};
use crate::message::{Message, Payload, SequenceNumber, SynPayload, PROTOCOL_VERSION_MAJOR};
use crate::mtud;
use crate::support::{bind_udp_socket, ErrorType, NetworkError, NetworkResult};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use quark::logging::{debug, error, info, o, warn, Logger};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One datagram queued for transmission from a listener's socket.
pub struct SendQueueItem {
    pub endpoint: SocketAddr,
    pub data: Vec<u8>,
}

/// Send queue shared between a listener socket and the inbound connections
/// it accepted. Until its handshake completes a connection replies through
/// this queue, so the peer sees traffic from the port it first contacted.
pub type ListenerSendQueue = Mutex<VecDeque<SendQueueItem>>;

const LISTENER_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Accepts new connections on the configured UDP ports. Each bound socket
/// runs its own receive-loop thread.
pub struct Listener {
    log: Logger,
    threads: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Listener {
    pub fn startup(
        log: &Logger,
        settings: Arc<Settings>,
        access: Arc<dyn AccessPolicy>,
        manager: Arc<ConnectionManager>,
    ) -> NetworkResult<Listener> {
        let log = log.new(o!("component" => "listener"));

        info!(log, "listener starting up");

        // Should have at least one port
        if settings.listen_ports.is_empty() {
            error!(log, "listener startup failed; no ports given");
            return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::InvalidInput)));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        // A separate socket and thread for every address family and port.
        // With NAT traversal on, one dual-stack IPv6 socket per port serves
        // both families.
        let any_addresses: Vec<IpAddr> = if settings.nat_traversal {
            vec![IpAddr::V6(Ipv6Addr::UNSPECIFIED)]
        } else {
            vec![
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            ]
        };

        for any_address in &any_addresses {
            for &port in &settings.listen_ports {
                let endpoint = SocketAddr::new(*any_address, port);

                match bind_udp_socket(endpoint, settings.nat_traversal) {
                    Ok(socket) => {
                        info!(log, "listening"; "endpoint" => %endpoint);

                        let thread_log = log.new(o!("endpoint" => endpoint.to_string()));
                        let thread_settings = settings.clone();
                        let thread_access = access.clone();
                        let thread_manager = manager.clone();
                        let thread_shutdown = shutdown.clone();

                        let handle = thread::Builder::new()
                            .name(format!("tachyon-listener-{}", endpoint))
                            .spawn(move || {
                                run_receive_loop(
                                    thread_log,
                                    thread_settings,
                                    thread_access,
                                    thread_manager,
                                    socket,
                                    thread_shutdown,
                                )
                            })
                            .expect("failed to spawn listener thread");

                        threads.push(handle);
                    }
                    Err(err) => {
                        error!(log, "could not bind listener socket";
                               "endpoint" => %endpoint,
                               "error" => ?err);
                    }
                }
            }
        }

        if threads.is_empty() {
            error!(log, "listener startup failed; no sockets bound");
            return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::AddrNotAvailable)));
        }

        info!(log, "listener startup successful");

        Ok(Listener {
            log,
            threads,
            shutdown,
        })
    }

    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        info!(self.log, "listener shutting down");

        self.shutdown.store(true, Ordering::Release);

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        info!(self.log, "listener shut down");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_receive_loop(
    log: Logger,
    settings: Arc<Settings>,
    access: Arc<dyn AccessPolicy>,
    manager: Arc<ConnectionManager>,
    mut socket: UdpSocket,
    shutdown: Arc<AtomicBool>,
) {
    let mut poll = Poll::new().expect("failed to create listener poll");
    poll.registry()
        .register(&mut socket, LISTENER_TOKEN, Interest::READABLE)
        .expect("failed to register listener socket");

    let mut events = Events::with_capacity(64);
    let mut buffer = vec![0u8; 65535];

    let send_queue: Arc<ListenerSendQueue> = Arc::new(Mutex::new(VecDeque::new()));
    let mut cookie_jar = CookieJar::new(Instant::now());
    let keys = KeySlots::new(&settings.global_shared_secret);

    while !shutdown.load(Ordering::Acquire) {
        let _ = poll.poll(&mut events, Some(POLL_TIMEOUT));

        drain_send_queue(&log, &socket, &send_queue);

        loop {
            match socket.recv_from(&mut buffer) {
                Ok((len, peer_endpoint)) => {
                    if len == 0 {
                        continue;
                    }

                    accept_connection(
                        &log,
                        &settings,
                        &access,
                        &manager,
                        &keys,
                        &mut cookie_jar,
                        &send_queue,
                        peer_endpoint,
                        &buffer[..len],
                        Instant::now(),
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    // Stray port-unreachable from an earlier reply; harmless
                    continue;
                }
                Err(err) => {
                    error!(log, "receive failed on listener socket"; "error" => ?err);
                    break;
                }
            }
        }
    }
}

/// Flushes handshake replies queued by accepted connections.
fn drain_send_queue(log: &Logger, socket: &UdpSocket, send_queue: &Arc<ListenerSendQueue>) {
    let mut queue = send_queue.lock().expect("listener send queue lock poisoned");

    while let Some(item) = queue.front() {
        match socket.send_to(&item.data, item.endpoint) {
            Ok(_) => {
                queue.pop_front();
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                warn!(log, "failed to send queued reply";
                      "endpoint" => %item.endpoint,
                      "error" => ?err);

                queue.pop_front();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_connection(
    log: &Logger,
    settings: &Arc<Settings>,
    access: &Arc<dyn AccessPolicy>,
    manager: &Arc<ConnectionManager>,
    keys: &KeySlots,
    cookie_jar: &mut CookieJar,
    send_queue: &Arc<ListenerSendQueue>,
    peer_endpoint: SocketAddr,
    buffer: &[u8],
    now: Instant,
) {
    // Count the attempt and consult filters and reputation before any
    // parsing happens
    if !access.connection_attempt(peer_endpoint.ip()) || !access.is_allowed(peer_endpoint.ip()) {
        warn!(log, "discarding datagram; address not allowed"; "endpoint" => %peer_endpoint);
        return;
    }

    let mut reputation_update = false;

    match Message::read(buffer, keys) {
        Ok(message) => {
            let seqnum = message.seqnum();

            match message.into_payload() {
                Payload::Syn(syn) => {
                    if syn.version_major != PROTOCOL_VERSION_MAJOR {
                        error!(log, "unsupported protocol version";
                               "endpoint" => %peer_endpoint,
                               "version_major" => syn.version_major);
                        reputation_update = true;
                    } else if let Some(seqnum) = seqnum {
                        reputation_update = !handle_syn(
                            log,
                            settings,
                            manager,
                            keys,
                            cookie_jar,
                            send_queue,
                            peer_endpoint,
                            syn,
                            seqnum,
                            now,
                        );
                    }
                }
                _ => {
                    error!(log, "invalid message for establishing a connection";
                           "endpoint" => %peer_endpoint);
                    reputation_update = true;
                }
            }
        }
        Err(_) => {
            error!(log, "malformed datagram on listener socket"; "endpoint" => %peer_endpoint);
            reputation_update = true;
        }
    }

    if reputation_update {
        let _ = access.penalize(peer_endpoint.ip(), Penalty::Minimal);
    }
}

/// Runs the accept pipeline for one valid SYN. Returns false when the
/// attempt deserves a reputation penalty.
#[allow(clippy::too_many_arguments)]
fn handle_syn(
    log: &Logger,
    settings: &Arc<Settings>,
    manager: &Arc<ConnectionManager>,
    keys: &KeySlots,
    cookie_jar: &mut CookieJar,
    send_queue: &Arc<ListenerSendQueue>,
    peer_endpoint: SocketAddr,
    syn: SynPayload,
    seqnum: SequenceNumber,
    now: Instant,
) -> bool {
    let interval = settings.cookie_expiration_interval;

    match manager.query_add(syn.connection_id, peer_endpoint.ip()) {
        AddQuery::ConnectionExists => {
            // Retransmitted SYN for a connection that is already being set
            // up; the connection's own retransmission covers the reply
            debug!(log, "connection already exists";
                   "connection_id" => syn.connection_id,
                   "endpoint" => %peer_endpoint);

            true
        }
        AddQuery::ConnectionIdInUse => {
            warn!(log, "connection id in use by another peer";
                  "connection_id" => syn.connection_id,
                  "endpoint" => %peer_endpoint);

            false
        }
        AddQuery::RequireSynCookie => {
            match syn.cookie {
                Some(cookie) => {
                    if cookie_jar.verify(cookie, syn.connection_id, peer_endpoint, now, interval) {
                        create_connection(log, manager, send_queue, peer_endpoint, syn, seqnum)
                    } else {
                        warn!(log, "syn carried an invalid cookie"; "endpoint" => %peer_endpoint);
                        false
                    }
                }
                None => {
                    // Under cookie pressure a bare SYN gets a challenge
                    // instead of a connection
                    let cookie_id = cookie_jar.issue(syn.connection_id, peer_endpoint, now, interval);

                    match Message::cookie(cookie_id).write(mtud::MIN_MESSAGE_SIZE, keys.current()) {
                        Ok(data) => {
                            send_queue
                                .lock()
                                .expect("listener send queue lock poisoned")
                                .push_back(SendQueueItem {
                                    endpoint: peer_endpoint,
                                    data,
                                });
                        }
                        Err(err) => {
                            error!(log, "failed to encode cookie reply"; "error" => ?err);
                        }
                    }

                    true
                }
            }
        }
        AddQuery::Ok => {
            if let Some(cookie) = syn.cookie {
                if !cookie_jar.verify(cookie, syn.connection_id, peer_endpoint, now, interval) {
                    warn!(log, "syn carried an invalid cookie"; "endpoint" => %peer_endpoint);
                    return false;
                }
            }

            create_connection(log, manager, send_queue, peer_endpoint, syn, seqnum)
        }
    }
}

fn create_connection(
    log: &Logger,
    manager: &Arc<ConnectionManager>,
    send_queue: &Arc<ListenerSendQueue>,
    peer_endpoint: SocketAddr,
    syn: SynPayload,
    seqnum: SequenceNumber,
) -> bool {
    match manager.add_inbound(
        syn.connection_id,
        seqnum,
        &syn.handshake_data,
        peer_endpoint,
        send_queue.clone(),
    ) {
        Ok(()) => {
            info!(log, "connection accepted";
                  "connection_id" => syn.connection_id,
                  "endpoint" => %peer_endpoint);

            true
        }
        Err(err) => {
            error!(log, "could not accept connection";
                   "connection_id" => syn.connection_id,
                   "endpoint" => %peer_endpoint,
                   "error" => ?err);

            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AllowAll;
    use crate::message::MessageType;
    use quark::logging;

    fn make_syn(connection_id: u64, cookie: Option<u64>) -> SynPayload {
        SynPayload {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: crate::message::PROTOCOL_VERSION_MINOR,
            connection_id,
            port: 40000,
            cookie,
            handshake_data: vec![7u8; 32],
        }
    }

    #[test]
    fn test_syn_under_cookie_pressure_is_challenged_then_accepted() {
        let log = logging::discard();
        let mut settings = Settings::default();
        settings.connect_cookie_requirement_threshold = 0;
        settings.min_worker_threads = 1;
        settings.max_worker_threads = 1;
        let settings = Arc::new(settings);

        let manager = ConnectionManager::startup(&log, settings.clone(), Arc::new(AllowAll));
        let keys = KeySlots::new(&settings.global_shared_secret);
        let mut cookie_jar = CookieJar::new(Instant::now());
        let send_queue: Arc<ListenerSendQueue> = Arc::new(Mutex::new(VecDeque::new()));
        let peer_endpoint: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let now = Instant::now();

        // With zero in-flight tolerance the bare SYN gets a cookie
        // challenge instead of a connection
        assert!(handle_syn(
            &log,
            &settings,
            &manager,
            &keys,
            &mut cookie_jar,
            &send_queue,
            peer_endpoint,
            make_syn(1234, None),
            1000,
            now,
        ));
        assert!(manager.accept().is_none());

        let challenge = send_queue.lock().unwrap().pop_front().expect("cookie reply expected");
        assert_eq!(challenge.endpoint, peer_endpoint);

        let reply = Message::read(&challenge.data, &keys).unwrap();
        assert_eq!(reply.message_type(), MessageType::Cookie);

        let cookie_id = match reply.into_payload() {
            Payload::Cookie(cookie_id) => cookie_id,
            payload => panic!("unexpected payload {:?}", payload),
        };

        // Echoing the cookie satisfies the challenge and the connection is
        // created
        assert!(handle_syn(
            &log,
            &settings,
            &manager,
            &keys,
            &mut cookie_jar,
            &send_queue,
            peer_endpoint,
            make_syn(1234, Some(cookie_id)),
            1000,
            now,
        ));
        assert!(manager.accept().is_some());

        // A wrong cookie is refused
        assert!(!handle_syn(
            &log,
            &settings,
            &manager,
            &keys,
            &mut cookie_jar,
            &send_queue,
            "198.51.100.7:40000".parse().unwrap(),
            make_syn(5678, Some(cookie_id.wrapping_add(1))),
            1000,
            now,
        ));

        manager.shutdown();
    }
}
