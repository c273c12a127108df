use crate::access::AccessPolicy;
use crate::config::Settings;
use crate::connection::{Connection, ConnectionType};
use crate::listener::ListenerSendQueue;
use crate::message::{ConnectionId, SequenceNumber};
use crate::socket::{ConnectionData, SharedConnectionData, Socket};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use hashbrown::HashMap;
use indexmap::IndexMap;
use mio::{Events, Poll, Token};
use quark::logging::{debug, error, info, o, Logger};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// RAII guard around the manager's count of inbound handshakes in flight;
/// the count feeds the listener's cookie-pressure decision. Released when
/// the connection reaches the connected state or is dropped.
pub struct HandshakeGuard {
    counter: Arc<AtomicUsize>,
}

impl HandshakeGuard {
    fn new(counter: Arc<AtomicUsize>) -> HandshakeGuard {
        counter.fetch_add(1, Ordering::Relaxed);

        HandshakeGuard { counter }
    }
}

impl Drop for HandshakeGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Answer to the listener's question whether a SYN may become a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddQuery {
    Ok,
    RequireSynCookie,
    ConnectionExists,
    ConnectionIdInUse,
}

/// Lightweight connection metadata kept outside the owning worker so the
/// listener can answer duplicate queries without touching worker state.
struct RegistryEntry {
    conn_type: ConnectionType,
    peer_addr: IpAddr,
}

struct WorkerShared {
    inbox: Mutex<Vec<Connection>>,
    connection_count: AtomicUsize,
    interface_changed: AtomicBool,
}

/// Hosts all connection state machines on a pool of worker threads. Each
/// connection is owned by exactly one worker; new connections go to the
/// worker with the fewest.
pub struct ConnectionManager {
    log: Logger,
    settings: Arc<Settings>,
    access: Arc<dyn AccessPolicy>,
    workers: Vec<Arc<WorkerShared>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    registry: Arc<Mutex<HashMap<ConnectionId, RegistryEntry>>>,
    handshakes_in_progress: Arc<AtomicUsize>,
    accepted: Mutex<VecDeque<Socket>>,
}

impl ConnectionManager {
    pub fn startup(
        log: &Logger,
        settings: Arc<Settings>,
        access: Arc<dyn AccessPolicy>,
    ) -> Arc<ConnectionManager> {
        let log = log.new(o!("component" => "connection_manager"));

        let num_threads = settings.num_worker_threads();

        info!(log, "connection manager starting up"; "worker_threads" => num_threads);

        let shutdown = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(Mutex::new(HashMap::new()));

        let mut workers = Vec::with_capacity(num_threads);
        let mut threads = Vec::with_capacity(num_threads);

        for index in 0..num_threads {
            let shared = Arc::new(WorkerShared {
                inbox: Mutex::new(Vec::new()),
                connection_count: AtomicUsize::new(0),
                interface_changed: AtomicBool::new(false),
            });

            let worker_log = log.new(o!("worker" => index));
            let worker_shared = shared.clone();
            let worker_shutdown = shutdown.clone();
            let worker_registry = registry.clone();

            let handle = thread::Builder::new()
                .name(format!("tachyon-worker-{}", index))
                .spawn(move || run_worker(worker_log, worker_shared, worker_shutdown, worker_registry))
                .expect("failed to spawn connection worker thread");

            workers.push(shared);
            threads.push(handle);
        }

        info!(log, "connection manager startup successful");

        Arc::new(ConnectionManager {
            log,
            settings,
            access,
            workers,
            threads: Mutex::new(threads),
            shutdown,
            registry,
            handshakes_in_progress: Arc::new(AtomicUsize::new(0)),
            accepted: Mutex::new(VecDeque::new()),
        })
    }

    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(self.log, "connection manager shutting down");

        let mut threads = self.threads.lock().expect("manager thread list lock poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }

        self.registry.lock().expect("registry lock poisoned").clear();

        info!(self.log, "connection manager shut down");
    }

    #[inline]
    pub fn num_handshakes_in_progress(&self) -> usize {
        self.handshakes_in_progress.load(Ordering::Relaxed)
    }

    /// Propagates a local interface or address change to every worker-owned
    /// connection: each restarts MTU discovery and nudges its peer so the
    /// new endpoint gets picked up.
    pub fn notify_local_interface_changed(&self) {
        info!(self.log, "local interface changed");

        for worker in &self.workers {
            worker.interface_changed.store(true, Ordering::Release);
        }
    }

    /// Opens an outbound connection towards `remote` and returns the socket
    /// facade for it. The handshake proceeds on a worker thread.
    pub fn connect(&self, remote: SocketAddr, shared_secret: Option<Vec<u8>>) -> NetworkResult<Socket> {
        let data: SharedConnectionData = Arc::new(RwLock::new(ConnectionData::new()));
        let id = Connection::make_connection_id();

        let connection = Connection::new(
            &self.log,
            self.settings.clone(),
            self.access.clone(),
            data.clone(),
            ConnectionType::Outbound,
            id,
            rand::random::<SequenceNumber>(),
            None,
            shared_secret,
            None,
            remote.is_ipv4(),
            Instant::now(),
        )?;

        {
            let mut inner = data.write().expect("connection data lock poisoned");
            inner.set_peer_endpoint(remote);
            inner.set_connect_request();
        }

        self.register_and_assign(connection, ConnectionType::Outbound, remote.ip())?;

        debug!(self.log, "outbound connection created"; "connection_id" => id);

        Ok(Socket::new(data))
    }

    /// Next accepted inbound connection, if any completed creation.
    pub fn accept(&self) -> Option<Socket> {
        self.accepted.lock().expect("accept queue lock poisoned").pop_front()
    }

    /// Classifies an incoming SYN before any state is allocated for it.
    pub fn query_add(&self, id: ConnectionId, peer_addr: IpAddr) -> AddQuery {
        if self.num_handshakes_in_progress() >= self.settings.connect_cookie_requirement_threshold {
            return AddQuery::RequireSynCookie;
        }

        let registry = self.registry.lock().expect("registry lock poisoned");

        match registry.get(&id) {
            Some(entry) => {
                if entry.conn_type == ConnectionType::Inbound && entry.peer_addr == peer_addr {
                    AddQuery::ConnectionExists
                } else {
                    AddQuery::ConnectionIdInUse
                }
            }
            None => AddQuery::Ok,
        }
    }

    /// Creates an inbound connection for an accepted SYN and queues its
    /// socket facade for `accept`.
    pub(crate) fn add_inbound(
        &self,
        id: ConnectionId,
        seqnum: SequenceNumber,
        handshake_data: &[u8],
        peer_endpoint: SocketAddr,
        listener_queue: Arc<ListenerSendQueue>,
    ) -> NetworkResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(NetworkError::Fatal(ErrorType::Io(std::io::ErrorKind::NotConnected)));
        }

        let guard = HandshakeGuard::new(self.handshakes_in_progress.clone());

        let data: SharedConnectionData = Arc::new(RwLock::new(ConnectionData::new()));

        {
            let mut inner = data.write().expect("connection data lock poisoned");
            inner.set_peer_endpoint(peer_endpoint);
            inner.set_listener_send_queue(listener_queue);
            inner.set_connect_request();
        }

        let connection = Connection::new(
            &self.log,
            self.settings.clone(),
            self.access.clone(),
            data.clone(),
            ConnectionType::Inbound,
            id,
            seqnum,
            Some(handshake_data),
            None,
            Some(guard),
            peer_endpoint.is_ipv4(),
            Instant::now(),
        )?;

        self.register_and_assign(connection, ConnectionType::Inbound, peer_endpoint.ip())?;

        self.accepted
            .lock()
            .expect("accept queue lock poisoned")
            .push_back(Socket::new(data));

        Ok(())
    }

    fn register_and_assign(
        &self,
        connection: Connection,
        conn_type: ConnectionType,
        peer_addr: IpAddr,
    ) -> NetworkResult<()> {
        let id = connection.id();

        {
            let mut registry = self.registry.lock().expect("registry lock poisoned");

            if registry.contains_key(&id) {
                error!(self.log, "connection id already registered"; "connection_id" => id);
                return Err(NetworkError::Fatal(ErrorType::ConnectionExists));
            }

            registry.insert(id, RegistryEntry { conn_type, peer_addr });
        }

        // Hand the connection to the worker with the fewest connections
        let worker = self
            .workers
            .iter()
            .min_by_key(|worker| worker.connection_count.load(Ordering::Relaxed))
            .expect("at least one worker must exist");

        worker.connection_count.fetch_add(1, Ordering::Relaxed);
        worker
            .inbox
            .lock()
            .expect("worker inbox lock poisoned")
            .push(connection);

        Ok(())
    }
}

fn run_worker(
    log: Logger,
    shared: Arc<WorkerShared>,
    shutdown: Arc<AtomicBool>,
    registry: Arc<Mutex<HashMap<ConnectionId, RegistryEntry>>>,
) {
    let mut poll = Poll::new().expect("failed to create worker poll");
    let mut events = Events::with_capacity(1024);

    let mut connections: IndexMap<ConnectionId, Connection> = IndexMap::new();
    let mut next_token: usize = 0;
    let mut remove_list: Vec<ConnectionId> = Vec::new();

    while !shutdown.load(Ordering::Acquire) {
        // Adopt newly assigned connections
        let incoming: Vec<Connection> = {
            let mut inbox = shared.inbox.lock().expect("worker inbox lock poisoned");
            inbox.drain(..).collect()
        };

        for mut connection in incoming {
            let token = Token(next_token);
            next_token += 1;

            if let Err(err) = connection.register(poll.registry(), token) {
                error!(log, "failed to register connection socket";
                       "connection_id" => connection.id(),
                       "error" => ?err);
            }

            connections.insert(connection.id(), connection);
        }

        if shared.interface_changed.swap(false, Ordering::AcqRel) {
            for (_, connection) in connections.iter_mut() {
                connection.on_local_interface_changed(Instant::now());
            }
        }

        // Bounded wait; socket readiness only shortens the tick
        let _ = poll.poll(&mut events, Some(POLL_TIMEOUT));

        for (_, connection) in connections.iter_mut() {
            if shutdown.load(Ordering::Acquire) {
                break;
            }

            // Taken in the loop so each connection sees a fresh time
            let now = Instant::now();

            connection.process_events(now);

            if connection.should_close() {
                remove_list.push(connection.id());
            }
        }

        if !remove_list.is_empty() {
            debug!(log, "removing connections"; "count" => remove_list.len());

            for id in remove_list.drain(..) {
                if let Some(mut connection) = connections.swap_remove(&id) {
                    let _ = connection.deregister(poll.registry());
                    connection.close(Instant::now());

                    shared.connection_count.fetch_sub(1, Ordering::Relaxed);
                    registry.lock().expect("registry lock poisoned").remove(&id);
                }
            }
        }
    }

    // Orderly teardown on shutdown
    for (id, mut connection) in connections.drain(..) {
        let _ = connection.deregister(poll.registry());
        connection.close(Instant::now());

        shared.connection_count.fetch_sub(1, Ordering::Relaxed);
        registry.lock().expect("registry lock poisoned").remove(&id);
    }
}
