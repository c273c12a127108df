use crate::buffer::RingBuffer;
use crate::listener::ListenerSendQueue;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

/// Capacity of each per-connection stream buffer.
const STREAM_BUFFER_SIZE: usize = 1 << 20;

/// A manually reset event for cross-thread readiness signalling. Waits are
/// always bounded.
pub struct Event {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    pub fn new() -> Event {
        Event {
            state: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut state = self.state.lock().expect("event lock poisoned");
        *state = true;
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().expect("event lock poisoned");
        *state = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().expect("event lock poisoned")
    }

    /// Waits until the event is set or the timeout elapses; returns whether
    /// the event was set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.state.lock().expect("event lock poisoned");

        let (state, _) = self
            .condvar
            .wait_timeout_while(state, timeout, |set| !*set)
            .expect("event lock poisoned");

        *state
    }
}

/// The only cross-thread surface of a connection: stream ring buffers,
/// endpoints and request/readiness flags, shared between the worker thread
/// that owns the connection and the application-facing socket.
pub struct ConnectionData {
    can_read: bool,
    can_write: bool,
    exception: Option<io::ErrorKind>,

    connect_requested: bool,
    close_requested: bool,
    suspended: bool,

    local_endpoint: Option<SocketAddr>,
    peer_endpoint: Option<SocketAddr>,

    send_buffer: RingBuffer,
    receive_buffer: RingBuffer,

    receive_event: Arc<Event>,

    listener_send_queue: Option<Arc<ListenerSendQueue>>,
}

impl ConnectionData {
    pub fn new() -> ConnectionData {
        ConnectionData {
            can_read: false,
            can_write: false,
            exception: None,
            connect_requested: false,
            close_requested: false,
            suspended: false,
            local_endpoint: None,
            peer_endpoint: None,
            send_buffer: RingBuffer::new(STREAM_BUFFER_SIZE),
            receive_buffer: RingBuffer::new(STREAM_BUFFER_SIZE),
            receive_event: Arc::new(Event::new()),
            listener_send_queue: None,
        }
    }

    #[inline]
    pub fn signal_receive_event(&self) {
        self.receive_event.set();
    }

    #[inline]
    pub fn receive_event(&self) -> &Arc<Event> {
        &self.receive_event
    }

    #[inline]
    pub fn set_local_endpoint(&mut self, endpoint: SocketAddr) {
        self.local_endpoint = Some(endpoint);
    }

    #[inline]
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local_endpoint
    }

    #[inline]
    pub fn set_peer_endpoint(&mut self, endpoint: SocketAddr) {
        self.peer_endpoint = Some(endpoint);
    }

    #[inline]
    pub fn peer_endpoint(&self) -> Option<SocketAddr> {
        self.peer_endpoint
    }

    #[inline]
    pub fn set_read(&mut self, enabled: bool) {
        self.can_read = enabled;
    }

    #[inline]
    pub fn can_read(&self) -> bool {
        self.can_read
    }

    #[inline]
    pub fn set_write(&mut self, enabled: bool) {
        self.can_write = enabled;
    }

    #[inline]
    pub fn can_write(&self) -> bool {
        self.can_write
    }

    #[inline]
    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    #[inline]
    pub fn send_buffer(&mut self) -> &mut RingBuffer {
        &mut self.send_buffer
    }

    #[inline]
    pub fn receive_buffer(&mut self) -> &mut RingBuffer {
        &mut self.receive_buffer
    }

    #[inline]
    pub fn set_connect_request(&mut self) {
        self.connect_requested = true;
    }

    #[inline]
    pub fn has_connect_request(&self) -> bool {
        self.connect_requested
    }

    #[inline]
    pub fn set_close_request(&mut self) {
        self.close_requested = true;
    }

    #[inline]
    pub fn has_close_request(&self) -> bool {
        self.close_requested
    }

    #[inline]
    pub fn set_exception(&mut self, error: io::ErrorKind) {
        self.exception = Some(error);
    }

    #[inline]
    pub fn exception(&self) -> Option<io::ErrorKind> {
        self.exception
    }

    #[inline]
    pub fn set_listener_send_queue(&mut self, queue: Arc<ListenerSendQueue>) {
        self.listener_send_queue = Some(queue);
    }

    #[inline]
    pub fn has_listener_send_queue(&self) -> bool {
        self.listener_send_queue.is_some()
    }

    #[inline]
    pub fn listener_send_queue(&self) -> Option<Arc<ListenerSendQueue>> {
        self.listener_send_queue.clone()
    }

    #[inline]
    pub fn take_listener_send_queue(&mut self) -> Option<Arc<ListenerSendQueue>> {
        self.listener_send_queue.take()
    }
}

pub type SharedConnectionData = Arc<RwLock<ConnectionData>>;

/// Application-facing handle to one connection. All operations are
/// non-blocking; `receive_event` signals readability and state changes.
pub struct Socket {
    data: SharedConnectionData,
    receive_event: Arc<Event>,
}

impl Socket {
    pub(crate) fn new(data: SharedConnectionData) -> Socket {
        let receive_event = data
            .read()
            .expect("connection data lock poisoned")
            .receive_event()
            .clone();

        Socket { data, receive_event }
    }

    /// Requests connection establishment towards `endpoint`. The handshake
    /// runs on the owning worker thread; `can_write` flips once connected.
    pub fn connect(&self, endpoint: SocketAddr) {
        let mut data = self.data.write().expect("connection data lock poisoned");

        data.set_peer_endpoint(endpoint);
        data.set_connect_request();
    }

    /// Queues bytes onto the outgoing stream, returning how many were
    /// accepted. Zero means the stream buffer is full.
    pub fn send(&self, bytes: &[u8]) -> NetworkResult<usize> {
        let mut data = self.data.write().expect("connection data lock poisoned");

        if let Some(error) = data.exception() {
            return Err(NetworkError::Fatal(ErrorType::Io(error)));
        }

        if !data.can_write() {
            return Err(NetworkError::Wait);
        }

        Ok(data.send_buffer().write(bytes))
    }

    /// Drains bytes from the incoming stream, returning how many were read.
    pub fn receive(&self, out: &mut [u8]) -> NetworkResult<usize> {
        let mut data = self.data.write().expect("connection data lock poisoned");

        if let Some(error) = data.exception() {
            return Err(NetworkError::Fatal(ErrorType::Io(error)));
        }

        let count = data.receive_buffer().read(out);

        if data.receive_buffer().is_empty() {
            data.set_read(false);
            self.receive_event.reset();
        }

        Ok(count)
    }

    /// Requests an orderly close; the worker emits a reset and tears the
    /// connection down.
    pub fn close(&self) {
        self.data
            .write()
            .expect("connection data lock poisoned")
            .set_close_request();
    }

    pub fn is_suspended(&self) -> bool {
        self.data.read().expect("connection data lock poisoned").is_suspended()
    }

    pub fn can_read(&self) -> bool {
        self.data.read().expect("connection data lock poisoned").can_read()
    }

    pub fn can_write(&self) -> bool {
        self.data.read().expect("connection data lock poisoned").can_write()
    }

    pub fn exception(&self) -> Option<io::ErrorKind> {
        self.data.read().expect("connection data lock poisoned").exception()
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.data.read().expect("connection data lock poisoned").local_endpoint()
    }

    pub fn peer_endpoint(&self) -> Option<SocketAddr> {
        self.data.read().expect("connection data lock poisoned").peer_endpoint()
    }

    /// Event set when data becomes readable or the connection changes
    /// state. Reset once the receive buffer is drained.
    pub fn receive_event(&self) -> &Event {
        &self.receive_event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_event_set_reset() {
        let event = Event::new();

        assert!(!event.is_set());
        assert!(!event.wait(Duration::from_millis(1)));

        event.set();
        assert!(event.is_set());
        assert!(event.wait(Duration::from_millis(1)));

        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn test_event_wakes_waiter() {
        let event = Arc::new(Event::new());
        let waiter_event = event.clone();

        let waiter = thread::spawn(move || waiter_event.wait(Duration::from_secs(5)));

        event.set();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_socket_send_requires_writability() {
        let data: SharedConnectionData = Arc::new(RwLock::new(ConnectionData::new()));
        let socket = Socket::new(data.clone());

        assert_eq!(socket.send(b"hello"), Err(NetworkError::Wait));

        data.write().unwrap().set_write(true);
        assert_eq!(socket.send(b"hello"), Ok(5));
        assert_eq!(data.write().unwrap().send_buffer().len(), 5);
    }

    #[test]
    fn test_socket_receive_drains_and_resets_readiness() {
        let data: SharedConnectionData = Arc::new(RwLock::new(ConnectionData::new()));
        let socket = Socket::new(data.clone());

        {
            let mut inner = data.write().unwrap();
            inner.receive_buffer().write(b"abc");
            inner.set_read(true);
            inner.signal_receive_event();
        }

        let mut out = [0u8; 8];
        assert_eq!(socket.receive(&mut out), Ok(3));
        assert_eq!(&out[..3], b"abc");
        assert!(!socket.can_read());
        assert!(!socket.receive_event().is_set());
    }

    #[test]
    fn test_socket_surfaces_exception() {
        let data: SharedConnectionData = Arc::new(RwLock::new(ConnectionData::new()));
        let socket = Socket::new(data.clone());

        data.write().unwrap().set_exception(io::ErrorKind::TimedOut);

        assert_eq!(
            socket.send(b"x"),
            Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::TimedOut)))
        );

        let mut out = [0u8; 1];
        assert_eq!(
            socket.receive(&mut out),
            Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::TimedOut)))
        );
    }
}
