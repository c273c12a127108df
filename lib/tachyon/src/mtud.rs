use crate::keys::SymmetricKey;
use crate::message::{Message, SequenceNumber};
use crate::support::{NetworkResult, SendStatus};
use quark::logging::{debug, error, trace, Logger};
use rand::Rng;
use std::time::{Duration, Instant};

/// Candidate datagram sizes, strictly increasing.
///
/// RFC 791 requires IPv4 links to carry 576 octets with an IP header of up
/// to 60; RFC 8200 requires IPv6 links to carry 1280 octets with a fixed
/// header of 40. The ceiling is 65467 octets (65535 minus the 8 octet UDP
/// header and 60 octet IP header).
pub const MESSAGE_SIZES: [usize; 9] = [508, 1232, 1452, 2048, 4096, 8192, 16384, 32768, 65467];
pub const MIN_MESSAGE_SIZE: usize = MESSAGE_SIZES[0];
pub const MAX_MESSAGE_SIZE: usize = MESSAGE_SIZES[8];

const MIN_RETRANSMISSION_TIMEOUT: Duration = Duration::from_millis(600);
const MAX_NUM_RETRIES: u32 = 6;

/// Everything the discoverer needs from its connection: the key to encode
/// probes under, a way to put datagrams on the wire and control of the
/// socket's don't-fragment flag.
pub trait ProbeTransport {
    fn current_key(&self) -> &SymmetricKey;
    fn send(&mut self, data: &[u8], now: Instant) -> NetworkResult<SendStatus>;
    fn set_dont_fragment(&mut self, enabled: bool) -> bool;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MtudStatus {
    Start,
    Discovery,
    Finished,
    Failed,
}

enum TransmitOutcome {
    Success,
    MessageTooLarge,
    Failed,
}

struct ProbeData {
    /// Datagram size considered safe when this probe was created.
    confirmed_size: usize,
    /// A final probe re-confirms an already reached size; its ack ends
    /// discovery.
    is_final: bool,
    seqnum: SequenceNumber,
    num_tries: u32,
    time_sent: Instant,
    data: Vec<u8>,
    acked: bool,
}

/// Path-MTU discovery for one connection. Maintains a single outstanding
/// probe, climbing the size ladder until a probe is refused by the network
/// or the ceiling is reached.
pub struct MtuDiscovery {
    log: Logger,
    status: MtudStatus,
    probe: Option<ProbeData>,
    maximum_message_size: usize,
    current_size_index: usize,
    retransmission_timeout: Duration,
    start_time: Instant,
    start_delay: Duration,
}

impl MtuDiscovery {
    /// The start is delayed by a random fraction of `max_start_delay` to
    /// make traffic analysis harder.
    pub fn new(log: Logger, max_start_delay: Duration, now: Instant) -> MtuDiscovery {
        let start_delay = if max_start_delay > Duration::ZERO {
            max_start_delay.mul_f64(rand::thread_rng().gen::<f64>())
        } else {
            Duration::ZERO
        };

        MtuDiscovery {
            log,
            status: MtudStatus::Start,
            probe: None,
            maximum_message_size: MIN_MESSAGE_SIZE,
            current_size_index: 0,
            retransmission_timeout: MIN_RETRANSMISSION_TIMEOUT,
            start_time: now,
            start_delay,
        }
    }

    /// The largest datagram size confirmed so far.
    #[inline]
    pub fn max_message_size(&self) -> usize {
        self.maximum_message_size
    }

    #[inline]
    pub fn status(&self) -> MtudStatus {
        self.status
    }

    /// Drives the state machine one step. Returns the current status;
    /// `Finished` and `Failed` are terminal and release the socket's
    /// don't-fragment flag.
    pub fn process<T: ProbeTransport>(&mut self, transport: &mut T, now: Instant) -> MtudStatus {
        if self.status == MtudStatus::Start && now < self.start_time + self.start_delay {
            return MtudStatus::Start;
        }

        match self.status {
            MtudStatus::Start => {
                self.maximum_message_size = MIN_MESSAGE_SIZE;
                self.current_size_index = 1;

                // Without fragmentation, probes larger than the path MTU
                // get dropped or refused instead of silently split
                if transport.set_dont_fragment(true) {
                    trace!(self.log, "starting mtu discovery");

                    self.status = self.create_and_transmit(
                        transport,
                        MIN_MESSAGE_SIZE,
                        MESSAGE_SIZES[self.current_size_index],
                        false,
                        now,
                    );
                } else {
                    error!(self.log, "failed to enable the don't-fragment socket option");
                    self.status = MtudStatus::Failed;
                }
            }
            MtudStatus::Discovery => {
                let (acked, timed_out, retries_spent, is_final) = {
                    let probe = self.probe.as_ref().expect("probe must exist in discovery");
                    (
                        probe.acked,
                        now.duration_since(probe.time_sent) >= self.retransmission_timeout,
                        probe.num_tries >= MAX_NUM_RETRIES,
                        probe.is_final,
                    )
                };

                if !acked && timed_out {
                    if retries_spent {
                        if !is_final {
                            let size = MESSAGE_SIZES[self.current_size_index - 1];
                            self.status = self.create_and_transmit(transport, size, size, true, now);
                        } else {
                            // Stop retrying
                            self.status = MtudStatus::Finished;
                        }
                    } else {
                        // Retry transmission and see if we get an ack
                        let outcome = self.transmit(transport, now);
                        self.status = self.handle_transmit_outcome(transport, outcome, now);
                    }
                } else if acked {
                    if is_final {
                        // Reached the largest size this path will carry
                        self.status = MtudStatus::Finished;
                    } else if self.current_size_index == MESSAGE_SIZES.len() - 1 {
                        let size = MESSAGE_SIZES[self.current_size_index];
                        self.status = self.create_and_transmit(transport, size, size, true, now);
                    } else {
                        // Create and send a bigger probe
                        self.current_size_index += 1;
                        self.status = self.create_and_transmit(
                            transport,
                            MESSAGE_SIZES[self.current_size_index - 1],
                            MESSAGE_SIZES[self.current_size_index],
                            false,
                            now,
                        );
                    }
                }
            }
            MtudStatus::Finished | MtudStatus::Failed => {}
        }

        if matches!(self.status, MtudStatus::Finished | MtudStatus::Failed) {
            if self.status == MtudStatus::Failed {
                error!(self.log, "mtu discovery failed";
                       "max_message_size" => self.maximum_message_size);
            } else {
                debug!(self.log, "mtu discovery finished";
                       "max_message_size" => self.maximum_message_size);
            }

            if !transport.set_dont_fragment(false) {
                error!(self.log, "failed to disable the don't-fragment socket option");
            }
        }

        self.status
    }

    /// Handles an MTUD ack from the peer; confirms the outstanding probe
    /// when the sequence numbers match.
    pub fn process_received_ack(&mut self, acknum: SequenceNumber, now: Instant) {
        if self.status != MtudStatus::Discovery {
            return;
        }

        let probe = match self.probe.as_mut() {
            Some(probe) => probe,
            None => return,
        };

        if probe.seqnum == acknum {
            self.retransmission_timeout =
                MIN_RETRANSMISSION_TIMEOUT.max(now.duration_since(probe.time_sent));
            probe.acked = true;
            self.maximum_message_size = probe.confirmed_size;
        }
    }

    fn create_and_transmit<T: ProbeTransport>(
        &mut self,
        transport: &mut T,
        confirmed_size: usize,
        probe_size: usize,
        is_final: bool,
        now: Instant,
    ) -> MtudStatus {
        if !self.create_probe(transport, confirmed_size, probe_size, is_final, now) {
            return MtudStatus::Failed;
        }

        let outcome = self.transmit(transport, now);
        self.handle_transmit_outcome(transport, outcome, now)
    }

    fn create_probe<T: ProbeTransport>(
        &mut self,
        transport: &mut T,
        confirmed_size: usize,
        probe_size: usize,
        is_final: bool,
        now: Instant,
    ) -> bool {
        let mut rng = rand::thread_rng();

        // Randomize the payload size between the confirmed size and the
        // probe ceiling so probe lengths don't betray the ladder position
        let max_payload = Message::max_data_size(probe_size);
        let payload_size = if max_payload > confirmed_size {
            rng.gen_range(confirmed_size..=max_payload)
        } else {
            max_payload
        };

        let mut payload = vec![0u8; payload_size];
        rng.fill(&mut payload[..]);

        let message = Message::mtud_probe(rng.gen(), payload);
        let seqnum = message.seqnum().expect("probe carries a sequence number");

        match message.write(probe_size, transport.current_key()) {
            Ok(data) => {
                self.probe = Some(ProbeData {
                    confirmed_size,
                    is_final,
                    seqnum,
                    num_tries: 0,
                    time_sent: now,
                    data,
                    acked: false,
                });

                true
            }
            Err(err) => {
                error!(self.log, "failed to create probe";
                       "probe_size" => probe_size,
                       "error" => ?err);

                false
            }
        }
    }

    fn transmit<T: ProbeTransport>(&mut self, transport: &mut T, now: Instant) -> TransmitOutcome {
        let probe = self.probe.as_mut().expect("probe must have been created");

        trace!(self.log, "sending probe";
               "size" => probe.data.len(),
               "tries" => probe.num_tries);

        match transport.send(&probe.data, now) {
            Ok(SendStatus::Sent) => {
                // We'll wait for an ack or else continue trying
                probe.time_sent = now;
                probe.num_tries += 1;

                TransmitOutcome::Success
            }
            Ok(SendStatus::Deferred) => {
                // Buffer temporarily full; the retransmission timer will
                // try again
                TransmitOutcome::Success
            }
            Ok(SendStatus::TooLarge) => {
                // Expected at some point once probes exceed the path MTU
                trace!(self.log, "probe exceeds path mtu"; "size" => probe.data.len());

                TransmitOutcome::MessageTooLarge
            }
            Err(err) => {
                error!(self.log, "failed to send probe";
                       "size" => probe.data.len(),
                       "error" => ?err);

                TransmitOutcome::Failed
            }
        }
    }

    fn handle_transmit_outcome<T: ProbeTransport>(
        &mut self,
        transport: &mut T,
        outcome: TransmitOutcome,
        now: Instant,
    ) -> MtudStatus {
        match outcome {
            TransmitOutcome::Success => MtudStatus::Discovery,
            TransmitOutcome::MessageTooLarge => {
                let is_final = self.probe.as_ref().map(|probe| probe.is_final).unwrap_or(true);

                if !is_final {
                    let size = MESSAGE_SIZES[self.current_size_index - 1];
                    self.create_and_transmit(transport, size, size, true, now)
                } else {
                    MtudStatus::Finished
                }
            }
            TransmitOutcome::Failed => MtudStatus::Failed,
        }
    }
}

/// Replies to a received probe with a minimal MTUD ack carrying the probe's
/// sequence number.
pub fn send_probe_ack<T: ProbeTransport>(
    transport: &mut T,
    log: &Logger,
    seqnum: SequenceNumber,
    now: Instant,
) {
    let message = Message::mtud_ack(seqnum);

    match message.write(MIN_MESSAGE_SIZE, transport.current_key()) {
        Ok(data) => {
            if transport.send(&data, now).is_err() {
                error!(log, "failed to send probe ack"; "acknum" => seqnum);
            }
        }
        Err(err) => {
            error!(log, "failed to encode probe ack"; "error" => ?err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeySlots;
    use quark::logging;

    /// Transport whose network accepts datagrams up to a configured size.
    struct MockTransport {
        keys: KeySlots,
        path_mtu: usize,
        dont_fragment: bool,
        sent: Vec<Vec<u8>>,
    }

    impl MockTransport {
        fn new(path_mtu: usize) -> MockTransport {
            MockTransport {
                keys: KeySlots::new(b""),
                path_mtu,
                dont_fragment: false,
                sent: Vec::new(),
            }
        }

        fn last_probe_seqnum(&self) -> SequenceNumber {
            let wire = self.sent.last().unwrap();
            Message::read(wire, &self.keys).unwrap().seqnum().unwrap()
        }
    }

    impl ProbeTransport for MockTransport {
        fn current_key(&self) -> &SymmetricKey {
            self.keys.current()
        }

        fn send(&mut self, data: &[u8], _now: Instant) -> NetworkResult<SendStatus> {
            if self.dont_fragment && data.len() > self.path_mtu {
                return Ok(SendStatus::TooLarge);
            }

            self.sent.push(data.to_vec());
            Ok(SendStatus::Sent)
        }

        fn set_dont_fragment(&mut self, enabled: bool) -> bool {
            self.dont_fragment = enabled;
            true
        }
    }

    fn run_to_completion(discovery: &mut MtuDiscovery, transport: &mut MockTransport) -> usize {
        let mut now = Instant::now();

        for _ in 0..256 {
            match discovery.status() {
                MtudStatus::Finished | MtudStatus::Failed => break,
                _ => {}
            }

            discovery.process(transport, now);

            // Ack whatever probe is outstanding, as a cooperating peer would
            if discovery.status() == MtudStatus::Discovery && !transport.sent.is_empty() {
                let seqnum = transport.last_probe_seqnum();
                discovery.process_received_ack(seqnum, now + Duration::from_millis(5));
            }

            now += Duration::from_millis(10);
        }

        discovery.max_message_size()
    }

    #[test]
    fn test_ladder_stops_at_path_mtu() {
        let mut transport = MockTransport::new(2048);
        let mut discovery = MtuDiscovery::new(logging::discard(), Duration::ZERO, Instant::now());

        let confirmed = run_to_completion(&mut discovery, &mut transport);

        assert_eq!(discovery.status(), MtudStatus::Finished);
        assert_eq!(confirmed, 2048);
        assert!(!transport.dont_fragment);
    }

    #[test]
    fn test_ladder_reaches_ceiling_on_clean_path() {
        let mut transport = MockTransport::new(usize::MAX);
        let mut discovery = MtuDiscovery::new(logging::discard(), Duration::ZERO, Instant::now());

        let confirmed = run_to_completion(&mut discovery, &mut transport);

        assert_eq!(discovery.status(), MtudStatus::Finished);
        assert_eq!(confirmed, MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_unanswered_probe_retries_then_finishes() {
        let mut transport = MockTransport::new(usize::MAX);
        let mut discovery = MtuDiscovery::new(logging::discard(), Duration::ZERO, Instant::now());

        let mut now = Instant::now();
        discovery.process(&mut transport, now);
        assert_eq!(discovery.status(), MtudStatus::Discovery);

        // Nobody ever acks; the prober retries, falls back to a final probe
        // at the confirmed rung and gives up on that too
        for _ in 0..64 {
            now += Duration::from_secs(2);
            discovery.process(&mut transport, now);

            if discovery.status() == MtudStatus::Finished {
                break;
            }
        }

        assert_eq!(discovery.status(), MtudStatus::Finished);
        assert_eq!(discovery.max_message_size(), MIN_MESSAGE_SIZE);
    }

    #[test]
    fn test_start_delay_defers_probing() {
        let mut transport = MockTransport::new(usize::MAX);
        let now = Instant::now();
        let mut discovery = MtuDiscovery::new(logging::discard(), Duration::from_secs(60), now);
        discovery.start_delay = Duration::from_secs(30);

        assert_eq!(discovery.process(&mut transport, now), MtudStatus::Start);
        assert!(transport.sent.is_empty());

        assert_eq!(
            discovery.process(&mut transport, now + Duration::from_secs(31)),
            MtudStatus::Discovery
        );
        assert!(!transport.sent.is_empty());
    }

    #[test]
    fn test_ack_with_wrong_seqnum_is_ignored() {
        let mut transport = MockTransport::new(usize::MAX);
        let now = Instant::now();
        let mut discovery = MtuDiscovery::new(logging::discard(), Duration::ZERO, now);

        discovery.process(&mut transport, now);
        let seqnum = transport.last_probe_seqnum();

        discovery.process_received_ack(seqnum.wrapping_add(1), now);
        assert!(!discovery.probe.as_ref().unwrap().acked);

        discovery.process_received_ack(seqnum, now);
        assert!(discovery.probe.as_ref().unwrap().acked);
    }

    #[test]
    fn test_probe_ack_is_minimal_and_echoes_seqnum() {
        let mut transport = MockTransport::new(usize::MAX);
        let log = logging::discard();

        send_probe_ack(&mut transport, &log, 4242, Instant::now());

        let wire = transport.sent.last().unwrap();
        assert!(wire.len() <= MIN_MESSAGE_SIZE);

        let message = Message::read(wire, &transport.keys).unwrap();
        assert_eq!(message.acknum(), Some(4242));
        assert_eq!(message.seqnum(), None);
    }
}
