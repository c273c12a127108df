use crate::message::{AckRange, MessageType, SequenceNumber};
use crate::mtud;
use crate::stats::Statistics;
use crate::support::{NetworkResult, SendStatus};
use crate::window::next_seqnum;
use quark::logging::{debug, trace, Logger};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Lower bound on the receive window in items.
pub const MIN_RECEIVE_WINDOW_ITEMS: usize = 128;
/// Upper bound on the receive window in items: half the sequence space.
pub const MAX_RECEIVE_WINDOW_ITEMS: usize = SequenceNumber::MAX as usize / 2;
/// Upper bound on the receive window in bytes.
pub const MAX_RECEIVE_WINDOW_BYTES: usize = 1 << 20;

/// Sink for encoded datagrams; implemented by the connection's channel so
/// the queue stays free of socket and listener plumbing.
pub trait Transmit {
    fn transmit(&mut self, message_type: MessageType, data: &[u8], now: Instant) -> NetworkResult<SendStatus>;
}

/// One sequenced message awaiting acknowledgement. `data` holds the encoded
/// datagram, so retransmissions resend the exact bytes that were originally
/// put on the wire.
pub struct Item {
    pub message_type: MessageType,
    pub seqnum: SequenceNumber,
    pub num_tries: u32,
    pub time_sent: Instant,
    pub time_resent: Instant,
    pub data: Vec<u8>,
    pub acked: bool,
    pub time_acked: Option<Instant>,
}

/// Reliability bookkeeping for one direction of a connection: sequencing,
/// retransmission, selective acknowledgement and flow control.
pub struct SendQueue {
    log: Logger,
    queue: VecDeque<Item>,
    num_bytes_in_queue: usize,
    stats: Statistics,

    next_send_seqnum: SequenceNumber,
    last_in_order_acked: Option<SequenceNumber>,

    max_message_size: usize,

    peer_adv_window_items: usize,
    peer_adv_window_bytes: usize,
    peer_window_items: usize,
}

impl SendQueue {
    pub fn new(log: Logger, now: Instant) -> SendQueue {
        SendQueue {
            log,
            queue: VecDeque::new(),
            num_bytes_in_queue: 0,
            stats: Statistics::new(now),
            next_send_seqnum: rand::random(),
            last_in_order_acked: None,
            max_message_size: mtud::MIN_MESSAGE_SIZE,
            peer_adv_window_items: MIN_RECEIVE_WINDOW_ITEMS,
            peer_adv_window_bytes: MIN_RECEIVE_WINDOW_ITEMS * mtud::MIN_MESSAGE_SIZE,
            peer_window_items: MIN_RECEIVE_WINDOW_ITEMS,
        }
    }

    pub fn set_max_message_size(&mut self, size: usize) {
        self.max_message_size = size;

        self.recalc_peer_receive_window();
    }

    /// A message may not be larger than the peer is willing to receive.
    #[inline]
    pub fn max_message_size(&self) -> usize {
        self.peer_adv_window_bytes.min(self.max_message_size)
    }

    pub fn set_peer_advertised_window(&mut self, num_items: usize, num_bytes: usize) {
        self.peer_adv_window_items = num_items;
        self.peer_adv_window_bytes = num_bytes;

        self.recalc_peer_receive_window();
    }

    #[inline]
    pub fn next_send_seqnum(&self) -> SequenceNumber {
        self.next_send_seqnum
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn num_bytes_in_queue(&self) -> usize {
        self.num_bytes_in_queue
    }

    /// Appends a sequenced message, transmitting it immediately on a best
    /// effort basis, and advances the send sequence number.
    pub fn add(&mut self, mut item: Item, channel: &mut dyn Transmit) -> NetworkResult<()> {
        let status = channel.transmit(item.message_type, &item.data, item.time_sent)?;
        if status == SendStatus::Sent {
            item.num_tries = 1;
        }

        self.num_bytes_in_queue += item.data.len();
        self.queue.push_back(item);

        self.next_send_seqnum = next_seqnum(self.next_send_seqnum);

        Ok(())
    }

    /// Retransmission scan: resends every item whose timeout has elapsed,
    /// front to back, then feeds the observed loss to the window estimator.
    pub fn process(
        &mut self,
        now: Instant,
        rto_override: Option<Duration>,
        channel: &mut dyn Transmit,
    ) -> NetworkResult<()> {
        if self.queue.is_empty() {
            return Ok(());
        }

        let rto = match rto_override {
            Some(timeout) => timeout,
            None => self.stats.retransmission_timeout(),
        };

        let mut loss_bytes = 0usize;

        for item in self.queue.iter_mut() {
            if item.num_tries == 0 || now.duration_since(item.time_resent) >= rto * item.num_tries {
                if item.num_tries > 0 {
                    trace!(self.log, "retransmitting message";
                           "seqnum" => item.seqnum,
                           "tries" => item.num_tries);

                    loss_bytes += item.data.len();
                }

                match channel.transmit(item.message_type, &item.data, now)? {
                    SendStatus::Sent => {
                        // We'll wait for an ack or else continue sending
                        item.time_resent = now;
                        item.num_tries += 1;
                    }
                    _ => {
                        // Buffer temporarily full; we'll try again later
                        break;
                    }
                }
            }
        }

        let max_message_size = self.max_message_size();
        self.stats
            .record_mtu_loss(loss_bytes as f64 / max_message_size as f64, now);
        self.stats.record_mtu_window_stats(now);

        Ok(())
    }

    /// Byte budget currently available to new messages: the congestion
    /// window less the bytes already in flight, zero once the peer's item
    /// limit is reached.
    pub fn available_window(&mut self) -> usize {
        if self.queue.len() >= self.peer_window_items {
            return 0;
        }

        let window = self.send_window_bytes();
        if window > self.num_bytes_in_queue {
            window - self.num_bytes_in_queue
        } else {
            0
        }
    }

    /// Handles the cumulative acknowledgement carried by any message with
    /// the ack flag: every queued item up to `seqnum` is acknowledged.
    pub fn process_in_order_ack(&mut self, seqnum: SequenceNumber, now: Instant) {
        if self.last_in_order_acked == Some(seqnum) {
            return;
        }

        self.last_in_order_acked = Some(seqnum);

        let position = match self.queue.iter().position(|item| item.seqnum == seqnum) {
            Some(position) => position,
            None => return,
        };

        let mut acked_any = false;
        let mut num_bytes = 0usize;

        for index in 0..=position {
            let item = &mut self.queue[index];

            if item.num_tries > 0 && !item.acked {
                num_bytes += item.data.len();
                acked_any = true;

                Self::ack_item(&mut self.stats, item, now);
            }
        }

        let max_message_size = self.max_message_size();
        self.stats.record_mtu_ack(num_bytes as f64 / max_message_size as f64);

        if acked_any {
            self.purge_acked();
        }
    }

    /// Handles the selectively acknowledged ranges of an EAck message.
    pub fn process_ack_ranges(&mut self, ranges: &[AckRange], now: Instant) {
        let mut acked_any = false;
        let mut num_bytes = 0usize;

        for range in ranges {
            let mut seqnum = range.begin;
            loop {
                if let Some((acked, size)) = self.ack_sent_message(seqnum, now) {
                    if acked {
                        num_bytes += size;
                        acked_any = true;
                    }
                }

                if seqnum == range.end || seqnum == SequenceNumber::MAX {
                    break;
                }
                seqnum += 1;
            }
        }

        let max_message_size = self.max_message_size();
        self.stats.record_mtu_ack(num_bytes as f64 / max_message_size as f64);

        if acked_any {
            self.purge_acked();
        }
    }

    /// Drops everything in flight. Used when a cookie challenge forces the
    /// handshake to start over.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.num_bytes_in_queue = 0;
    }

    fn ack_sent_message(&mut self, seqnum: SequenceNumber, now: Instant) -> Option<(bool, usize)> {
        let item = self.queue.iter_mut().find(|item| item.seqnum == seqnum)?;

        debug!(self.log, "received ack"; "seqnum" => seqnum);

        if !item.acked {
            let size = item.data.len();
            Self::ack_item(&mut self.stats, item, now);

            return Some((true, size));
        }

        Some((false, 0))
    }

    fn ack_item(stats: &mut Statistics, item: &mut Item, now: Instant) {
        item.acked = true;
        item.time_acked = Some(now);

        // Per Karn's algorithm only samples from items that were never
        // retransmitted enter the RTT estimate
        if item.num_tries == 1 {
            stats.record_rtt(now.duration_since(item.time_sent));
        }
    }

    /// Removes the longest acknowledged prefix to make room for new
    /// messages in the send window.
    fn purge_acked(&mut self) {
        while let Some(item) = self.queue.front() {
            if !item.acked {
                break;
            }

            self.num_bytes_in_queue -= item.data.len();
            self.queue.pop_front();
        }
    }

    fn recalc_peer_receive_window(&mut self) {
        let window = MIN_RECEIVE_WINDOW_ITEMS.max(self.peer_adv_window_bytes / self.max_message_size());
        self.peer_window_items = window.min(self.peer_adv_window_items);
    }

    fn send_window_bytes(&mut self) -> usize {
        let max_message_size = self.max_message_size();

        (self.stats.mtu_window_size() * max_message_size).min(self.peer_adv_window_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quark::logging;
    use std::cell::RefCell;

    /// Transmitter that records every datagram and answers with a scripted
    /// status.
    struct MockChannel {
        sent: RefCell<Vec<(MessageType, usize)>>,
        status: SendStatus,
    }

    impl MockChannel {
        fn new() -> MockChannel {
            MockChannel {
                sent: RefCell::new(Vec::new()),
                status: SendStatus::Sent,
            }
        }

        fn deferred() -> MockChannel {
            MockChannel {
                sent: RefCell::new(Vec::new()),
                status: SendStatus::Deferred,
            }
        }
    }

    impl Transmit for MockChannel {
        fn transmit(&mut self, message_type: MessageType, data: &[u8], _now: Instant) -> NetworkResult<SendStatus> {
            self.sent.borrow_mut().push((message_type, data.len()));
            Ok(self.status)
        }
    }

    fn make_item(seqnum: SequenceNumber, size: usize, now: Instant) -> Item {
        Item {
            message_type: MessageType::Data,
            seqnum,
            num_tries: 0,
            time_sent: now,
            time_resent: now,
            data: vec![0; size],
            acked: false,
            time_acked: None,
        }
    }

    fn queue_with_items(seqnums: &[SequenceNumber], size: usize, now: Instant) -> (SendQueue, MockChannel) {
        let mut queue = SendQueue::new(logging::discard(), now);
        let mut channel = MockChannel::new();

        for &seqnum in seqnums {
            queue.add(make_item(seqnum, size, now), &mut channel).unwrap();
        }

        (queue, channel)
    }

    #[test]
    fn test_add_sends_and_advances_seqnum() {
        let now = Instant::now();
        let mut queue = SendQueue::new(logging::discard(), now);
        let mut channel = MockChannel::new();

        let first = queue.next_send_seqnum();
        queue.add(make_item(first, 100, now), &mut channel).unwrap();

        assert_eq!(queue.next_send_seqnum(), next_seqnum(first));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.num_bytes_in_queue(), 100);
        assert_eq!(channel.sent.borrow().len(), 1);
    }

    #[test]
    fn test_add_on_full_buffer_keeps_item_unsent() {
        let now = Instant::now();
        let mut queue = SendQueue::new(logging::discard(), now);
        let mut channel = MockChannel::deferred();

        queue.add(make_item(1, 100, now), &mut channel).unwrap();

        assert_eq!(queue.queue[0].num_tries, 0);
    }

    #[test]
    fn test_in_order_ack_purges_prefix() {
        let now = Instant::now();
        let (mut queue, _channel) = queue_with_items(&[1, 2, 3, 4, 5], 1000, now);

        queue.process_in_order_ack(3, now + Duration::from_millis(10));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.num_bytes_in_queue(), 2000);
        assert!(queue.queue.iter().all(|item| !item.acked));
    }

    #[test]
    fn test_in_order_ack_is_idempotent() {
        let now = Instant::now();
        let (mut queue, _channel) = queue_with_items(&[1, 2, 3], 100, now);

        queue.process_in_order_ack(2, now);
        let remaining = queue.len();

        queue.process_in_order_ack(2, now);
        assert_eq!(queue.len(), remaining);
    }

    #[test]
    fn test_selective_ack_leaves_gap_unacked() {
        let now = Instant::now();
        let (mut queue, _channel) = queue_with_items(&[1, 2, 3, 4, 5], 1000, now);

        // Cumulative ack covers 1..=2; 3 was lost, 4..=5 arrived
        queue.process_in_order_ack(2, now);
        queue.process_ack_ranges(&[AckRange { begin: 4, end: 5 }], now);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.queue[0].seqnum, 3);
        assert!(!queue.queue[0].acked);
        assert!(queue.queue[1].acked);
        assert!(queue.queue[2].acked);
        assert_eq!(queue.num_bytes_in_queue(), 3000);
    }

    #[test]
    fn test_selective_ack_then_cumulative_purges_everything() {
        let now = Instant::now();
        let (mut queue, _channel) = queue_with_items(&[1, 2, 3, 4, 5], 1000, now);

        queue.process_ack_ranges(&[AckRange { begin: 4, end: 5 }], now);
        queue.process_in_order_ack(5, now);

        assert_eq!(queue.len(), 0);
        assert_eq!(queue.num_bytes_in_queue(), 0);
    }

    #[test]
    fn test_ack_range_wraps_at_sequence_max() {
        let now = Instant::now();
        let (mut queue, _channel) = queue_with_items(&[SequenceNumber::MAX], 100, now);

        // A range ending at the numeric maximum must not loop forever
        queue.process_ack_ranges(
            &[AckRange {
                begin: SequenceNumber::MAX,
                end: SequenceNumber::MAX,
            }],
            now,
        );

        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_retransmission_after_timeout() {
        let now = Instant::now();
        let (mut queue, mut channel) = queue_with_items(&[1], 100, now);

        assert_eq!(channel.sent.borrow().len(), 1);

        // Well before any plausible timeout nothing is resent
        queue.process(now, Some(Duration::from_secs(1)), &mut channel).unwrap();
        assert_eq!(channel.sent.borrow().len(), 1);

        queue
            .process(now + Duration::from_secs(2), Some(Duration::from_secs(1)), &mut channel)
            .unwrap();
        assert_eq!(channel.sent.borrow().len(), 2);
        assert_eq!(queue.queue[0].num_tries, 2);
    }

    #[test]
    fn test_retransmission_backs_off_linearly_with_tries() {
        let now = Instant::now();
        let (mut queue, mut channel) = queue_with_items(&[1], 100, now);
        let rto = Duration::from_secs(1);

        let t1 = now + Duration::from_secs(2);
        queue.process(t1, Some(rto), &mut channel).unwrap();
        assert_eq!(queue.queue[0].num_tries, 2);

        // Second retry waits rto * 2
        queue.process(t1 + Duration::from_secs(1), Some(rto), &mut channel).unwrap();
        assert_eq!(queue.queue[0].num_tries, 2);

        queue.process(t1 + Duration::from_secs(2), Some(rto), &mut channel).unwrap();
        assert_eq!(queue.queue[0].num_tries, 3);
    }

    #[test]
    fn test_available_window_zero_at_item_limit() {
        let now = Instant::now();
        let mut queue = SendQueue::new(logging::discard(), now);
        let mut channel = MockChannel::new();

        queue.set_peer_advertised_window(2, 1 << 20);

        for seqnum in 0..2 {
            queue.add(make_item(seqnum, 100, now), &mut channel).unwrap();
        }

        assert_eq!(queue.available_window(), 0);
    }

    #[test]
    fn test_available_window_decreases_with_queued_bytes() {
        let now = Instant::now();
        let mut queue = SendQueue::new(logging::discard(), now);
        let mut channel = MockChannel::new();

        queue.set_peer_advertised_window(1024, 1 << 20);

        let before = queue.available_window();
        queue.add(make_item(1, 400, now), &mut channel).unwrap();

        assert_eq!(queue.available_window(), before.saturating_sub(400));
    }

    #[test]
    fn test_reset_clears_queue() {
        let now = Instant::now();
        let (mut queue, _channel) = queue_with_items(&[1, 2, 3], 100, now);

        queue.reset();

        assert_eq!(queue.len(), 0);
        assert_eq!(queue.num_bytes_in_queue(), 0);
    }
}
