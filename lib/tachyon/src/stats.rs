use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of samples retained by the estimator rings.
const SAMPLE_CAPACITY: usize = 128;

/// A bounded sample ring that tracks whether new samples arrived since the
/// estimate was last recomputed.
struct RingList<T> {
    items: VecDeque<T>,
    capacity: usize,
    updated: bool,
}

impl<T> RingList<T> {
    fn new(capacity: usize) -> RingList<T> {
        RingList {
            items: VecDeque::with_capacity(capacity),
            capacity,
            updated: false,
        }
    }

    fn add(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }

        self.items.push_back(item);
        self.updated = true;
    }

    #[inline]
    fn is_updated(&self) -> bool {
        self.updated
    }

    /// Marks the current contents as consumed by the estimator.
    #[inline]
    fn expire(&mut self) {
        self.updated = false;
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    fn clear(&mut self) {
        self.items.clear();
        self.updated = false;
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// Online mean/variance accumulator (Welford).
struct OnlineVariance {
    count: f64,
    mean: f64,
    m2: f64,
}

impl OnlineVariance {
    fn new() -> OnlineVariance {
        OnlineVariance {
            count: 0.0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    fn add_sample(&mut self, sample: f64) {
        self.count += 1.0;
        let delta = sample - self.mean;
        self.mean += delta / self.count;
        self.m2 += delta * (sample - self.mean);
    }

    #[inline]
    fn mean(&self) -> f64 {
        self.mean
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2.0 {
            return 0.0;
        }

        (self.m2 / self.count).sqrt()
    }

    /// Lower acceptance bound for samples: one deviation below the mean.
    fn min_dev(&self) -> f64 {
        self.mean() - self.std_dev()
    }

    /// Upper acceptance bound for samples: one deviation above the mean.
    fn max_dev(&self) -> f64 {
        self.mean() + self.std_dev()
    }

    fn restart(&mut self) {
        self.count = 0.0;
        self.mean = 0.0;
        self.m2 = 0.0;
    }

    /// Exponentially weighted blend of the previous estimate and a new
    /// sample. A weight close to 1 makes the average immune to short-lived
    /// changes; close to 0 makes it respond quickly.
    #[inline]
    fn weighted_sample_update(old: f64, sample: f64, weight: f64) -> f64 {
        old * weight + sample * (1.0 - weight)
    }
}

/// Round-trip-time and send-window estimation for one connection.
///
/// RTT follows a filtered weighted average over the most recent samples; the
/// send window follows additive increase / multiplicative decrease in units
/// of MTU-sized segments, sampled once per RTT and smoothed the same way.
pub struct Statistics {
    rtt: Duration,
    rtt_variance: OnlineVariance,
    rtt_samples: RingList<Duration>,
    rtt_mtu_loss_count: f64,
    rtt_mtu_loss_factor: f64,
    last_loss_factor_time: Instant,

    mtu_start: bool,
    no_loss_yet: bool,
    no_loss_window_size: usize,
    last_loss_time: Instant,
    threshold_window_size: usize,
    mtu_window_size: usize,
    window_variance: OnlineVariance,
    window_samples: RingList<f64>,
    new_window_sample: f64,
    old_window_sample: f64,
    last_window_sample_time: Instant,
}

impl Statistics {
    pub const MIN_MTU_WINDOW_SIZE: usize = 1;

    const START_RTT: Duration = Duration::from_millis(600);
    const MIN_RTT: Duration = Duration::from_micros(1);
    const NO_LOSS_RESTART_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(now: Instant) -> Statistics {
        Statistics {
            rtt: Self::START_RTT,
            rtt_variance: OnlineVariance::new(),
            rtt_samples: RingList::new(SAMPLE_CAPACITY),
            rtt_mtu_loss_count: 0.0,
            rtt_mtu_loss_factor: 1.0,
            last_loss_factor_time: now,
            mtu_start: true,
            no_loss_yet: true,
            no_loss_window_size: Self::MIN_MTU_WINDOW_SIZE,
            last_loss_time: now,
            threshold_window_size: Self::MIN_MTU_WINDOW_SIZE,
            mtu_window_size: Self::MIN_MTU_WINDOW_SIZE,
            window_variance: OnlineVariance::new(),
            window_samples: RingList::new(SAMPLE_CAPACITY),
            new_window_sample: Self::MIN_MTU_WINDOW_SIZE as f64,
            old_window_sample: Self::MIN_MTU_WINDOW_SIZE as f64,
            last_window_sample_time: now,
        }
    }

    /// Timeout before an unacknowledged message is retransmitted. Larger
    /// than the RTT to avoid premature retransmission, and grows when more
    /// segments get lost.
    pub fn retransmission_timeout(&mut self) -> Duration {
        self.recalc_rtt();

        self.rtt.mul_f64(self.rtt_mtu_loss_factor * 2.0)
    }

    /// Records one round-trip sample, floored at the minimum RTT.
    pub fn record_rtt(&mut self, rtt: Duration) {
        let rtt = rtt.max(Self::MIN_RTT);

        self.rtt_variance.add_sample(rtt.as_nanos() as f64);
        self.rtt_samples.add(rtt);
    }

    fn recalc_rtt(&mut self) {
        // No new recorded samples
        if !self.rtt_samples.is_updated() {
            return;
        }

        let rtt_min = self.rtt_variance.min_dev();
        let rtt_max = self.rtt_variance.max_dev();

        let mut total_ns = 0.0f64;
        let mut total_count = 0.0f64;

        for sample in self.rtt_samples.iter() {
            let ns = sample.as_nanos() as f64;
            if rtt_min <= ns && ns <= rtt_max {
                total_ns += ns;
                total_count += 1.0;
            }
        }

        if total_count > 0.0 {
            let weight = if self.no_loss_yet { 0.5 } else { 0.95 };
            let sample = total_ns / total_count;
            let new_rtt =
                OnlineVariance::weighted_sample_update(self.rtt.as_nanos() as f64, sample, weight);

            self.rtt = Duration::from_nanos(new_rtt as u64).max(Self::MIN_RTT);
        }

        self.rtt_samples.expire();
    }

    /// Current send window in MTU-sized segments.
    pub fn mtu_window_size(&mut self) -> usize {
        self.recalc_mtu_window_size();

        self.mtu_window_size
    }

    /// Accounts acknowledged segments towards the window sample.
    pub fn record_mtu_ack(&mut self, num_mtu: f64) {
        if num_mtu == 0.0 {
            return;
        }

        if self.no_loss_yet {
            // Fast start
            self.new_window_sample += num_mtu;
        } else if self.new_window_sample < self.threshold_window_size as f64 {
            // Fast recovery
            self.new_window_sample += num_mtu;
        } else {
            self.new_window_sample += (1.0 / self.mtu_window_size as f64) * num_mtu;
        }
    }

    /// Accounts lost segments. A zero loss keeps the fast-start bookkeeping
    /// current; a non-zero loss halves the window sample per lost segment
    /// and feeds the RTO loss factor.
    pub fn record_mtu_loss(&mut self, num_mtu: f64, now: Instant) {
        if num_mtu == 0.0 {
            if self.no_loss_yet {
                self.no_loss_window_size = Self::MIN_MTU_WINDOW_SIZE.max(self.mtu_window_size / 2);
                self.threshold_window_size = self.no_loss_window_size;
            }

            return;
        }

        self.last_loss_time = now;

        self.new_window_sample /= 2.0f64.powf(num_mtu);

        if self.no_loss_yet {
            self.window_samples.clear();

            if self.mtu_start {
                self.window_variance.restart();
                self.mtu_window_size = Self::MIN_MTU_WINDOW_SIZE.max(self.mtu_window_size / 2);
                self.mtu_start = false;
            }

            self.no_loss_yet = false;
        }

        self.rtt_mtu_loss_count += num_mtu;
        if now.duration_since(self.last_loss_factor_time) >= self.rtt {
            self.rtt_mtu_loss_factor = 1.0 + (self.rtt_mtu_loss_count / self.mtu_window_size as f64);

            self.rtt_mtu_loss_count = 0.0;
            self.last_loss_factor_time = now;
        }
    }

    /// Samples the window estimator. Only records once per RTT so each
    /// sample covers a full round trip.
    pub fn record_mtu_window_stats(&mut self, now: Instant) {
        if self.old_window_sample != self.new_window_sample {
            let interval = if self.window_samples.is_full() {
                self.retransmission_timeout()
            } else {
                self.rtt
            };

            if now.duration_since(self.last_window_sample_time) >= interval {
                self.window_variance.add_sample(self.new_window_sample);
                self.window_samples.add(self.new_window_sample);

                self.threshold_window_size = self
                    .no_loss_window_size
                    .max((self.window_variance.mean() / 2.0) as usize);

                self.old_window_sample = self.new_window_sample;
                self.last_window_sample_time = now;
            }
        }

        if now.duration_since(self.last_loss_time) >= Self::NO_LOSS_RESTART_TIMEOUT {
            self.no_loss_yet = true;
        }
    }

    fn recalc_mtu_window_size(&mut self) {
        if !self.window_samples.is_updated() {
            return;
        }

        let wnd_min = self.window_variance.min_dev();
        let wnd_max = self.window_variance.max_dev();

        let mut total = 0.0f64;
        let mut total_count = 0.0f64;

        for &sample in self.window_samples.iter() {
            if wnd_min <= sample && sample <= wnd_max {
                total += sample;
                total_count += 1.0;
            }
        }

        if total_count > 0.0 {
            let weight = 0.95;
            let sample = total / total_count;
            let new_size =
                OnlineVariance::weighted_sample_update(self.mtu_window_size as f64, sample, weight)
                    .ceil() as usize;

            // Never go below minimum
            self.mtu_window_size = Self::MIN_MTU_WINDOW_SIZE.max(new_size);
        }

        self.window_samples.expire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_list_caps_length_and_tracks_updates() {
        let mut ring = RingList::new(4);

        for x in 0..6 {
            ring.add(x);
        }

        assert!(ring.is_full());
        assert!(ring.is_updated());
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4, 5]);

        ring.expire();
        assert!(!ring.is_updated());
    }

    #[test]
    fn test_online_variance() {
        let mut variance = OnlineVariance::new();

        for &x in &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            variance.add_sample(x);
        }

        assert!((variance.mean() - 5.0).abs() < 1e-9);
        assert!((variance.std_dev() - 2.0).abs() < 1e-9);
        assert!((variance.min_dev() - 3.0).abs() < 1e-9);
        assert!((variance.max_dev() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_rtt_is_floored() {
        let now = Instant::now();
        let mut stats = Statistics::new(now);

        for _ in 0..SAMPLE_CAPACITY {
            stats.record_rtt(Duration::from_nanos(1));
        }

        let rto = stats.retransmission_timeout();

        assert!(stats.rtt >= Statistics::MIN_RTT);
        assert!(rto >= stats.rtt * 2);
    }

    #[test]
    fn test_rtt_converges_towards_samples() {
        let now = Instant::now();
        let mut stats = Statistics::new(now);

        // Start estimate is 600ms; steady 10ms samples must pull it down.
        for _ in 0..64 {
            stats.record_rtt(Duration::from_millis(10));
        }
        let first = stats.retransmission_timeout();

        for _ in 0..64 {
            stats.record_rtt(Duration::from_millis(10));
        }
        let second = stats.retransmission_timeout();

        assert!(second < first);
        assert!(first < Statistics::START_RTT.mul_f64(2.0));
    }

    #[test]
    fn test_window_fast_start_counts_whole_segments() {
        let now = Instant::now();
        let mut stats = Statistics::new(now);

        stats.record_mtu_ack(3.0);
        assert!((stats.new_window_sample - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_loss_halves_sample_per_segment() {
        let now = Instant::now();
        let mut stats = Statistics::new(now);

        stats.record_mtu_ack(7.0);
        assert!((stats.new_window_sample - 8.0).abs() < 1e-9);

        stats.record_mtu_loss(2.0, now);
        assert!((stats.new_window_sample - 2.0).abs() < 1e-9);
        assert!(!stats.no_loss_yet);
    }

    #[test]
    fn test_window_returns_to_fast_start_after_quiet_period() {
        let now = Instant::now();
        let mut stats = Statistics::new(now);

        stats.record_mtu_loss(1.0, now);
        assert!(!stats.no_loss_yet);

        stats.record_mtu_window_stats(now + Statistics::NO_LOSS_RESTART_TIMEOUT);
        assert!(stats.no_loss_yet);
    }

    #[test]
    fn test_window_never_below_minimum() {
        let now = Instant::now();
        let mut stats = Statistics::new(now);

        stats.record_mtu_loss(16.0, now);
        stats.record_mtu_window_stats(now + Duration::from_secs(1));

        assert!(stats.mtu_window_size() >= Statistics::MIN_MTU_WINDOW_SIZE);
    }
}
