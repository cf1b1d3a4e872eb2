//! Per-(peer, session) receive state: sequence tracking, gap detection,
//! NAK scheduling and in-order release.
//!
//! The tracker is a pure state machine - it performs no I/O and takes the
//! current time as a parameter. Each entry point returns a [`TrackerOutput`]
//! describing what the caller (the bus receive task) must do: dispatch
//! deliveries in order, announce permanently lost ranges, send NAKs.
//!
//! Wire sequence numbers are 32 bit and wrap; internally every sequence is
//! unwrapped onto a monotonic `u64` axis anchored at the next expected
//! sequence, so the ordered maps stay meaningful across the wrap. A packet
//! more than a quarter of the sequence space away from the expected position
//! is treated as a session reset.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::BusConfig;
use crate::seq::{Seq, SeqRange};

const OUT_OF_WINDOW: u32 = 1 << 30;

/// Sequence numbering starts here for every fresh session, so receivers can
/// detect loss of the initial packets.
pub const FIRST_SEQ: Seq = Seq::from_raw(1);

/// An undelivered DATA packet, payload still as carried on the wire.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct HeldData {
    pub topic: String,
    pub payload: Vec<u8>,
    pub encrypted: bool,
}

#[derive(Debug)]
pub struct Deliverable {
    pub sequence: Seq,
    pub data: HeldData,
}

/// What the caller must act on after feeding the tracker. `lost` ranges are
/// announced before `deliveries` are dispatched, so that skipped sequences
/// are explained to the subscriber in stream order.
#[derive(Debug, Default)]
pub struct TrackerOutput {
    pub deliveries: Vec<Deliverable>,
    pub lost: Option<Vec<SeqRange>>,
    pub nak_ranges: Vec<SeqRange>,
    pub duplicate: bool,
}

struct MissingSeq {
    next_nak_at: Instant,
    nak_count: u32,
    deadline: Instant,
}

impl MissingSeq {
    fn new(now: Instant, config: &BusConfig) -> MissingSeq {
        MissingSeq {
            next_nak_at: now + config.nak_initial_delay,
            nak_count: 0,
            deadline: now + config.nak_deadline,
        }
    }
}

pub struct PeerTracker {
    config: Arc<BusConfig>,
    /// datagram source of the most recent packet, target for unicast NAKs
    pub addr: SocketAddr,
    pub last_heard: Instant,

    /// next in-order sequence awaited, on the unwrapped axis; never decreases
    expected: u64,
    /// out-of-order packets held until the gap before them closes
    pending: BTreeMap<u64, HeldData>,
    /// sequences known missing but still recoverable, with NAK timing state
    missing: BTreeMap<u64, MissingSeq>,
}

impl PeerTracker {
    pub fn new(config: Arc<BusConfig>, addr: SocketAddr, now: Instant) -> PeerTracker {
        PeerTracker {
            config,
            addr,
            last_heard: now,
            expected: FIRST_SEQ.to_raw() as u64,
            pending: BTreeMap::new(),
            missing: BTreeMap::new(),
        }
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.duration_since(self.last_heard) >= self.config.peer_idle_timeout
    }

    fn wire(ext: u64) -> Seq {
        Seq::from_raw(ext as u32)
    }

    /// The sequence one past the highest known (received or missing) packet.
    fn high_water(&self) -> u64 {
        let pending = self.pending.last_key_value().map(|(&k, _)| k + 1).unwrap_or(self.expected);
        let missing = self.missing.last_key_value().map(|(&k, _)| k + 1).unwrap_or(self.expected);
        self.expected.max(pending).max(missing)
    }

    pub fn on_data(&mut self, sequence: Seq, data: HeldData, addr: SocketAddr, now: Instant) -> TrackerOutput {
        self.last_heard = now;
        self.addr = addr;

        let diff = sequence.diff(Seq::from_raw(self.expected as u32));
        if diff.unsigned_abs() > OUT_OF_WINDOW {
            debug!("packet #{} is out of window (expected #{}) - treating as session reset", sequence, self.expected);
            self.pending.clear();
            self.missing.clear();
            self.expected = sequence.to_raw() as u64 + 1;
            return TrackerOutput {
                deliveries: vec![Deliverable { sequence, data }],
                ..TrackerOutput::default()
            };
        }

        let ext = self.expected as i64 + diff as i64;
        if ext < self.expected as i64 {
            trace!("packet #{} is a duplicate of an already-released sequence - dropping", sequence);
            return TrackerOutput { duplicate: true, ..TrackerOutput::default() };
        }
        let ext = ext as u64;
        if self.pending.contains_key(&ext) {
            trace!("packet #{} is already pending - dropping duplicate", sequence);
            return TrackerOutput { duplicate: true, ..TrackerOutput::default() };
        }

        // everything between the old high-water mark and this packet is now
        // known to be missing
        let lost = self.register_missing(self.high_water(), ext, now);
        self.missing.remove(&ext);
        self.pending.insert(ext, data);

        TrackerOutput {
            deliveries: self.release_in_order(),
            lost,
            ..TrackerOutput::default()
        }
    }

    /// A heartbeat announces the sender's highest assigned sequence; anything
    /// between our high-water mark and that point was lost in the tail.
    pub fn on_heartbeat(&mut self, highest: Seq, addr: SocketAddr, now: Instant) -> TrackerOutput {
        self.last_heard = now;
        self.addr = addr;

        let diff = highest.diff(Seq::from_raw(self.expected as u32));
        if diff < 0 {
            return TrackerOutput::default();
        }
        if diff.unsigned_abs() > OUT_OF_WINDOW {
            debug!("heartbeat #{} is out of window (expected #{}) - reinitializing", highest, self.expected);
            self.pending.clear();
            self.missing.clear();
            self.expected = highest.to_raw() as u64 + 1;
            return TrackerOutput::default();
        }

        let ext = self.expected + diff as u64;
        let lost = self.register_missing(self.high_water(), ext + 1, now);
        TrackerOutput {
            deliveries: self.release_in_order(),
            lost,
            ..TrackerOutput::default()
        }
    }

    /// The sender answered a NAK with ranges it no longer retains: declare
    /// them lost right away instead of waiting for the deadline.
    pub fn on_unrecoverable(&mut self, ranges: &[SeqRange], now: Instant) -> TrackerOutput {
        self.last_heard = now;

        let lost_keys: Vec<u64> = self.missing.keys()
            .filter(|&&k| ranges.iter().any(|r| r.contains(Self::wire(k))))
            .copied()
            .collect();
        if lost_keys.is_empty() {
            return TrackerOutput::default();
        }

        debug!("sender declared {} sequence(s) unrecoverable", lost_keys.len());
        for key in &lost_keys {
            self.missing.remove(key);
        }
        TrackerOutput {
            lost: Some(coalesce(&lost_keys)),
            deliveries: self.release_in_order(),
            ..TrackerOutput::default()
        }
    }

    /// Timer tick: expire deadline-passed gaps into losses and collect the
    /// gaps due for a (re-)NAK, with per-gap exponential backoff.
    pub fn poll(&mut self, now: Instant) -> TrackerOutput {
        let mut output = TrackerOutput::default();

        // gaps that can no longer be recovered: deadline passed, or fallen
        // further behind the highest known sequence than the sender's ring
        // retains
        let recoverable_floor = self.high_water()
            .saturating_sub(1)
            .saturating_sub(self.config.retransmit_ring_size as u64);
        let lost_keys: Vec<u64> = self.missing.iter()
            .filter(|(&k, m)| now >= m.deadline || k < recoverable_floor)
            .map(|(&k, _)| k)
            .collect();
        if !lost_keys.is_empty() {
            debug!("declaring {} sequence(s) permanently lost", lost_keys.len());
            for key in &lost_keys {
                self.missing.remove(key);
            }
            output.lost = Some(coalesce(&lost_keys));
            output.deliveries = self.release_in_order();
        }

        let mut due = Vec::new();
        for (&seq, missing) in self.missing.iter_mut() {
            if now >= missing.next_nak_at {
                due.push(seq);
                missing.nak_count += 1;
                let exponent = (missing.nak_count - 1).min(16);
                let backoff = self.config.nak_backoff_base
                    .saturating_mul(1u32 << exponent)
                    .min(self.config.nak_backoff_cap);
                missing.next_nak_at = now + backoff;
            }
        }
        output.nak_ranges = coalesce(&due);

        output
    }

    /// Record `[from, to_excl)` as missing. Stretches wider than the
    /// sender-side retransmit ring cannot be recovered anyway, so only the
    /// tail is materialized and the head is returned as immediately lost.
    fn register_missing(&mut self, from: u64, to_excl: u64, now: Instant) -> Option<Vec<SeqRange>> {
        if to_excl <= from {
            return None;
        }

        let window = self.config.retransmit_ring_size as u64;
        let (lost, start) = if to_excl - from > window {
            let cut = to_excl - window;
            debug!("gap of {} packets exceeds the recoverable window - skipping the first {}", to_excl - from, cut - from);
            (Some(vec![SeqRange { from: Self::wire(from), to: Self::wire(cut - 1) }]), cut)
        }
        else {
            (None, from)
        };

        for seq in start..to_excl {
            self.missing.insert(seq, MissingSeq::new(now, &self.config));
        }
        lost
    }

    /// Advance `expected`, releasing pending packets in order. Sequences in
    /// neither buffer have already been announced as lost and are skipped.
    /// Stops at the first still-missing sequence.
    fn release_in_order(&mut self) -> Vec<Deliverable> {
        let mut out = Vec::new();
        let high_water = self.high_water();

        while self.expected < high_water {
            if self.missing.contains_key(&self.expected) {
                break;
            }
            if let Some(data) = self.pending.remove(&self.expected) {
                out.push(Deliverable { sequence: Self::wire(self.expected), data });
                self.expected += 1;
                continue;
            }
            // a permanently lost stretch: jump to the next known sequence
            let next_pending = self.pending.keys().next().copied().unwrap_or(high_water);
            let next_missing = self.missing.keys().next().copied().unwrap_or(high_water);
            self.expected = next_pending.min(next_missing);
        }
        out
    }
}

/// Merge a sorted list of unwrapped sequences into inclusive wire ranges.
fn coalesce(seqs: &[u64]) -> Vec<SeqRange> {
    let mut ranges = Vec::new();
    let mut seqs = seqs.iter().copied();

    let Some(first) = seqs.next() else {
        return ranges;
    };
    let (mut start, mut prev) = (first, first);
    for seq in seqs {
        if seq != prev + 1 {
            ranges.push(SeqRange { from: PeerTracker::wire(start), to: PeerTracker::wire(prev) });
            start = seq;
        }
        prev = seq;
    }
    ranges.push(SeqRange { from: PeerTracker::wire(start), to: PeerTracker::wire(prev) });
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn test_config() -> Arc<BusConfig> {
        let mut config = BusConfig::new(std::net::Ipv4Addr::new(239, 1, 2, 3), 7400);
        config.nak_initial_delay = Duration::from_millis(20);
        config.nak_backoff_base = Duration::from_millis(50);
        config.nak_backoff_cap = Duration::from_millis(400);
        config.nak_deadline = Duration::from_secs(5);
        config.retransmit_ring_size = 64;
        Arc::new(config)
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 9000))
    }

    fn data(marker: u8) -> HeldData {
        HeldData { topic: "t".to_owned(), payload: vec![marker], encrypted: false }
    }

    fn tracker() -> (PeerTracker, Instant) {
        let now = Instant::now();
        (PeerTracker::new(test_config(), addr(), now), now)
    }

    fn feed(tracker: &mut PeerTracker, seq: u32, now: Instant) -> TrackerOutput {
        tracker.on_data(Seq::from_raw(seq), data(seq as u8), addr(), now)
    }

    fn delivered(output: &TrackerOutput) -> Vec<u32> {
        output.deliveries.iter().map(|d| d.sequence.to_raw()).collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let (mut tracker, now) = tracker();
        for seq in 1..=3u32 {
            let output = feed(&mut tracker, seq, now);
            assert_eq!(delivered(&output), vec![seq]);
            assert!(output.lost.is_none());
            assert!(!output.duplicate);
        }
    }

    #[test]
    fn test_reordering_is_resequenced() {
        let (mut tracker, now) = tracker();
        let mut all = Vec::new();
        for seq in [5u32, 3, 4, 2, 1] {
            all.extend(delivered(&feed(&mut tracker, seq, now)));
        }
        assert_eq!(all, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_duplicates_are_suppressed() {
        let (mut tracker, now) = tracker();
        assert_eq!(delivered(&feed(&mut tracker, 1, now)), vec![1]);

        let output = feed(&mut tracker, 1, now);
        assert!(output.duplicate);
        assert!(output.deliveries.is_empty());

        // duplicate of a packet still held out of order
        feed(&mut tracker, 3, now);
        let output = feed(&mut tracker, 3, now);
        assert!(output.duplicate);
    }

    #[test]
    fn test_gap_is_nacked_after_initial_delay() {
        let (mut tracker, now) = tracker();
        feed(&mut tracker, 1, now);
        feed(&mut tracker, 4, now); // 2 and 3 missing

        // before the initial delay: reorder grace, no NAK yet
        assert!(tracker.poll(now).nak_ranges.is_empty());

        let output = tracker.poll(now + Duration::from_millis(25));
        assert_eq!(output.nak_ranges, vec![SeqRange { from: Seq::from_raw(2), to: Seq::from_raw(3) }]);
    }

    #[test]
    fn test_nak_backoff_doubles_up_to_cap() {
        let (mut tracker, mut now) = tracker();
        feed(&mut tracker, 1, now);
        feed(&mut tracker, 3, now);

        now += Duration::from_millis(25);
        assert_eq!(tracker.poll(now).nak_ranges.len(), 1); // first NAK

        // 50ms backoff after the first NAK
        assert!(tracker.poll(now + Duration::from_millis(40)).nak_ranges.is_empty());
        now += Duration::from_millis(55);
        assert_eq!(tracker.poll(now).nak_ranges.len(), 1);

        // 100ms after the second
        assert!(tracker.poll(now + Duration::from_millis(80)).nak_ranges.is_empty());
        now += Duration::from_millis(105);
        assert_eq!(tracker.poll(now).nak_ranges.len(), 1);

        // backoff is capped at 400ms
        now += Duration::from_millis(450);
        assert_eq!(tracker.poll(now).nak_ranges.len(), 1);
        now += Duration::from_millis(450);
        assert_eq!(tracker.poll(now).nak_ranges.len(), 1);
    }

    #[test]
    fn test_gap_fill_releases_pending_in_order() {
        let (mut tracker, now) = tracker();
        feed(&mut tracker, 1, now);
        feed(&mut tracker, 4, now);
        feed(&mut tracker, 3, now);

        let output = feed(&mut tracker, 2, now);
        assert_eq!(delivered(&output), vec![2, 3, 4]);

        // the filled gap is no longer NAK-eligible
        assert!(tracker.poll(now + Duration::from_secs(1)).nak_ranges.is_empty());
    }

    #[test]
    fn test_deadline_expiry_declares_loss_and_releases() {
        let (mut tracker, now) = tracker();
        for seq in [1u32, 2, 3, 4] {
            feed(&mut tracker, seq, now);
        }
        // 5 is dropped; 6..=10 arrive
        let mut later = Vec::new();
        for seq in 6..=10u32 {
            later.extend(delivered(&feed(&mut tracker, seq, now)));
        }
        assert!(later.is_empty(), "nothing released while 5 is outstanding");

        let output = tracker.poll(now + Duration::from_secs(6));
        assert_eq!(output.lost, Some(vec![SeqRange::single(Seq::from_raw(5))]));
        assert_eq!(delivered(&output), vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_heartbeat_detects_tail_loss() {
        let (mut tracker, now) = tracker();
        feed(&mut tracker, 1, now);
        feed(&mut tracker, 2, now);

        // sender announces it assigned up to 5: 3..=5 were lost in the tail
        tracker.on_heartbeat(Seq::from_raw(5), addr(), now);
        let output = tracker.poll(now + Duration::from_millis(25));
        assert_eq!(output.nak_ranges, vec![SeqRange { from: Seq::from_raw(3), to: Seq::from_raw(5) }]);
    }

    #[test]
    fn test_heartbeat_behind_expected_is_ignored() {
        let (mut tracker, now) = tracker();
        for seq in 1..=4u32 {
            feed(&mut tracker, seq, now);
        }
        tracker.on_heartbeat(Seq::from_raw(3), addr(), now);
        assert!(tracker.poll(now + Duration::from_secs(1)).nak_ranges.is_empty());
    }

    #[test]
    fn test_unrecoverable_reply_short_circuits_deadline() {
        let (mut tracker, now) = tracker();
        feed(&mut tracker, 1, now);
        feed(&mut tracker, 3, now);

        let output = tracker.on_unrecoverable(&[SeqRange::single(Seq::from_raw(2))], now);
        assert_eq!(output.lost, Some(vec![SeqRange::single(Seq::from_raw(2))]));
        assert_eq!(delivered(&output), vec![3]);
    }

    #[test]
    fn test_initial_gap_is_recovered() {
        // first contact with sequence 5: the start of the session is missing
        let (mut tracker, now) = tracker();
        assert!(delivered(&feed(&mut tracker, 5, now)).is_empty());

        let output = tracker.poll(now + Duration::from_millis(25));
        assert_eq!(output.nak_ranges, vec![SeqRange { from: Seq::from_raw(1), to: Seq::from_raw(4) }]);
    }

    #[test]
    fn test_out_of_window_jump_resets_session_state() {
        let (mut tracker, now) = tracker();
        feed(&mut tracker, 1, now);
        feed(&mut tracker, 3, now); // 2 missing

        let jump = 1u32 << 31;
        let output = feed(&mut tracker, jump, now);
        assert_eq!(delivered(&output), vec![jump]);

        // old gap state is gone, delivery continues from the new position
        assert!(tracker.poll(now + Duration::from_secs(1)).nak_ranges.is_empty());
        let output = feed(&mut tracker, jump + 1, now);
        assert_eq!(delivered(&output), vec![jump + 1]);
    }

    #[test]
    fn test_sequence_wrap_is_handled() {
        let (mut tracker, now) = tracker();
        // move the tracker close to the wrap via two out-of-window jumps,
        // each of which resets the expected position
        feed(&mut tracker, 1 << 31, now);
        feed(&mut tracker, u32::MAX - 1, now);
        assert_eq!(delivered(&feed(&mut tracker, u32::MAX, now)), vec![u32::MAX]);
        assert_eq!(delivered(&feed(&mut tracker, 0, now)), vec![0]);
        assert_eq!(delivered(&feed(&mut tracker, 1, now)), vec![1]);

        // a gap across the wrap coalesces into a single wrapped range
        feed(&mut tracker, 4, now);
        let output = tracker.poll(now + Duration::from_millis(25));
        assert_eq!(output.nak_ranges, vec![SeqRange { from: Seq::from_raw(2), to: Seq::from_raw(3) }]);
    }

    #[test]
    fn test_gap_wider_than_ring_loses_head_immediately() {
        let (mut tracker, now) = tracker();
        feed(&mut tracker, 1, now);

        // ring size is 64: of the gap 2..=999, only the last 64 are recoverable
        let output = feed(&mut tracker, 1000, now);
        assert_eq!(
            output.lost,
            Some(vec![SeqRange { from: Seq::from_raw(2), to: Seq::from_raw(935) }])
        );

        let nak = tracker.poll(now + Duration::from_millis(25));
        assert_eq!(nak.nak_ranges, vec![SeqRange { from: Seq::from_raw(936), to: Seq::from_raw(999) }]);
    }

    #[test]
    fn test_idle_detection() {
        let (tracker, now) = tracker();
        assert!(!tracker.is_idle(now + Duration::from_secs(29)));
        assert!(tracker.is_idle(now + Duration::from_secs(30)));
    }

    #[rstest]
    #[case(vec![], vec![])]
    #[case(vec![5], vec![(5, 5)])]
    #[case(vec![5, 6, 7], vec![(5, 7)])]
    #[case(vec![5, 7, 8, 12], vec![(5, 5), (7, 8), (12, 12)])]
    fn test_coalesce(#[case] seqs: Vec<u64>, #[case] expected: Vec<(u32, u32)>) {
        let expected: Vec<SeqRange> = expected.into_iter()
            .map(|(from, to)| SeqRange { from: Seq::from_raw(from), to: Seq::from_raw(to) })
            .collect();
        assert_eq!(coalesce(&seqs), expected);
    }
}
