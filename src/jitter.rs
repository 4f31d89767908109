//! Jitter buffer for RTP packet streams.
//!
//! Arriving packets are held in a fixed ring of slots so that short-term
//! variation in inter-arrival times is absorbed before playout. Packets
//! that arrive out of order are put back in their place, late packets are
//! discarded, and missing packets leave holes that are skipped on read.
//! Delivery is gated until the buffered duration first exceeds the
//! configured budget.
//!
//! A buffer that is sized too small discards an excessive number of
//! packets; one sized too large adds delay that hurts conversation.
//! 30 to 50 ms is a typical budget, 100 to 200 ms a typical upper bound
//! for adaptive deployments.

use std::time::Instant;

use tracing::{trace, warn};

use crate::clock::{MediaClock, StreamMs, WallMs};
use crate::format::MediaFormat;
use crate::packet::RtpPacket;

/// Number of packet slots in the ring.
pub const QUEUE_SIZE: usize = 100;

/// Jitter buffer configuration.
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Buffered duration (ms) that must be exceeded before delivery begins.
    pub budget_ms: u32,
    /// Keep the running duration total equal to the sum of slot durations
    /// when packets are inserted out of order. The legacy behavior leaves
    /// the total untouched on such insertions; this flag opts into the
    /// corrected bookkeeping.
    pub strict_accounting: bool,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            budget_ms: 50,
            strict_accounting: false,
        }
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitterStats {
    pub received: u64,
    pub discarded_late: u64,
    pub evicted: u64,
    pub delivered: u64,
}

/// Fixed-capacity reordering buffer between a receive loop and a media
/// pacer.
///
/// `write` is called by the receive loop as packets arrive; `read` is
/// called by the consumer at its own cadence and returns packets in
/// presentation-time order, each carrying the duration the consumer should
/// pace by. One instance serves one stream; calls must be serialized by
/// the caller.
pub struct JitterBuffer {
    config: JitterConfig,
    queue: [Option<RtpPacket>; QUEUE_SIZE],
    /// Next slot to deliver from.
    read_cursor: usize,
    /// Slot of the most recently stored packet.
    write_cursor: usize,
    ready: bool,
    read_started: bool,
    write_started: bool,
    /// Running total of the durations accounted in the ring.
    duration_ms: i64,
    /// The most recent local "now" expressed on the remote stream clock.
    stream_now: StreamMs,
    /// Offset between the remote and local clocks, captured when reading
    /// begins and fixed until reset.
    drift_ms: i64,
    /// Previous arrival instant (r) and presentation time (s) feeding the
    /// inter-arrival jitter estimator.
    last_arrival: Option<WallMs>,
    last_time: Option<StreamMs>,
    jitter: f64,
    jitter_max: f64,
    format: Option<MediaFormat>,
    clock: Option<Box<dyn MediaClock + Send>>,
    stats: JitterStats,
    epoch: Instant,
}

impl JitterBuffer {
    /// Create a buffer with the given delay budget in milliseconds.
    pub fn new(budget_ms: u32) -> Self {
        Self::with_config(JitterConfig {
            budget_ms,
            ..JitterConfig::default()
        })
    }

    pub fn with_config(config: JitterConfig) -> Self {
        JitterBuffer {
            config,
            queue: std::array::from_fn(|_| None),
            read_cursor: 0,
            write_cursor: 0,
            ready: false,
            // the consumer is considered armed from the start; see read()
            read_started: true,
            write_started: false,
            duration_ms: 0,
            stream_now: StreamMs(0),
            drift_ms: 0,
            last_arrival: None,
            last_time: None,
            jitter: 0.0,
            jitter_max: 0.0,
            format: None,
            clock: None,
            stats: JitterStats::default(),
            epoch: Instant::now(),
        }
    }

    /// Install the clock that maps wire timestamps to milliseconds.
    /// Required before the first `write`.
    pub fn set_clock(&mut self, mut clock: Box<dyn MediaClock + Send>) {
        if let Some(format) = self.format {
            clock.set_format(format);
        }
        self.clock = Some(clock);
    }

    /// Configure the media format. The `ANY` wildcard is recorded but not
    /// propagated to the clock.
    pub fn set_format(&mut self, format: MediaFormat) {
        self.format = Some(format);
        if format.is_any() {
            return;
        }
        if let Some(clock) = self.clock.as_mut() {
            clock.set_format(format);
        }
    }

    pub fn budget_ms(&self) -> u32 {
        self.config.budget_ms
    }

    /// RFC 3550 inter-arrival jitter estimate, in milliseconds.
    pub fn inter_arrival_jitter(&self) -> f64 {
        self.jitter
    }

    /// Highest value the jitter estimate has reached.
    pub fn max_jitter(&self) -> f64 {
        self.jitter_max
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Total buffered duration currently accounted, in milliseconds.
    pub fn buffered_ms(&self) -> i64 {
        self.duration_ms
    }

    /// Number of occupied slots.
    pub fn depth(&self) -> usize {
        self.queue.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    /// Accept one packet from the receive loop.
    ///
    /// # Panics
    ///
    /// Panics if called before `set_clock`.
    pub fn write(&mut self, packet: RtpPacket) {
        let now = WallMs(self.epoch.elapsed().as_millis() as i64);
        self.write_at(packet, now);
    }

    /// `write` with the arrival instant supplied by the caller (public for
    /// deterministic testing).
    pub fn write_at(&mut self, mut packet: RtpPacket, now: WallMs) {
        let Some(clock) = self.clock.as_mut() else {
            panic!("jitter buffer: write before set_clock");
        };
        let t = clock.time_of(packet.timestamp);
        packet.time = t;
        self.stats.received += 1;
        trace!(
            "receive: seq={} ts={} time={}ms",
            packet.sequence,
            packet.timestamp,
            t.0
        );

        // RFC 3550 6.4.1: D is the difference between the arrival spacing
        // and the stream-time spacing of consecutive packets.
        if let (Some(r), Some(s)) = (self.last_arrival, self.last_time) {
            let d = ((now - r) - (t - s)).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
            if self.jitter > self.jitter_max {
                self.jitter_max = self.jitter;
            }
        }
        self.last_time = Some(t);
        self.last_arrival = Some(now);

        // reading has moved past this packet's presentation time
        if self.ready && self.read_started && t <= self.stream_now {
            warn!(
                "late packet discarded: seq={} time={}ms stream_now={}ms",
                packet.sequence, t.0, self.stream_now.0
            );
            self.stats.discarded_late += 1;
            return;
        }

        if !self.write_started {
            self.write_cursor = 0;
            self.queue[0] = Some(packet);
            self.write_started = true;
        } else {
            self.insert(packet);
        }

        // strictly greater: filled exactly to the budget is not ready yet
        if !self.ready && self.duration_ms > self.config.budget_ms as i64 {
            self.ready = true;
        }
    }

    fn insert(&mut self, packet: RtpPacket) {
        let (prev_seq, prev_time) = match self.queue[self.write_cursor].as_ref() {
            Some(prev) => (prev.sequence, prev.time),
            None => {
                // the previous tail was drained out from under us; start a
                // fresh run at the current cursor
                self.queue[self.write_cursor] = Some(packet);
                return;
            }
        };
        let diff = seq_delta(packet.sequence, prev_seq);

        if diff == 1 {
            // in order: the previous packet's duration is now known
            let prev_index = self.write_cursor;
            let dur = packet.time - prev_time;
            self.write_cursor = inc(self.write_cursor, 1);
            self.evict_on_simple_overflow();
            self.queue[self.write_cursor] = Some(packet);
            let replaced = self.set_duration(prev_index, dur);
            self.duration_ms += dur;
            if self.config.strict_accounting {
                self.duration_ms -= replaced;
            }
        } else if diff > 1 {
            // packets are missing in between; leave their slots empty so
            // they still have a chance to arrive, and account the gap as
            // if they were lost
            let dur = packet.time - prev_time;
            let replaced = self.set_duration(self.write_cursor, dur);
            let next_write = inc(self.write_cursor, diff as usize);
            self.evict_on_positive_overflow(next_write, diff as i64);
            self.write_cursor = next_write;
            self.queue[self.write_cursor] = Some(packet);
            self.duration_ms += dur;
            if self.config.strict_accounting {
                self.duration_ms -= replaced;
            }
        } else {
            self.insert_behind(packet, diff);
        }
    }

    /// Stamp a slot's duration, returning the value it replaces. The
    /// replaced value is nonzero when an out-of-order repair already ran
    /// over the slot.
    fn set_duration(&mut self, index: usize, dur: i64) -> i64 {
        match self.queue[index].as_mut() {
            Some(p) => {
                let old = p.duration_ms;
                p.duration_ms = dur;
                old
            }
            None => 0,
        }
    }

    /// A packet whose sequence number falls behind the current tail is put
    /// into its slot and the durations of both neighbors are repaired.
    fn insert_behind(&mut self, mut packet: RtpPacket, diff: i32) {
        let right_index = self.write_cursor;
        let slot = dec(self.write_cursor, (-(diff as i64)) as usize);
        self.write_cursor = slot;

        let mut delta = 0i64;

        // left neighbor: first occupied slot walking backward, at most one
        // lap
        let mut i = dec(slot, 1);
        let mut count = 0;
        while self.queue[i].is_none() && count < QUEUE_SIZE - 1 {
            i = dec(i, 1);
            count += 1;
        }
        if let Some(left) = self.queue[i].as_mut() {
            let old = left.duration_ms;
            left.duration_ms = packet.time - left.time;
            delta += left.duration_ms - old;
        }

        // right neighbor: first occupied slot walking forward, stopping at
        // the old tail
        let mut i = inc(slot, 1);
        while self.queue[i].is_none() && i != right_index {
            i = inc(i, 1);
        }
        if let Some(right) = self.queue[i].as_ref() {
            packet.duration_ms = right.time - packet.time;
            delta += packet.duration_ms;
        }

        if let Some(replaced) = self.queue[slot].replace(packet) {
            delta -= replaced.duration_ms;
        }

        // the running total is left alone here unless the caller opted in
        // to strict accounting
        if self.config.strict_accounting {
            self.duration_ms += delta;
        }
    }

    /// The in-order write is about to land on the read cursor; drop the
    /// packet sitting there.
    fn evict_on_simple_overflow(&mut self) {
        if self.read_cursor != self.write_cursor {
            return;
        }
        if let Some(removed) = self.queue[self.read_cursor].take() {
            self.duration_ms -= removed.duration_ms;
            self.read_cursor = inc(self.read_cursor, 1);
            self.stats.evicted += 1;
            trace!("evicted on overflow: seq={}", removed.sequence);
        }
    }

    /// A gap write advances the tail by more than one slot. When the span
    /// between the old and new write positions crosses the read cursor,
    /// the stale packets under it must go.
    fn evict_on_positive_overflow(&mut self, next_write: usize, diff: i64) {
        let r = self.read_cursor;
        let w = self.write_cursor;
        let crosses = if w as i64 + diff >= QUEUE_SIZE as i64 {
            // the raw advance wraps the ring
            (r > w && next_write < r) || (r < w && next_write >= r)
        } else {
            r > w && next_write >= r
        };
        if crosses {
            self.evict_backward_from(next_write);
        }
    }

    /// Remove the run of stale packets ending at the new write position,
    /// walking backward toward the old read cursor. An empty slot means
    /// the stale region is exhausted and the walk is done. The oldest
    /// survivor, one past the new write position, becomes the new read
    /// cursor.
    fn evict_backward_from(&mut self, next_write: usize) {
        let old_read = self.read_cursor;
        self.read_cursor = inc(next_write, 1);
        let stop = dec(old_read, 1);
        let mut i = next_write;
        while i != stop {
            let Some(removed) = self.queue[i].take() else {
                return;
            };
            self.duration_ms -= removed.duration_ms;
            self.stats.evicted += 1;
            i = dec(i, 1);
        }
    }

    /// Deliver the next packet in presentation order.
    ///
    /// Returns None while the buffer is warming up or has nothing
    /// consumable. `now` is the consumer's wall clock; the packet's
    /// `duration_ms` tells the consumer how long to pace before the next
    /// call.
    pub fn read(&mut self, now: WallMs) -> Option<RtpPacket> {
        if !self.ready {
            return None;
        }

        // the drift between the remote and local clocks is fixed at the
        // moment reading begins
        if !self.read_started {
            self.read_started = true;
            if let Some(first) = self.queue[0].as_ref() {
                // the one place the two clock domains meet
                self.drift_ms = first.time.0 - now.0;
            }
        }

        // our clock shows `now`; the same instant on the remote clock:
        self.stream_now = now.on_stream(self.drift_ms);

        if self.duration_ms == 0 {
            return None;
        }

        let packet = self.queue[self.read_cursor].take()?;
        self.duration_ms -= packet.duration_ms;
        self.read_cursor = inc(self.read_cursor, 1);

        // hop over holes left for packets that never arrived, at most one
        // lap
        let mut hops = 0;
        while self.duration_ms >= 0 && self.queue[self.read_cursor].is_none() && hops < QUEUE_SIZE {
            self.read_cursor = inc(self.read_cursor, 1);
            hops += 1;
        }

        self.stats.delivered += 1;
        Some(packet)
    }

    /// Return to the initial state. Slot contents are left in place; the
    /// next write lands on slot 0 and the cursors take it from there.
    pub fn reset(&mut self) {
        self.duration_ms = 0;
        if let Some(clock) = self.clock.as_mut() {
            clock.reset();
        }
        self.drift_ms = 0;
        self.last_arrival = None;
        self.last_time = None;

        self.ready = false;
        self.read_started = true;
        self.write_started = false;

        self.read_cursor = 0;
        self.write_cursor = 0;
    }
}

fn inc(i: usize, by: usize) -> usize {
    (i + by) % QUEUE_SIZE
}

fn dec(i: usize, by: usize) -> usize {
    let by = by % QUEUE_SIZE;
    (i + QUEUE_SIZE - by) % QUEUE_SIZE
}

/// Signed distance from `prev` to `seq` on the 16-bit sequence circle.
/// Stays correct across the 65535 to 0 wrap.
fn seq_delta(seq: u16, prev: u16) -> i32 {
    seq.wrapping_sub(prev) as i16 as i32
}


#[cfg(test)]
mod proptests {
    use super::tests::{buffer, packet};
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// any traffic pattern leaves the buffer intact and bounded
        #[test]
        fn arbitrary_traffic_never_panics(
            ops in proptest::collection::vec(
                (any::<u16>(), 0u32..1_000_000, 0i64..100_000, any::<bool>()),
                1..300,
            )
        ) {
            let mut buf = buffer(40);
            for (seq, ts, now, also_read) in ops {
                buf.write_at(packet(seq, ts), WallMs(now));
                if also_read {
                    let _ = buf.read(WallMs(now));
                }
                prop_assert!(buf.depth() <= QUEUE_SIZE);
            }
        }

        /// an uninterrupted in-order stream is delivered in order
        #[test]
        fn in_order_stream_delivers_in_order(start in any::<u16>(), count in 5usize..60) {
            let mut buf = buffer(10);
            for i in 0..count {
                let ts = (i as u32) * 20;
                buf.write_at(packet(start.wrapping_add(i as u16), ts), WallMs(ts as i64));
            }

            let mut last = None;
            while let Some(p) = buf.read(WallMs(0)) {
                if let Some(prev) = last {
                    prop_assert!(p.time.0 >= prev);
                }
                last = Some(p.time.0);
            }
            prop_assert!(last.is_some());
        }

        /// ready stays latched until reset
        #[test]
        fn ready_is_monotone(
            count in 10usize..120,
            reads in proptest::collection::vec(any::<bool>(), 10..120)
        ) {
            let mut buf = buffer(30);
            let mut was_ready = false;
            for i in 0..count {
                let ts = (i as u32) * 20;
                buf.write_at(packet(i as u16, ts), WallMs(ts as i64));
                if *reads.get(i).unwrap_or(&false) {
                    let _ = buf.read(WallMs(ts as i64));
                }
                if was_ready {
                    prop_assert!(buf.is_ready());
                }
                was_ready = buf.is_ready();
            }
        }

        /// constant cadence means zero estimated jitter
        #[test]
        fn constant_cadence_keeps_estimator_at_zero(
            spacing in 1i64..100,
            count in 3usize..50,
        ) {
            let mut buf = buffer(1000);
            for i in 0..count {
                let at = i as i64 * spacing;
                buf.write_at(packet(i as u16, at as u32), WallMs(at));
            }
            prop_assert_eq!(buf.inter_arrival_jitter(), 0.0);
            prop_assert_eq!(buf.max_jitter(), 0.0);
        }

        /// alternating early/late arrivals keep the estimate under the
        /// perturbation size
        #[test]
        fn perturbed_cadence_is_bounded_by_perturbation(
            d in 1i64..50,
            count in 4usize..80,
        ) {
            let mut buf = buffer(100_000);
            for i in 0..count {
                let nominal = i as i64 * 100;
                let at = if i % 2 == 1 { nominal + d } else { nominal };
                buf.write_at(packet(i as u16, nominal as u32), WallMs(at));
            }
            let j = buf.inter_arrival_jitter();
            prop_assert!(j >= 0.0);
            prop_assert!(j <= d as f64);
        }

        /// strict accounting keeps the running total equal to the slot sum
        /// under arbitrary reordering
        #[test]
        fn strict_accounting_tracks_slot_sum(
            seqs in proptest::collection::vec(0u16..200, 1..150)
        ) {
            let mut buf = JitterBuffer::with_config(JitterConfig {
                budget_ms: u32::MAX,
                strict_accounting: true,
            });
            buf.set_clock(Box::new(super::tests::TestClock));

            for (i, seq) in seqs.iter().enumerate() {
                buf.write_at(packet(*seq, *seq as u32 * 10), WallMs(i as i64 * 10));
            }

            let slot_sum: i64 = buf.queue.iter().flatten().map(|p| p.duration_ms).sum();
            prop_assert_eq!(buf.buffered_ms(), slot_sum);
        }
    }
}

/// State machine model of the ring occupancy and the delivery gate.
#[cfg(test)]
mod state_machine {
    use stateright::*;

    #[derive(Clone, Debug, Hash, PartialEq, Eq)]
    enum Action {
        /// Store the next packet in sequence.
        WriteNext,
        /// Store a packet that skips ahead, leaving a hole.
        WriteSkip,
        /// Consumer poll.
        Read,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq)]
    struct RingState {
        occupied: u8,
        ready: bool,
        written: u8,
        delivered: u8,
    }

    struct PlayoutModel {
        capacity: u8,
        arm_depth: u8,
        max_ops: u8,
    }

    impl Model for PlayoutModel {
        type State = RingState;
        type Action = Action;

        fn init_states(&self) -> Vec<Self::State> {
            vec![RingState {
                occupied: 0,
                ready: false,
                written: 0,
                delivered: 0,
            }]
        }

        fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
            if state.written < self.max_ops {
                actions.push(Action::WriteNext);
                actions.push(Action::WriteSkip);
            }
            actions.push(Action::Read);
        }

        fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
            let mut next = state.clone();
            match action {
                Action::WriteNext | Action::WriteSkip => {
                    next.written += 1;
                    // a full ring evicts one to admit one, so occupancy
                    // stays at capacity
                    if next.occupied < self.capacity {
                        next.occupied += 1;
                    }
                    if next.occupied >= self.arm_depth {
                        next.ready = true;
                    }
                }
                Action::Read => {
                    if next.ready && next.occupied > 0 {
                        next.occupied -= 1;
                        next.delivered += 1;
                    }
                }
            }
            Some(next)
        }

        fn properties(&self) -> Vec<Property<Self>> {
            vec![
                Property::always("occupancy_bounded", |model: &Self, state: &RingState| {
                    state.occupied <= model.capacity
                }),
                Property::always("nothing_delivered_before_ready", |_: &Self, state: &RingState| {
                    state.delivered == 0 || state.ready
                }),
                Property::always("conservation", |_: &Self, state: &RingState| {
                    state.delivered as u16 + state.occupied as u16 <= state.written as u16
                }),
            ]
        }
    }

    #[test]
    fn test_playout_model_basic() {
        let model = PlayoutModel {
            capacity: 5,
            arm_depth: 3,
            max_ops: 8,
        };
        let checker = model.checker().threads(1).spawn_bfs().join();
        checker.assert_properties();
    }

    #[test]
    fn test_playout_model_tiny_ring() {
        let model = PlayoutModel {
            capacity: 2,
            arm_depth: 1,
            max_ops: 10,
        };
        let checker = model.checker().threads(1).spawn_bfs().join();
        checker.assert_properties();
    }
}

/// Kani formal verification proofs
#[cfg(kani)]
mod kani_proofs {
    use super::*;

    /// Proves: cursor arithmetic never leaves the ring
    #[kani::proof]
    fn cursor_arithmetic_stays_in_bounds() {
        let i: usize = kani::any();
        let by: usize = kani::any();
        kani::assume(i < QUEUE_SIZE);
        kani::assume(by <= u16::MAX as usize);

        kani::assert(inc(i, by) < QUEUE_SIZE, "inc stays in bounds");
        kani::assert(dec(i, by) < QUEUE_SIZE, "dec stays in bounds");
    }

    /// Proves: dec undoes inc for in-ring steps
    #[kani::proof]
    fn dec_undoes_inc() {
        let i: usize = kani::any();
        let by: usize = kani::any();
        kani::assume(i < QUEUE_SIZE);
        kani::assume(by < QUEUE_SIZE);

        kani::assert(dec(inc(i, by), by) == i, "dec is the inverse of inc");
    }

    /// Proves: the sequence delta is total and antisymmetric away from the
    /// ambiguous midpoint
    #[kani::proof]
    fn seq_delta_antisymmetric() {
        let a: u16 = kani::any();
        let b: u16 = kani::any();

        let d = seq_delta(a, b);
        kani::assert((-32768..=32767).contains(&d), "delta is a 16-bit value");

        kani::assume(a.wrapping_sub(b) != 0x8000);
        kani::assert(seq_delta(b, a) == -d, "antisymmetric off the midpoint");
    }

    /// Proves: adjacency is preserved across the 65535 -> 0 wrap
    #[kani::proof]
    fn seq_delta_spans_the_wrap() {
        kani::assert(seq_delta(0, 65535) == 1, "0 follows 65535");
        kani::assert(seq_delta(65535, 0) == -1, "65535 precedes 0");
        kani::assert(seq_delta(3, 65534) == 5, "gaps span the wrap");
    }
}
