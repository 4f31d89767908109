//! Clock domains and the timestamp mapping.
//!
//! Two clocks are in play: the local wall clock the consumer ticks on, and
//! the remote media clock the sender stamps packets with. They are kept as
//! distinct types so an instant from one domain never silently stands in
//! for an instant from the other. The only bridge between them is the
//! drift offset the jitter buffer captures when delivery starts.

use crate::format::MediaFormat;

/// Local wall-clock instant in milliseconds (monotonic, consumer side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct WallMs(pub i64);

/// Remote media time in milliseconds, as mapped by a `MediaClock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct StreamMs(pub i64);

impl std::ops::Sub for WallMs {
    type Output = i64;

    fn sub(self, rhs: WallMs) -> i64 {
        self.0 - rhs.0
    }
}

impl std::ops::Sub for StreamMs {
    type Output = i64;

    fn sub(self, rhs: StreamMs) -> i64 {
        self.0 - rhs.0
    }
}

impl WallMs {
    /// Express this local instant on the remote stream clock.
    pub fn on_stream(self, drift_ms: i64) -> StreamMs {
        StreamMs(self.0 + drift_ms)
    }
}

/// Maps wire timestamps to the local millisecond time base.
pub trait MediaClock {
    /// Configure the media rate the timestamps tick at.
    fn set_format(&mut self, format: MediaFormat);

    /// Map a wire timestamp to milliseconds. Takes `&mut self` because a
    /// real clock tracks 32-bit timestamp rollover across calls.
    fn time_of(&mut self, stream_timestamp: u32) -> StreamMs;

    /// Clear the time base and rollover tracking.
    fn reset(&mut self);
}

/// Sample-rate-scaling clock for RTP timestamps.
///
/// The first timestamp observed becomes the time base; later timestamps
/// are extended across 32-bit rollover and scaled by the sample rate.
#[derive(Debug)]
pub struct RtpClock {
    sample_rate: u32,
    base: Option<i64>,
    last_ts: u32,
    wraps: i64,
    seen: bool,
}

const DEFAULT_RATE: u32 = 8000;

impl RtpClock {
    pub fn new(format: MediaFormat) -> Self {
        let sample_rate = if format.sample_rate == 0 {
            DEFAULT_RATE
        } else {
            format.sample_rate
        };
        RtpClock {
            sample_rate,
            base: None,
            last_ts: 0,
            wraps: 0,
            seen: false,
        }
    }

    /// Extend a 32-bit timestamp to a monotone 64-bit tick count.
    ///
    /// A backward jump of more than half the range is a rollover; a forward
    /// jump of more than half the range is a straggler stamped before the
    /// most recent rollover.
    fn extend(&mut self, ts: u32) -> i64 {
        const HALF: u32 = 1 << 31;

        if !self.seen {
            self.seen = true;
            self.last_ts = ts;
            return ts as i64;
        }

        if ts < self.last_ts && self.last_ts - ts > HALF {
            self.wraps += 1;
            self.last_ts = ts;
        } else if ts > self.last_ts && ts - self.last_ts > HALF {
            return ((self.wraps - 1) << 32) + ts as i64;
        } else if ts > self.last_ts {
            self.last_ts = ts;
        }

        (self.wraps << 32) + ts as i64
    }
}

impl MediaClock for RtpClock {
    fn set_format(&mut self, format: MediaFormat) {
        if format.sample_rate != 0 {
            self.sample_rate = format.sample_rate;
        }
    }

    fn time_of(&mut self, stream_timestamp: u32) -> StreamMs {
        let ticks = self.extend(stream_timestamp);
        let base = *self.base.get_or_insert(ticks);
        StreamMs((ticks - base) * 1000 / self.sample_rate as i64)
    }

    fn reset(&mut self) {
        self.base = None;
        self.last_ts = 0;
        self.wraps = 0;
        self.seen = false;
    }
}
