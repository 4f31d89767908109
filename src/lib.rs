//! Jitter buffer for RTP media streams.
//!
//! Absorbs short-term variation in packet inter-arrival times so a media
//! sink ticking on a local clock can pull samples in presentation order at
//! a steady cadence.

pub mod clock;
pub mod format;
pub mod jitter;
pub mod packet;
pub mod receiver;

pub use clock::{MediaClock, RtpClock, StreamMs, WallMs};
pub use format::MediaFormat;
pub use jitter::{JitterBuffer, JitterConfig, JitterStats, QUEUE_SIZE};
pub use packet::RtpPacket;
pub use receiver::RtpReceiver;
