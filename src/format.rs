/// Media format of the stream feeding the buffer.
///
/// Only the sample rate matters to the timestamp-to-milliseconds mapping;
/// the payload type is carried so a receiver can pick the format straight
/// off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFormat {
    pub payload_type: u8,
    pub sample_rate: u32,
}

impl MediaFormat {
    /// Wildcard format. `JitterBuffer::set_format` ignores it.
    pub const ANY: MediaFormat = MediaFormat {
        payload_type: u8::MAX,
        sample_rate: 0,
    };

    /// G.711 u-law (PCMU), payload type 0, 8 kHz
    pub const PCMU: MediaFormat = MediaFormat {
        payload_type: 0,
        sample_rate: 8000,
    };

    /// G.711 A-law (PCMA), payload type 8, 8 kHz
    pub const PCMA: MediaFormat = MediaFormat {
        payload_type: 8,
        sample_rate: 8000,
    };

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// Look up a static payload type (RFC 3551 table 4).
    pub fn from_payload_type(payload_type: u8) -> Option<MediaFormat> {
        match payload_type {
            0 => Some(Self::PCMU),
            8 => Some(Self::PCMA),
            _ => None,
        }
    }
}
