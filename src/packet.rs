use crate::clock::StreamMs;

/// One RTP packet as the jitter buffer sees it.
///
/// `sequence`, `timestamp` and the payload come off the wire and are never
/// touched again. `time` and `duration_ms` are derived: the buffer stamps
/// the presentation time on write and fills in the playout duration once
/// the packet's successor arrives.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub marker: bool,
    pub ssrc: u32,
    /// Presentation time on the remote clock, set by the buffer.
    pub time: StreamMs,
    /// Playout duration in milliseconds, set by the buffer.
    pub duration_ms: i64,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    pub fn new(sequence: u16, timestamp: u32, payload: Vec<u8>) -> Self {
        RtpPacket {
            sequence,
            timestamp,
            payload_type: 0,
            marker: false,
            ssrc: 0,
            time: StreamMs(0),
            duration_ms: 0,
            payload,
        }
    }

    /// Parse a packet off the wire.
    ///
    /// Returns None if the datagram is truncated or not RTP version 2.
    /// CSRC entries and a header extension, if present, are skipped over to
    /// find the payload.
    pub fn parse(data: &[u8]) -> Option<RtpPacket> {
        if data.len() < 12 {
            return None;
        }

        let version = (data[0] >> 6) & 0x03;
        if version != 2 {
            return None;
        }

        let cc = data[0] & 0x0F;
        let has_extension = (data[0] & 0x10) != 0;
        let marker = (data[1] & 0x80) != 0;
        let payload_type = data[1] & 0x7F;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = 12 + (cc as usize * 4);

        if has_extension {
            if data.len() < offset + 4 {
                return None;
            }
            let ext_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + (ext_length * 4);
        }

        if offset > data.len() {
            return None;
        }

        Some(RtpPacket {
            sequence,
            timestamp,
            payload_type,
            marker,
            ssrc,
            time: StreamMs(0),
            duration_ms: 0,
            payload: data[offset..].to_vec(),
        })
    }
}
