use anyhow::{Context, Result};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::clock::{RtpClock, WallMs};
use crate::format::MediaFormat;
use crate::jitter::{JitterBuffer, JitterConfig};
use crate::packet::RtpPacket;

/// UDP ingest loop feeding a jitter buffer.
///
/// Binds a socket, parses incoming datagrams and writes them into the
/// buffer. The first SSRC seen owns the session; datagrams from any other
/// SSRC are dropped.
pub struct RtpReceiver {
    socket: UdpSocket,
    buffer: JitterBuffer,
    ssrc: Option<u32>,
}

impl RtpReceiver {
    pub async fn bind(port: u16, config: JitterConfig, format: MediaFormat) -> Result<Self> {
        let addr = format!("0.0.0.0:{}", port);
        let socket = UdpSocket::bind(&addr)
            .await
            .context(format!("Failed to bind RTP socket on {}", addr))?;

        debug!("RTP receiver bound to port {}", port);

        let mut buffer = JitterBuffer::with_config(config);
        buffer.set_clock(Box::new(RtpClock::new(format)));
        buffer.set_format(format);

        Ok(Self {
            socket,
            buffer,
            ssrc: None,
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Receive and buffer packets for the specified duration.
    pub async fn receive_for(&mut self, duration: Duration) -> Result<()> {
        let mut buf = [0u8; 2048];
        let deadline = tokio::time::Instant::now() + duration;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _addr))) => {
                    self.process_datagram(&buf[..len]);
                }
                Ok(Err(e)) => {
                    warn!("RTP receive error: {}", e);
                }
                Err(_) => {
                    // deadline reached
                    break;
                }
            }
        }

        let stats = self.buffer.stats();
        debug!(
            "receive window closed: {} packets buffered, {} late",
            stats.received, stats.discarded_late
        );
        Ok(())
    }

    fn process_datagram(&mut self, data: &[u8]) {
        let Some(packet) = RtpPacket::parse(data) else {
            trace!("ignoring non-RTP datagram ({} bytes)", data.len());
            return;
        };

        match self.ssrc {
            None => {
                self.ssrc = Some(packet.ssrc);
                debug!("locked to SSRC {:#010x}", packet.ssrc);
            }
            Some(ssrc) if ssrc != packet.ssrc => {
                trace!("dropping packet from foreign SSRC {:#010x}", packet.ssrc);
                return;
            }
            Some(_) => {}
        }

        self.buffer.write(packet);
    }

    /// Pull the next packet due for playout.
    pub fn playout(&mut self, now: WallMs) -> Option<RtpPacket> {
        self.buffer.read(now)
    }

    pub fn buffer(&self) -> &JitterBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut JitterBuffer {
        &mut self.buffer
    }
}
