//! Outbound datagram path, abstracted behind a trait so the protocol logic
//! can be tested with the I/O mocked away.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

use crate::error::{BusError, BusResult};
use crate::metrics::BusMetrics;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet: &[u8]) -> BusResult<()>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_packet(&self, to: SocketAddr, packet: &[u8]) -> BusResult<()> {
        trace!("UDP socket: sending {} bytes to {:?}", packet.len(), to);
        match self.send_to(packet, to).await {
            Ok(_) => Ok(()),
            Err(e) => Err(BusError::SendFailed(e)),
        }
    }
}

/// Shared outbound path. Send errors are absorbed here: the caller's packet
/// is already retained for retransmit, so a failed datagram is only counted
/// and logged.
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    metrics: Arc<BusMetrics>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, metrics: Arc<BusMetrics>) -> SendPipeline {
        SendPipeline { socket, metrics }
    }

    pub async fn send(&self, to: SocketAddr, packet: &[u8]) {
        if let Err(e) = self.socket.send_packet(to, packet).await {
            warn!("error sending packet to {:?}: {}", to, e);
            BusMetrics::bump(&self.metrics.sends_failed);
        }
    }
}
