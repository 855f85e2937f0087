use crate::error::CapError;
use crate::segment::{Segment, HEADER_LEN};
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, info, trace};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to
///  facilitate mocking the I/O part away for testing.
///
/// Send failures are not reported to the caller: the engine treats them as transient,
///  keeping the segment in the send buffer so the retransmission path retries it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending datagram to {:?}", to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }
}

/// Bind the underlying datagram socket, mapping the OS error for an occupied address to
///  the protocol-level error kind.
pub async fn bind_udp(addr: SocketAddr) -> Result<Arc<UdpSocket>, CapError> {
    let socket = UdpSocket::bind(addr).await.map_err(CapError::from)?;
    info!("bound datagram socket to {:?}", socket.local_addr().map_err(CapError::from)?);
    Ok(Arc::new(socket))
}

/// Serializes segments and hands them to the datagram socket. All outbound traffic of a
///  connection funnels through here.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn DatagramSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn DatagramSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub async fn send_segment(&self, to: SocketAddr, segment: &Segment) {
        trace!("sending {:?} to {:?}", segment, to);

        let mut buf = BytesMut::with_capacity(HEADER_LEN + segment.payload.len());
        segment.ser(&mut buf);
        self.socket.do_send_packet(to, buf.as_ref()).await;
    }
}
