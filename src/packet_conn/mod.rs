#[cfg(test)]
mod packet_conn_test;

use std::fmt;
use std::io;
use std::io::IoSliceMut;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::{Context, Poll};

use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use tokio::sync::mpsc;
use webrtc_util::Conn;

use crate::error::{Error, Result};

// Generous upper bound for a single ICE datagram; QUIC keeps its own
// payloads well under this.
const MAX_DATAGRAM_SIZE: usize = 1500;
const INBOUND_QUEUE: usize = 64;

/// Presents the peer-bound ICE flow as the datagram socket the QUIC endpoint
/// consumes.
///
/// ICE hands us a stream-like object already bound to the selected peer; the
/// transport wants a `readFrom`/`writeTo` socket. Reads are stamped with the
/// cached remote address, writes discard their destination and go to the one
/// peer, in order, through a dedicated writer task.
pub struct IcePacketConn {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl IcePacketConn {
    pub fn new(conn: Arc<dyn Conn + Send + Sync>) -> Result<Self> {
        let local_addr = conn.local_addr()?;
        let remote_addr = conn.remote_addr().ok_or(Error::ErrNoRemoteAddr)?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    match conn.recv(&mut buf).await {
                        Ok(n) => {
                            if inbound_tx.send(buf[..n].to_vec()).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            log::info!("ice read ended: {err}");
                            return;
                        }
                    }
                }
            });
        }

        tokio::spawn(async move {
            while let Some(datagram) = outbound_rx.recv().await {
                if let Err(err) = conn.send(&datagram).await {
                    log::info!("ice write ended: {err}");
                    return;
                }
            }
        });

        Ok(Self {
            local_addr,
            remote_addr,
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl fmt::Debug for IcePacketConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IcePacketConn")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

#[derive(Debug)]
struct AlwaysWritable;

impl UdpPoller for AlwaysWritable {
    fn poll_writable(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The writer channel is unbounded; sends never need to wait.
        Poll::Ready(Ok(()))
    }
}

impl AsyncUdpSocket for IcePacketConn {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(AlwaysWritable)
    }

    fn try_send(&self, transmit: &Transmit<'_>) -> io::Result<()> {
        // Single-peer flow: the destination on the transmit is ignored.
        self.outbound
            .send(transmit.contents.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "ice writer closed"))
    }

    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let mut inbound = match self.inbound.lock() {
            Ok(inbound) => inbound,
            Err(_) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "inbound queue poisoned",
                )))
            }
        };
        match inbound.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                let len = datagram.len().min(bufs[0].len());
                bufs[0][..len].copy_from_slice(&datagram[..len]);
                meta[0] = RecvMeta {
                    addr: self.remote_addr,
                    len,
                    stride: len,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "ice reader closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
