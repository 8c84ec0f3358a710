use super::*;

use std::future::poll_fn;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;

struct PipeConn {
    local: SocketAddr,
    remote: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: TokioMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Two in-process conns joined back to back, standing in for the punched
/// ICE flow.
fn pipe_pair() -> (Arc<PipeConn>, Arc<PipeConn>) {
    let addr_a = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1111);
    let addr_b = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2222);
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a = Arc::new(PipeConn {
        local: addr_a,
        remote: addr_b,
        tx: a_tx,
        rx: TokioMutex::new(a_rx),
    });
    let b = Arc::new(PipeConn {
        local: addr_b,
        remote: addr_a,
        tx: b_tx,
        rx: TokioMutex::new(b_rx),
    });
    (a, b)
}

#[async_trait]
impl Conn for PipeConn {
    async fn connect(&self, _addr: SocketAddr) -> webrtc_util::Result<()> {
        Err(webrtc_util::Error::Other("not supported".to_owned()))
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Err(webrtc_util::Error::ErrBufferClosed),
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc_util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, self.remote))
    }

    async fn send(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| webrtc_util::Error::ErrBufferClosed)?;
        Ok(buf.len())
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc_util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> webrtc_util::Result<SocketAddr> {
        Ok(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn close(&self) -> webrtc_util::Result<()> {
        Ok(())
    }
}

async fn recv_one(conn: &IcePacketConn) -> (Vec<u8>, SocketAddr) {
    let mut storage = [0u8; MAX_DATAGRAM_SIZE];
    let mut meta = [RecvMeta::default()];
    poll_fn(|cx| {
        let mut bufs = [IoSliceMut::new(&mut storage)];
        match conn.poll_recv(cx, &mut bufs, &mut meta) {
            Poll::Ready(Ok(_)) => Poll::Ready(()),
            Poll::Ready(Err(err)) => panic!("poll_recv failed: {err}"),
            Poll::Pending => Poll::Pending,
        }
    })
    .await;
    (storage[..meta[0].len].to_vec(), meta[0].addr)
}

#[tokio::test]
async fn test_write_through_to_single_peer() {
    let (a, b) = pipe_pair();
    let adapter = IcePacketConn::new(a).unwrap();

    // The destination is deliberately bogus; the adapter must ignore it.
    let bogus: SocketAddr = "203.0.113.7:9".parse().unwrap();
    adapter
        .try_send(&Transmit {
            destination: bogus,
            ecn: None,
            contents: b"ping",
            segment_size: None,
            src_ip: None,
        })
        .unwrap();

    let mut buf = [0u8; 16];
    let n = b.recv(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");
}

#[tokio::test]
async fn test_reads_stamped_with_remote_addr() {
    let (a, b) = pipe_pair();
    let remote = b.local;
    let adapter = IcePacketConn::new(a).unwrap();

    b.send(b"pong").await.unwrap();

    let (payload, addr) = recv_one(&adapter).await;
    assert_eq!(payload, b"pong");
    assert_eq!(addr, remote);
    assert_eq!(adapter.local_addr().unwrap().port(), 1111);
}

#[tokio::test]
async fn test_ordered_writes() {
    let (a, b) = pipe_pair();
    let adapter = IcePacketConn::new(a).unwrap();

    for i in 0..10u8 {
        adapter
            .try_send(&Transmit {
                destination: "203.0.113.7:9".parse().unwrap(),
                ecn: None,
                contents: &[i],
                segment_size: None,
                src_ip: None,
            })
            .unwrap();
    }
    for i in 0..10u8 {
        let mut buf = [0u8; 4];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[i]);
    }
}
