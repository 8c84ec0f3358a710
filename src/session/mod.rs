#[cfg(test)]
mod session_test;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

const NEXT_PROTO: &[u8] = b"chute-quic";
const IDENTITY_LIMIT: usize = 64;
const SESSION_IDLE: Duration = Duration::from_secs(5 * 60);
const KEEP_ALIVE: Duration = Duration::from_secs(20);
const HANDSHAKE_IDLE: Duration = Duration::from_secs(10);
const RECEIVE_QUEUE_CAPACITY: usize = 16;
// One stream carries one message; anything above this is dropped.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// IPv4 host/port of the peer, derived from the ICE remote address once the
/// flow is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub ip: String,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.ip.parse()?, self.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Handshaking,
    Connected,
    Closed,
}

struct SessionInner {
    state: SessionState,
    peer_id: String,
    conn: Option<quinn::Connection>,
}

type OnCloseFn = Box<dyn FnOnce() + Send>;

/// The encrypted stream session riding on the punched flow.
///
/// QUIC over the adapter socket, with a newline-framed identity handshake on
/// the first bidirectional stream, one stream per message afterwards, and a
/// bounded receive queue that drops the newest message when full.
///
/// States run Idle → Handshaking → Connected → Closed; Closed is terminal,
/// each connection attempt builds a fresh session. The busy check and every
/// state flip happen under one mutex so a concurrent dial and inbound offer
/// cannot both win.
pub struct ChuteSession {
    local_id: String,
    endpoint: quinn::Endpoint,
    inner: Mutex<SessionInner>,
    receive_tx: mpsc::Sender<Vec<u8>>,
    receive_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    on_close: StdMutex<Option<OnCloseFn>>,
    accept_started: AtomicBool,
}

impl std::fmt::Debug for ChuteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChuteSession")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

impl ChuteSession {
    /// Builds a session over an adapter socket (the ICE flow).
    pub fn new(socket: Arc<dyn quinn::AsyncUdpSocket>, local_id: &str) -> Result<Arc<Self>> {
        let endpoint = quinn::Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config()?),
            socket,
            Arc::new(quinn::TokioRuntime),
        )?;
        Ok(Self::with_endpoint(endpoint, local_id))
    }

    /// Builds a session directly over a UDP socket. Used by the loopback
    /// test harness; the protocol is identical.
    pub fn from_udp_socket(socket: std::net::UdpSocket, local_id: &str) -> Result<Arc<Self>> {
        socket.set_nonblocking(true)?;
        let endpoint = quinn::Endpoint::new(
            quinn::EndpointConfig::default(),
            Some(server_config()?),
            socket,
            Arc::new(quinn::TokioRuntime),
        )?;
        Ok(Self::with_endpoint(endpoint, local_id))
    }

    fn with_endpoint(endpoint: quinn::Endpoint, local_id: &str) -> Arc<Self> {
        let (receive_tx, receive_rx) = mpsc::channel(RECEIVE_QUEUE_CAPACITY);
        Arc::new(Self {
            local_id: local_id.to_owned(),
            endpoint,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                peer_id: String::new(),
                conn: None,
            }),
            receive_tx,
            receive_rx: Mutex::new(receive_rx),
            on_close: StdMutex::new(None),
            accept_started: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Installs the hook fired exactly once when the session reaches Closed,
    /// whether by explicit close or transport loss.
    pub fn set_on_close(&self, hook: OnCloseFn) {
        if let Ok(mut guard) = self.on_close.lock() {
            *guard = Some(hook);
        }
    }

    /// Starts the accept loop for inbound connections. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.accept_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(incoming) = session.endpoint.accept().await {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => session.handle_incoming(conn).await,
                        Err(err) => log::warn!("quic accept failed: {err}"),
                    }
                });
            }
        });
    }

    /// Dial-side establishment: QUIC connect to `peer`, then the identity
    /// handshake. A `"busy"` reply is retryable; any other unexpected reply
    /// is fatal. Failure closes the session.
    pub async fn connect(self: &Arc<Self>, peer: PeerEndpoint, peer_id: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Idle => inner.state = SessionState::Handshaking,
                _ => {
                    log::info!("session busy peer_id={}", inner.peer_id);
                    return Err(Error::ErrBusy);
                }
            }
        }

        match self.dial(peer, peer_id).await {
            Ok(conn) => {
                {
                    let mut inner = self.inner.lock().await;
                    if inner.state != SessionState::Handshaking {
                        // Closed out from under us while the handshake ran.
                        drop(inner);
                        conn.close(0u32.into(), b"session closed");
                        return Err(Error::ErrNoActiveSession);
                    }
                    inner.state = SessionState::Connected;
                    inner.peer_id = peer_id.to_owned();
                    inner.conn = Some(conn.clone());
                }
                log::info!(
                    "session started peer_id={peer_id} remote={}",
                    conn.remote_address()
                );
                self.spawn_monitor(conn.clone());
                self.spawn_read_loop(conn);
                Ok(())
            }
            Err(err) => {
                self.close().await;
                Err(err)
            }
        }
    }

    async fn dial(&self, peer: PeerEndpoint, peer_id: &str) -> Result<quinn::Connection> {
        let addr = peer.socket_addr()?;
        let connecting = self.endpoint.connect_with(client_config()?, addr, "chute")?;
        let conn = tokio::time::timeout(HANDSHAKE_IDLE, connecting)
            .await
            .map_err(|_| Error::ErrSessionTimeout)??;
        if let Err(err) = self.handshake_dial(&conn).await {
            log::warn!("handshake with {peer_id} failed: {err}");
            conn.close(0u32.into(), b"handshake failed");
            return Err(err);
        }
        Ok(conn)
    }

    async fn handshake_dial(&self, conn: &quinn::Connection) -> Result<()> {
        let (mut send, mut recv) = conn.open_bi().await?;
        write_line(&mut send, &self.local_id).await?;
        let reply = tokio::time::timeout(HANDSHAKE_IDLE, read_line(&mut recv))
            .await
            .map_err(|_| Error::ErrHandshakeFailed)??;
        let _ = send.finish();
        match reply.as_str() {
            "accept" => Ok(()),
            "busy" => Err(Error::ErrBusy),
            _ => Err(Error::ErrHandshakeFailed),
        }
    }

    /// Responder-side establishment for one inbound QUIC connection.
    ///
    /// Occupied sessions and empty identities are answered `"busy"`;
    /// over-long identities are cut off without a reply. A failure here
    /// flips the session back to Idle so the accept loop keeps serving.
    async fn handle_incoming(self: &Arc<Self>, conn: quinn::Connection) {
        let (mut send, mut recv) = match tokio::time::timeout(HANDSHAKE_IDLE, conn.accept_bi())
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                log::warn!("incoming stream accept failed: {err}");
                conn.close(0u32.into(), b"handshake failed");
                return;
            }
            Err(_) => {
                conn.close(0u32.into(), b"handshake failed");
                return;
            }
        };

        let peer_id = match tokio::time::timeout(HANDSHAKE_IDLE, read_line(&mut recv)).await {
            Ok(Ok(line)) => line,
            Ok(Err(err)) => {
                log::warn!("incoming handshake read failed: {err}");
                conn.close(0u32.into(), b"handshake failed");
                return;
            }
            Err(_) => {
                conn.close(0u32.into(), b"handshake failed");
                return;
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Idle || peer_id.is_empty() {
                log::info!("rejecting incoming peer_id={peer_id} busy");
                drop(inner);
                let _ = write_line(&mut send, "busy").await;
                let _ = send.finish();
                // Let the reply reach the dialer; it closes once it reads
                // "busy", and the timeout bounds a vanished dialer.
                let _ = tokio::time::timeout(Duration::from_secs(1), conn.closed()).await;
                conn.close(0u32.into(), b"busy");
                return;
            }
            inner.state = SessionState::Handshaking;
            inner.conn = Some(conn.clone());
        }

        if let Err(err) = write_line(&mut send, "accept").await {
            log::warn!("incoming handshake reply failed: {err}");
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Idle;
            inner.conn = None;
            drop(inner);
            conn.close(0u32.into(), b"handshake failed");
            return;
        }
        let _ = send.finish();

        {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Handshaking {
                drop(inner);
                conn.close(0u32.into(), b"session closed");
                return;
            }
            inner.state = SessionState::Connected;
            inner.peer_id = peer_id.clone();
        }

        log::info!(
            "session accepted peer_id={peer_id} remote={}",
            conn.remote_address()
        );
        self.spawn_monitor(conn.clone());
        self.spawn_read_loop(conn);
    }

    /// Sends one message: a fresh bidirectional stream, the payload, then
    /// the write side closes.
    pub async fn send(&self, msg: &[u8]) -> Result<()> {
        let (conn, peer_id) = {
            let inner = self.inner.lock().await;
            match (inner.state, inner.conn.clone()) {
                (SessionState::Connected, Some(conn)) => (conn, inner.peer_id.clone()),
                _ => return Err(Error::ErrNoActiveSession),
            }
        };

        let (mut send, _recv) = conn.open_bi().await?;
        if let Err(err) = send.write_all(msg).await {
            log::warn!("quic send failed peer_id={peer_id} err={err}");
            return Err(err.into());
        }
        if let Err(err) = send.finish() {
            log::warn!("quic send close failed peer_id={peer_id} err={err}");
        }
        log::info!("quic sent peer_id={peer_id} bytes={}", msg.len());
        Ok(())
    }

    /// Drains up to `max` queued inbound messages without waiting.
    pub async fn drain_messages(&self, max: usize) -> Vec<Vec<u8>> {
        let mut rx = self.receive_rx.lock().await;
        let mut out = Vec::new();
        while out.len() < max.max(1) {
            match rx.try_recv() {
                Ok(msg) => out.push(msg),
                Err(_) => break,
            }
        }
        out
    }

    /// Waits for the next inbound message; `None` once the session closed
    /// and the queue drained.
    pub async fn recv_message(&self) -> Option<Vec<u8>> {
        self.receive_rx.lock().await.recv().await
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.state == SessionState::Connected
    }

    pub async fn is_connected_to(&self, target_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.state == SessionState::Connected && inner.peer_id == target_id
    }

    /// Connected peer id, or empty when not connected. `connected` and a
    /// non-empty peer id flip together under the session mutex.
    pub async fn current_peer_id(&self) -> String {
        self.inner.lock().await.peer_id.clone()
    }

    /// Tears the session down: terminal, idempotent, fires the on-close
    /// hook exactly once.
    pub async fn close(&self) {
        let conn = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.peer_id.clear();
            inner.conn.take()
        };
        if let Some(conn) = conn {
            conn.close(0u32.into(), b"session closed");
        }
        self.endpoint.close(0u32.into(), b"session closed");
        log::info!("session closed");
        self.fire_on_close();
    }

    fn spawn_monitor(self: &Arc<Self>, conn: quinn::Connection) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let reason = conn.closed().await;
            session.handle_disconnect(&reason).await;
        });
    }

    /// Accepts message streams and copies each payload into the receive
    /// queue; a full queue drops the new message rather than stall here.
    fn spawn_read_loop(self: &Arc<Self>, conn: quinn::Connection) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (_send, mut recv) = match conn.accept_bi().await {
                    Ok(stream) => stream,
                    Err(err) => {
                        session.handle_disconnect(&err).await;
                        return;
                    }
                };
                let payload = match recv.read_to_end(MAX_MESSAGE_SIZE).await {
                    Ok(payload) => payload,
                    Err(err) => {
                        log::warn!("quic stream read failed: {err}");
                        continue;
                    }
                };
                let peer_id = { session.inner.lock().await.peer_id.clone() };
                log::info!("quic received peer_id={peer_id} bytes={}", payload.len());
                if session.receive_tx.try_send(payload).is_err() {
                    log::debug!("receive queue full, dropping message");
                }
            }
        });
    }

    async fn handle_disconnect(&self, err: &quinn::ConnectionError) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Connected {
                return;
            }
            inner.state = SessionState::Closed;
            inner.peer_id.clear();
            inner.conn = None;
        }
        match err {
            quinn::ConnectionError::ApplicationClosed(_) | quinn::ConnectionError::LocallyClosed => {
                log::info!("session disconnected");
            }
            err => log::info!("session disconnected err={err}"),
        }
        self.endpoint.close(0u32.into(), b"session closed");
        self.fire_on_close();
    }

    fn fire_on_close(&self) {
        let hook = self.on_close.lock().ok().and_then(|mut guard| guard.take());
        if let Some(hook) = hook {
            hook();
        }
    }
}

async fn write_line(send: &mut quinn::SendStream, value: &str) -> Result<()> {
    if value.len() > IDENTITY_LIMIT {
        return Err(Error::ErrIdentityTooLong);
    }
    send.write_all(format!("{value}\n").as_bytes()).await?;
    Ok(())
}

async fn read_line(recv: &mut quinn::RecvStream) -> Result<String> {
    let mut buf = [0u8; IDENTITY_LIMIT + 2];
    let mut filled = 0usize;
    loop {
        if filled == buf.len() {
            return Err(Error::ErrIdentityTooLong);
        }
        match recv.read(&mut buf[filled..]).await? {
            Some(n) => {
                filled += n;
                if buf[..filled].contains(&b'\n') {
                    break;
                }
            }
            None => break,
        }
    }
    let line = match buf[..filled].iter().position(|&b| b == b'\n') {
        Some(pos) => &buf[..pos],
        None => &buf[..filled],
    };
    let line = std::str::from_utf8(line)
        .map_err(|_| Error::ErrHandshakeFailed)?
        .trim();
    if line.len() > IDENTITY_LIMIT {
        return Err(Error::ErrIdentityTooLong);
    }
    Ok(line.to_owned())
}

/// Ephemeral self-signed server TLS; peers do not verify it. Identity is
/// established by the application-layer handshake instead.
fn server_config() -> Result<quinn::ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["chute".to_owned()])?;
    let cert_der: CertificateDer<'static> = cert.cert.into();
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())?;
    crypto.alpn_protocols = vec![NEXT_PROTO.to_vec()];
    let crypto =
        QuicServerConfig::try_from(crypto).map_err(|err| Error::Other(err.to_string()))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config()?));
    Ok(config)
}

fn client_config() -> Result<quinn::ClientConfig> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    crypto.alpn_protocols = vec![NEXT_PROTO.to_vec()];
    let crypto =
        QuicClientConfig::try_from(crypto).map_err(|err| Error::Other(err.to_string()))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config()?));
    Ok(config)
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    let idle = quinn::IdleTimeout::try_from(SESSION_IDLE)
        .map_err(|err| Error::Other(err.to_string()))?;
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    Ok(transport)
}

#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
