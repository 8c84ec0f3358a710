use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the connection core.
///
/// The distinguished unit variants drive control flow: `ErrRateLimited`
/// backs the lookup loop off, `ErrDeclined` aborts it, `ErrBusy` is
/// retryable by the caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("missing target id")]
    ErrMissingTargetId,
    #[error("missing peer id")]
    ErrMissingPeerId,
    #[error("message required")]
    ErrEmptyMessage,
    #[error("cannot connect to self")]
    ErrSelfConnect,
    #[error("rate limited")]
    ErrRateLimited,
    #[error("connection declined")]
    ErrDeclined,
    #[error("busy")]
    ErrBusy,
    #[error("handshake failed")]
    ErrHandshakeFailed,
    #[error("identity too long")]
    ErrIdentityTooLong,
    #[error("missing identity")]
    ErrMissingIdentity,
    #[error("no active session")]
    ErrNoActiveSession,
    #[error("no pending request")]
    ErrNoPendingRequest,
    #[error("ice candidate gathering timed out")]
    ErrGatherTimeout,
    #[error("no ice candidates gathered")]
    ErrNoCandidates,
    #[error("ice connect timed out")]
    ErrConnectTimeout,
    #[error("timed out waiting for ice info for {0}")]
    ErrLookupTimeout(String),
    #[error("timeout waiting for quic connection")]
    ErrSessionTimeout,
    #[error("no remote address on ice connection")]
    ErrNoRemoteAddr,
    #[error("unexpected status: {0}")]
    ErrUnexpectedStatus(u16),

    #[error("ice: {0}")]
    Ice(#[from] webrtc_ice::Error),
    #[error("net: {0}")]
    Util(#[from] webrtc_util::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("quic connect: {0}")]
    QuicConnect(#[from] quinn::ConnectError),
    #[error("quic connection: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),
    #[error("quic write: {0}")]
    QuicWrite(#[from] quinn::WriteError),
    #[error("quic read: {0}")]
    QuicRead(#[from] quinn::ReadError),
    #[error("quic read: {0}")]
    QuicReadToEnd(#[from] quinn::ReadToEndError),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("cert: {0}")]
    Cert(#[from] rcgen::Error),
    #[error("addr: {0}")]
    Addr(#[from] std::net::AddrParseError),
    #[error("{0}")]
    Other(String),
}
