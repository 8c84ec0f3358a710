
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::manager::ConnectionManager;
use crate::rendezvous::{IceInfo, RendezvousClient};
use crate::session::ChuteSession;

const MESSAGE_DRAIN_LIMIT: usize = 50;
const DECLINE_TTL_SECONDS: u64 = 20;

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub client_id: String,
    pub server_addr: String,
    pub connected: bool,
    pub peer_id: String,
    pub rendezvous_healthy: bool,
    pub rendezvous_checked: bool,
}

/// The client-facing handle: the command surface the shell drives.
///
/// Holds a lookup-only reference to the active session (installed via the
/// manager's session setter) and the single-slot pending-intent mailbox the
/// poller fills.
pub struct ChuteClient {
    client_id: String,
    server_addr: String,
    manager: Arc<ConnectionManager>,
    rendezvous: RendezvousClient,
    session: StdMutex<Option<Arc<ChuteSession>>>,
    pending: StdMutex<Option<IceInfo>>,
}

impl ChuteClient {
    /// Builds the handle and wires it to the manager's session setter. The
    /// setter captures a weak reference; the manager never keeps the handle
    /// alive.
    pub fn new(client_id: &str, server_addr: &str, manager: Arc<ConnectionManager>) -> Arc<Self> {
        let client = Arc::new(Self {
            client_id: client_id.to_owned(),
            server_addr: server_addr.to_owned(),
            manager: Arc::clone(&manager),
            rendezvous: RendezvousClient::new(server_addr),
            session: StdMutex::new(None),
            pending: StdMutex::new(None),
        });
        let weak = Arc::downgrade(&client);
        manager.set_session_setter(Box::new(move |session| {
            if let Some(client) = weak.upgrade() {
                client.set_session(session);
            }
        }));
        client
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_session(&self, session: Arc<ChuteSession>) {
        if let Ok(mut guard) = self.session.lock() {
            *guard = Some(session);
        }
    }

    fn current_session(&self) -> Option<Arc<ChuteSession>> {
        self.session.lock().ok().and_then(|guard| guard.clone())
    }

    pub async fn is_connected(&self) -> bool {
        match self.current_session() {
            Some(session) => session.is_connected().await,
            None => false,
        }
    }

    pub async fn status(&self) -> StatusResponse {
        let session = self.current_session();
        let (connected, peer_id) = match &session {
            Some(session) => (
                session.is_connected().await,
                session.current_peer_id().await,
            ),
            None => (false, String::new()),
        };
        let (rendezvous_healthy, rendezvous_checked) = self.manager.rendezvous_health();
        StatusResponse {
            client_id: self.client_id.clone(),
            server_addr: self.server_addr.clone(),
            connected,
            peer_id,
            rendezvous_healthy,
            rendezvous_checked,
        }
    }

    /// Dials `target_id`. Input is sanitized: whitespace is stripped (ids
    /// are often pasted in `NNN NNN NNN` form), empty and self targets are
    /// rejected before anything touches the network.
    pub async fn connect(&self, target_id: &str) -> Result<()> {
        let target: String = target_id.split_whitespace().collect();
        if target.is_empty() {
            return Err(Error::ErrMissingTargetId);
        }
        if target == self.client_id {
            return Err(Error::ErrSelfConnect);
        }
        self.manager.connect(&target).await.map(|_| ())
    }

    pub async fn disconnect(&self) -> Result<()> {
        if let Some(session) = self.current_session() {
            session.close().await;
        }
        Ok(())
    }

    /// Sends one trimmed, non-empty message over the active session.
    pub async fn send(&self, message: &str) -> Result<()> {
        let message = message.trim();
        if message.is_empty() {
            return Err(Error::ErrEmptyMessage);
        }
        let session = self.current_session().ok_or(Error::ErrNoActiveSession)?;
        session.send(message.as_bytes()).await
    }

    /// Drains up to 50 received messages as strings.
    pub async fn messages(&self) -> Vec<String> {
        match self.current_session() {
            Some(session) => session
                .drain_messages(MESSAGE_DRAIN_LIMIT)
                .await
                .into_iter()
                .map(|msg| String::from_utf8_lossy(&msg).into_owned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Peer id of the pending inbound offer, or empty.
    pub fn pending(&self) -> String {
        self.pending
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|intent| intent.id.clone()))
            .unwrap_or_default()
    }

    pub fn has_pending_intent(&self) -> bool {
        self.pending
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Fills the single-slot mailbox; a newer offer replaces an unclaimed
    /// older one.
    pub fn set_pending_intent(&self, intent: IceInfo) {
        if let Ok(mut guard) = self.pending.lock() {
            if let Some(prior) = guard.replace(intent) {
                log::info!("pending intent from {} replaced", prior.id);
            }
        }
    }

    fn take_pending_intent(&self) -> Option<IceInfo> {
        self.pending.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Accepts the pending offer: clears the slot and connects back with
    /// the stored peer info.
    pub async fn accept(&self) -> Result<()> {
        let intent = self.take_pending_intent().ok_or(Error::ErrNoPendingRequest)?;
        self.manager.connect_with_peer_info(intent).await.map(|_| ())
    }

    /// Declines the pending offer: clears the slot and tells the rendezvous
    /// so the caller's lookup aborts with "declined".
    pub async fn decline(&self) -> Result<()> {
        let intent = self.take_pending_intent().ok_or(Error::ErrNoPendingRequest)?;
        self.rendezvous
            .send_decline(&intent.id, &self.client_id, DECLINE_TTL_SECONDS)
            .await
    }

    /// Best-effort removal of our rendezvous registration.
    pub async fn unregister(&self) -> Result<()> {
        self.rendezvous.unregister(&self.client_id).await
    }
}
