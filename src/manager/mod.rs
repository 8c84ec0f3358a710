#[cfg(test)]
mod manager_test;

use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::agent::{is_initiator, IceAgent};
use crate::error::{Error, Result};
use crate::packet_conn::IcePacketConn;
use crate::rendezvous::{IceInfo, RendezvousClient};
use crate::session::{ChuteSession, PeerEndpoint};

const ICE_TTL_SECONDS: u64 = 60;
const INTENT_TTL_SECONDS: u64 = 20;
const ICE_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
const LOOKUP_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(3);
const SESSION_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Handoff callback installing a newly connected session on the
/// client-facing handle.
pub type SessionSetter = Box<dyn Fn(Arc<ChuteSession>) + Send + Sync>;

/// Orchestrates a connection attempt end to end: rendezvous signaling, ICE
/// punch, adapter, session handshake.
///
/// At most one ICE agent is held at a time; installing a new one or clearing
/// the slot closes the previous agent, so a failed or replaced attempt can
/// never leak a half-open agent.
pub struct ConnectionManager {
    local_id: String,
    rendezvous: RendezvousClient,
    session_setter: StdMutex<Option<SessionSetter>>,
    ice: Mutex<Option<Arc<IceAgent>>>,
    health: RwLock<(bool, bool)>,
}

impl ConnectionManager {
    pub fn new(local_id: &str, server_addr: &str) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.to_owned(),
            rendezvous: RendezvousClient::new(server_addr),
            session_setter: StdMutex::new(None),
            ice: Mutex::new(None),
            health: RwLock::new((false, false)),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn set_session_setter(&self, setter: SessionSetter) {
        if let Ok(mut guard) = self.session_setter.lock() {
            *guard = Some(setter);
        }
    }

    /// Outbound dial: register our ICE info, announce the intent, poll the
    /// rendezvous for the target's info, then punch and hand off.
    pub async fn connect(self: &Arc<Self>, target_id: &str) -> Result<Arc<ChuteSession>> {
        if target_id.is_empty() {
            return Err(Error::ErrMissingTargetId);
        }

        let (agent, local_info) = IceAgent::new(&self.local_id).await?;
        let agent = Arc::new(agent);

        if let Err(err) = self.rendezvous.register(&local_info, ICE_TTL_SECONDS).await {
            agent.close().await;
            return Err(err);
        }

        // Best-effort: the callee may discover us via lookup alone.
        if let Err(err) = self
            .rendezvous
            .send_intent(&self.local_id, target_id, INTENT_TTL_SECONDS)
            .await
        {
            log::warn!("connect intent failed target={target_id} err={err}");
        }

        let remote = match wait_for_ice_info(
            &self.rendezvous,
            target_id,
            &self.local_id,
            ICE_CONNECT_TIMEOUT,
        )
        .await
        {
            Ok(info) => info,
            Err(err) => {
                agent.close().await;
                return Err(err);
            }
        };

        self.start_ice(agent, target_id, remote).await
    }

    /// Inbound accept: the peer's info arrived with the intent, so the
    /// lookup-polling phase is skipped.
    pub async fn connect_with_peer_info(self: &Arc<Self>, info: IceInfo) -> Result<Arc<ChuteSession>> {
        if info.id.is_empty() {
            return Err(Error::ErrMissingPeerId);
        }

        let (agent, local_info) = IceAgent::new(&self.local_id).await?;
        let agent = Arc::new(agent);

        if let Err(err) = self.rendezvous.register(&local_info, ICE_TTL_SECONDS).await {
            agent.close().await;
            return Err(err);
        }

        let target_id = info.id.clone();
        self.start_ice(agent, &target_id, info).await
    }

    async fn start_ice(
        self: &Arc<Self>,
        agent: Arc<IceAgent>,
        target_id: &str,
        remote: IceInfo,
    ) -> Result<Arc<ChuteSession>> {
        self.set_ice_agent(Arc::clone(&agent)).await;
        let deadline = tokio::time::Instant::now() + ICE_CONNECT_TIMEOUT;

        let conn = match agent.connect(target_id, &remote, deadline).await {
            Ok(conn) => conn,
            Err(err) => {
                self.close_ice().await;
                return Err(err);
            }
        };

        let packet_conn = match IcePacketConn::new(conn) {
            Ok(packet_conn) => packet_conn,
            Err(err) => {
                self.close_ice().await;
                return Err(err);
            }
        };
        let remote_addr = packet_conn.remote_addr();

        let session = match ChuteSession::new(Arc::new(packet_conn), &self.local_id) {
            Ok(session) => session,
            Err(err) => {
                self.close_ice().await;
                return Err(err);
            }
        };

        {
            let manager = Arc::downgrade(self);
            let rendezvous = self.rendezvous.clone();
            let local_id = self.local_id.clone();
            session.set_on_close(Box::new(move || {
                tokio::spawn(async move {
                    if let Some(manager) = manager.upgrade() {
                        manager.close_ice().await;
                    }
                    if let Err(err) = rendezvous.unregister(&local_id).await {
                        log::warn!("unregister failed: {err}");
                    }
                });
            }));
        }

        if is_initiator(&self.local_id, target_id) {
            let peer = PeerEndpoint::from_addr(remote_addr);
            match tokio::time::timeout_at(deadline, session.connect(peer, target_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    session.close().await;
                    self.close_ice().await;
                    return Err(err);
                }
                Err(_) => {
                    session.close().await;
                    self.close_ice().await;
                    return Err(Error::ErrSessionTimeout);
                }
            }
        } else {
            session.start();
            let wait_deadline = tokio::time::Instant::now() + ICE_CONNECT_TIMEOUT;
            if let Err(err) = wait_for_session(&session, wait_deadline).await {
                session.close().await;
                self.close_ice().await;
                return Err(err);
            }
        }

        if let Ok(guard) = self.session_setter.lock() {
            if let Some(setter) = guard.as_ref() {
                setter(Arc::clone(&session));
            }
        }
        Ok(session)
    }

    async fn set_ice_agent(&self, agent: Arc<IceAgent>) {
        let prior = self.ice.lock().await.replace(agent);
        if let Some(prior) = prior {
            prior.close().await;
        }
    }

    /// Clears the agent slot and closes whatever it held. Safe when empty.
    pub async fn close_ice(&self) {
        let agent = self.ice.lock().await.take();
        if let Some(agent) = agent {
            agent.close().await;
        }
    }

    pub fn set_rendezvous_health(&self, healthy: bool) {
        if let Ok(mut guard) = self.health.write() {
            *guard = (healthy, true);
        }
    }

    /// Snapshot of the latest `/health` probe: `(healthy, checked)`.
    pub fn rendezvous_health(&self) -> (bool, bool) {
        self.health.read().map(|guard| *guard).unwrap_or((false, false))
    }

    pub async fn check_rendezvous_health(&self) {
        let healthy = self.rendezvous.health().await;
        self.set_rendezvous_health(healthy);
    }
}

/// Polls the rendezvous until the target's info shows up. Not-found keeps
/// polling at the regular interval, rate-limiting backs off longer, a
/// decline or any network failure aborts.
async fn wait_for_ice_info(
    rendezvous: &RendezvousClient,
    target_id: &str,
    from_id: &str,
    budget: Duration,
) -> Result<IceInfo> {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        match rendezvous.lookup(target_id, from_id).await {
            Ok(Some(info)) => return Ok(info),
            Ok(None) => tokio::time::sleep(LOOKUP_POLL_INTERVAL).await,
            Err(Error::ErrRateLimited) => tokio::time::sleep(RATE_LIMIT_BACKOFF).await,
            Err(err) => return Err(err),
        }
    }
    Err(Error::ErrLookupTimeout(target_id.to_owned()))
}

async fn wait_for_session(
    session: &Arc<ChuteSession>,
    deadline: tokio::time::Instant,
) -> Result<()> {
    while tokio::time::Instant::now() < deadline {
        if session.is_connected().await {
            return Ok(());
        }
        tokio::time::sleep(SESSION_WAIT_INTERVAL).await;
    }
    Err(Error::ErrSessionTimeout)
}
