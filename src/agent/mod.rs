
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use webrtc_ice::agent::agent_config::AgentConfig;
use webrtc_ice::agent::Agent;
use webrtc_ice::candidate::candidate_base::unmarshal_candidate;
use webrtc_ice::candidate::Candidate;
use webrtc_ice::network_type::NetworkType;
use webrtc_ice::state::ConnectionState;
use webrtc_ice::url::Url;
use webrtc_util::Conn;

use crate::config;
use crate::error::{Error, Result};
use crate::rendezvous::IceInfo;

const GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Elects the initiator for a `(local, peer)` pair: the lexicographically
/// lesser id dials, the greater accepts. Both the ICE role and the session
/// role derive from this one predicate so they cannot drift apart.
pub fn is_initiator(local_id: &str, peer_id: &str) -> bool {
    local_id < peer_id
}

/// Wraps a `webrtc_ice::Agent` configured for UDP4 (loopback included) with
/// a single STUN server, and drives it through gather and connect.
///
/// The wrapper is the unit of ownership for ICE resources: the manager holds
/// at most one and closes it on replacement, failure, or session close.
pub struct IceAgent {
    local_id: String,
    agent: Arc<Agent>,
    // Held so an in-flight dial/accept can be cancelled by close(); the
    // webrtc-ice connect aborts when all senders are gone.
    cancel_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl IceAgent {
    /// Builds the agent, reads the local credentials, and gathers candidates
    /// under the 10-second budget. Returns the agent together with the local
    /// `IceInfo` ready for registration. Any failure closes the agent.
    pub async fn new(local_id: &str) -> Result<(Self, IceInfo)> {
        let stun_addr = config::stun_server_addr();
        let url = Url::parse_url(&format!("stun:{stun_addr}"))?;
        let agent = Arc::new(
            Agent::new(AgentConfig {
                urls: vec![url],
                network_types: vec![NetworkType::Udp4],
                ..Default::default()
            })
            .await?,
        );

        let (ufrag, password) = agent.get_local_user_credentials().await;

        let candidates = match gather_candidates(&agent).await {
            Ok(candidates) => candidates,
            Err(err) => {
                let _ = agent.close().await;
                return Err(err);
            }
        };

        let info = IceInfo {
            id: local_id.to_owned(),
            ufrag,
            password,
            candidates,
        };
        Ok((
            Self {
                local_id: local_id.to_owned(),
                agent,
                cancel_tx: Mutex::new(None),
            },
            info,
        ))
    }

    /// Installs the remote candidates and credentials, then dials or accepts
    /// according to role election, bounded by `deadline`. Produces the
    /// connected single-peer flow. Every failure path closes the agent.
    pub async fn connect(
        &self,
        target_id: &str,
        remote: &IceInfo,
        deadline: tokio::time::Instant,
    ) -> Result<Arc<dyn Conn + Send + Sync>> {
        let target = target_id.to_owned();
        self.agent
            .on_connection_state_change(Box::new(move |state: ConnectionState| {
                // Diagnostics only; correctness never depends on these.
                log::info!("ice state for {target}: {state}");
                Box::pin(async move {})
            }));

        for raw in &remote.candidates {
            let candidate = match unmarshal_candidate(raw) {
                Ok(candidate) => candidate,
                Err(err) => {
                    self.close().await;
                    return Err(err.into());
                }
            };
            let candidate: Arc<dyn Candidate + Send + Sync> = Arc::new(candidate);
            if let Err(err) = self.agent.add_remote_candidate(&candidate) {
                self.close().await;
                return Err(err.into());
            }
        }

        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        *self.cancel_tx.lock().await = Some(cancel_tx);

        let controlling = is_initiator(&self.local_id, target_id);
        let connect = async {
            let conn: Arc<dyn Conn + Send + Sync> = if controlling {
                self.agent
                    .dial(cancel_rx, remote.ufrag.clone(), remote.password.clone())
                    .await?
            } else {
                self.agent
                    .accept(cancel_rx, remote.ufrag.clone(), remote.password.clone())
                    .await?
            };
            Ok::<_, Error>(conn)
        };

        match tokio::time::timeout_at(deadline, connect).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => {
                self.close().await;
                Err(err)
            }
            Err(_) => {
                self.close().await;
                Err(Error::ErrConnectTimeout)
            }
        }
    }

    /// Cancels any in-flight connect and closes the agent. Safe to call more
    /// than once.
    pub async fn close(&self) {
        self.cancel_tx.lock().await.take();
        if let Err(err) = self.agent.close().await {
            log::warn!("ice agent close failed: {err}");
        }
    }
}

/// Collects marshalled candidate strings until the agent reports the
/// gathering terminator, bounded by `GATHER_TIMEOUT`.
///
/// Candidates accumulate inside the callback under a mutex; the terminator
/// completes a oneshot the caller waits on, then the vector is taken whole.
async fn gather_candidates(agent: &Arc<Agent>) -> Result<Vec<String>> {
    let collected = Arc::new(Mutex::new(Vec::<String>::new()));
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));

    {
        let collected = Arc::clone(&collected);
        let done_tx = Arc::clone(&done_tx);
        agent.on_candidate(Box::new(move |candidate: Option<Arc<dyn Candidate + Send + Sync>>| {
            let collected = Arc::clone(&collected);
            let done_tx = Arc::clone(&done_tx);
            Box::pin(async move {
                match candidate {
                    Some(candidate) => {
                        let raw = candidate.marshal();
                        log::info!("ice candidate gathered: {raw}");
                        collected.lock().await.push(raw);
                    }
                    None => {
                        if let Some(done) = done_tx.lock().await.take() {
                            let _ = done.send(());
                        }
                    }
                }
            })
        }));
    }

    agent.gather_candidates()?;

    match tokio::time::timeout(GATHER_TIMEOUT, done_rx).await {
        Ok(Ok(())) => {}
        _ => return Err(Error::ErrGatherTimeout),
    }

    let candidates = collected.lock().await.clone();
    if candidates.is_empty() {
        return Err(Error::ErrNoCandidates);
    }
    Ok(candidates)
}
