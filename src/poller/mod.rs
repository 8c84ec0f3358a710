
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::ChuteClient;
use crate::rendezvous::RendezvousClient;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the background intent poller.
///
/// While the client is idle and the pending slot is empty, `/poll` is hit
/// once a second; a hit lands in the client's single-slot mailbox and the
/// poller goes quiet until the UI resolves it with accept or decline.
/// Shutdown is observed within one interval.
pub fn spawn(
    client: Arc<ChuteClient>,
    rendezvous: RendezvousClient,
    mut shutdown: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }

            if client.is_connected().await || client.has_pending_intent() {
                continue;
            }

            match rendezvous.poll_intent(client.client_id()).await {
                Ok(Some(intent)) => {
                    log::info!("incoming connection request from {}", intent.id);
                    client.set_pending_intent(intent);
                }
                Ok(None) => {}
                Err(err) => log::warn!("poll failed: {err}"),
            }
        }
    })
}
