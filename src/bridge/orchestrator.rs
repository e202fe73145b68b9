use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, error, info, info_span};

use super::event::{BridgeEvent, Network};
use super::portal::{Portal, PortalCommand};
use super::{BridgeContext, BridgeError, PortalRef};
use crate::db::PortalState;
use crate::web::metrics::Metrics;

/// Routes inbound events from both listeners to one worker per portal.
///
/// Workers are spawned lazily on the first event for a portal. Events for the same
/// portal are handled in arrival order; different portals run concurrently.
pub struct SyncOrchestrator {
    ctx: BridgeContext,
    workers: Mutex<HashMap<i64, mpsc::UnboundedSender<PortalCommand>>>,
}

impl SyncOrchestrator {
    pub fn new(ctx: BridgeContext) -> Self {
        Self {
            ctx,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &BridgeContext {
        &self.ctx
    }

    /// Consumes both inbound queues until both listeners hang up.
    pub async fn run(
        &self,
        mut matrix_rx: mpsc::Receiver<BridgeEvent>,
        mut chat_rx: mpsc::Receiver<BridgeEvent>,
    ) {
        let sync_secs = self.ctx.config.bridge.metadata_sync_interval_secs;
        let sync_enabled = sync_secs > 0;
        let mut ticker = tokio::time::interval(Duration::from_secs(sync_secs.max(1)));
        ticker.tick().await;

        info!("sync orchestrator started");
        let mut matrix_open = true;
        let mut chat_open = true;
        while matrix_open || chat_open {
            tokio::select! {
                event = matrix_rx.recv(), if matrix_open => match event {
                    Some(event) => self.dispatch(event).await,
                    None => matrix_open = false,
                },
                event = chat_rx.recv(), if chat_open => match event {
                    Some(event) => self.dispatch(event).await,
                    None => chat_open = false,
                },
                _ = ticker.tick(), if sync_enabled => {
                    if let Err(err) = self.sync_all_metadata().await {
                        error!("metadata sync failed: {}", err);
                    }
                }
            }
        }
        info!("sync orchestrator stopped");
    }

    pub async fn dispatch(&self, event: BridgeEvent) {
        let handle = match event.source {
            Network::GoogleChat => self
                .ctx
                .identity
                .resolve_portal(&event.conversation, false)
                .await
                .map(Some),
            Network::Matrix => {
                self.ctx
                    .identity
                    .portal_by_local_room(&event.conversation)
                    .await
            }
        };
        match handle {
            Ok(Some(handle)) => self.send(&handle, PortalCommand::Event(event)),
            Ok(None) => debug!(
                "no portal for {} conversation={} event_id={}",
                event.source.as_str(),
                event.conversation,
                event.event_id
            ),
            Err(err) => error!(
                "failed to resolve portal conversation={}: {}",
                event.conversation, err
            ),
        }
    }

    /// Bridges `space` to `room_id`, or to a fresh room when none is given.
    pub async fn initialize_portal(
        &self,
        space: &str,
        room_id: Option<String>,
    ) -> Result<String, BridgeError> {
        let handle = self.ctx.identity.resolve_portal(space, false).await?;
        let (reply, result) = oneshot::channel();
        self.send(
            &handle,
            PortalCommand::Initialize {
                room_id,
                reply: Some(reply),
            },
        );
        result.await.map_err(|_| {
            BridgeError::PermanentRejection(format!("portal worker for {space} stopped"))
        })?
    }

    /// Asks every active portal to pull metadata from Google Chat.
    pub async fn sync_all_metadata(&self) -> Result<(), BridgeError> {
        let total = self.ctx.identity.count_portals().await?;
        let portals = self.ctx.identity.list_portals(total.max(1), 0).await?;
        for record in portals
            .into_iter()
            .filter(|portal| portal.state == PortalState::Active)
        {
            let handle = self
                .ctx
                .identity
                .resolve_portal(&record.remote_conversation_id, record.is_direct)
                .await?;
            self.send(&handle, PortalCommand::SyncMetadata);
        }
        Ok(())
    }

    /// Returns false when no portal is bridged to `space`.
    pub async fn request_metadata_sync(&self, space: &str) -> Result<bool, BridgeError> {
        match self.ctx.identity.portal_by_remote(space).await? {
            Some(handle) => {
                self.send(&handle, PortalCommand::SyncMetadata);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Resolves once every worker has handled everything queued before the call.
    pub async fn drain(&self) {
        let workers: Vec<_> = self.workers.lock().values().cloned().collect();
        let mut acks = Vec::with_capacity(workers.len());
        for worker in workers {
            let (done, ack) = oneshot::channel();
            if worker.send(PortalCommand::Barrier(done)).is_ok() {
                acks.push(ack);
            }
        }
        join_all(acks).await;
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    fn send(&self, handle: &Arc<PortalRef>, command: PortalCommand) {
        let mut command = Some(command);
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.get(&handle.id)
            && let Some(pending) = command.take()
            && let Err(mpsc::error::SendError(returned)) = worker.send(pending)
        {
            // The worker died; respawn it with the command it refused.
            command = Some(returned);
        }
        let Some(command) = command else {
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(command);
        workers.insert(handle.id, tx);
        Metrics::set_active_portals(workers.len() as u64);
        drop(workers);
        self.spawn_worker(handle.clone(), rx);
    }

    fn spawn_worker(&self, handle: Arc<PortalRef>, rx: mpsc::UnboundedReceiver<PortalCommand>) {
        let ctx = self.ctx.clone();
        let span = info_span!(
            "portal",
            portal_id = handle.id,
            remote = %handle.remote_conversation_id
        );
        tokio::spawn(
            async move {
                match Portal::load(ctx, &handle).await {
                    Ok(portal) => portal.run(rx).await,
                    Err(err) => error!("failed to load portal: {}", err),
                }
            }
            .instrument(span),
        );
    }
}
