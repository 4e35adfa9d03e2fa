//! The hub owns the set of live connections.
//!
//! Sessions never touch the registry. They send [`Event`]s through a
//! [`HubHandle`], and a single task drains the queue in arrival order, so
//! membership changes and broadcast fan-out never overlap.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::HubConfig,
    connection::{Connection, ConnectionId},
};

enum Event {
    Join(Arc<Connection>),
    Leave(ConnectionId),
    Broadcast {
        source: ConnectionId,
        text: String,
    },
    Members {
        respond_to: oneshot::Sender<Vec<ConnectionId>>,
    },
    Shutdown {
        notice: String,
        respond_to: oneshot::Sender<()>,
    },
}

/// Cloneable sender side of the hub's event queue.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::Sender<Event>,
}

impl HubHandle {
    /// Adds `connection` to the registry. Joining twice is a no-op.
    pub async fn join(&self, connection: Arc<Connection>) -> Result<()> {
        self.send(Event::Join(connection)).await
    }

    /// Removes and closes the connection if it is still registered.
    pub async fn leave(&self, id: ConnectionId) -> Result<()> {
        self.send(Event::Leave(id)).await
    }

    /// Queues a leave without awaiting, for use from `Drop`.
    ///
    /// Falls back to a spawned send when the queue is full so the leave is
    /// never lost while the hub is running.
    pub fn leave_detached(&self, id: ConnectionId) {
        match self.events.try_send(Event::Leave(id)) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let events = self.events.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            let _ = events.send(event).await;
                        });
                    }
                    Err(_) => warn!(%id, "no runtime available to queue leave"),
                }
            }
            Err(TrySendError::Closed(_)) => debug!(%id, "hub stopped before leave"),
        }
    }

    /// Delivers `text` to every registered connection except `source`.
    pub async fn broadcast(&self, source: ConnectionId, text: impl Into<String>) -> Result<()> {
        self.send(Event::Broadcast {
            source,
            text: text.into(),
        })
        .await
    }

    /// Registered connection ids, ordered by connection id (accept order).
    pub async fn members(&self) -> Result<Vec<ConnectionId>> {
        let (respond_to, response) = oneshot::channel();
        self.send(Event::Members { respond_to }).await?;
        response.await.context("members response channel closed")
    }

    /// Writes `notice` to every connection, closes them all and stops the hub.
    pub async fn shutdown(&self, notice: impl Into<String>) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.send(Event::Shutdown {
            notice: notice.into(),
            respond_to,
        })
        .await?;
        response.await.context("shutdown response channel closed")
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("hub is no longer running"))
    }
}

pub struct Hub {
    events: mpsc::Receiver<Event>,
    registry: BTreeMap<ConnectionId, Arc<Connection>>,
    write_timeout: Duration,
}

impl Hub {
    pub fn new(config: &HubConfig) -> (Self, HubHandle) {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let hub = Self {
            events: events_rx,
            registry: BTreeMap::new(),
            write_timeout: config.write_timeout,
        };
        (hub, HubHandle { events: events_tx })
    }

    /// Processes events until every handle is dropped or a shutdown arrives.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
        info!(remaining = self.registry.len(), "hub stopped");
    }

    async fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Join(connection) => self.handle_join(connection),
            Event::Leave(id) => self.handle_leave(id).await,
            Event::Broadcast { source, text } => self.handle_broadcast(source, &text).await,
            Event::Members { respond_to } => {
                let _ = respond_to.send(self.registry.keys().copied().collect());
            }
            Event::Shutdown { notice, respond_to } => {
                self.handle_shutdown(&notice).await;
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    fn handle_join(&mut self, connection: Arc<Connection>) {
        let id = connection.id();
        if self.registry.contains_key(&id) {
            debug!(%id, "ignoring duplicate join");
            return;
        }
        debug!(
            %id,
            peer = ?connection.peer(),
            members = self.registry.len() + 1,
            "connection joined"
        );
        self.registry.insert(id, connection);
    }

    async fn handle_leave(&mut self, id: ConnectionId) {
        match self.registry.remove(&id) {
            Some(connection) => {
                debug!(%id, members = self.registry.len(), "connection left");
                self.close(&connection).await;
            }
            None => debug!(%id, "leave for unknown connection"),
        }
    }

    async fn handle_broadcast(&mut self, source: ConnectionId, text: &str) {
        let mut failed = Vec::new();
        for (id, recipient) in &self.registry {
            if *id == source {
                continue;
            }
            match timeout(self.write_timeout, recipient.write_line(text)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(%id, error = ?err, "failed to deliver broadcast");
                    failed.push(*id);
                }
                Err(_) => {
                    warn!(%id, timeout = ?self.write_timeout, "broadcast write timed out");
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            if let Some(connection) = self.registry.remove(&id) {
                info!(%id, peer = ?connection.peer(), "dropping unreachable connection");
                self.close(&connection).await;
            }
        }
    }

    async fn handle_shutdown(&mut self, notice: &str) {
        info!(members = self.registry.len(), "closing all connections");
        for (id, connection) in std::mem::take(&mut self.registry) {
            if let Ok(Err(err)) = timeout(self.write_timeout, connection.write_line(notice)).await {
                debug!(%id, error = ?err, "failed to deliver shutdown notice");
            }
            self.close(&connection).await;
        }
    }

    async fn close(&self, connection: &Connection) {
        if timeout(self.write_timeout, connection.close()).await.is_err() {
            warn!(id = %connection.id(), "timed out closing connection");
        }
    }
}
