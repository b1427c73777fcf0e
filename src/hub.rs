//! Event fan-out to connected dashboard clients
//!
//! The hub is a single control loop ([`HubLoop`]) fed by three intake queues:
//! register, unregister and broadcast. Only the loop mutates the client set, so
//! registration, removal and fan-out are applied one at a time in loop order.
//!
//! Each client gets a bounded outbound queue. Fan-out never waits on a client: a
//! queue that is full (or already closed) gets its client evicted, and dropping the
//! queue's sender is what tells the client's pump to close the connection.
//!
//! ```text
//! producers ──broadcast──┐
//! upgrade   ──register───┼──▶ HubLoop ──try_send──▶ client queue ──▶ ClientConnection
//! pumps     ──unregister─┘
//! ```

use crate::events::{AppHealth, ConfigSnapshot, Event, HealthMap, HealthSummary};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, error, info, warn};

/// Identifier the hub assigns to each client
pub type ClientId = u64;

/// An encoded event as delivered to clients
pub type Frame = Utf8Bytes;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("event hub is no longer running")]
    Closed,
}

/// Queue sizes for the hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each intake queue (register, unregister, broadcast)
    pub intake_capacity: usize,
    /// Capacity of each client's outbound queue
    pub client_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            intake_capacity: 256,
            client_queue_capacity: 256,
        }
    }
}

/// A registered client's end of its outbound queue
#[derive(Debug)]
pub struct Subscription {
    pub id: ClientId,
    pub receiver: mpsc::Receiver<Frame>,
}

struct Registration {
    id: ClientId,
    sender: mpsc::Sender<Frame>,
}

type ClientSet = Arc<RwLock<HashMap<ClientId, mpsc::Sender<Frame>>>>;

/// Cloneable handle used by producers and client connections
#[derive(Clone)]
pub struct EventHub {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ClientId>,
    broadcast_tx: mpsc::Sender<Event>,
    clients: ClientSet,
    next_id: Arc<AtomicU64>,
    client_queue_capacity: usize,
}

/// The hub's control loop; run it exactly once
pub struct HubLoop {
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<ClientId>,
    broadcast_rx: mpsc::Receiver<Event>,
    clients: ClientSet,
}

impl EventHub {
    pub fn new(config: HubConfig) -> (Self, HubLoop) {
        let (register_tx, register_rx) = mpsc::channel(config.intake_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.intake_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.intake_capacity);
        let clients: ClientSet = Arc::new(RwLock::new(HashMap::new()));

        let hub = Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            clients: Arc::clone(&clients),
            next_id: Arc::new(AtomicU64::new(1)),
            client_queue_capacity: config.client_queue_capacity.max(1),
        };

        let hub_loop = HubLoop {
            register_rx,
            unregister_rx,
            broadcast_rx,
            clients,
        };

        (hub, hub_loop)
    }

    /// Register a new client and return the receiving end of its outbound queue.
    ///
    /// The client is added when the loop processes the request; a broadcast
    /// submitted concurrently by another task may or may not reach it.
    pub async fn register(&self) -> Result<Subscription, HubError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.client_queue_capacity);

        self.register_tx
            .send(Registration { id, sender })
            .await
            .map_err(|_| HubError::Closed)?;

        Ok(Subscription { id, receiver })
    }

    /// Remove a client and close its queue. Unknown ids are ignored.
    pub async fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.unregister_tx
            .send(id)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Queue an event for delivery to every client
    pub async fn broadcast(&self, event: Event) -> Result<(), HubError> {
        self.broadcast_tx
            .send(event)
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn broadcast_config_update(&self, snapshot: ConfigSnapshot) -> Result<(), HubError> {
        self.broadcast(Event::ConfigUpdated(snapshot)).await
    }

    pub async fn broadcast_health_update(&self, health: HealthMap) -> Result<(), HubError> {
        self.broadcast(Event::HealthChanged(health)).await
    }

    pub async fn broadcast_app_health_update(
        &self,
        app: &str,
        health: HealthSummary,
    ) -> Result<(), HubError> {
        self.broadcast(Event::AppHealthChanged(AppHealth {
            app: app.to_string(),
            health,
        }))
        .await
    }

    /// Number of registered clients, for observability only
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }
}

impl HubLoop {
    /// Process intake requests until shutdown or until every hub handle is dropped
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Event hub started");

        loop {
            tokio::select! {
                biased;

                Some(registration) = self.register_rx.recv() => {
                    self.add(registration);
                }
                Some(id) = self.unregister_rx.recv() => {
                    self.remove(id);
                }
                Some(event) = self.broadcast_rx.recv() => {
                    self.fan_out(&event);
                }
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Event hub shutting down");
                        break;
                    }
                }
                else => break,
            }
        }

        let mut clients = self.clients.write();
        let remaining = clients.len();
        clients.clear();
        debug!(remaining, "Closed all client queues");
    }

    fn add(&self, registration: Registration) {
        let mut clients = self.clients.write();
        clients.insert(registration.id, registration.sender);
        info!(client_id = registration.id, clients = clients.len(), "Client connected");
    }

    fn remove(&self, id: ClientId) {
        let mut clients = self.clients.write();
        if clients.remove(&id).is_some() {
            info!(client_id = id, clients = clients.len(), "Client disconnected");
        }
    }

    fn fan_out(&self, event: &Event) {
        let frame: Frame = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                error!(event = event.kind(), error = %e, "Failed to encode event, dropping it");
                return;
            }
        };

        let clients = self.clients.upgradable_read();
        let mut evicted = Vec::new();

        for (id, sender) in clients.iter() {
            match sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(client_id = id, event = event.kind(), "Client queue full, evicting slow consumer");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client_id = id, "Client queue closed, removing");
                    evicted.push(*id);
                }
            }
        }

        let delivered = clients.len() - evicted.len();
        if !evicted.is_empty() {
            let mut clients = RwLockUpgradableReadGuard::upgrade(clients);
            for id in &evicted {
                clients.remove(id);
            }
        }

        debug!(event = event.kind(), delivered, evicted = evicted.len(), "Event broadcast");
    }
}
