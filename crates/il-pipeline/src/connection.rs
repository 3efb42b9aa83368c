//! Per-peer connection state machine with heartbeat and supervision.
//!
//! ```text
//! DISCONNECTED ──connect_to_agent──▶ CONNECTING ──ok──▶ CONNECTED
//!                                        │                  │
//!                                        └──fail──▶ ERROR   │ heartbeat silence
//!                                                           ▼
//!                                                     RECONNECTING
//!                                        retry < max ──▶ CONNECTING (retry+1)
//!                                        else        ──▶ ERROR
//! ```
//!
//! Two background loops run while the manager is started: the heartbeat
//! loop pings every CONNECTED peer and bumps `last_seen` on a successful
//! send; the supervisor loop demotes silent peers to RECONNECTING and
//! re-dials them until the retry budget runs out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use il_crypto::EncryptionHandler;
use il_protocol::{Protocol, now_ts};
use il_transport::{Transport, TransportError};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Errors surfaced by explicit connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("unknown agent {0}")]
    UnknownAgent(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Snapshot of one peer connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub agent_id: String,
    pub address: String,
    pub status: ConnectionStatus,
    pub connected_at: Option<f64>,
    /// Monotonic non-decreasing while CONNECTED.
    pub last_seen: Option<f64>,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Heartbeat and supervision tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub supervisor_period: Duration,
    pub max_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            supervisor_period: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

/// Everything the background loops share with the public API.
struct Core {
    transport: Arc<dyn Transport>,
    protocol: Protocol,
    /// Set when the pipeline runs encrypted, so heartbeats match.
    crypto: Option<Arc<EncryptionHandler>>,
    config: ConnectionConfig,
    connections: Mutex<HashMap<String, ConnectionInfo>>,
}

struct LoopHandles {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Manages connections to peer agents over one transport.
pub struct ConnectionManager {
    core: Arc<Core>,
    loops: Mutex<Option<LoopHandles>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, agent_id: impl Into<String>) -> Self {
        Self::with_config(transport, agent_id, None, ConnectionConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        agent_id: impl Into<String>,
        crypto: Option<Arc<EncryptionHandler>>,
        config: ConnectionConfig,
    ) -> Self {
        ConnectionManager {
            core: Arc::new(Core {
                transport,
                protocol: Protocol::new(agent_id),
                crypto,
                config,
                connections: Mutex::new(HashMap::new()),
            }),
            loops: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the heartbeat and supervisor loops.  Idempotent.
    pub fn start(&self) {
        let mut loops = self.loops.lock().expect("loop slot poisoned");
        if loops.is_some() {
            return;
        }
        let (tx, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(heartbeat_loop(Arc::clone(&self.core), tx.subscribe())),
            tokio::spawn(supervisor_loop(Arc::clone(&self.core), tx.subscribe())),
        ];
        *loops = Some(LoopHandles { shutdown: tx, tasks });
        info!("connection manager started");
    }

    /// Stop the loops and disconnect every peer.
    pub async fn stop(&self) {
        let taken = self.loops.lock().expect("loop slot poisoned").take();
        if let Some(handles) = taken {
            let _ = handles.shutdown.send(true);
            for task in handles.tasks {
                let _ = task.await;
            }
        }
        let agents: Vec<String> = {
            let connections = self.core.connections.lock().expect("connection table poisoned");
            connections.keys().cloned().collect()
        };
        for agent_id in agents {
            let _ = self.disconnect_from_agent(&agent_id).await;
        }
        info!("connection manager stopped");
    }

    // -----------------------------------------------------------------------
    // Peer operations
    // -----------------------------------------------------------------------

    /// Dial a peer.  Re-entering for an already CONNECTED peer is a no-op;
    /// for a peer in ERROR it restarts the attempt with a fresh retry
    /// budget.
    pub async fn connect_to_agent(
        &self,
        agent_id: &str,
        address: &str,
    ) -> Result<(), ConnectionError> {
        {
            let mut connections =
                self.core.connections.lock().expect("connection table poisoned");
            let entry = connections
                .entry(agent_id.to_owned())
                .or_insert_with(|| ConnectionInfo {
                    agent_id: agent_id.to_owned(),
                    address: address.to_owned(),
                    status: ConnectionStatus::Disconnected,
                    connected_at: None,
                    last_seen: None,
                    retry_count: 0,
                    max_retries: self.core.config.max_retries,
                });
            if entry.status == ConnectionStatus::Connected {
                return Ok(());
            }
            entry.address = address.to_owned();
            entry.status = ConnectionStatus::Connecting;
            entry.retry_count = 0;
        }
        self.core.dial(agent_id, address).await
    }

    pub async fn disconnect_from_agent(&self, agent_id: &str) -> Result<(), ConnectionError> {
        let address = {
            let mut connections =
                self.core.connections.lock().expect("connection table poisoned");
            let entry = connections
                .get_mut(agent_id)
                .ok_or_else(|| ConnectionError::UnknownAgent(agent_id.to_owned()))?;
            entry.status = ConnectionStatus::Disconnected;
            entry.address.clone()
        };
        // Transports without peer semantics report NotConnected; the state
        // transition above already happened either way.
        match self.core.transport.disconnect_from_peer(&address).await {
            Ok(()) | Err(TransportError::NotConnected(_)) => {
                info!(agent_id, "peer disconnected");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send one heartbeat to a CONNECTED peer; bumps `last_seen` on
    /// success.
    pub async fn send_heartbeat(&self, agent_id: &str) -> bool {
        self.core.send_heartbeat(agent_id).await
    }

    /// Record traffic from a peer.  `last_seen` never moves backwards.
    pub fn update_last_seen(&self, agent_id: &str) {
        self.core.update_last_seen(agent_id);
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn get_connection_status(&self, agent_id: &str) -> Option<ConnectionStatus> {
        self.core
            .connections
            .lock()
            .expect("connection table poisoned")
            .get(agent_id)
            .map(|c| c.status)
    }

    pub fn get_connection_info(&self, agent_id: &str) -> Option<ConnectionInfo> {
        self.core
            .connections
            .lock()
            .expect("connection table poisoned")
            .get(agent_id)
            .cloned()
    }

    pub fn get_connected_agents(&self) -> Vec<String> {
        self.core.connected_agents()
    }
}

impl Core {
    /// One dial attempt; transitions the entry to CONNECTED or ERROR.
    async fn dial(&self, agent_id: &str, address: &str) -> Result<(), ConnectionError> {
        match self.transport.connect_to_peer(address).await {
            Ok(()) => {
                let now = now_ts();
                let mut connections =
                    self.connections.lock().expect("connection table poisoned");
                if let Some(entry) = connections.get_mut(agent_id) {
                    entry.status = ConnectionStatus::Connected;
                    entry.connected_at = Some(now);
                    entry.last_seen = Some(now);
                    entry.retry_count = 0;
                }
                info!(agent_id, address, "peer connected");
                Ok(())
            }
            Err(e) => {
                let mut connections =
                    self.connections.lock().expect("connection table poisoned");
                if let Some(entry) = connections.get_mut(agent_id) {
                    entry.status = ConnectionStatus::Error;
                }
                warn!(agent_id, address, error = %e, "peer dial failed");
                Err(e.into())
            }
        }
    }

    async fn send_heartbeat(&self, agent_id: &str) -> bool {
        let address = {
            let connections = self.connections.lock().expect("connection table poisoned");
            match connections.get(agent_id) {
                Some(entry) if entry.status == ConnectionStatus::Connected => {
                    entry.address.clone()
                }
                _ => return false,
            }
        };

        let heartbeat = self.protocol.create_heartbeat(&format!("heartbeat_{agent_id}"));
        let payload = match il_protocol::encode_json(&heartbeat) {
            Ok(serialized) => match &self.crypto {
                Some(crypto) => match crypto.encrypt_message(&serialized) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!(agent_id, error = %e, "heartbeat encryption failed");
                        return false;
                    }
                },
                None => serialized,
            },
            Err(e) => {
                warn!(agent_id, error = %e, "heartbeat encode failed");
                return false;
            }
        };

        match self.transport.send_message(&address, &payload).await {
            Ok(()) => {
                self.update_last_seen(agent_id);
                debug!(agent_id, "heartbeat sent");
                true
            }
            Err(e) => {
                debug!(agent_id, error = %e, "heartbeat send failed");
                false
            }
        }
    }

    fn update_last_seen(&self, agent_id: &str) {
        let now = now_ts();
        let mut connections = self.connections.lock().expect("connection table poisoned");
        if let Some(entry) = connections.get_mut(agent_id) {
            if entry.last_seen.is_none_or(|seen| now > seen) {
                entry.last_seen = Some(now);
            }
        }
    }

    fn connected_agents(&self) -> Vec<String> {
        self.connections
            .lock()
            .expect("connection table poisoned")
            .values()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .map(|c| c.agent_id.clone())
            .collect()
    }

    /// One supervision pass: demote silent CONNECTED peers, then re-dial
    /// RECONNECTING peers that still have retry budget.
    async fn supervise(&self) {
        let now = now_ts();
        let timeout = self.config.heartbeat_timeout.as_secs_f64();

        let mut redial: Vec<(String, String)> = Vec::new();
        {
            let mut connections = self.connections.lock().expect("connection table poisoned");
            for entry in connections.values_mut() {
                match entry.status {
                    ConnectionStatus::Connected => {
                        let silent = entry
                            .last_seen
                            .is_none_or(|seen| now - seen > timeout);
                        if silent {
                            warn!(
                                agent_id = %entry.agent_id,
                                "peer silent past heartbeat timeout, reconnecting"
                            );
                            entry.status = ConnectionStatus::Reconnecting;
                            redial.push((entry.agent_id.clone(), entry.address.clone()));
                        }
                    }
                    ConnectionStatus::Reconnecting => {
                        redial.push((entry.agent_id.clone(), entry.address.clone()));
                    }
                    _ => {}
                }
            }

            // Spend one retry per pass; exhausted peers go terminal.
            redial.retain(|(agent_id, _)| {
                let Some(entry) = connections.get_mut(agent_id) else {
                    return false;
                };
                if entry.retry_count < entry.max_retries {
                    entry.retry_count += 1;
                    entry.status = ConnectionStatus::Connecting;
                    true
                } else {
                    warn!(agent_id, "retry budget exhausted, marking peer errored");
                    entry.status = ConnectionStatus::Error;
                    false
                }
            });
        }

        for (agent_id, address) in redial {
            debug!(agent_id = %agent_id, "reconnect attempt");
            if self.dial(&agent_id, &address).await.is_err() {
                // Stay in the retry cycle until the budget runs out.
                let mut connections =
                    self.connections.lock().expect("connection table poisoned");
                if let Some(entry) = connections.get_mut(&agent_id) {
                    if entry.status == ConnectionStatus::Error
                        && entry.retry_count < entry.max_retries
                    {
                        entry.status = ConnectionStatus::Reconnecting;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn heartbeat_loop(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(core.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for agent_id in core.connected_agents() {
                    core.send_heartbeat(&agent_id).await;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn supervisor_loop(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(core.config.supervisor_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => core.supervise().await,
            _ = shutdown.changed() => break,
        }
    }
}
