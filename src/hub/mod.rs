//! Connection hub
//!
//! Single-writer actor owning the live connection registry and fan-out.
//! All mutation flows through one command queue consumed by the hub task;
//! commands posted from the same caller are processed in FIFO order. No
//! other code touches the indices.
//!
//! Connections hold nothing but a bounded outbound sender; the hub owns the
//! registry entry and initiates teardown. Aggregate reads are served from a
//! snapshot the loop refreshes after every mutation, so readers never block
//! the loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::{Message, MessageType, OUTBOUND_QUEUE_SIZE};

/// Pre-serialized frame shared across recipients of one fan-out.
pub type OutboundFrame = Arc<str>;

/// Bounded per-connection outbound queue sender.
pub type OutboundSender = mpsc::Sender<OutboundFrame>;

/// Identity stamped onto a connection when its auth frame validates.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    pub user_id: String,
    pub session_id: String,
    pub device_id: String,
    pub device_type: String,
    pub device_name: String,
    pub is_admin: bool,
}

/// Commands accepted by the hub loop.
pub enum HubCommand {
    Register {
        connection_id: String,
        sender: OutboundSender,
    },
    Authenticate {
        connection_id: String,
        identity: ConnectionIdentity,
    },
    Unregister {
        connection_id: String,
    },
    Broadcast(Message),
    AdminBroadcast(Message),
    DisconnectDevice {
        device_id: String,
    },
}

struct ConnectionEntry {
    connection_id: String,
    sender: OutboundSender,
    user_id: String,
    session_id: String,
    device_id: String,
    device_type: String,
    device_name: String,
    is_authenticated: bool,
    is_admin: bool,
    connected_at: DateTime<Utc>,
}

/// Read-only aggregate view, refreshed by the loop after every mutation.
#[derive(Debug, Clone, Default)]
pub struct HubSnapshot {
    pub total: i64,
    pub authenticated: i64,
    pub peak: i64,
    pub messages_sent: i64,
    pub messages_received: i64,
    /// Unique device ids per user, across that user's live connections.
    pub devices_by_user: HashMap<String, Vec<String>>,
    /// device_id → connection_id for devices with a live connection.
    pub online_devices: HashMap<String, String>,
}

/// Cloneable handle onto the hub's command queue and read snapshot.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
    snapshot: Arc<RwLock<HubSnapshot>>,
}

impl HubHandle {
    pub fn register(&self, connection_id: String, sender: OutboundSender) {
        let _ = self.tx.send(HubCommand::Register {
            connection_id,
            sender,
        });
    }

    pub fn authenticate(&self, connection_id: String, identity: ConnectionIdentity) {
        let _ = self.tx.send(HubCommand::Authenticate {
            connection_id,
            identity,
        });
    }

    pub fn unregister(&self, connection_id: String) {
        let _ = self.tx.send(HubCommand::Unregister { connection_id });
    }

    /// Fan a frame out to every connection of `message.user_id`, except the
    /// connection named by `payload.exclude_connection`.
    pub fn broadcast(&self, message: Message) {
        let _ = self.tx.send(HubCommand::Broadcast(message));
    }

    pub fn admin_broadcast(&self, message: Message) {
        let _ = self.tx.send(HubCommand::AdminBroadcast(message));
    }

    pub fn disconnect_device(&self, device_id: String) {
        let _ = self.tx.send(HubCommand::DisconnectDevice { device_id });
    }

    pub fn snapshot(&self) -> HubSnapshot {
        self.snapshot.read().clone()
    }

    pub fn connection_count(&self) -> i64 {
        self.snapshot.read().total
    }

    pub fn is_device_online(&self, device_id: &str) -> bool {
        self.snapshot.read().online_devices.contains_key(device_id)
    }
}

/// Spawn the hub task and return a handle onto its queue.
pub fn spawn() -> HubHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let snapshot = Arc::new(RwLock::new(HubSnapshot::default()));
    let hub = Hub {
        rx,
        entries: HashMap::new(),
        by_user: HashMap::new(),
        by_device: HashMap::new(),
        total: 0,
        authenticated: 0,
        peak: 0,
        messages_sent: 0,
        messages_received: 0,
        snapshot: snapshot.clone(),
    };
    tokio::spawn(hub.run());
    HubHandle { tx, snapshot }
}

struct Hub {
    rx: mpsc::UnboundedReceiver<HubCommand>,
    entries: HashMap<String, ConnectionEntry>,
    by_user: HashMap<String, HashSet<String>>,
    by_device: HashMap<String, String>,
    total: i64,
    authenticated: i64,
    peak: i64,
    messages_sent: i64,
    messages_received: i64,
    snapshot: Arc<RwLock<HubSnapshot>>,
}

impl Hub {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                HubCommand::Register {
                    connection_id,
                    sender,
                } => self.register(connection_id, sender),
                HubCommand::Authenticate {
                    connection_id,
                    identity,
                } => self.authenticate(&connection_id, identity),
                HubCommand::Unregister { connection_id } => self.unregister(&connection_id),
                HubCommand::Broadcast(message) => self.handle_broadcast(message),
                HubCommand::AdminBroadcast(message) => self.handle_admin_broadcast(message),
                HubCommand::DisconnectDevice { device_id } => {
                    if let Some(connection_id) = self.by_device.get(&device_id).cloned() {
                        self.unregister(&connection_id);
                    }
                }
            }
            self.refresh_snapshot();
        }
    }

    fn register(&mut self, connection_id: String, sender: OutboundSender) {
        self.entries.insert(
            connection_id.clone(),
            ConnectionEntry {
                connection_id: connection_id.clone(),
                sender,
                user_id: String::new(),
                session_id: String::new(),
                device_id: String::new(),
                device_type: String::new(),
                device_name: String::new(),
                is_authenticated: false,
                is_admin: false,
                connected_at: Utc::now(),
            },
        );
        self.total += 1;
        if self.total > self.peak {
            self.peak = self.total;
        }
        info!(
            target: "hub",
            connection_id = %connection_id,
            total_connections = self.total,
            "connection registered"
        );
    }

    fn authenticate(&mut self, connection_id: &str, identity: ConnectionIdentity) {
        if !self.entries.contains_key(connection_id) {
            return;
        }

        // Last writer wins on device identity: the previous holder of this
        // device_id is disconnected before the new connection takes over.
        if !identity.device_id.is_empty() {
            if let Some(existing) = self.by_device.get(&identity.device_id).cloned() {
                if existing != connection_id {
                    info!(
                        target: "hub",
                        device_id = %identity.device_id,
                        old_connection = %existing,
                        new_connection = %connection_id,
                        "device reconnected elsewhere, disconnecting old connection"
                    );
                    self.unregister(&existing);
                }
            }
        }

        let Some(entry) = self.entries.get_mut(connection_id) else {
            return;
        };
        entry.user_id = identity.user_id.clone();
        entry.session_id = identity.session_id.clone();
        entry.device_id = identity.device_id.clone();
        entry.device_type = identity.device_type;
        entry.device_name = identity.device_name;
        entry.is_admin = identity.is_admin;
        if !entry.is_authenticated {
            entry.is_authenticated = true;
            self.authenticated += 1;
        }

        self.by_user
            .entry(identity.user_id.clone())
            .or_default()
            .insert(connection_id.to_string());
        if !identity.device_id.is_empty() {
            self.by_device
                .insert(identity.device_id.clone(), connection_id.to_string());
        }

        if !identity.user_id.is_empty() && !identity.session_id.is_empty() {
            self.notify_device_joined(connection_id);
        }
    }

    fn unregister(&mut self, connection_id: &str) {
        let Some(entry) = self.entries.remove(connection_id) else {
            return;
        };
        // Dropping the entry drops the only sender, which closes the
        // outbound queue exactly once.
        self.total -= 1;
        if entry.is_authenticated {
            self.authenticated -= 1;
        }

        if let Some(conns) = self.by_user.get_mut(&entry.user_id) {
            conns.remove(connection_id);
            if conns.is_empty() {
                self.by_user.remove(&entry.user_id);
            }
        }
        if !entry.device_id.is_empty() {
            if self.by_device.get(&entry.device_id).map(String::as_str) == Some(connection_id) {
                self.by_device.remove(&entry.device_id);
            }
        }

        info!(
            target: "hub",
            connection_id = %entry.connection_id,
            user_id = %entry.user_id,
            device_id = %entry.device_id,
            total_connections = self.total,
            "connection unregistered"
        );

        if !entry.user_id.is_empty() && !entry.session_id.is_empty() {
            self.notify_device_left(&entry);
        }
    }

    fn handle_broadcast(&mut self, message: Message) {
        self.messages_received += 1;
        if message.user_id.is_empty() {
            return;
        }
        let exclude = message
            .payload_str("exclude_connection")
            .unwrap_or_default()
            .to_string();
        let frame: OutboundFrame = Arc::from(message.to_wire());

        let Some(conn_ids) = self.by_user.get(&message.user_id) else {
            return;
        };
        for conn_id in conn_ids {
            if *conn_id == exclude {
                continue;
            }
            let Some(entry) = self.entries.get(conn_id) else {
                continue;
            };
            match entry.sender.try_send(frame.clone()) {
                Ok(()) => self.messages_sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        target: "hub",
                        connection_id = %conn_id,
                        "outbound queue full, dropping frame"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    fn handle_admin_broadcast(&mut self, message: Message) {
        let frame: OutboundFrame = Arc::from(message.to_wire());
        for entry in self.entries.values() {
            if !entry.is_admin {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = entry.sender.try_send(frame.clone())
            {
                warn!(
                    target: "hub",
                    connection_id = %entry.connection_id,
                    "admin outbound queue full, dropping frame"
                );
            }
        }
    }

    /// Informational frame to every *other* connection of the same user.
    fn notify_device_joined(&mut self, connection_id: &str) {
        let Some(entry) = self.entries.get(connection_id) else {
            return;
        };
        let mut message = Message::build(
            MessageType::DeviceJoined,
            json!({
                "connection_id": entry.connection_id,
                "device_type": entry.device_type,
                "device_name": entry.device_name,
                "connected_at": entry.connected_at.timestamp(),
            }),
        );
        message.user_id = entry.user_id.clone();
        message.session_id = entry.session_id.clone();
        message.device_id = entry.device_id.clone();
        let frame: OutboundFrame = Arc::from(message.to_wire());

        let Some(conn_ids) = self.by_user.get(&entry.user_id) else {
            return;
        };
        for conn_id in conn_ids {
            if conn_id == connection_id {
                continue;
            }
            if let Some(other) = self.entries.get(conn_id) {
                let _ = other.sender.try_send(frame.clone());
            }
        }
    }

    /// Informational frame to every remaining connection of the user.
    fn notify_device_left(&mut self, entry: &ConnectionEntry) {
        let mut message = Message::build(
            MessageType::DeviceLeft,
            json!({
                "connection_id": entry.connection_id,
                "disconnected_at": Utc::now().timestamp(),
            }),
        );
        message.user_id = entry.user_id.clone();
        message.session_id = entry.session_id.clone();
        message.device_id = entry.device_id.clone();
        let frame: OutboundFrame = Arc::from(message.to_wire());

        let Some(conn_ids) = self.by_user.get(&entry.user_id) else {
            return;
        };
        for conn_id in conn_ids {
            if let Some(other) = self.entries.get(conn_id) {
                let _ = other.sender.try_send(frame.clone());
            }
        }
    }

    fn refresh_snapshot(&self) {
        let mut devices_by_user: HashMap<String, Vec<String>> = HashMap::new();
        for (user_id, conn_ids) in &self.by_user {
            let mut devices: HashSet<&str> = HashSet::new();
            for conn_id in conn_ids {
                if let Some(entry) = self.entries.get(conn_id) {
                    if !entry.device_id.is_empty() {
                        devices.insert(entry.device_id.as_str());
                    }
                }
            }
            devices_by_user.insert(
                user_id.clone(),
                devices.into_iter().map(|d| d.to_string()).collect(),
            );
        }
        let online_devices = self
            .by_device
            .iter()
            .map(|(device, conn)| (device.clone(), conn.clone()))
            .collect();

        *self.snapshot.write() = HubSnapshot {
            total: self.total,
            authenticated: self.authenticated,
            peak: self.peak,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            devices_by_user,
            online_devices,
        };
    }
}

/// Build the bounded outbound queue for a new connection.
pub fn outbound_channel() -> (OutboundSender, mpsc::Receiver<OutboundFrame>) {
    mpsc::channel(OUTBOUND_QUEUE_SIZE)
}
