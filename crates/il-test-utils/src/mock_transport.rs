//! In-memory loopback transport.
//!
//! Every `MockTransport` registers itself under an address in a
//! process-global registry; `send_message` looks the target up and delivers
//! straight into its inbound handler.  Tests must use unique addresses —
//! suites run in parallel within one process.
//!
//! Fault injection: `set_online(false)` makes a transport unreachable, so
//! sends and dials toward it fail until it comes back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use async_trait::async_trait;

use il_transport::{InboundHandler, Transport, TransportError, deliver};

type Registry = Mutex<HashMap<String, Arc<MockTransport>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A loopback transport endpoint addressed by name.
pub struct MockTransport {
    address: String,
    handler: Arc<RwLock<Option<InboundHandler>>>,
    online: AtomicBool,
    /// Every payload delivered to this endpoint, `(message, sender)`.
    inbox: Mutex<Vec<(String, String)>>,
}

impl MockTransport {
    /// Create an endpoint and register it under `address`, replacing any
    /// prior registration.
    pub fn register(address: &str) -> Arc<Self> {
        let transport = Arc::new(MockTransport {
            address: address.to_owned(),
            handler: Arc::new(RwLock::new(None)),
            online: AtomicBool::new(true),
            inbox: Mutex::new(Vec::new()),
        });
        registry()
            .lock()
            .expect("mock registry poisoned")
            .insert(address.to_owned(), Arc::clone(&transport));
        transport
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Toggle reachability.  While offline, sends and dials toward this
    /// endpoint fail.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Snapshot of everything delivered to this endpoint.
    pub fn sent_to_me(&self) -> Vec<(String, String)> {
        self.inbox.lock().expect("inbox poisoned").clone()
    }

    fn lookup(target: &str) -> Option<Arc<MockTransport>> {
        registry()
            .lock()
            .expect("mock registry poisoned")
            .get(target)
            .cloned()
    }

    fn all_online_except(address: &str) -> Vec<Arc<MockTransport>> {
        registry()
            .lock()
            .expect("mock registry poisoned")
            .values()
            .filter(|t| t.address != address && t.is_online())
            .cloned()
            .collect()
    }

    async fn deliver_to(target: &Arc<MockTransport>, message: &str, sender: &str) {
        target
            .inbox
            .lock()
            .expect("inbox poisoned")
            .push((message.to_owned(), sender.to_owned()));
        deliver(&target.handler, message.to_owned(), sender.to_owned()).await;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start_server(&self) -> Result<(), TransportError> {
        self.online.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_server(&self) -> Result<(), TransportError> {
        self.online.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(&self, target: &str, message: &str) -> Result<(), TransportError> {
        if target == "*" {
            for peer in Self::all_online_except(&self.address) {
                Self::deliver_to(&peer, message, &self.address).await;
            }
            return Ok(());
        }
        let Some(peer) = Self::lookup(target) else {
            return Err(TransportError::Dial {
                target: target.to_owned(),
                reason: "no such endpoint".to_owned(),
            });
        };
        if !peer.is_online() {
            return Err(TransportError::Write {
                target: target.to_owned(),
                reason: "endpoint offline".to_owned(),
            });
        }
        Self::deliver_to(&peer, message, &self.address).await;
        Ok(())
    }

    async fn connect_to_peer(&self, target: &str) -> Result<(), TransportError> {
        match Self::lookup(target) {
            Some(peer) if peer.is_online() => Ok(()),
            Some(_) => Err(TransportError::Dial {
                target: target.to_owned(),
                reason: "endpoint offline".to_owned(),
            }),
            None => Err(TransportError::Dial {
                target: target.to_owned(),
                reason: "no such endpoint".to_owned(),
            }),
        }
    }

    async fn disconnect_from_peer(&self, _target: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_message_handler(&self, handler: InboundHandler) {
        *self.handler.write().expect("handler slot poisoned") = Some(handler);
    }
}
