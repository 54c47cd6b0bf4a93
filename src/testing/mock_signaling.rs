//! In-memory signaling hub.
//!
//! Routes addressed envelopes to the target peer and broadcasts to every
//! registered peer. Delivery into each receiver preserves per-sender order
//! because dispatch is synchronous under one lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::CallError;
use crate::signaling::{SignalEnvelope, SignalTarget, SignalingTransport};

#[derive(Default)]
pub struct SignalingHub {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<SignalEnvelope>>>>,
    sent: Mutex<Vec<SignalEnvelope>>,
}

impl SignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport bound to this hub for one peer.
    pub fn transport(self: &Arc<Self>, peer_id: &str) -> Arc<MockSignaling> {
        Arc::new(MockSignaling {
            hub: Arc::clone(self),
            peer_id: peer_id.to_string(),
            connected: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
        })
    }

    fn register(&self, peer_id: &str, tx: mpsc::UnboundedSender<SignalEnvelope>) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(peer_id.to_string())
            .or_default()
            .push(tx);
    }

    fn dispatch(&self, envelope: SignalEnvelope) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(envelope.clone());

        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        match &envelope.to {
            SignalTarget::Peer(id) => {
                if let Some(channels) = subscribers.get(id) {
                    for tx in channels {
                        let _ = tx.send(envelope.clone());
                    }
                }
            }
            SignalTarget::All => {
                for channels in subscribers.values() {
                    for tx in channels {
                        let _ = tx.send(envelope.clone());
                    }
                }
            }
        }
    }

    /// Every envelope dispatched through the hub, in send order.
    pub fn sent_log(&self) -> Vec<SignalEnvelope> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn sent_of_kind(&self, kind: &str) -> Vec<SignalEnvelope> {
        self.sent_log()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }
}

pub struct MockSignaling {
    hub: Arc<SignalingHub>,
    peer_id: String,
    connected: AtomicBool,
    fail_send: AtomicBool,
}

impl MockSignaling {
    /// Make every subsequent send fail, simulating a dead channel.
    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingTransport for MockSignaling {
    async fn connect(&self, _session_id: &str, _peer_id: &str) -> Result<(), CallError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<(), CallError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(CallError::Signaling("injected send failure".to_string()));
        }
        self.hub.dispatch(envelope);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>, CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.register(&self.peer_id, tx);
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), CallError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
