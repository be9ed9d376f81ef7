use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use topo_core::protocol::PONG_WAIT;
use topo_core::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Pong(Vec<u8>),
}

#[derive(Debug)]
pub struct Session {
    id: String,
    identity: String,
    sender: mpsc::Sender<Outbound>,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
}

impl Session {
    pub fn new(id: String, identity: String, sender: mpsc::Sender<Outbound>) -> Self {
        let (close_signal, _) = watch::channel(false);
        Self {
            id,
            identity,
            sender,
            closed: AtomicBool::new(false),
            close_signal,
        }
    }

    pub fn channel(
        id: impl Into<String>,
        identity: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(id.into(), identity.into(), tx)), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn send_frame(&self, frame: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.sender.try_send(Outbound::Text(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::AbnormalClosure(
                "writer task gone".to_string(),
            )),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::AbnormalClosure(
                "outbound queue full".to_string(),
            )),
        }
    }

    pub async fn pong(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match tokio::time::timeout(PONG_WAIT, self.sender.send(Outbound::Pong(payload))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::AbnormalClosure(
                "writer task gone".to_string(),
            )),
            Err(_) => Err(TransportError::AbnormalClosure(
                "pong not queued in time".to_string(),
            )),
        }
    }

    /// Close-once. Later calls do nothing.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.close_signal.send_replace(true);
        true
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_signal.subscribe()
    }

    pub async fn closed(&self) {
        let mut signal = self.close_signal.subscribe();
        loop {
            let closed = *signal.borrow();
            if closed || signal.changed().await.is_err() {
                return;
            }
        }
    }
}
