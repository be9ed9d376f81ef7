use crate::backoff::{retry_with_backoff, wait_shutdown, BackoffPolicy, RetryError};
use crate::error::ClientError;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use topo_core::protocol::{
    classify_close, decode, encode, Envelope, MessageType, CLIENT_ID_HEADER, PONG_WAIT,
    READ_DEADLINE,
};
use topo_core::{Actor, DialError, TransportError};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

pub const DEFAULT_INBOX_CAPACITY: usize = 100;
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub link: String,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub handshake_timeout: Duration,
    pub inbox_capacity: usize,
    pub read_deadline: Duration,
    pub pong_wait: Duration,
    pub write_timeout: Duration,
}

impl ClientConfig {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            read_deadline: READ_DEADLINE,
            pong_wait: PONG_WAIT,
            write_timeout: Duration::from_secs(2),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    Active,
    Reconnecting { attempt: u32 },
    PermanentlyFailed,
}

enum ReadEnd {
    Shutdown,
    Closed(TransportError),
}

enum Outbound {
    Text(String),
    Pong(Vec<u8>),
    Close,
}

struct Writer {
    tx: mpsc::Sender<Outbound>,
    task: JoinHandle<()>,
}

impl Writer {
    async fn close(self, limit: Duration) {
        let Writer { tx, mut task } = self;
        if tx.try_send(Outbound::Close).is_err() {
            task.abort();
            return;
        }
        drop(tx);
        if tokio::time::timeout(limit, &mut task).await.is_err() {
            debug!(event = "close_timeout");
            task.abort();
        }
    }
}

struct Reading {
    source: WsSource,
    failed: oneshot::Receiver<TransportError>,
}

/// WebSocket client that keeps one hub connection alive.
#[derive(Clone)]
pub struct ResilientClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    identity: Actor,
    status: watch::Sender<ClientStatus>,
    writer: Mutex<Option<Writer>>,
    pending: Mutex<Option<Reading>>,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    inbox_tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    terminal: Mutex<Option<ClientError>>,
    shutdown: watch::Sender<bool>,
    torn_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResilientClient {
    pub fn new(config: ClientConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let (status, _) = watch::channel(ClientStatus::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                identity: Actor::generate(),
                status,
                writer: Mutex::new(None),
                pending: Mutex::new(None),
                handlers: RwLock::new(HashMap::new()),
                inbox_tx: Mutex::new(Some(inbox_tx)),
                inbox_rx: Mutex::new(Some(inbox_rx)),
                reader: Mutex::new(None),
                terminal: Mutex::new(None),
                shutdown,
                torn_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> &Actor {
        &self.inner.identity
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.inner.status.subscribe()
    }

    pub fn terminal_error(&self) -> Option<ClientError> {
        lock(&self.inner.terminal).clone()
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return Err(ClientError::Shutdown);
        }
        self.inner.set_status(ClientStatus::Connecting);
        match self.inner.dial().await {
            Ok(stream) => {
                self.inner.attach(stream)?;
                self.inner.set_status(ClientStatus::Active);
                info!(
                    event = "client_connected",
                    link = %self.inner.config.link,
                    identity = %self.inner.identity.id
                );
                Ok(())
            }
            Err(err) => {
                self.inner.set_status(ClientStatus::Disconnected);
                warn!(event = "client_connect_error", link = %self.inner.config.link, error = %err);
                Err(err.into())
            }
        }
    }

    pub async fn subscribe(&self) -> Result<(), ClientError> {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return Err(ClientError::Shutdown);
        }
        let mut reader = lock(&self.inner.reader);
        if reader.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(event = "subscribe_noop");
            return Ok(());
        }
        if lock(&self.inner.pending).is_none() {
            return Err(ClientError::NotConnected);
        }
        *reader = Some(tokio::spawn(run_reader(self.inner.clone())));
        Ok(())
    }

    pub fn on_message<F>(&self, kind: MessageType, handler: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        handlers.insert(kind, Arc::new(handler));
    }

    pub fn messages(&self) -> Option<mpsc::Receiver<Envelope>> {
        lock(&self.inner.inbox_rx).take()
    }

    pub async fn send(&self, mut envelope: Envelope) -> Result<(), ClientError> {
        let Some(tx) = self.inner.outbound() else {
            return Err(ClientError::NotConnected);
        };
        if envelope.sender.is_empty() {
            envelope.sender = self.inner.identity.id.clone();
        }
        let frame = encode(&envelope)?;
        tx.try_send(Outbound::Text(frame)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ClientError::Transport(
                TransportError::AbnormalClosure("outbound queue full".to_string()),
            ),
            mpsc::error::TrySendError::Closed(_) => ClientError::Transport(TransportError::Closed),
        })
    }

    pub async fn disconnect(&self) {
        self.inner.teardown().await;
    }

    #[cfg(test)]
    fn deliver(&self, envelope: Envelope) {
        self.inner.deliver(envelope);
    }
}

impl Inner {
    fn set_status(&self, status: ClientStatus) {
        self.status.send_replace(status);
    }

    async fn dial(&self) -> Result<WsStream, DialError> {
        let link = self.config.link.as_str();
        let parsed = Url::parse(link).map_err(|err| DialError::InvalidLink {
            link: link.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(DialError::InvalidLink {
                link: link.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        let mut request = link
            .into_client_request()
            .map_err(|err| DialError::InvalidLink {
                link: link.to_string(),
                reason: err.to_string(),
            })?;
        let identity = HeaderValue::from_str(&self.identity.id)
            .map_err(|err| DialError::InvalidIdentity(err.to_string()))?;
        request.headers_mut().insert(CLIENT_ID_HEADER, identity);

        let timeout = self.config.handshake_timeout;
        let (stream, response) = match tokio::time::timeout(timeout, connect_async(request)).await
        {
            Err(_) => return Err(DialError::Timeout(timeout)),
            Ok(Err(WsError::Http(response))) => {
                return Err(DialError::UnexpectedStatus(response.status().as_u16()))
            }
            Ok(Err(err)) => return Err(DialError::Handshake(err.to_string())),
            Ok(Ok(value)) => value,
        };
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(DialError::UnexpectedStatus(response.status().as_u16()));
        }
        Ok(stream)
    }

    fn attach(&self, stream: WsStream) -> Result<(), ClientError> {
        let mut writer = lock(&self.writer);
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(ClientError::Shutdown);
        }
        let (sink, source) = stream.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (failed_tx, failed) = oneshot::channel();
        let task = tokio::spawn(writer_loop(sink, rx, failed_tx, self.config.write_timeout));
        if let Some(previous) = writer.replace(Writer { tx, task }) {
            previous.task.abort();
        }
        *lock(&self.pending) = Some(Reading { source, failed });
        Ok(())
    }

    fn outbound(&self) -> Option<mpsc::Sender<Outbound>> {
        lock(&self.writer).as_ref().map(|writer| writer.tx.clone())
    }

    fn detach_writer(&self) {
        if let Some(writer) = lock(&self.writer).take() {
            writer.task.abort();
        }
    }

    fn deliver(&self, envelope: Envelope) {
        let kind = envelope.message_type();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();
        if let Some(inbox) = lock(&self.inbox_tx).as_ref() {
            match inbox.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "inbox_full", r#type = %kind);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(event = "inbox_closed", r#type = %kind);
                }
            }
        }
        if let Some(handler) = handler {
            handler(&envelope);
        }
    }

    async fn read_until_closed(
        &self,
        reading: &mut Reading,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReadEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_shutdown(shutdown) => return ReadEnd::Shutdown,
                failed = &mut reading.failed => {
                    return ReadEnd::Closed(failed.unwrap_or_else(|_| {
                        TransportError::AbnormalClosure("writer stopped".to_string())
                    }));
                }
                next = tokio::time::timeout(self.config.read_deadline, reading.source.next()) => next,
            };
            let message = match next {
                Err(_) => {
                    return ReadEnd::Closed(TransportError::AbnormalClosure(
                        "read deadline exceeded".to_string(),
                    ))
                }
                Ok(None) => {
                    return ReadEnd::Closed(TransportError::AbnormalClosure(
                        "stream ended".to_string(),
                    ))
                }
                Ok(Some(Err(err))) => {
                    return ReadEnd::Closed(TransportError::AbnormalClosure(err.to_string()))
                }
                Ok(Some(Ok(message))) => message,
            };
            let data = match message {
                WsMessage::Text(text) => text.into_bytes(),
                WsMessage::Binary(bytes) => bytes,
                WsMessage::Ping(payload) => {
                    if let Err(err) = self.pong(payload).await {
                        return ReadEnd::Closed(err);
                    }
                    continue;
                }
                WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                WsMessage::Close(frame) => {
                    let (code, reason) = frame
                        .map(|frame| (Some(u16::from(frame.code)), frame.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    return ReadEnd::Closed(classify_close(code, &reason));
                }
            };
            match decode(&data) {
                Ok(envelope) => self.deliver(envelope),
                Err(err) => warn!(event = "envelope_dropped", error = %err),
            }
        }
    }

    async fn pong(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let Some(tx) = self.outbound() else {
            return Err(TransportError::AbnormalClosure("writer detached".to_string()));
        };
        match tokio::time::timeout(self.config.pong_wait, tx.send(Outbound::Pong(payload))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::AbnormalClosure("writer stopped".to_string())),
            Err(_) => Err(TransportError::AbnormalClosure("pong timeout".to_string())),
        }
    }

    async fn reconnect(
        self: &Arc<Self>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        let policy = self.config.backoff();
        let outcome = retry_with_backoff(&policy, shutdown, |attempt| {
            let inner = Arc::clone(self);
            async move {
                if inner.torn_down.load(Ordering::SeqCst) {
                    return Err(DialError::Handshake("client shut down".to_string()));
                }
                inner.set_status(ClientStatus::Reconnecting { attempt });
                info!(event = "reconnect_attempt", attempt = attempt, link = %inner.config.link);
                inner.dial().await
            }
        })
        .await;
        match outcome {
            Ok(stream) => {
                self.attach(stream)?;
                self.set_status(ClientStatus::Active);
                info!(event = "reconnected", link = %self.config.link);
                Ok(())
            }
            Err(RetryError::Shutdown) => Err(ClientError::Shutdown),
            Err(RetryError::Exhausted { attempts, .. }) => {
                Err(ClientError::ReconnectExhausted { attempts })
            }
        }
    }

    async fn fail(&self, err: ClientError) {
        error!(event = "client_failed", link = %self.config.link, error = %err);
        *lock(&self.terminal) = Some(err);
        self.set_status(ClientStatus::PermanentlyFailed);
        self.teardown().await;
    }

    async fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.send_replace(true);
        lock(&self.inbox_tx).take();

        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            writer.close(self.config.write_timeout).await;
        }
        lock(&self.pending).take();
        self.status.send_if_modified(|status| {
            if *status == ClientStatus::PermanentlyFailed || *status == ClientStatus::Disconnected {
                return false;
            }
            *status = ClientStatus::Disconnected;
            true
        });
        info!(event = "client_disconnected", identity = %self.identity.id);
        true
    }
}

async fn run_reader(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let reading = lock(&inner.pending).take();
        let Some(mut reading) = reading else {
            break;
        };
        let end = inner.read_until_closed(&mut reading, &mut shutdown).await;
        drop(reading);
        match end {
            ReadEnd::Shutdown => break,
            ReadEnd::Closed(TransportError::NormalClosure) => {
                info!(event = "hub_closed", link = %inner.config.link);
                inner.teardown().await;
                break;
            }
            ReadEnd::Closed(err) => {
                warn!(event = "transport_lost", link = %inner.config.link, error = %err);
                inner.detach_writer();
                match inner.reconnect(&mut shutdown).await {
                    Ok(()) => continue,
                    Err(ClientError::Shutdown) => break,
                    Err(err) => {
                        inner.fail(err).await;
                        break;
                    }
                }
            }
        }
    }
    debug!(event = "reader_stop");
}

async fn writer_loop(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<Outbound>,
    failed: oneshot::Sender<TransportError>,
    write_timeout: Duration,
) {
    while let Some(outbound) = rx.recv().await {
        let message = match outbound {
            Outbound::Text(frame) => WsMessage::Text(frame),
            Outbound::Pong(payload) => WsMessage::Pong(payload),
            Outbound::Close => {
                let close = WsMessage::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                }));
                let closing = async {
                    let _ = sink.send(close).await;
                    let _ = sink.close().await;
                };
                if tokio::time::timeout(write_timeout, closing).await.is_err() {
                    debug!(event = "close_timeout");
                }
                return;
            }
        };
        let err = match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => TransportError::AbnormalClosure(err.to_string()),
            Err(_) => TransportError::AbnormalClosure("write timeout".to_string()),
        };
        warn!(event = "write_failed", error = %err);
        let _ = failed.send(err);
        return;
    }
}
