use crate::hub::{Hub, HubConfig, HubHandle};
use crate::metrics::{spawn_sampler, MetricsSource, DEFAULT_METRICS_INTERVAL};
use crate::session::{Outbound, Session};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc, sync::watch, task::JoinHandle};
use topo_core::protocol::{
    classify_close, decode, CLIENT_ID_HEADER, CLOSE_NORMAL, READ_DEADLINE, WS_PATH,
};
use topo_core::TransportError;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub require_identity: bool,
    /// Zero disables hub-initiated pings.
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub read_deadline: Duration,
    pub session_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            require_identity: true,
            ping_interval: Duration::from_secs(20),
            write_timeout: Duration::from_secs(2),
            read_deadline: READ_DEADLINE,
            session_queue: 256,
        }
    }
}

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    config: ServerConfig,
}

pub fn router(hub: HubHandle, config: ServerConfig) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(AppState { hub, config })
}

pub async fn serve(
    listener: TcpListener,
    hub: HubHandle,
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let app = router(hub, config);
    let signal = async move {
        loop {
            let stop = *shutdown.borrow();
            if stop || shutdown.changed().await.is_err() {
                break;
            }
        }
    };
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await
}

pub struct LaunchOptions {
    pub addr: SocketAddr,
    pub hub: HubConfig,
    pub server: ServerConfig,
    pub metrics_interval: Option<Duration>,
    pub metrics_source: Arc<dyn MetricsSource>,
}

impl LaunchOptions {
    pub fn new(addr: SocketAddr, metrics_source: Arc<dyn MetricsSource>) -> Self {
        Self {
            addr,
            hub: HubConfig::default(),
            server: ServerConfig::default(),
            metrics_interval: Some(DEFAULT_METRICS_INTERVAL),
            metrics_source,
        }
    }
}

pub struct RunningHub {
    pub handle: HubHandle,
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    control: JoinHandle<()>,
    sampler: Option<JoinHandle<()>>,
    server: JoinHandle<io::Result<()>>,
}

impl RunningHub {
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, WS_PATH)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub async fn wait(&mut self) -> io::Result<()> {
        match (&mut self.server).await {
            Ok(result) => result,
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
        }
    }

    pub async fn shutdown(self) -> io::Result<()> {
        self.shutdown.send_replace(true);
        let _ = self.control.await;
        if let Some(sampler) = self.sampler {
            let _ = sampler.await;
        }
        match self.server.await {
            Ok(result) => result,
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
        }
    }
}

pub async fn launch(options: LaunchOptions) -> io::Result<RunningHub> {
    let listener = TcpListener::bind(options.addr).await?;
    let addr = listener.local_addr()?;
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (handle, control) = Hub::spawn(options.hub, shutdown_rx.clone());
    let sampler = options.metrics_interval.map(|interval| {
        spawn_sampler(
            handle.clone(),
            options.metrics_source.clone(),
            interval,
            shutdown_rx.clone(),
        )
    });
    let server = tokio::spawn(serve(
        listener,
        handle.clone(),
        options.server,
        shutdown_rx,
    ));
    info!(event = "hub_start", addr = %addr);
    Ok(RunningHub {
        handle,
        addr,
        shutdown,
        control,
        sampler,
        server,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(app): State<AppState>,
) -> Response {
    // Origin is not checked: every origin is accepted.
    if let Some(origin) = headers.get("origin").and_then(|value| value.to_str().ok()) {
        debug!(event = "origin_unchecked", origin = origin, remote = %remote);
    }
    let identity = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let identity = match identity {
        Some(value) => value,
        None if app.config.require_identity => {
            warn!(event = "missing_client_identity", remote = %remote);
            return (StatusCode::BAD_REQUEST, "missing client identity").into_response();
        }
        None => String::new(),
    };
    ws.on_upgrade(move |socket| handle_socket(app, socket, identity, remote))
}

async fn handle_socket(app: AppState, socket: WebSocket, identity: String, remote: SocketAddr) {
    let session_id = app.hub.next_session_id();
    let identity = if identity.is_empty() {
        session_id.clone()
    } else {
        identity
    };
    let (ws_sender, mut ws_receiver) = socket.split();
    let (session, rx) = Session::channel(session_id, identity, app.config.session_queue);
    info!(
        event = "handshake_ok",
        session_id = %session.id(),
        identity = %session.identity(),
        remote = %remote
    );

    let writer = tokio::spawn(writer_loop(
        app.hub.clone(),
        session.clone(),
        ws_sender,
        rx,
        app.config.clone(),
    ));
    if !app.hub.register(session.clone()).await {
        warn!(event = "register_refused", session_id = %session.id());
        session.close();
        let _ = writer.await;
        return;
    }

    let deadline = app.config.read_deadline;
    let closure = tokio::select! {
        closure = read_loop(&app.hub, &session, &mut ws_receiver, deadline) => closure,
        _ = session.closed() => TransportError::Closed,
    };
    match &closure {
        TransportError::NormalClosure => {
            info!(event = "client_close", session_id = %session.id());
        }
        TransportError::Closed => {
            debug!(event = "session_closed_by_hub", session_id = %session.id());
        }
        other => {
            warn!(event = "read_error", session_id = %session.id(), error = %other);
        }
    }
    app.hub.unregister(session.id()).await;
    let _ = writer.await;
}

async fn read_loop(
    hub: &HubHandle,
    session: &Arc<Session>,
    ws_receiver: &mut SplitStream<WebSocket>,
    deadline: Duration,
) -> TransportError {
    loop {
        let next = match tokio::time::timeout(deadline, ws_receiver.next()).await {
            Ok(next) => next,
            Err(_) => {
                return TransportError::AbnormalClosure("read deadline exceeded".to_string())
            }
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => return TransportError::AbnormalClosure(err.to_string()),
            None => {
                if session.is_closed() {
                    return TransportError::NormalClosure;
                }
                return TransportError::AbnormalClosure("stream ended".to_string());
            }
        };
        let data = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Ping(payload) => {
                if let Err(err) = session.pong(payload).await {
                    return err;
                }
                continue;
            }
            Message::Pong(_) => continue,
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|frame| (Some(frame.code), frame.reason.to_string()))
                    .unwrap_or((None, String::new()));
                return classify_close(code, &reason);
            }
        };
        match decode(&data) {
            Ok(envelope) => hub.submit(session, envelope).await,
            Err(err) => {
                warn!(event = "envelope_dropped", session_id = %session.id(), error = %err);
            }
        }
    }
}

async fn writer_loop(
    hub: HubHandle,
    session: Arc<Session>,
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    config: ServerConfig,
) {
    let mut close_signal = session.close_signal();
    let ping_enabled = !config.ping_interval.is_zero();
    let period = if ping_enabled {
        config.ping_interval
    } else {
        Duration::from_secs(3600)
    };
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut failed = false;

    loop {
        let closed = *close_signal.borrow();
        if closed {
            break;
        }
        let message = tokio::select! {
            changed = close_signal.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            outbound = rx.recv() => match outbound {
                Some(Outbound::Text(frame)) => Message::Text(frame),
                Some(Outbound::Pong(payload)) => Message::Pong(payload),
                None => break,
            },
            _ = ping.tick(), if ping_enabled => Message::Ping(Vec::new()),
        };
        match tokio::time::timeout(config.write_timeout, ws_sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "write_error", session_id = %session.id(), error = %err);
                failed = true;
                break;
            }
            Err(_) => {
                warn!(event = "write_timeout", session_id = %session.id());
                failed = true;
                break;
            }
        }
    }

    drop(rx);
    if failed {
        hub.unregister(session.id()).await;
        return;
    }
    let close = Message::Close(Some(CloseFrame {
        code: CLOSE_NORMAL,
        reason: "".into(),
    }));
    if tokio::time::timeout(config.write_timeout, ws_sender.send(close))
        .await
        .is_err()
    {
        error!(event = "close_timeout", session_id = %session.id());
    }
}
