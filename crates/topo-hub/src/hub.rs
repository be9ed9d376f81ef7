use crate::registry::ServiceRegistry;
use crate::session::Session;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use topo_core::protocol::{encode, Envelope, Message};
use topo_core::{Broker, Metrics, Project, RegistryError, SharedState};
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub initial_state: SharedState,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            initial_state: SharedState::default(),
        }
    }
}

struct Registration {
    session: Arc<Session>,
    ack: oneshot::Sender<bool>,
}

#[derive(Debug)]
enum TopologyChange {
    UpsertBroker(Broker),
    RemoveBroker(String),
    UpsertProject(Project),
    RemoveProject(String),
}

#[derive(Debug, Clone, Copy)]
enum TopologyQuery {
    Brokers,
    Projects,
}

/// Work items on the broadcast queue. Every state mutation travels through
/// here so mutations and the broadcasts that follow them are totally ordered.
#[derive(Debug)]
enum Dispatch {
    ApplyState { sender: String, state: SharedState },
    Relay { sender: String, payload: Value },
    Mutate { sender: String, change: TopologyChange },
    Query { session_id: String, query: TopologyQuery },
    Reply { session_id: String, envelope: Envelope },
    Publish(Envelope),
}

pub struct Hub;

impl Hub {
    pub fn spawn(config: HubConfig, shutdown: watch::Receiver<bool>) -> (HubHandle, JoinHandle<()>) {
        let capacity = config.queue_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(capacity);
        let state = Arc::new(RwLock::new(config.initial_state));
        let session_count = Arc::new(AtomicUsize::new(0));

        let handle = HubHandle {
            register_tx,
            unregister_tx,
            dispatch_tx,
            state: state.clone(),
            services: ServiceRegistry::new(),
            session_count: session_count.clone(),
            conn_counter: Arc::new(AtomicU64::new(0)),
        };
        let control = ControlLoop {
            sessions: HashMap::new(),
            state,
            session_count,
        };
        let task = tokio::spawn(control.run(register_rx, unregister_rx, dispatch_rx, shutdown));
        (handle, task)
    }
}

#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<String>,
    dispatch_tx: mpsc::Sender<Dispatch>,
    state: Arc<RwLock<SharedState>>,
    services: ServiceRegistry,
    session_count: Arc<AtomicUsize>,
    conn_counter: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn next_session_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    /// Add a session and send it the current state. Resolves once the control
    /// loop has processed the registration; `false` means the session was not
    /// admitted (hub stopped, session already closed or initial state lost).
    pub async fn register(&self, session: Arc<Session>) -> bool {
        let session_id = session.id().to_string();
        let (ack, done) = oneshot::channel();
        if self
            .register_tx
            .send(Registration { session, ack })
            .await
            .is_err()
        {
            warn!(event = "hub_unavailable", op = "register", session_id = %session_id);
            return false;
        }
        done.await.unwrap_or(false)
    }

    pub async fn unregister(&self, session_id: &str) {
        if self
            .unregister_tx
            .send(session_id.to_string())
            .await
            .is_err()
        {
            debug!(event = "hub_unavailable", op = "unregister", session_id = session_id);
        }
    }

    pub async fn submit(&self, session: &Session, envelope: Envelope) {
        let Envelope { message, sender } = envelope;
        let sender = if sender.is_empty() {
            session.identity().to_string()
        } else {
            sender
        };
        let kind = message.message_type();
        let dispatch = match message {
            Message::State(state) => Dispatch::ApplyState { sender, state },
            Message::Broadcast(payload) => Dispatch::Relay { sender, payload },
            Message::RegisterService(service) => {
                if let Err(err) = self.services.register_service(service).await {
                    warn!(event = "registration_dropped", session_id = %session.id(), error = %err);
                }
                return;
            }
            Message::RemoveService(id) => {
                self.services.remove_service(&id).await;
                return;
            }
            Message::ListServices(_) => {
                let services = self.services.list_services().await;
                Dispatch::Reply {
                    session_id: session.id().to_string(),
                    envelope: Envelope::from_hub(Message::ListServices(Some(services))),
                }
            }
            Message::RegisterBroker(broker) => {
                if let Err(err) = validate_entry("broker", &broker.id, &broker.name) {
                    warn!(event = "registration_dropped", session_id = %session.id(), error = %err);
                    return;
                }
                Dispatch::Mutate {
                    sender,
                    change: TopologyChange::UpsertBroker(broker),
                }
            }
            Message::RemoveBroker(id) => Dispatch::Mutate {
                sender,
                change: TopologyChange::RemoveBroker(id),
            },
            Message::RegisterProjects(project) => {
                if let Err(err) = validate_entry("project", &project.id, &project.name) {
                    warn!(event = "registration_dropped", session_id = %session.id(), error = %err);
                    return;
                }
                Dispatch::Mutate {
                    sender,
                    change: TopologyChange::UpsertProject(project),
                }
            }
            Message::RemoveProjects(id) => Dispatch::Mutate {
                sender,
                change: TopologyChange::RemoveProject(id),
            },
            Message::ListBrokers(_) => Dispatch::Query {
                session_id: session.id().to_string(),
                query: TopologyQuery::Brokers,
            },
            Message::ListProjects(_) => Dispatch::Query {
                session_id: session.id().to_string(),
                query: TopologyQuery::Projects,
            },
            Message::Connected(_) => {
                info!(event = "client_connected", session_id = %session.id(), identity = %session.identity());
                return;
            }
            Message::Metrics(_) => {
                debug!(event = "metrics_ignored", session_id = %session.id());
                return;
            }
        };
        if self.dispatch_tx.send(dispatch).await.is_err() {
            warn!(event = "hub_unavailable", op = "submit", r#type = %kind);
        }
    }

    pub async fn publish_metrics(&self, metrics: Metrics) {
        let envelope = Envelope::from_hub(Message::Metrics(metrics));
        if self.dispatch_tx.send(Dispatch::Publish(envelope)).await.is_err() {
            debug!(event = "hub_unavailable", op = "publish_metrics");
        }
    }

    pub async fn snapshot(&self) -> SharedState {
        self.state.read().await.clone()
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::SeqCst)
    }
}

fn validate_entry(kind: &'static str, id: &str, name: &str) -> Result<(), RegistryError> {
    if id.trim().is_empty() {
        return Err(RegistryError::MissingField { kind, field: "id" });
    }
    if name.trim().is_empty() {
        return Err(RegistryError::MissingField { kind, field: "name" });
    }
    Ok(())
}

struct ControlLoop {
    sessions: HashMap<String, Arc<Session>>,
    state: Arc<RwLock<SharedState>>,
    session_count: Arc<AtomicUsize>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut register_rx: mpsc::Receiver<Registration>,
        mut unregister_rx: mpsc::Receiver<String>,
        mut dispatch_rx: mpsc::Receiver<Dispatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(event = "hub_loop_start");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(registration) = register_rx.recv() => {
                    self.register(registration).await;
                }
                Some(session_id) = unregister_rx.recv() => {
                    self.remove(&session_id, "unregister");
                }
                Some(dispatch) = dispatch_rx.recv() => {
                    self.dispatch(dispatch).await;
                }
                else => break,
            }
        }

        let ids = self.sessions.keys().cloned().collect::<Vec<_>>();
        for session_id in ids {
            self.remove(&session_id, "hub_shutdown");
        }
        info!(event = "hub_loop_stop");
    }

    async fn register(&mut self, registration: Registration) {
        let Registration { session, ack } = registration;
        let session_id = session.id().to_string();
        if session.is_closed() {
            debug!(event = "register_closed_session", session_id = %session_id);
            let _ = ack.send(false);
            return;
        }
        self.sessions.insert(session_id.clone(), session.clone());
        self.update_count();
        info!(
            event = "session_registered",
            session_id = %session_id,
            identity = %session.identity(),
            sessions = self.sessions.len()
        );

        let snapshot = self.state.read().await.clone();
        let envelope = Envelope::from_hub(Message::State(snapshot));
        let delivered = match encode(&envelope) {
            Ok(frame) => session.send_frame(frame).map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        let admitted = match delivered {
            Ok(()) => true,
            Err(err) => {
                warn!(event = "initial_state_failed", session_id = %session_id, error = %err);
                self.remove(&session_id, "initial_state_failed");
                false
            }
        };
        let _ = ack.send(admitted);
    }

    fn remove(&mut self, session_id: &str, reason: &str) -> bool {
        let Some(session) = self.sessions.remove(session_id) else {
            return false;
        };
        session.close();
        self.update_count();
        info!(
            event = "session_unregistered",
            session_id = session_id,
            identity = %session.identity(),
            reason = reason,
            sessions = self.sessions.len()
        );
        true
    }

    fn update_count(&self) {
        self.session_count
            .store(self.sessions.len(), Ordering::SeqCst);
    }

    async fn dispatch(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::ApplyState { sender, state } => {
                {
                    let mut current = self.state.write().await;
                    *current = state.clone();
                }
                info!(event = "state_applied", sender = %sender);
                self.deliver(&Envelope::new(sender, Message::State(state)), None);
            }
            Dispatch::Relay { sender, payload } => {
                let envelope = Envelope::new(sender.clone(), Message::Broadcast(payload));
                self.deliver(&envelope, Some(&sender));
            }
            Dispatch::Mutate { sender, change } => {
                let updated = {
                    let mut current = self.state.write().await;
                    let changed = match change {
                        TopologyChange::UpsertBroker(broker) => {
                            current.upsert_broker(broker);
                            true
                        }
                        TopologyChange::RemoveBroker(id) => current.remove_broker(&id),
                        TopologyChange::UpsertProject(project) => {
                            current.upsert_project(project);
                            true
                        }
                        TopologyChange::RemoveProject(id) => current.remove_project(&id),
                    };
                    changed.then(|| (*current).clone())
                };
                match updated {
                    Some(state) => {
                        info!(event = "state_mutated", sender = %sender);
                        self.deliver(&Envelope::new(sender, Message::State(state)), None);
                    }
                    None => debug!(event = "state_unchanged", sender = %sender),
                }
            }
            Dispatch::Query { session_id, query } => {
                let message = {
                    let current = self.state.read().await;
                    match query {
                        TopologyQuery::Brokers => Message::ListBrokers(Some(current.brokers.clone())),
                        TopologyQuery::Projects => {
                            Message::ListProjects(Some(current.projects.clone()))
                        }
                    }
                };
                self.reply(&session_id, &Envelope::from_hub(message));
            }
            Dispatch::Reply {
                session_id,
                envelope,
            } => self.reply(&session_id, &envelope),
            Dispatch::Publish(envelope) => self.deliver(&envelope, None),
        }
    }

    fn deliver(&mut self, envelope: &Envelope, skip: Option<&str>) {
        let frame = match encode(envelope) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "encode_error", r#type = %envelope.message_type(), error = %err);
                return;
            }
        };
        let mut dead = Vec::new();
        let mut delivered = 0usize;
        for (session_id, session) in &self.sessions {
            if skip.is_some_and(|identity| identity == session.identity()) {
                continue;
            }
            match session.send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(event = "send_error", session_id = %session_id, error = %err);
                    dead.push(session_id.clone());
                }
            }
        }
        for session_id in dead {
            self.remove(&session_id, "send_error");
        }
        debug!(
            event = "broadcast",
            r#type = %envelope.message_type(),
            delivered = delivered
        );
    }

    fn reply(&mut self, session_id: &str, envelope: &Envelope) {
        let Some(session) = self.sessions.get(session_id).cloned() else {
            debug!(event = "reply_miss", session_id = session_id);
            return;
        };
        let result = encode(envelope)
            .map_err(|err| err.to_string())
            .and_then(|frame| session.send_frame(frame).map_err(|err| err.to_string()));
        if let Err(err) = result {
            warn!(event = "send_error", session_id = session_id, error = %err);
            self.remove(session_id, "send_error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbound;
    use std::time::Duration;
    use topo_core::protocol::{decode, HUB_SENDER_ID};
    use topo_core::{Actor, Server, Service};

    fn launch() -> (HubHandle, watch::Sender<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let (handle, task) = Hub::spawn(HubConfig::default(), rx);
        (handle, tx, task)
    }

    async fn join(
        hub: &HubHandle,
        identity: &str,
    ) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let (session, mut rx) = Session::channel(hub.next_session_id(), identity, 32);
        assert!(hub.register(session.clone()).await);
        let initial = next_envelope(&mut rx).await;
        assert!(matches!(initial.message, Message::State(_)));
        (session, rx)
    }

    async fn next_envelope(rx: &mut mpsc::Receiver<Outbound>) -> Envelope {
        let outbound = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("session queue closed");
        match outbound {
            Outbound::Text(frame) => decode(frame.as_bytes()).expect("decode frame"),
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    async fn wait_for_count(hub: &HubHandle, expected: usize) {
        for _ in 0..100 {
            if hub.session_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "session count stuck at {} (wanted {expected})",
            hub.session_count()
        );
    }

    fn state_named(label: &str) -> SharedState {
        SharedState {
            servers: vec![Server {
                id: format!("srv-{label}"),
                name: label.to_string(),
                url: format!("http://{label}"),
            }],
            brokers: Vec::new(),
            projects: Vec::new(),
            actor: Actor {
                id: format!("actor-{label}"),
            },
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn newcomer_observes_last_applied_state() {
        let (hub, _shutdown, _task) = launch();
        let (writer, mut writer_rx) = join(&hub, "client-a").await;

        for label in ["one", "two", "three"] {
            hub.submit(
                &writer,
                Envelope::new("client-a", Message::State(state_named(label))),
            )
            .await;
        }
        for label in ["one", "two", "three"] {
            let echoed = next_envelope(&mut writer_rx).await;
            assert_eq!(echoed.message, Message::State(state_named(label)));
            assert_eq!(echoed.sender, "client-a");
        }

        let (late, mut late_rx) = Session::channel(hub.next_session_id(), "client-b", 8);
        assert!(hub.register(late.clone()).await);
        let initial = next_envelope(&mut late_rx).await;
        assert_eq!(initial.sender, HUB_SENDER_ID);
        assert_eq!(initial.message, Message::State(state_named("three")));
        assert_eq!(hub.snapshot().await, state_named("three"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broadcast_skips_only_the_sender() {
        let (hub, _shutdown, _task) = launch();
        let mut members = Vec::new();
        for idx in 0..4 {
            members.push(join(&hub, &format!("client-{idx}")).await);
        }

        let (origin, _) = &members[2];
        hub.submit(
            origin,
            Envelope::new("client-2", Message::Broadcast(serde_json::json!("hello"))),
        )
        .await;
        hub.submit(origin, Envelope::new("client-2", Message::State(state_named("fence"))))
            .await;

        let mut deliveries = 0;
        for (idx, (_, rx)) in members.iter_mut().enumerate() {
            let first = next_envelope(rx).await;
            if idx == 2 {
                assert_eq!(first.message, Message::State(state_named("fence")));
                continue;
            }
            assert_eq!(first.message, Message::Broadcast(serde_json::json!("hello")));
            assert_eq!(first.sender, "client-2");
            deliveries += 1;
        }
        assert_eq!(deliveries, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_sender_is_stamped_with_session_identity() {
        let (hub, _shutdown, _task) = launch();
        let (origin, mut origin_rx) = join(&hub, "client-a").await;
        let (_peer, mut peer_rx) = join(&hub, "client-b").await;

        hub.submit(&origin, Envelope::new("", Message::Broadcast(serde_json::json!(1))))
            .await;
        let relayed = next_envelope(&mut peer_rx).await;
        assert_eq!(relayed.sender, "client-a");

        hub.submit(&origin, Envelope::new("", Message::State(state_named("x"))))
            .await;
        let echoed = next_envelope(&mut origin_rx).await;
        assert_eq!(echoed.message, Message::State(state_named("x")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_session_is_dropped_without_blocking_others() {
        let (hub, _shutdown, _task) = launch();
        let (first, mut first_rx) = join(&hub, "client-1").await;
        let (second, second_rx) = join(&hub, "client-2").await;
        let (_third, mut third_rx) = join(&hub, "client-3").await;
        drop(second_rx);

        hub.submit(&first, Envelope::new("client-1", Message::State(state_named("after"))))
            .await;

        let to_first = next_envelope(&mut first_rx).await;
        let to_third = next_envelope(&mut third_rx).await;
        assert_eq!(to_first.message, Message::State(state_named("after")));
        assert_eq!(to_third.message, Message::State(state_named("after")));

        wait_for_count(&hub, 2).await;
        assert!(second.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_initial_state_tears_session_down() {
        let (hub, _shutdown, _task) = launch();
        let (session, rx) = Session::channel(hub.next_session_id(), "client-a", 4);
        drop(rx);

        assert!(!hub.register(session.clone()).await);
        assert_eq!(hub.session_count(), 0);
        assert!(session.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unregister_is_idempotent() {
        let (hub, _shutdown, _task) = launch();
        let (session, _rx) = join(&hub, "client-a").await;
        let (_other, _other_rx) = join(&hub, "client-b").await;

        hub.unregister(session.id()).await;
        hub.unregister(session.id()).await;
        hub.unregister("conn-missing").await;

        wait_for_count(&hub, 1).await;
        assert!(session.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_closes_every_session() {
        let (hub, shutdown, task) = launch();
        let (a, _a_rx) = join(&hub, "client-a").await;
        let (b, _b_rx) = join(&hub, "client-b").await;

        shutdown.send(true).expect("signal shutdown");
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop exits")
            .expect("join");

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn service_listing_replies_only_to_requester() {
        let (hub, _shutdown, _task) = launch();
        let (requester, mut requester_rx) = join(&hub, "client-a").await;
        let (_bystander, mut bystander_rx) = join(&hub, "client-b").await;

        let api = Service {
            id: "s1".to_string(),
            name: "api".to_string(),
            endpoint: "http://x".to_string(),
            description: String::new(),
            metadata: HashMap::new(),
        };
        hub.submit(&requester, Envelope::new("client-a", Message::RegisterService(api.clone())))
            .await;
        hub.submit(&requester, Envelope::new("client-a", Message::ListServices(None)))
            .await;
        let listed = next_envelope(&mut requester_rx).await;
        assert_eq!(listed.message, Message::ListServices(Some(vec![api])));

        hub.submit(&requester, Envelope::new("client-a", Message::RemoveService("s1".to_string())))
            .await;
        hub.submit(&requester, Envelope::new("client-a", Message::ListServices(None)))
            .await;
        let emptied = next_envelope(&mut requester_rx).await;
        assert_eq!(emptied.message, Message::ListServices(Some(Vec::new())));

        assert!(bystander_rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broker_and_project_registration_mutates_state() {
        let (hub, _shutdown, _task) = launch();
        let (origin, mut origin_rx) = join(&hub, "client-a").await;
        let (_peer, mut peer_rx) = join(&hub, "client-b").await;

        let broker = Broker::new("queue", "amqp://queue");
        hub.submit(&origin, Envelope::new("client-a", Message::RegisterBroker(broker.clone())))
            .await;
        let to_peer = next_envelope(&mut peer_rx).await;
        let Message::State(state) = to_peer.message else {
            panic!("expected state broadcast")
        };
        assert_eq!(state.brokers, vec![broker.clone()]);
        next_envelope(&mut origin_rx).await;

        let project = Project::new("atlas");
        hub.submit(&origin, Envelope::new("client-a", Message::RegisterProjects(project.clone())))
            .await;
        next_envelope(&mut origin_rx).await;

        hub.submit(&origin, Envelope::new("client-a", Message::ListProjects(None)))
            .await;
        let listed = next_envelope(&mut origin_rx).await;
        assert_eq!(listed.message, Message::ListProjects(Some(vec![project])));

        hub.submit(&origin, Envelope::new("client-a", Message::RemoveBroker(broker.id.clone())))
            .await;
        next_envelope(&mut origin_rx).await;
        hub.submit(&origin, Envelope::new("client-a", Message::ListBrokers(None)))
            .await;
        let brokers = next_envelope(&mut origin_rx).await;
        assert_eq!(brokers.message, Message::ListBrokers(Some(Vec::new())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_registration_is_dropped() {
        let (hub, _shutdown, _task) = launch();
        let (origin, mut origin_rx) = join(&hub, "client-a").await;

        let nameless = Broker {
            id: "b1".to_string(),
            name: String::new(),
            url: "amqp://x".to_string(),
        };
        hub.submit(&origin, Envelope::new("client-a", Message::RegisterBroker(nameless)))
            .await;
        hub.submit(&origin, Envelope::new("client-a", Message::ListBrokers(None)))
            .await;

        let listed = next_envelope(&mut origin_rx).await;
        assert_eq!(listed.message, Message::ListBrokers(Some(Vec::new())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn published_metrics_reach_everyone() {
        let (hub, _shutdown, _task) = launch();
        let (_a, mut a_rx) = join(&hub, "client-a").await;
        let (_b, mut b_rx) = join(&hub, "client-b").await;

        let metrics = Metrics {
            cpu: 12.5,
            memory: 40.0,
            storage: 71.0,
            network: 3.0,
        };
        hub.publish_metrics(metrics).await;

        for rx in [&mut a_rx, &mut b_rx] {
            let envelope = next_envelope(rx).await;
            assert_eq!(envelope.sender, HUB_SENDER_ID);
            assert_eq!(envelope.message, Message::Metrics(metrics));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_after_shutdown_is_refused() {
        let (hub, shutdown, task) = launch();
        shutdown.send(true).expect("signal shutdown");
        task.await.expect("join");

        let (session, _rx) = Session::channel(hub.next_session_id(), "client-late", 4);
        assert!(!hub.register(session.clone()).await);
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shutdown_wins_over_queued_dispatch() {
        let (hub, shutdown, task) = launch();
        let (session, mut rx) = join(&hub, "client-a").await;

        shutdown.send(true).expect("signal shutdown");
        for _ in 0..16 {
            hub.publish_metrics(Metrics::default()).await;
        }
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop exits")
            .expect("join");

        assert!(session.is_closed());
        assert!(rx.try_recv().is_err());
    }
}
