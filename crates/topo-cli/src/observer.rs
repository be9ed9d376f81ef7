use serde_json::json;
use tokio::sync::watch;
use topo_client::{ClientConfig, ClientStatus, ResilientClient};
use topo_core::protocol::{Envelope, Message, MessageType};
use topo_core::SharedState;
use tracing::{info, warn};

pub struct Observer {
    client: ResilientClient,
}

impl Observer {
    pub fn new(link: String) -> Self {
        let client = ResilientClient::new(ClientConfig::new(link));
        client.on_message(MessageType::State, |envelope| {
            if let Message::State(state) = &envelope.message {
                log_state(&envelope.sender, state);
            }
        });
        client.on_message(MessageType::Metrics, |envelope| {
            if let Message::Metrics(metrics) = &envelope.message {
                info!(
                    event = "metrics_update",
                    cpu = metrics.cpu,
                    memory = metrics.memory,
                    storage = metrics.storage,
                    network = metrics.network
                );
            }
        });
        client.on_message(MessageType::Broadcast, |envelope| {
            if let Message::Broadcast(payload) = &envelope.message {
                info!(event = "broadcast", sender = %envelope.sender, payload = %payload);
            }
        });
        Self { client }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        // Handlers do the work; nobody drains the inbox.
        drop(self.client.messages());
        self.client.connect().await?;
        self.client.subscribe().await?;
        let announce = Envelope::new(
            "",
            Message::Connected(json!({ "identity": self.client.identity().id })),
        );
        if let Err(err) = self.client.send(announce).await {
            warn!(event = "announce_failed", error = %err);
        }

        let mut status = self.client.watch_status();
        loop {
            let current = status.borrow_and_update().clone();
            match current {
                ClientStatus::PermanentlyFailed => {
                    let err = self.client.terminal_error();
                    self.client.disconnect().await;
                    return match err {
                        Some(err) => Err(err.into()),
                        None => Err(anyhow::anyhow!("observer failed")),
                    };
                }
                ClientStatus::Disconnected => {
                    info!(event = "observer_stop", reason = "hub_closed");
                    return Ok(());
                }
                other => info!(event = "observer_status", status = ?other),
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.client.disconnect().await;
        info!(event = "observer_stop", reason = "shutdown");
        Ok(())
    }
}

fn log_state(sender: &str, state: &SharedState) {
    info!(
        event = "state_update",
        sender = sender,
        servers = state.servers.len(),
        brokers = state.brokers.len(),
        projects = state.projects.len(),
        actor = %state.actor.id
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use topo_hub::{launch, FixedMetrics, LaunchOptions};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn observer_stops_when_hub_closes() {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let mut options = LaunchOptions::new(addr, Arc::new(FixedMetrics::default()));
        options.metrics_interval = Some(Duration::from_millis(50));
        let hub = launch(options).await.expect("launch hub");

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let observer = Observer::new(hub.url());
        let task = tokio::spawn(observer.run(shutdown_rx));
        for _ in 0..100 {
            if hub.handle.session_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(hub.handle.session_count(), 1);

        hub.shutdown().await.expect("shutdown");
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("observer exits")
            .expect("observer task");
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn observer_fails_fast_without_hub() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let observer = Observer::new(format!("ws://127.0.0.1:{port}/ws"));
        assert!(observer.run(shutdown_rx).await.is_err());
    }
}
