pub mod error;
pub mod protocol;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub use error::{DialError, ProtocolError, RegistryError, TransportError};
pub use protocol::{Envelope, Message, MessageType};

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub url: String,
}

impl Server {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Broker {
    pub id: String,
    pub name: String,
    pub url: String,
}

impl Broker {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub name: String,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Actor {
    pub id: String,
}

impl Actor {
    pub fn generate() -> Self {
        Self { id: generate_id() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SharedState {
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub brokers: Vec<Broker>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub actor: Actor,
}

impl SharedState {
    pub fn upsert_broker(&mut self, broker: Broker) {
        match self.brokers.iter_mut().find(|entry| entry.id == broker.id) {
            Some(existing) => *existing = broker,
            None => self.brokers.push(broker),
        }
    }

    pub fn remove_broker(&mut self, id: &str) -> bool {
        let before = self.brokers.len();
        self.brokers.retain(|entry| entry.id != id);
        self.brokers.len() != before
    }

    pub fn upsert_project(&mut self, project: Project) {
        match self.projects.iter_mut().find(|entry| entry.id == project.id) {
            Some(existing) => *existing = project,
            None => self.projects.push(project),
        }
    }

    pub fn remove_project(&mut self, id: &str) -> bool {
        let before = self.projects.len();
        self.projects.retain(|entry| entry.id != id);
        self.projects.len() != before
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Metrics {
    pub cpu: f64,
    pub memory: f64,
    pub storage: f64,
    pub network: f64,
}
