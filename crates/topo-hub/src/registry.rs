use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use topo_core::{RegistryError, Service};
use tracing::info;

#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<RwLock<HashMap<String, Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_service(&self, service: Service) -> Result<(), RegistryError> {
        validate_service(&service)?;
        let id = service.id.clone();
        let replaced = self
            .services
            .write()
            .await
            .insert(id.clone(), service)
            .is_some();
        info!(event = "service_registered", service_id = %id, replaced = replaced);
        Ok(())
    }

    pub async fn remove_service(&self, id: &str) -> bool {
        let removed = self.services.write().await.remove(id).is_some();
        info!(event = "service_removed", service_id = id, removed = removed);
        removed
    }

    pub async fn list_services(&self) -> Vec<Service> {
        let mut services = self
            .services
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }
}

fn validate_service(service: &Service) -> Result<(), RegistryError> {
    if service.id.trim().is_empty() {
        return Err(RegistryError::MissingField {
            kind: "service",
            field: "id",
        });
    }
    if service.name.trim().is_empty() {
        return Err(RegistryError::MissingField {
            kind: "service",
            field: "name",
        });
    }
    Ok(())
}
