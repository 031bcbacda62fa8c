use std::collections::BTreeMap;
use std::sync::Arc;

use zoe_definitions::state::{Service, StateStore};
use zoe_definitions::{BackendKind, Config};

use crate::stats::ClusterStats;
use crate::{Error, Result};

/// Label and environment generation shared by all backends
pub mod common;

/// The functions the scheduler calls, keeping it backend-neutral
pub mod interface;

/// The backend-neutral container description
pub mod service_instance;
pub use self::service_instance::{BackendPort, ServiceInstance};

/// Kubernetes, one ReplicationController plus one Service per Zoe service
pub mod kubernetes;

/// Stand-alone Docker Swarm, one container per Zoe service
pub mod swarm;

/// What a successful spawn hands back to the scheduler
#[derive(Debug, Clone)]
pub struct SpawnedService {
    pub backend_id: String,
    pub ip_address: Option<String>,
    /// internal port number to externally reachable port
    pub ports: BTreeMap<u16, u16>,
}

/// The spawn contract the scheduler pattern-matches on
#[derive(Debug, Fail)]
pub enum StartupError {
    /// The backend is out of resources right now, retry next round
    #[fail(display = "not enough resources: {}", _0)]
    RetryLater(String),

    /// Anything else, the execution cannot be started
    #[fail(display = "fatal backend error: {}", _0)]
    Fatal(String),
}

/// Discriminated client-level failures, mapped onto the spawn contract
#[derive(Debug, Fail, PartialEq)]
pub enum BackendError {
    #[fail(display = "not enough resources available: {}", _0)]
    NotEnoughResources(String),

    #[fail(display = "object not found on the backend")]
    NotFound,

    #[fail(display = "unexpected HTTP status {} from {}", _0, _1)]
    UnexpectedHttpStatus(u16, String),
}

/// Uniform capability set implemented by every container platform
pub trait ContainerBackend: Send + Sync {
    /// Start the event monitor thread(s)
    fn init(&self, state: Arc<StateStore>) -> Result<()>;

    /// Stop the monitor threads cleanly
    fn shutdown(&self);

    /// Synchronous; returns only on success with a stable backend id
    fn spawn_service(&self, instance: &ServiceInstance) -> std::result::Result<SpawnedService, StartupError>;

    /// Idempotent; a missing object is not an error
    fn terminate_service(&self, service: &Service) -> Result<()>;

    /// May be expensive; callers cache the snapshot per scheduling round
    fn platform_state(&self) -> Result<ClusterStats>;

    /// Best-effort reservation adjustment; unsupported backends log and no-op
    fn update_service(&self, service: &Service, cores: Option<f64>, memory: Option<i64>) -> Result<()>;

    /// Make an image available ahead of time; may be unsupported
    fn preload_image(&self, image: &str) -> Result<()>;

    fn node_list(&self) -> Result<Vec<String>>;

    fn list_available_images(&self, node_name: &str) -> Result<Vec<String>>;
}

/// Map a client error onto the spawn contract
pub(crate) fn startup_error_from(err: Error) -> StartupError {
    match err.downcast::<BackendError>() {
        Ok(BackendError::NotEnoughResources(msg)) => StartupError::RetryLater(msg),
        Ok(other) => StartupError::Fatal(other.to_string()),
        Err(other) => StartupError::Fatal(other.to_string()),
    }
}

pub fn initialize_backend(config: &Config) -> Result<Arc<dyn ContainerBackend>> {
    Ok(match config.backend {
        BackendKind::Kubernetes => Arc::new(kubernetes::KubernetesBackend::new(config)?),
        BackendKind::Swarm => Arc::new(swarm::SwarmBackend::new(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_shortage_maps_to_retry_later() {
        let err: Error = BackendError::NotEnoughResources("node full".into()).into();
        match startup_error_from(err) {
            StartupError::RetryLater(msg) => assert!(msg.contains("node full")),
            other => panic!("expected RetryLater, got {:?}", other),
        }
    }

    #[test]
    fn other_errors_map_to_fatal() {
        let err: Error = BackendError::UnexpectedHttpStatus(500, "http://swarm/create".into()).into();
        match startup_error_from(err) {
            StartupError::Fatal(msg) => assert!(msg.contains("500")),
            other => panic!("expected Fatal, got {:?}", other),
        }
        let plain = format_err!("connection reset");
        match startup_error_from(plain) {
            StartupError::Fatal(msg) => assert!(msg.contains("connection reset")),
            other => panic!("expected Fatal, got {:?}", other),
        }
    }
}
