//! Backend implementation for Kubernetes.

use std::sync::{Arc, Mutex};

use zoe_definitions::state::{Service, StateStore};
use zoe_definitions::Config;

use super::{startup_error_from, ContainerBackend, ServiceInstance, SpawnedService, StartupError};
use crate::stats::ClusterStats;
use crate::Result;

/// Low-level REST client for the API server
pub mod api_client;
pub use self::api_client::KubernetesClient;

/// Pod watch thread
pub mod monitor;
use self::monitor::KubernetesMonitor;

pub struct KubernetesBackend {
    kube: KubernetesClient,
    config: Config,
    monitor: Mutex<Option<KubernetesMonitor>>,
}

impl KubernetesBackend {
    pub fn new(config: &Config) -> Result<KubernetesBackend> {
        let kube = KubernetesClient::new(
            &config.kubernetes_url,
            &config.kubernetes_token,
            &config.kubernetes_namespace,
        )?;
        Ok(KubernetesBackend {
            kube,
            config: config.clone(),
            monitor: Mutex::new(None),
        })
    }
}

impl ContainerBackend for KubernetesBackend {
    fn init(&self, state: Arc<StateStore>) -> Result<()> {
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.is_none() {
            *monitor = Some(KubernetesMonitor::start(
                self.kube.clone(),
                state,
                &self.config.deployment_name,
            ));
        }
        Ok(())
    }

    fn shutdown(&self) {
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            monitor.quit();
        }
    }

    fn spawn_service(&self, instance: &ServiceInstance) -> std::result::Result<SpawnedService, StartupError> {
        self.kube.create_service(instance).map_err(startup_error_from)?;
        let spawned = self
            .kube
            .create_replication_controller(instance)
            .and_then(|backend_id| {
                let endpoint = self.kube.inspect_service(&instance.hostname)?;
                Ok(SpawnedService {
                    backend_id,
                    ip_address: endpoint.cluster_ip,
                    ports: endpoint.node_ports,
                })
            });
        match spawned {
            Ok(spawned) => Ok(spawned),
            Err(e) => {
                // do not leave a half-created object pair behind
                if let Err(cleanup) = self.kube.terminate(&instance.hostname) {
                    warn!("Cannot clean up after a failed spawn of {}: {}", instance.hostname, cleanup);
                }
                Err(startup_error_from(e))
            }
        }
    }

    fn terminate_service(&self, service: &Service) -> Result<()> {
        self.kube.terminate(&service.dns_name(&self.config.deployment_name))
    }

    fn platform_state(&self) -> Result<ClusterStats> {
        let mut stats = self.kube.info()?;
        for node in &mut stats.nodes {
            // Kubernetes only reports requests
            node.memory_in_use = node.memory_reserved;
            node.cores_in_use = node.cores_reserved;
        }
        Ok(stats)
    }

    fn update_service(&self, _service: &Service, _cores: Option<f64>, _memory: Option<i64>) -> Result<()> {
        error!("Reservation update not implemented in the Kubernetes back-end");
        Ok(())
    }

    fn preload_image(&self, _image: &str) -> Result<()> {
        bail!("image preloading is not supported by the Kubernetes back-end");
    }

    fn node_list(&self) -> Result<Vec<String>> {
        Ok(self.kube.info()?.nodes.into_iter().map(|n| n.name).collect())
    }

    fn list_available_images(&self, node_name: &str) -> Result<Vec<String>> {
        let info = self.kube.info()?;
        Ok(info
            .nodes
            .into_iter()
            .find(|n| n.name == node_name)
            .map(|n| n.images)
            .unwrap_or_default())
    }
}
