//! Backend implementation for stand-alone Docker Swarm.

use std::sync::{Arc, Mutex};

use threadpool::ThreadPool;

use zoe_definitions::state::{Service, StateStore};
use zoe_definitions::Config;

use super::{startup_error_from, ContainerBackend, ServiceInstance, SpawnedService, StartupError};
use crate::stats::ClusterStats;
use crate::Result;

/// Low-level Docker Engine API client
pub mod api_client;
pub use self::api_client::{parse_size, DockerContainerOptions, SwarmClient};

/// Event monitor thread
pub mod monitor;
use self::monitor::SwarmMonitor;

const PRELOAD_WORKERS: usize = 4;

pub struct SwarmBackend {
    swarm: SwarmClient,
    config: Config,
    monitor: Mutex<Option<SwarmMonitor>>,
    preload_pool: Mutex<ThreadPool>,
}

impl SwarmBackend {
    pub fn new(config: &Config) -> Result<SwarmBackend> {
        let swarm = SwarmClient::new(&config.swarm_url)?;
        Ok(SwarmBackend {
            swarm,
            config: config.clone(),
            monitor: Mutex::new(None),
            preload_pool: Mutex::new(ThreadPool::with_name("image_preload".to_string(), PRELOAD_WORKERS)),
        })
    }

    fn options_for(&self, instance: &ServiceInstance) -> DockerContainerOptions {
        let mut constraints = Vec::new();
        if let Some(ref host) = instance.backend_host {
            constraints.push(format!("constraint:node=={}", host));
        }
        DockerContainerOptions {
            name: instance.hostname.clone(),
            hostname: instance.hostname.clone(),
            environment: instance.environment.clone(),
            volume_binds: instance.volumes.iter().map(|v| v.to_bind_string()).collect(),
            command: instance.command.clone(),
            work_dir: instance.work_dir.clone(),
            memory_limit: instance.memory_limit.max,
            shm_size: instance.shm_size,
            ports: instance.ports.iter().map(|p| (p.number, p.proto)).collect(),
            network_name: instance.network.clone(),
            labels: instance.labels.clone(),
            gelf_log_address: self.config.gelf_address.clone(),
            constraints,
        }
    }
}

impl ContainerBackend for SwarmBackend {
    fn init(&self, state: Arc<StateStore>) -> Result<()> {
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.is_none() {
            *monitor = Some(SwarmMonitor::start(
                self.swarm.clone(),
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
        self.preload_pool.lock().unwrap().join();
    }

    fn spawn_service(&self, instance: &ServiceInstance) -> std::result::Result<SpawnedService, StartupError> {
        let options = self.options_for(instance);
        let info = self
            .swarm
            .spawn_container(&instance.image_name, &options)
            .map_err(startup_error_from)?;
        Ok(SpawnedService {
            backend_id: info.docker_id,
            ip_address: info.ip_address,
            ports: info.ports,
        })
    }

    fn terminate_service(&self, service: &Service) -> Result<()> {
        match service.backend_id {
            Some(ref backend_id) => self.swarm.terminate_container(backend_id, true),
            None => {
                debug!("Service {} has no container, nothing to terminate", service.name);
                Ok(())
            }
        }
    }

    fn platform_state(&self) -> Result<ClusterStats> {
        let mut stats = self.swarm.info()?;
        for node in &mut stats.nodes {
            // Swarm only reports reservations
            node.memory_in_use = node.memory_reserved;
            node.cores_in_use = node.cores_reserved;
        }
        Ok(stats)
    }

    fn update_service(&self, service: &Service, cores: Option<f64>, memory: Option<i64>) -> Result<()> {
        match service.backend_id {
            Some(ref backend_id) => self.swarm.update_container(backend_id, cores, memory),
            None => Ok(()),
        }
    }

    fn preload_image(&self, image: &str) -> Result<()> {
        let client = self.swarm.clone();
        let image = image.to_string();
        self.preload_pool.lock().unwrap().execute(move || {
            debug!("Preloading image {}", image);
            if let Err(e) = client.pull_image(&image) {
                warn!("Could not preload image {}: {}", image, e);
            }
        });
        Ok(())
    }

    fn node_list(&self) -> Result<Vec<String>> {
        Ok(self.swarm.info()?.nodes.into_iter().map(|n| n.name).collect())
    }

    fn list_available_images(&self, node_name: &str) -> Result<Vec<String>> {
        // the stand-alone Swarm API aggregates images over the whole cluster
        debug!("Swarm cannot filter images by node, returning the cluster-wide list for {}", node_name);
        self.swarm.list_images()
    }
}
