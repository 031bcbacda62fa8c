use std::collections::BTreeMap;

use zoe_definitions::state::{Execution, Service, StateStore};
use zoe_definitions::structs::{Limits, VolumeBind};
use zoe_definitions::Config;

use super::common;
use crate::Result;

/// A port the backend must publish
#[derive(Clone, Debug)]
pub struct BackendPort {
    pub number: u16,
    pub proto: &'static str,
}

/// A backend-neutral description of one container about to be created
///
/// Built from the persistent records immediately before spawning and
/// discarded afterwards. Reservations arrive here already clamped to the
/// deployment-wide ceilings.
#[derive(Clone, Debug)]
pub struct ServiceInstance {
    pub name: String,
    pub hostname: String,
    /// Node the scheduler picked; backends turn it into a placement constraint
    pub backend_host: Option<String>,
    pub memory_limit: Limits<i64>,
    pub core_limit: Limits<f64>,
    pub shm_size: Option<i64>,
    pub labels: BTreeMap<String, String>,
    pub environment: Vec<(String, String)>,
    pub volumes: Vec<VolumeBind>,
    pub command: Option<String>,
    pub work_dir: Option<String>,
    pub image_name: String,
    pub load_balancer: bool,
    pub ports: Vec<BackendPort>,
    pub network: String,
}

impl ServiceInstance {
    pub fn build(
        state: &StateStore,
        execution: &Execution,
        service: &Service,
        config: &Config,
    ) -> Result<ServiceInstance> {
        let owner = execution
            .owner(state)?
            .ok_or_else(|| format_err!("execution {} has no owner in the state store", execution.id))?;
        let dict = common::build_subst_dict(execution, &owner, config);

        let reservation = service.reservation();
        let mut memory_limit = reservation.memory;
        if memory_limit.max > config.max_memory_limit_bytes() {
            memory_limit.max = config.max_memory_limit_bytes();
        }
        let mut core_limit = reservation.cores;
        if core_limit.max > config.max_core_limit {
            core_limit.max = config.max_core_limit;
        }

        let ports = service
            .description
            .ports
            .iter()
            .map(|p| BackendPort {
                number: p.port_number,
                proto: p.backend_protocol(),
            })
            .collect();

        Ok(ServiceInstance {
            name: service.unique_name.clone(),
            hostname: service.dns_name(&config.deployment_name),
            backend_host: service.backend_host.clone(),
            memory_limit,
            core_limit,
            shm_size: reservation.shm,
            labels: common::gen_labels(execution, service, &owner, config),
            environment: common::gen_environment(execution, service, &owner, config, &dict),
            volumes: common::gen_volumes(service, &owner, config),
            command: service.description.command.as_ref().map(|c| common::substitute(c, &dict)),
            work_dir: service.description.work_dir.clone(),
            image_name: service.description.docker_image.clone(),
            load_balancer: service.description.load_balancer,
            ports,
            network: service
                .description
                .network
                .clone()
                .unwrap_or_else(|| config.overlay_network_name.clone()),
        })
    }
}
