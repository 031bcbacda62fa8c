//! The functions the scheduler calls to act on the real cluster.
//!
//! Everything here goes through the `ContainerBackend` trait, keeping the
//! scheduler oblivious to which platform actually runs the containers.

use std::collections::HashMap;
use std::sync::Arc;

use threadpool::ThreadPool;

use zoe_definitions::state::{Execution, Service, StateStore};
use zoe_definitions::Config;

use super::{ContainerBackend, ServiceInstance, StartupError};
use crate::stats::ClusterStats;
use crate::Result;

const TEARDOWN_WORKERS: usize = 8;

/// Outcome of trying to start the essential services of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    Ok,
    Requeue,
    Fatal,
}

pub fn get_platform_state(backend: &dyn ContainerBackend) -> Result<ClusterStats> {
    backend.platform_state()
}

/// Spawn every essential service of an execution on its assigned node
///
/// On a transient resource shortage the siblings spawned so far are torn
/// down and the execution is left intact for a retry. On a fatal error the
/// execution is marked failed and cleaned up.
pub fn start_essential(
    state: &StateStore,
    backend: &dyn ContainerBackend,
    config: &Config,
    execution: &mut Execution,
    placements: &HashMap<i32, String>,
) -> Result<StartResult> {
    execution.set_starting(state)?;
    let mut services = execution.services(state)?;
    for service in services.iter_mut().filter(|s| s.essential) {
        if service.is_active() {
            continue;
        }
        if let Some(host) = placements.get(&service.id) {
            service.set_backend_host(state, host)?;
        }
        match spawn_one(state, backend, config, execution, service) {
            Ok(()) => {}
            Err(StartupError::RetryLater(msg)) => {
                info!(
                    "Not enough resources to start essential service {} of execution {}: {}",
                    service.name, execution.id, msg
                );
                tear_down_spawned(state, backend, execution)?;
                return Ok(StartResult::Requeue);
            }
            Err(StartupError::Fatal(msg)) => {
                execution.set_error(state, &msg)?;
                tear_down_spawned(state, backend, execution)?;
                return Ok(StartResult::Fatal);
            }
        }
    }
    Ok(StartResult::Ok)
}

/// Spawn whatever elastic services got a placement this round
///
/// Elastic failures never fail the execution: fatal ones park the service in
/// the error state, transient ones leave it pending for the next round.
pub fn start_elastic(
    state: &StateStore,
    backend: &dyn ContainerBackend,
    config: &Config,
    execution: &mut Execution,
    placements: &HashMap<i32, String>,
) -> Result<()> {
    let mut services = execution.services(state)?;
    for service in services.iter_mut().filter(|s| !s.essential) {
        if service.is_active() {
            continue;
        }
        let host = match placements.get(&service.id) {
            Some(host) => host,
            None => continue,
        };
        service.set_backend_host(state, host)?;
        match spawn_one(state, backend, config, execution, service) {
            Ok(()) => {}
            Err(StartupError::RetryLater(msg)) => {
                debug!(
                    "Elastic service {} of execution {} deferred: {}",
                    service.name, execution.id, msg
                );
            }
            Err(StartupError::Fatal(msg)) => {
                service.set_error(state, &msg)?;
            }
        }
    }
    Ok(())
}

fn spawn_one(
    state: &StateStore,
    backend: &dyn ContainerBackend,
    config: &Config,
    execution: &Execution,
    service: &mut Service,
) -> std::result::Result<(), StartupError> {
    let instance = ServiceInstance::build(state, execution, service, config)
        .map_err(|e| StartupError::Fatal(e.to_string()))?;
    let spawned = backend.spawn_service(&instance)?;
    service
        .set_active(state, &spawned.backend_id, spawned.ip_address.as_deref())
        .map_err(|e| StartupError::Fatal(e.to_string()))?;
    save_port_mappings(state, service, &spawned.ports).map_err(|e| StartupError::Fatal(e.to_string()))?;
    Ok(())
}

fn save_port_mappings(
    state: &StateStore,
    service: &Service,
    mappings: &std::collections::BTreeMap<u16, u16>,
) -> Result<()> {
    let host = service.backend_host.as_deref().unwrap_or("");
    for port in state.ports().by_service(service.id)? {
        if let Some(external) = mappings.get(&(port.internal_number as u16)) {
            state.ports().set_external(port.id, host, i32::from(*external))?;
        }
    }
    Ok(())
}

/// Remove every container already spawned for an execution
fn tear_down_spawned(state: &StateStore, backend: &dyn ContainerBackend, execution: &Execution) -> Result<()> {
    for mut service in execution.services(state)? {
        if service.backend_id.is_none() {
            continue;
        }
        if let Err(e) = backend.terminate_service(&service) {
            warn!(
                "Could not remove service {} while cleaning up execution {}: {}",
                service.name, execution.id, e
            );
            continue;
        }
        state.ports().clear_external(service.id)?;
        service.set_destroyed(state)?;
    }
    Ok(())
}

/// Tear an execution down completely; callers hold the termination lock
///
/// Containers are removed in parallel, one pool job per service.
pub fn terminate_execution(
    state: &Arc<StateStore>,
    backend: &Arc<dyn ContainerBackend>,
    execution: &mut Execution,
) -> Result<()> {
    execution.set_cleaning_up(state)?;
    let with_containers: Vec<Service> = execution
        .services(state)?
        .into_iter()
        .filter(|s| s.backend_id.is_some())
        .collect();
    if !with_containers.is_empty() {
        let pool = ThreadPool::new(with_containers.len().min(TEARDOWN_WORKERS));
        for mut service in with_containers {
            let state = Arc::clone(state);
            let backend = Arc::clone(backend);
            let execution_id = execution.id;
            pool.execute(move || {
                if let Err(e) = backend.terminate_service(&service) {
                    warn!(
                        "Could not remove service {} of execution {}: {}",
                        service.name, execution_id, e
                    );
                    return;
                }
                let cleared = state
                    .ports()
                    .clear_external(service.id)
                    .and_then(|_| service.set_destroyed(&state));
                if let Err(e) = cleared {
                    error!("Cannot record the removal of service {}: {}", service.id, e);
                }
            });
        }
        pool.join();
    }
    execution.set_terminated(state)
}

/// Best-effort reservation adjustment, used by the core-limit adjuster
pub fn update_service_resource_limits(
    backend: &dyn ContainerBackend,
    service: &Service,
    cores: Option<f64>,
    memory: Option<i64>,
) -> Result<()> {
    backend.update_service(service, cores, memory)
}
