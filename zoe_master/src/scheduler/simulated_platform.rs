//! An in-memory clone of cluster capacity used to dry-run placement
//! decisions before any container is created.

use std::collections::HashMap;

use zoe_definitions::state::{Execution, Service};

use crate::stats::ClusterStats;

#[derive(Debug, Clone)]
struct SimNode {
    name: String,
    memory_free: i64,
    cores_free: f64,
}

#[derive(Debug, Clone)]
struct Placement {
    service_id: i32,
    execution_id: i32,
    essential: bool,
    memory: i64,
    cores: f64,
    node: usize,
}

/// Tentative placement state for one scheduling round
///
/// Nodes are visited in deterministic order (sorted by name) and services go
/// to the first node with room for their minimum reservation.
#[derive(Debug, Clone)]
pub struct SimulatedPlatform {
    nodes: Vec<SimNode>,
    placements: Vec<Placement>,
}

impl SimulatedPlatform {
    pub fn new(snapshot: &ClusterStats) -> SimulatedPlatform {
        let mut nodes: Vec<SimNode> = snapshot
            .nodes
            .iter()
            .map(|n| SimNode {
                name: n.name.clone(),
                memory_free: n.free_memory(),
                cores_free: n.free_cores(),
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        SimulatedPlatform {
            nodes,
            placements: Vec::new(),
        }
    }

    fn is_placed(&self, service_id: i32) -> bool {
        self.placements.iter().any(|p| p.service_id == service_id)
    }

    fn first_fit(&self, memory: i64, cores: f64) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.memory_free >= memory && n.cores_free >= cores)
    }

    fn reserve(&mut self, placement: Placement) {
        let node = &mut self.nodes[placement.node];
        node.memory_free -= placement.memory;
        node.cores_free -= placement.cores;
        self.placements.push(placement);
    }

    fn unreserve(&mut self, index: usize) {
        let placement = self.placements.remove(index);
        let node = &mut self.nodes[placement.node];
        node.memory_free += placement.memory;
        node.cores_free += placement.cores;
    }

    /// Place every essential service of an execution at its minimum
    /// reservation; all of them fit or none does
    pub fn allocate_essential(&mut self, execution: &Execution, services: &[Service]) -> bool {
        let mut added = 0;
        for service in services.iter().filter(|s| s.essential) {
            if service.is_active() || self.is_placed(service.id) {
                continue;
            }
            let reservation = service.reservation();
            match self.first_fit(reservation.memory.min, reservation.cores.min) {
                Some(node) => {
                    self.reserve(Placement {
                        service_id: service.id,
                        execution_id: execution.id,
                        essential: true,
                        memory: reservation.memory.min,
                        cores: reservation.cores.min,
                        node,
                    });
                    added += 1;
                }
                None => {
                    // partial placements are rolled back
                    for _ in 0..added {
                        let index = self.placements.len() - 1;
                        self.unreserve(index);
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Place as many elastic services of an execution as fit right now
    pub fn allocate_elastic(&mut self, execution: &Execution, services: &[Service]) {
        for service in services.iter().filter(|s| !s.essential) {
            if service.is_active() || self.is_placed(service.id) {
                continue;
            }
            let reservation = service.reservation();
            if let Some(node) = self.first_fit(reservation.memory.min, reservation.cores.min) {
                self.reserve(Placement {
                    service_id: service.id,
                    execution_id: execution.id,
                    essential: false,
                    memory: reservation.memory.min,
                    cores: reservation.cores.min,
                    node,
                });
            }
        }
    }

    /// Remove every elastic placement of an execution, keeping essentials
    pub fn deallocate_elastic(&mut self, execution: &Execution) {
        loop {
            let index = self
                .placements
                .iter()
                .position(|p| p.execution_id == execution.id && !p.essential);
            match index {
                Some(index) => self.unreserve(index),
                None => break,
            }
        }
    }

    /// Memory still unclaimed across the whole simulated cluster
    pub fn aggregated_free_memory(&self) -> i64 {
        self.nodes.iter().map(|n| n.memory_free).sum()
    }

    /// Node assignment for every tentatively placed service
    pub fn get_service_allocation(&self) -> HashMap<i32, String> {
        self.placements
            .iter()
            .map(|p| (p.service_id, self.nodes[p.node].name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::NodeStats;
    use zoe_definitions::state::{BackendStatus, ServiceStatus, TerminationLock};

    const GIB: i64 = 1024 * 1024 * 1024;

    fn snapshot(nodes: &[(&str, f64, i64)]) -> ClusterStats {
        ClusterStats {
            nodes: nodes
                .iter()
                .map(|(name, cores, memory)| NodeStats {
                    cores_total: *cores,
                    memory_total: *memory,
                    ..NodeStats::new(name)
                })
                .collect(),
            ..ClusterStats::default()
        }
    }

    fn execution(id: i32) -> Execution {
        let description = serde_json::from_str(
            r#"{"name": "app", "version": 1,
                "processes": [{"name": "p", "docker_image": "i", "required_resources": {"memory": 1}}]}"#,
        )
        .unwrap();
        Execution {
            id,
            name: "app".into(),
            user_id: 1,
            description,
            status: zoe_definitions::state::ExecutionStatus::Queued,
            size: 1.0,
            error_message: None,
            time_submit: chrono::Utc::now(),
            time_start: None,
            time_end: None,
            termination_lock: TerminationLock::new(),
        }
    }

    fn service(id: i32, execution_id: i32, essential: bool, memory: i64, cores: f64) -> Service {
        let description = serde_json::from_str(&format!(
            r#"{{"name": "svc{}", "docker_image": "img",
                 "required_resources": {{"memory": {}, "cores": {{"min": {}, "max": {}}}}}}}"#,
            id, memory, cores, cores
        ))
        .unwrap();
        Service {
            id,
            execution_id,
            name: format!("svc{}", id),
            unique_name: format!("svc{}", id),
            description,
            essential,
            is_monitor: false,
            status: ServiceStatus::Created,
            backend_status: BackendStatus::Undefined,
            backend_id: None,
            backend_host: None,
            ip_address: None,
            error_message: None,
        }
    }

    #[test]
    fn essentials_place_and_elastics_fill_what_is_left() {
        // one node, 16 cores and 32 GiB
        let mut sim = SimulatedPlatform::new(&snapshot(&[("node-a", 16.0, 32 * GIB)]));
        let exec = execution(1);
        let services = vec![
            service(1, 1, true, 8 * GIB, 2.0),
            service(2, 1, true, 8 * GIB, 2.0),
            service(3, 1, false, 4 * GIB, 1.0),
            service(4, 1, false, 4 * GIB, 1.0),
            service(5, 1, false, 4 * GIB, 1.0),
        ];
        assert!(sim.allocate_essential(&exec, &services));
        sim.allocate_elastic(&exec, &services);
        let allocation = sim.get_service_allocation();
        // both essentials and all three elastics fit in 32 GiB
        assert_eq!(allocation.len(), 5);
        assert_eq!(sim.aggregated_free_memory(), 4 * GIB);
    }

    #[test]
    fn elastics_that_do_not_fit_are_simply_left_out() {
        let mut sim = SimulatedPlatform::new(&snapshot(&[("node-a", 16.0, 24 * GIB)]));
        let exec = execution(1);
        let services = vec![
            service(1, 1, true, 8 * GIB, 2.0),
            service(2, 1, true, 8 * GIB, 2.0),
            service(3, 1, false, 4 * GIB, 1.0),
            service(4, 1, false, 4 * GIB, 1.0),
            service(5, 1, false, 4 * GIB, 1.0),
        ];
        assert!(sim.allocate_essential(&exec, &services));
        sim.allocate_elastic(&exec, &services);
        // 24 GiB hold the two essentials and two of the three elastics
        assert_eq!(sim.get_service_allocation().len(), 4);
        assert_eq!(sim.aggregated_free_memory(), 0);
    }

    #[test]
    fn oversized_essential_rolls_back_and_leaves_the_platform_unchanged() {
        // two nodes with 8 GiB free each cannot hold a 12 GiB essential
        let mut sim = SimulatedPlatform::new(&snapshot(&[("node-a", 16.0, 8 * GIB), ("node-b", 16.0, 8 * GIB)]));
        let exec = execution(1);
        let services = vec![
            service(1, 1, true, 4 * GIB, 1.0),
            service(2, 1, true, 12 * GIB, 1.0),
        ];
        let free_before = sim.aggregated_free_memory();
        assert!(!sim.allocate_essential(&exec, &services));
        assert_eq!(sim.aggregated_free_memory(), free_before);
        assert!(sim.get_service_allocation().is_empty());
    }

    #[test]
    fn free_memory_never_grows_while_allocating() {
        let mut sim = SimulatedPlatform::new(&snapshot(&[("node-a", 16.0, 32 * GIB), ("node-b", 16.0, 32 * GIB)]));
        let exec = execution(1);
        let services: Vec<Service> = (0..6).map(|i| service(i, 1, i < 2, 6 * GIB, 1.0)).collect();
        let mut last_free = sim.aggregated_free_memory();
        assert!(sim.allocate_essential(&exec, &services));
        let free = sim.aggregated_free_memory();
        assert!(free <= last_free);
        last_free = free;
        sim.allocate_elastic(&exec, &services);
        assert!(sim.aggregated_free_memory() <= last_free);
    }

    #[test]
    fn deallocate_elastic_keeps_essentials_in_place() {
        let mut sim = SimulatedPlatform::new(&snapshot(&[("node-a", 16.0, 32 * GIB)]));
        let exec = execution(1);
        let services = vec![
            service(1, 1, true, 8 * GIB, 2.0),
            service(2, 1, false, 4 * GIB, 1.0),
        ];
        assert!(sim.allocate_essential(&exec, &services));
        sim.allocate_elastic(&exec, &services);
        assert_eq!(sim.get_service_allocation().len(), 2);
        sim.deallocate_elastic(&exec);
        let allocation = sim.get_service_allocation();
        assert_eq!(allocation.len(), 1);
        assert!(allocation.contains_key(&1));
        assert_eq!(sim.aggregated_free_memory(), 24 * GIB);
    }

    #[test]
    fn nodes_are_visited_in_name_order() {
        let mut sim = SimulatedPlatform::new(&snapshot(&[("node-b", 16.0, 32 * GIB), ("node-a", 16.0, 32 * GIB)]));
        let exec = execution(1);
        let services = vec![service(1, 1, true, 4 * GIB, 1.0)];
        assert!(sim.allocate_essential(&exec, &services));
        assert_eq!(sim.get_service_allocation()[&1], "node-a");
    }
}
