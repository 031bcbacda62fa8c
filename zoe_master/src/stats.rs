use chrono::Utc;

/// Capacity snapshot of one node
///
/// Reserved amounts are what the backend promised to running containers,
/// in-use amounts are what the containers actually consume.
#[derive(Serialize, Clone, Debug, Default)]
pub struct NodeStats {
    pub name: String,
    pub status: String,
    pub container_count: u32,
    pub cores_total: f64,
    pub cores_reserved: f64,
    pub cores_in_use: f64,
    pub memory_total: i64,
    pub memory_reserved: i64,
    pub memory_in_use: i64,
    pub labels: Vec<String>,
    pub images: Vec<String>,
    pub last_update: Option<String>,
}

impl NodeStats {
    pub fn new(name: &str) -> NodeStats {
        NodeStats {
            name: name.to_string(),
            ..NodeStats::default()
        }
    }

    pub fn free_memory(&self) -> i64 {
        self.memory_total - self.memory_reserved
    }

    pub fn free_cores(&self) -> f64 {
        self.cores_total - self.cores_reserved
    }
}

/// Immutable capacity snapshot of the whole cluster
#[derive(Serialize, Clone, Debug, Default)]
pub struct ClusterStats {
    pub nodes: Vec<NodeStats>,
    /// Seconds since the epoch when the snapshot was taken
    pub timestamp: i64,
    pub placement_strategy: String,
    pub active_filters: Vec<String>,
    pub container_count: u32,
    pub cores_total: f64,
    pub memory_total: i64,
}

impl ClusterStats {
    pub fn new() -> ClusterStats {
        ClusterStats {
            timestamp: Utc::now().timestamp(),
            ..ClusterStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_amounts_subtract_reservations() {
        let node = NodeStats {
            cores_total: 16.0,
            cores_reserved: 4.0,
            memory_total: 32 * 1024 * 1024 * 1024,
            memory_reserved: 8 * 1024 * 1024 * 1024,
            ..NodeStats::new("node-a")
        };
        assert_eq!(node.free_cores(), 12.0);
        assert_eq!(node.free_memory(), 24 * 1024 * 1024 * 1024);
    }
}
