use std::collections::BTreeMap;

use regex::Regex;

use crate::structs::{PortDescription, ResourceReservation, VolumeDescription};
use crate::Result;

/// An application description, the JSON document users submit
///
/// A description is a collection of long-lived containerized services
/// ("processes") with resource reservations. The document is stored verbatim
/// in the state store; unknown fields are tolerated and preserved in
/// `extra` so newer tooling can round-trip descriptions produced by older
/// or richer clients.
///
/// ```json
/// {
///   "name": "spark-submit",
///   "version": 1,
///   "will_end": false,
///   "priority": 512,
///   "requires_binary": true,
///   "processes": []
/// }
/// ```
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AppDescription {
    /// Name of the application
    ///
    /// Used as a building block for container and DNS names, so it has to be
    /// short, lower case and dash separated.
    pub name: String,

    /// Description format version
    pub version: u32,

    /// Whether the application terminates by itself
    ///
    /// Interactive applications (notebooks) set this to false.
    #[serde(default = "default_true")]
    pub will_end: bool,

    /// Priority hint exposed to external collaborators
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Whether the user must provide an application binary at submit time
    #[serde(default)]
    pub requires_binary: bool,

    /// Size unit for the SIZE scheduling policy
    ///
    /// A per-service estimate of run time, in arbitrary units. The initial
    /// execution size is this value multiplied by the number of services and
    /// it shrinks as the execution makes progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,

    /// The services that make up the application
    pub processes: Vec<ServiceDescription>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> u32 {
    512
}

/// One long-lived containerized service inside an application
///
/// ```json
/// {
///   "name": "spark-worker-0",
///   "docker_image": "registry:5000/zoerepo/spark-worker",
///   "monitor": false,
///   "essential": false,
///   "required_resources": {"memory": 8589934592},
///   "ports": [],
///   "environment": [["SPARK_WORKER_CORES", "4"]]
/// }
/// ```
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServiceDescription {
    /// Service name, unique within the application
    pub name: String,

    /// Image the container is created from
    pub docker_image: String,

    /// Whether this service's exit decides the fate of the whole execution
    #[serde(default)]
    pub monitor: bool,

    /// Essential services must all run before the execution is running;
    /// elastic ones are optional capacity the scheduler can defer
    #[serde(default = "default_true")]
    pub essential: bool,

    pub required_resources: ResourceReservation,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortDescription>,

    /// Static environment, pairs of name and value
    ///
    /// Values can contain substitution tokens (`{execution_id}`,
    /// `{user_name}`, ...) that are resolved right before the container is
    /// created.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<(String, String)>,

    /// Command overriding the image default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Network to attach to, defaults to the deployment overlay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeDescription>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,

    /// Size of /dev/shm in bytes, overrides the reservation field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm: Option<i64>,

    /// Ask the backend for a load-balanced endpoint instead of node ports
    #[serde(default)]
    pub load_balancer: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl AppDescription {
    /// Verify assumptions about a freshly parsed description
    pub fn verify(&self) -> Result<()> {
        // limited to 50 characters, alphanumeric and dashes, for DNS sanity
        let re = Regex::new(r"^[0-9a-z\-]{1,50}$").unwrap();
        if !re.is_match(&self.name) {
            bail!("application names must be short, lower case, dash separated");
        }
        if self.processes.is_empty() {
            bail!("application {} has no services", self.name);
        }

        let mut seen = BTreeMap::new();
        let mut monitors = 0;
        for proc_ in &self.processes {
            if !re.is_match(&proc_.name) {
                bail!("service names must be short, lower case, dash separated: {}", proc_.name);
            }
            if seen.insert(proc_.name.clone(), ()).is_some() {
                bail!("duplicate service name {} in application {}", proc_.name, self.name);
            }
            if proc_.docker_image.is_empty() {
                bail!("service {} has no image", proc_.name);
            }
            if proc_.monitor {
                monitors += 1;
            }
            proc_.required_resources.verify()?;
            for port in &proc_.ports {
                port.verify()?;
            }
            for vol in &proc_.volumes {
                vol.verify()?;
            }
        }
        if monitors > 1 {
            bail!("application {} declares more than one monitor service", self.name);
        }
        if !self.processes.iter().any(|p| p.essential) {
            warn!("application {} has only elastic services", self.name);
        }
        Ok(())
    }

    pub fn services_count(&self) -> usize {
        self.processes.len()
    }

    /// The per-service size unit used by the SIZE policy
    pub fn original_size_unit(&self) -> f64 {
        self.size.unwrap_or(1.0)
    }

    /// Starting value for `Execution::size`, before any progress is observed
    pub fn initial_size(&self) -> f64 {
        self.original_size_unit() * self.services_count() as f64
    }

    pub fn essential_processes(&self) -> impl Iterator<Item = &ServiceDescription> {
        self.processes.iter().filter(|p| p.essential)
    }

    pub fn elastic_processes(&self) -> impl Iterator<Item = &ServiceDescription> {
        self.processes.iter().filter(|p| !p.essential)
    }
}

impl ServiceDescription {
    /// The reservation with the process-level shm override folded in
    pub fn reservation(&self) -> ResourceReservation {
        let mut res = self.required_resources.clone();
        if self.shm.is_some() {
            res.shm = self.shm;
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppDescription {
        serde_json::from_str(
            r#"{
            "name": "wordcount",
            "version": 3,
            "will_end": true,
            "requires_binary": false,
            "processes": [
                {
                    "name": "master",
                    "docker_image": "zoerepo/spark-master",
                    "monitor": false,
                    "essential": true,
                    "required_resources": {"memory": 8589934592, "cores": {"min": 2, "max": 4}},
                    "ports": [{"name": "web", "protocol": "http", "port_number": 8080}]
                },
                {
                    "name": "worker-0",
                    "docker_image": "zoerepo/spark-worker",
                    "essential": false,
                    "required_resources": {"memory": 4294967296},
                    "environment": [["SPARK_MASTER", "{name_prefix}-master-{execution_id}"]],
                    "future_field": {"nested": true}
                }
            ]
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_and_verifies() {
        let app = sample();
        assert!(app.verify().is_ok());
        assert_eq!(app.services_count(), 2);
        assert_eq!(app.priority, 512);
        assert_eq!(app.essential_processes().count(), 1);
        assert_eq!(app.elastic_processes().count(), 1);
    }

    #[test]
    fn unknown_fields_round_trip() {
        let app = sample();
        assert!(app.processes[1].extra.contains_key("future_field"));
        let back = serde_json::to_value(&app).unwrap();
        assert_eq!(back["processes"][1]["future_field"]["nested"], true);
    }

    #[test]
    fn initial_size_defaults_to_service_count() {
        let app = sample();
        assert_eq!(app.initial_size(), 2.0);
        let mut sized = sample();
        sized.size = Some(50.0);
        assert_eq!(sized.initial_size(), 100.0);
    }

    #[test]
    fn duplicate_service_names_rejected() {
        let mut app = sample();
        let copy = app.processes[0].clone();
        app.processes.push(copy);
        assert!(app.verify().is_err());
    }

    #[test]
    fn two_monitors_rejected() {
        let mut app = sample();
        app.processes[0].monitor = true;
        app.processes[1].monitor = true;
        assert!(app.verify().is_err());
    }
}
