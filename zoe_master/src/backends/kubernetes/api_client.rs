//! Client for the Kubernetes API server, speaking plain REST with a bearer
//! token. Each Zoe service becomes one ReplicationController with a single
//! replica plus one Service object for port forwarding.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::time::Duration;

use serde_json::Value;

use crate::backends::{BackendError, ServiceInstance};
use crate::stats::{ClusterStats, NodeStats};
use crate::Result;

const API_TIMEOUT: Duration = Duration::from_secs(30);
/// Read timeout on watch streams; bounds how long shutdown can take
const WATCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Parse a Kubernetes cpu quantity ("100m", "2") into cores
pub fn parse_cpu_quantity(input: &str) -> Result<f64> {
    let s = input.trim();
    if let Some(milli) = s.strip_suffix('m') {
        Ok(milli.parse::<f64>()? / 1000.0)
    } else {
        Ok(s.parse()?)
    }
}

/// Parse a Kubernetes memory quantity ("64Mi", "2Gi", "128974848") into bytes
pub fn parse_memory_quantity(input: &str) -> Result<i64> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or_else(|| s.len());
    let (number, suffix) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format_err!("cannot parse quantity '{}'", input))?;
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0f64.powi(4),
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        other => bail!("unknown quantity suffix '{}' in '{}'", other, input),
    };
    Ok((value * multiplier) as i64)
}

/// The endpoint data of a Service object
#[derive(Debug, Clone, Default)]
pub struct ServiceEndpoint {
    pub cluster_ip: Option<String>,
    /// service port to node port
    pub node_ports: BTreeMap<u16, u16>,
}

#[derive(Clone)]
pub struct KubernetesClient {
    http: reqwest::blocking::Client,
    base: String,
    token: String,
    namespace: String,
}

impl KubernetesClient {
    pub fn new(api_url: &str, token: &str, namespace: &str) -> Result<KubernetesClient> {
        let http = reqwest::blocking::Client::builder()
            .timeout(API_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(KubernetesClient {
            http,
            base: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            namespace: namespace.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    fn namespaced(&self, kind: &str) -> String {
        self.url(&format!("api/v1/namespaces/{}/{}", self.namespace, kind))
    }

    /// Create the Service object exposing a Zoe service's ports
    pub fn create_service(&self, instance: &ServiceInstance) -> Result<()> {
        let ports: Vec<Value> = instance
            .ports
            .iter()
            .map(|p| {
                json!({
                    "name": format!("port-{}", p.number),
                    "port": p.number,
                    "targetPort": p.number,
                    "protocol": p.proto.to_uppercase(),
                })
            })
            .collect();
        let body = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": instance.hostname,
                "labels": instance.labels,
            },
            "spec": {
                "type": if instance.load_balancer { "LoadBalancer" } else { "NodePort" },
                "selector": {"zoe.service.id": instance.labels.get("zoe.service.id")},
                "ports": ports,
            }
        });
        let url = self.namespaced("services");
        check(self.http.post(&url).bearer_auth(&self.token).json(&body).send()?, &url)?;
        Ok(())
    }

    /// Create the single-replica ReplicationController running the container
    ///
    /// Returns the stable uid Kubernetes assigned to the controller.
    pub fn create_replication_controller(&self, instance: &ServiceInstance) -> Result<String> {
        let env: Vec<Value> = instance
            .environment
            .iter()
            .map(|(k, v)| json!({"name": k, "value": v}))
            .collect();
        let ports: Vec<Value> = instance
            .ports
            .iter()
            .map(|p| json!({"containerPort": p.number, "protocol": p.proto.to_uppercase()}))
            .collect();
        let volume_mounts: Vec<Value> = instance
            .volumes
            .iter()
            .enumerate()
            .map(|(idx, v)| {
                json!({
                    "name": format!("vol-{}", idx),
                    "mountPath": v.mount_point,
                    "readOnly": v.read_only,
                })
            })
            .collect();
        let volumes: Vec<Value> = instance
            .volumes
            .iter()
            .enumerate()
            .map(|(idx, v)| {
                json!({
                    "name": format!("vol-{}", idx),
                    "hostPath": {"path": v.host_path},
                })
            })
            .collect();

        let mut container = json!({
            "name": instance.hostname,
            "image": instance.image_name,
            "env": env,
            "ports": ports,
            "volumeMounts": volume_mounts,
            "resources": {
                "requests": {
                    "memory": instance.memory_limit.min.to_string(),
                    "cpu": format!("{}m", (instance.core_limit.min * 1000.0) as i64),
                },
                "limits": {
                    "memory": instance.memory_limit.max.to_string(),
                    "cpu": format!("{}m", (instance.core_limit.max * 1000.0) as i64),
                },
            },
        });
        if let Some(ref cmd) = instance.command {
            let argv: Vec<&str> = cmd.split_whitespace().collect();
            container["args"] = json!(argv);
        }
        if let Some(ref dir) = instance.work_dir {
            container["workingDir"] = json!(dir);
        }

        let mut pod_spec = json!({
            "containers": [container],
            "volumes": volumes,
            "hostname": instance.hostname,
        });
        if let Some(ref host) = instance.backend_host {
            pod_spec["nodeSelector"] = json!({"kubernetes.io/hostname": host});
        }

        let body = json!({
            "apiVersion": "v1",
            "kind": "ReplicationController",
            "metadata": {
                "name": instance.hostname,
                "labels": instance.labels,
            },
            "spec": {
                "replicas": 1,
                "selector": {"zoe.service.id": instance.labels.get("zoe.service.id")},
                "template": {
                    "metadata": {"labels": instance.labels},
                    "spec": pod_spec,
                }
            }
        });
        let url = self.namespaced("replicationcontrollers");
        let created: Value = check(self.http.post(&url).bearer_auth(&self.token).json(&body).send()?, &url)?.json()?;
        Ok(created["metadata"]["uid"]
            .as_str()
            .unwrap_or(&instance.hostname)
            .to_string())
    }

    /// Read back the Service object to learn the assigned node ports
    pub fn inspect_service(&self, name: &str) -> Result<ServiceEndpoint> {
        let url = format!("{}/{}", self.namespaced("services"), name);
        let svc: Value = check(self.http.get(&url).bearer_auth(&self.token).send()?, &url)?.json()?;
        let mut endpoint = ServiceEndpoint {
            cluster_ip: svc["spec"]["clusterIP"].as_str().map(|s| s.to_string()),
            ..ServiceEndpoint::default()
        };
        if let Some(ports) = svc["spec"]["ports"].as_array() {
            for port in ports {
                if let (Some(internal), Some(node_port)) = (port["port"].as_u64(), port["nodePort"].as_u64()) {
                    endpoint.node_ports.insert(internal as u16, node_port as u16);
                }
            }
        }
        Ok(endpoint)
    }

    /// Delete the controller and the Service of a Zoe service
    ///
    /// Missing objects are skipped silently, terminations must be idempotent.
    pub fn terminate(&self, name: &str) -> Result<()> {
        let delete_options = json!({
            "apiVersion": "v1",
            "kind": "DeleteOptions",
            "propagationPolicy": "Background",
        });
        for kind in &["replicationcontrollers", "services"] {
            let url = format!("{}/{}", self.namespaced(kind), name);
            let res = self
                .http
                .delete(&url)
                .bearer_auth(&self.token)
                .json(&delete_options)
                .send()?;
            if res.status() == reqwest::StatusCode::NOT_FOUND {
                debug!("cannot remove non-existent object {}/{}", kind, name);
                continue;
            }
            check(res, &url)?;
        }
        Ok(())
    }

    /// Node capacities plus the reservations of every running pod
    pub fn info(&self) -> Result<ClusterStats> {
        let nodes_url = self.url("api/v1/nodes");
        let nodes: Value = check(self.http.get(&nodes_url).bearer_auth(&self.token).send()?, &nodes_url)?.json()?;
        let pods_url = self.url("api/v1/pods");
        let pods: Value = check(
            self.http
                .get(&pods_url)
                .bearer_auth(&self.token)
                .query(&[("fieldSelector", "status.phase=Running")])
                .send()?,
            &pods_url,
        )?
        .json()?;

        let mut reserved: BTreeMap<String, (f64, i64)> = BTreeMap::new();
        if let Some(items) = pods["items"].as_array() {
            for pod in items {
                let node = match pod["spec"]["nodeName"].as_str() {
                    Some(node) => node.to_string(),
                    None => continue,
                };
                let entry = reserved.entry(node).or_insert((0.0, 0));
                if let Some(containers) = pod["spec"]["containers"].as_array() {
                    for container in containers {
                        let requests = &container["resources"]["requests"];
                        if let Some(cpu) = requests["cpu"].as_str() {
                            entry.0 += parse_cpu_quantity(cpu).unwrap_or(0.0);
                        }
                        if let Some(memory) = requests["memory"].as_str() {
                            entry.1 += parse_memory_quantity(memory).unwrap_or(0);
                        }
                    }
                }
            }
        }

        let mut stats = ClusterStats::new();
        stats.placement_strategy = "kube".to_string();
        if let Some(items) = nodes["items"].as_array() {
            for item in items {
                let name = item["metadata"]["name"].as_str().unwrap_or_default();
                let mut node = NodeStats::new(name);
                let allocatable = &item["status"]["allocatable"];
                if let Some(cpu) = allocatable["cpu"].as_str() {
                    node.cores_total = parse_cpu_quantity(cpu).unwrap_or(0.0);
                }
                if let Some(memory) = allocatable["memory"].as_str() {
                    node.memory_total = parse_memory_quantity(memory).unwrap_or(0);
                }
                if let Some((cores, memory)) = reserved.get(name) {
                    node.cores_reserved = *cores;
                    node.memory_reserved = *memory;
                }
                node.status = node_ready_status(item);
                if let Some(labels) = item["metadata"]["labels"].as_object() {
                    node.labels = labels
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v.as_str().unwrap_or_default()))
                        .collect();
                }
                if let Some(images) = item["status"]["images"].as_array() {
                    for image in images {
                        if let Some(names) = image["names"].as_array() {
                            node.images
                                .extend(names.iter().filter_map(|n| n.as_str()).map(|n| n.to_string()));
                        }
                    }
                }
                stats.cores_total += node.cores_total;
                stats.memory_total += node.memory_total;
                stats.nodes.push(node);
            }
        }
        Ok(stats)
    }

    /// Read one pass of the pod watch stream for this deployment
    ///
    /// Returns on stream close or read timeout; the monitor re-subscribes.
    pub fn watch_pods<F>(&self, deployment_name: &str, mut callback: F) -> Result<()>
    where
        F: FnMut(&Value) -> bool,
    {
        let stream_client = reqwest::blocking::Client::builder()
            .timeout(WATCH_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        let url = self.namespaced("pods");
        let selector = format!("zoe.deployment_name={}", deployment_name);
        let res = check(
            stream_client
                .get(&url)
                .bearer_auth(&self.token)
                .query(&[("watch", "true"), ("labelSelector", selector.as_str())])
                .send()?,
            &url,
        )?;
        let reader = BufReader::new(res);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => return Ok(()), // timeout or closed connection
            };
            if line.trim().is_empty() {
                continue;
            }
            let event: Value = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Undecodable watch event: {}", e);
                    continue;
                }
            };
            if !callback(&event) {
                break;
            }
        }
        Ok(())
    }
}

fn node_ready_status(node: &Value) -> String {
    if let Some(conditions) = node["status"]["conditions"].as_array() {
        for condition in conditions {
            if condition["type"].as_str() == Some("Ready") {
                return if condition["status"].as_str() == Some("True") {
                    "Ready".to_string()
                } else {
                    "NotReady".to_string()
                };
            }
        }
    }
    "Unknown".to_string()
}

/// Convert HTTP failures into the discriminated backend errors
fn check(res: reqwest::blocking::Response, url: &str) -> Result<reqwest::blocking::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(BackendError::NotFound.into());
    }
    let body = res.text().unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["message"].as_str().map(|m| m.to_string()))
        .unwrap_or(body);
    if message.contains("exceeded quota") || message.contains("Insufficient") {
        return Err(BackendError::NotEnoughResources(message).into());
    }
    debug!("Kubernetes API error from {}: {}", url, message);
    Err(BackendError::UnexpectedHttpStatus(status.as_u16(), url.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quantities_parse_to_cores() {
        assert_eq!(parse_cpu_quantity("100m").unwrap(), 0.1);
        assert_eq!(parse_cpu_quantity("2").unwrap(), 2.0);
        assert_eq!(parse_cpu_quantity("2500m").unwrap(), 2.5);
        assert!(parse_cpu_quantity("lots").is_err());
    }

    #[test]
    fn memory_quantities_parse_to_bytes() {
        assert_eq!(parse_memory_quantity("64Mi").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_memory_quantity("2Gi").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_quantity("128974848").unwrap(), 128_974_848);
        assert_eq!(parse_memory_quantity("500M").unwrap(), 500_000_000);
    }

    #[test]
    fn quota_errors_map_to_resource_shortage() {
        let mut server = mockito::Server::new();
        let _services = server
            .mock("POST", "/api/v1/namespaces/zoe/services")
            .with_status(403)
            .with_body(r#"{"kind": "Status", "message": "exceeded quota: compute-resources"}"#)
            .create();
        let client = KubernetesClient::new(&server.url(), "token", "zoe").unwrap();
        let instance_err = client
            .http
            .post(client.namespaced("services"))
            .bearer_auth(&client.token)
            .json(&json!({}))
            .send()
            .map_err(crate::Error::from)
            .and_then(|r| check(r, "url"))
            .unwrap_err();
        match instance_err.downcast::<BackendError>() {
            Ok(BackendError::NotEnoughResources(msg)) => assert!(msg.contains("exceeded quota")),
            other => panic!("expected NotEnoughResources, got {:?}", other),
        }
    }

    #[test]
    fn node_ports_surface_from_service_inspection() {
        let mut server = mockito::Server::new();
        let _svc = server
            .mock("GET", "/api/v1/namespaces/zoe/services/prod-master-1")
            .with_status(200)
            .with_body(
                r#"{
                    "spec": {
                        "clusterIP": "10.0.0.17",
                        "ports": [
                            {"port": 8080, "nodePort": 30080},
                            {"port": 7077, "nodePort": 30077}
                        ]
                    }
                }"#,
            )
            .create();
        let client = KubernetesClient::new(&server.url(), "token", "zoe").unwrap();
        let endpoint = client.inspect_service("prod-master-1").unwrap();
        assert_eq!(endpoint.cluster_ip.as_deref(), Some("10.0.0.17"));
        assert_eq!(endpoint.node_ports[&8080], 30080);
        assert_eq!(endpoint.node_ports[&7077], 30077);
    }
}
