//! Client for the Docker Engine API as exposed by a stand-alone Swarm
//! manager. The manager endpoint can sit behind ZooKeeper or Consul
//! leader election.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::time::Duration;

use serde_json::Value;
use url::Url;
use zookeeper::{WatchedEvent, Watcher, ZooKeeper};

use crate::backends::BackendError;
use crate::stats::{ClusterStats, NodeStats};
use crate::{Error, Result};

const API_TIMEOUT: Duration = Duration::from_secs(30);
/// Read timeout on the event stream; bounds how long shutdown can take
const EVENT_STREAM_TIMEOUT: Duration = Duration::from_secs(15);
const PULL_TIMEOUT: Duration = Duration::from_secs(600);

/// Parse a human-friendly size string into bytes
///
/// Binary suffixes are powers of 1024 ("4 GiB" is 4·2³⁰), decimal ones are
/// powers of 1000 ("4 GB" is 4·10⁹), a bare number is bytes.
pub fn parse_size(input: &str) -> Result<i64> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or_else(|| s.len());
    let (number, suffix) = s.split_at(split);
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format_err!("cannot parse size '{}'", input))?;
    let multiplier: f64 = match suffix.trim() {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0f64.powi(4),
        "PiB" => 1024.0f64.powi(5),
        "KB" | "kB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "PB" => 1e15,
        other => bail!("unknown size suffix '{}' in '{}'", other, input),
    };
    Ok((value * multiplier) as i64)
}

struct NullWatcher;
impl Watcher for NullWatcher {
    fn handle(&self, _event: WatchedEvent) {}
}

/// Ask ZooKeeper who the current Swarm manager is
fn zookeeper_swarm(server_list: &str) -> Result<String> {
    let (servers, base) = match server_list.find('/') {
        Some(idx) => (&server_list[..idx], server_list[idx..].trim_end_matches('/')),
        None => (server_list, ""),
    };
    let path = format!("{}/swarm/leader", if base.is_empty() { "/docker" } else { base });
    let zk = ZooKeeper::connect(servers, Duration::from_secs(10), NullWatcher)
        .map_err(|e| format_err!("cannot connect to ZooKeeper at {}: {:?}", servers, e))?;
    let (data, _stat) = zk
        .get_data(&path, false)
        .map_err(|e| format_err!("cannot read the Swarm leader key {}: {:?}", path, e))?;
    let _ = zk.close();
    Ok(String::from_utf8(data)?)
}

/// Ask Consul who the current Swarm manager is
fn consul_swarm(host: &str) -> Result<String> {
    let http = reqwest::blocking::Client::builder().timeout(API_TIMEOUT).build()?;
    let url = format!("http://{}/v1/kv/docker/swarm/leader", host);
    let entries: Vec<Value> = http.get(&url).send()?.error_for_status()?.json()?;
    let encoded = entries
        .get(0)
        .and_then(|e| e["Value"].as_str())
        .ok_or_else(|| format_err!("the Swarm leader key is missing from Consul at {}", host))?;
    Ok(String::from_utf8(base64::decode(encoded)?)?)
}

/// Resolve the manager endpoint from a plain URL or a discovery service
pub fn resolve_manager(swarm_url: &str) -> Result<String> {
    let manager = if let Some(rest) = swarm_url.strip_prefix("zk://") {
        zookeeper_swarm(rest)?
    } else if let Some(rest) = swarm_url.strip_prefix("consul://") {
        consul_swarm(rest)?
    } else if swarm_url.starts_with("http://") || swarm_url.starts_with("https://") {
        swarm_url.to_string()
    } else {
        bail!("unsupported URL scheme for the Swarm manager: {}", swarm_url);
    };
    // discovery services store the manager as host:port or tcp://host:port
    if let Some(rest) = manager.strip_prefix("tcp://") {
        Ok(format!("http://{}", rest))
    } else if manager.starts_with("http://") || manager.starts_with("https://") {
        Ok(manager)
    } else {
        Ok(format!("http://{}", manager))
    }
}

/// Wrapper for the Docker container creation options
#[derive(Default, Debug, Clone)]
pub struct DockerContainerOptions {
    pub name: String,
    pub hostname: String,
    pub environment: Vec<(String, String)>,
    pub volume_binds: Vec<String>,
    pub command: Option<String>,
    pub work_dir: Option<String>,
    pub memory_limit: i64,
    pub shm_size: Option<i64>,
    pub ports: Vec<(u16, &'static str)>,
    pub network_name: String,
    pub labels: BTreeMap<String, String>,
    pub gelf_log_address: String,
    pub constraints: Vec<String>,
}

/// What the scheduler needs to know about a freshly created container
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub docker_id: String,
    pub ip_address: Option<String>,
    pub state: String,
    pub running: bool,
    /// internal port number to host port
    pub ports: BTreeMap<u16, u16>,
}

/// A container as reported by the Swarm-wide listing
#[derive(Debug, Clone)]
pub struct ListedContainer {
    pub id: String,
    pub host: Option<String>,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub status: String,
}

#[derive(Clone)]
pub struct SwarmClient {
    http: reqwest::blocking::Client,
    base: String,
}

impl SwarmClient {
    pub fn new(swarm_url: &str) -> Result<SwarmClient> {
        let manager = resolve_manager(swarm_url)?;
        debug!("Connecting to Swarm at {}", manager);
        SwarmClient::with_endpoint(&manager)
    }

    /// Connect straight to a manager, skipping discovery
    pub fn with_endpoint(endpoint: &str) -> Result<SwarmClient> {
        Url::parse(endpoint)?; // discovery can hand back garbage
        let http = reqwest::blocking::Client::builder().timeout(API_TIMEOUT).build()?;
        Ok(SwarmClient {
            http,
            base: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    /// Retrieve Swarm statistics; the API returns a mess difficult to parse
    pub fn info(&self) -> Result<ClusterStats> {
        let url = self.url("info");
        let info: Value = check(self.http.get(&url).send()?, &url)?.json()?;
        parse_info(&info)
    }

    /// Create and start a new container
    pub fn spawn_container(&self, image: &str, options: &DockerContainerOptions) -> Result<ContainerInfo> {
        let mut env: Vec<String> = options
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        // Swarm reads placement constraints from the environment
        env.extend(options.constraints.iter().cloned());

        let mut exposed = serde_json::Map::new();
        let mut bindings = serde_json::Map::new();
        for (number, proto) in &options.ports {
            let key = format!("{}/{}", number, proto);
            exposed.insert(key.clone(), json!({}));
            bindings.insert(key, Value::Null);
        }

        let log_config = if options.gelf_log_address.is_empty() {
            json!({"Type": "json-file", "Config": {}})
        } else {
            let label_names: Vec<String> = options.labels.keys().cloned().collect();
            json!({
                "Type": "gelf",
                "Config": {
                    "gelf-address": options.gelf_log_address,
                    "labels": label_names.join(","),
                }
            })
        };

        let mut host_config = json!({
            "Memory": options.memory_limit,
            "MemorySwap": options.memory_limit,
            "Binds": options.volume_binds,
            "PortBindings": bindings,
            "NetworkMode": options.network_name,
            "RestartPolicy": {"Name": ""},
            "LogConfig": log_config,
        });
        if let Some(shm) = options.shm_size {
            host_config["ShmSize"] = json!(shm);
        }

        let mut body = json!({
            "Image": image,
            "Hostname": options.hostname,
            "Env": env,
            "Labels": options.labels,
            "ExposedPorts": exposed,
            "HostConfig": host_config,
        });
        if let Some(ref cmd) = options.command {
            let argv: Vec<&str> = cmd.split_whitespace().collect();
            body["Cmd"] = json!(argv);
        }
        if let Some(ref dir) = options.work_dir {
            body["WorkingDir"] = json!(dir);
        }

        let create_url = self.url("containers/create");
        let res = self
            .http
            .post(&create_url)
            .query(&[("name", options.name.as_str())])
            .json(&body)
            .send()?;
        let created: Value = check(res, &create_url)?.json()?;
        let docker_id = created["Id"]
            .as_str()
            .ok_or_else(|| format_err!("container creation reply carries no Id"))?
            .to_string();

        let start_url = self.url(&format!("containers/{}/start", docker_id));
        match self.http.post(&start_url).send().map_err(Error::from).and_then(|r| check(r, &start_url)) {
            Ok(_) => {}
            Err(e) => {
                // do not leave the half-created container behind
                let _ = self.terminate_container(&docker_id, true);
                return Err(e);
            }
        }

        self.inspect_container(&docker_id)
    }

    /// Retrieve information about an existing container
    pub fn inspect_container(&self, docker_id: &str) -> Result<ContainerInfo> {
        let url = self.url(&format!("containers/{}/json", docker_id));
        let info: Value = check(self.http.get(&url).send()?, &url)?.json()?;

        let ip_address = info["NetworkSettings"]["Networks"]
            .as_object()
            .and_then(|nets| {
                nets.values()
                    .filter_map(|n| n["IPAddress"].as_str())
                    .find(|ip| !ip.is_empty())
            })
            .map(|ip| ip.to_string());

        let mut ports = BTreeMap::new();
        if let Some(port_map) = info["NetworkSettings"]["Ports"].as_object() {
            for (key, value) in port_map {
                let internal: u16 = match key.split('/').next().and_then(|p| p.parse().ok()) {
                    Some(p) => p,
                    None => continue,
                };
                if let Some(host_port) = value
                    .get(0)
                    .and_then(|m| m["HostPort"].as_str())
                    .and_then(|p| p.parse().ok())
                {
                    ports.insert(internal, host_port);
                }
            }
        }

        let state = &info["State"];
        let (state_name, running) = if state["Running"].as_bool() == Some(true) {
            ("running", true)
        } else if state["Paused"].as_bool() == Some(true) {
            ("paused", true)
        } else if state["Restarting"].as_bool() == Some(true) {
            ("restarting", true)
        } else if state["OOMKilled"].as_bool() == Some(true) || state["Dead"].as_bool() == Some(true) {
            ("killed", false)
        } else {
            ("unknown", false)
        };

        Ok(ContainerInfo {
            docker_id: docker_id.to_string(),
            ip_address,
            state: state_name.to_string(),
            running,
            ports,
        })
    }

    /// Kill and delete a container; missing containers are not an error
    pub fn terminate_container(&self, docker_id: &str, delete: bool) -> Result<()> {
        let url = if delete {
            self.url(&format!("containers/{}?force=true&v=true", docker_id))
        } else {
            self.url(&format!("containers/{}/kill", docker_id))
        };
        let mut retries = 5;
        while retries > 0 {
            let res = if delete {
                self.http.delete(&url).send()
            } else {
                self.http.post(&url).send()
            };
            match res {
                Ok(res) => {
                    if res.status() == reqwest::StatusCode::NOT_FOUND {
                        debug!("cannot remove a non-existent container {}", docker_id);
                        return Ok(());
                    }
                    check(res, &url)?;
                    return Ok(());
                }
                Err(e) => {
                    if e.is_timeout() {
                        error!("Read timeout trying to remove container {}", docker_id);
                        retries -= 1;
                        std::thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
        bail!("giving up trying to remove container {}", docker_id);
    }

    /// Adjust the resource limits of a running container
    pub fn update_container(&self, docker_id: &str, cores: Option<f64>, memory: Option<i64>) -> Result<()> {
        let mut body = serde_json::Map::new();
        if let Some(cores) = cores {
            body.insert("NanoCpus".to_string(), json!((cores * 1e9) as i64));
        }
        if let Some(memory) = memory {
            body.insert("Memory".to_string(), json!(memory));
            body.insert("MemorySwap".to_string(), json!(memory));
        }
        if body.is_empty() {
            return Ok(());
        }
        let url = self.url(&format!("containers/{}/update", docker_id));
        check(self.http.post(&url).json(&Value::Object(body)).send()?, &url)?;
        Ok(())
    }

    /// List containers carrying all the given labels
    pub fn list(&self, only_labels: &BTreeMap<String, String>) -> Result<Vec<ListedContainer>> {
        let label_filters: Vec<String> = only_labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let filters = json!({"label": label_filters}).to_string();
        let url = self.url("containers/json");
        let containers: Vec<Value> = check(
            self.http
                .get(&url)
                .query(&[("all", "true"), ("filters", filters.as_str())])
                .send()?,
            &url,
        )?
        .json()?;
        let mut out = Vec::new();
        for cont in containers {
            // Swarm returns container names in the form /host/name
            let raw_name = cont["Names"][0].as_str().unwrap_or_default();
            let parts: Vec<&str> = raw_name.split('/').filter(|p| !p.is_empty()).collect();
            let (host, name) = match parts.as_slice() {
                [host, name] => (Some(host.to_string()), name.to_string()),
                [name] => (None, name.to_string()),
                _ => (None, raw_name.to_string()),
            };
            let labels = cont["Labels"]
                .as_object()
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            out.push(ListedContainer {
                id: cont["Id"].as_str().unwrap_or_default().to_string(),
                host,
                name,
                labels,
                status: cont["State"].as_str().unwrap_or_default().to_string(),
            });
        }
        Ok(out)
    }

    /// Pull an image so that later container creations do not block on it
    pub fn pull_image(&self, image: &str) -> Result<()> {
        let url = self.url("images/create");
        let res = self
            .http
            .post(&url)
            .query(&[("fromImage", image)])
            .timeout(PULL_TIMEOUT)
            .send()?;
        let mut res = check(res, &url)?;
        // progress is streamed; drain it so the pull completes
        let mut sink = Vec::new();
        std::io::copy(&mut res, &mut sink)?;
        Ok(())
    }

    /// The image tags known to the cluster
    pub fn list_images(&self) -> Result<Vec<String>> {
        let url = self.url("images/json");
        let images: Vec<Value> = check(self.http.get(&url).send()?, &url)?.json()?;
        let mut tags = Vec::new();
        for image in images {
            if let Some(repo_tags) = image["RepoTags"].as_array() {
                tags.extend(repo_tags.iter().filter_map(|t| t.as_str()).map(|t| t.to_string()));
            }
        }
        Ok(tags)
    }

    /// Read one pass of the event stream, feeding each event to `callback`
    ///
    /// Returns when the callback asks to stop, the stream closes or the read
    /// timeout fires; the monitor thread re-subscribes around protocol
    /// errors.
    // TODO: pass `since` on re-subscribe so events in the gap are not lost
    pub fn consume_events<F>(&self, deployment_name: &str, mut callback: F) -> Result<()>
    where
        F: FnMut(&Value) -> bool,
    {
        let filters = json!({
            "type": ["container"],
            "label": [format!("zoe.deployment_name={}", deployment_name)],
        })
        .to_string();
        let stream_client = reqwest::blocking::Client::builder()
            .timeout(EVENT_STREAM_TIMEOUT)
            .build()?;
        let url = self.url("events");
        let res = check(
            stream_client.get(&url).query(&[("filters", filters.as_str())]).send()?,
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
                    warn!("Undecodable Swarm event: {}", e);
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
    if message.contains("no resources available") {
        return Err(BackendError::NotEnoughResources(message).into());
    }
    debug!("Swarm API error from {}: {}", url, message);
    Err(BackendError::UnexpectedHttpStatus(status.as_u16(), url.to_string()).into())
}

/// Walk the SystemStatus table by fixed offsets; each node is nine rows
fn parse_info(info: &Value) -> Result<ClusterStats> {
    let mut stats = ClusterStats::new();
    stats.container_count = info["Containers"].as_u64().unwrap_or(0) as u32;
    stats.memory_total = info["MemTotal"].as_i64().unwrap_or(0);
    stats.cores_total = info["NCPU"].as_f64().unwrap_or(0.0);

    let table = info["SystemStatus"]
        .as_array()
        .ok_or_else(|| format_err!("the Swarm info reply carries no SystemStatus table"))?;
    let cell = |row: usize, col: usize| -> Result<&str> {
        table
            .get(row)
            .and_then(|r| r.get(col))
            .and_then(|c| c.as_str())
            .ok_or_else(|| format_err!("truncated SystemStatus table at row {}", row))
    };

    // rows 0..4: Role, Strategy, Filters, Nodes; nodes start at row 4
    ensure!(cell(1, 0)?.contains("Strategy"), "unexpected SystemStatus layout");
    stats.placement_strategy = cell(1, 1)?.to_string();
    ensure!(cell(2, 0)?.contains("Filters"), "unexpected SystemStatus layout");
    stats.active_filters = cell(2, 1)?.split(", ").map(|f| f.trim().to_string()).collect();
    ensure!(cell(3, 0)?.contains("Nodes"), "unexpected SystemStatus layout");
    let node_count: usize = cell(3, 1)?.trim().parse()?;

    for node_idx in 0..node_count {
        let base = 4 + node_idx * 9;
        let mut node = NodeStats::new(cell(base, 0)?.trim());
        node.status = cell(base + 2, 1)?.to_string();
        node.container_count = cell(base + 3, 1)?
            .split_whitespace()
            .next()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let cpus = cell(base + 4, 1)?;
        let mut cpu_parts = cpus.split(" / ");
        node.cores_reserved = cpu_parts.next().unwrap_or("0").trim().parse()?;
        node.cores_total = cpu_parts
            .next()
            .ok_or_else(|| format_err!("malformed CPU reservation '{}'", cpus))?
            .trim()
            .parse()?;
        let memory = cell(base + 5, 1)?;
        let mut mem_parts = memory.split(" / ");
        node.memory_reserved = parse_size(mem_parts.next().unwrap_or("0"))?;
        node.memory_total = parse_size(
            mem_parts
                .next()
                .ok_or_else(|| format_err!("malformed memory reservation '{}'", memory))?,
        )?;
        node.labels = cell(base + 6, 1)?
            .split(", ")
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        node.last_update = Some(cell(base + 7, 1)?.to_string());
        stats.nodes.push(node);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: i64 = 1024 * 1024 * 1024;

    #[test]
    fn size_strings_parse_to_bytes() {
        assert_eq!(parse_size("4 GiB").unwrap(), 4 * GIB);
        assert_eq!(parse_size("4 GB").unwrap(), 4_000_000_000);
        assert_eq!(parse_size("512 MiB").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("31.39 GiB").unwrap(), (31.39 * GIB as f64) as i64);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("0 B").unwrap(), 0);
        assert!(parse_size("four gigabytes").is_err());
    }

    fn sample_info() -> Value {
        json!({
            "Containers": 7,
            "MemTotal": 64 * GIB,
            "NCPU": 32,
            "SystemStatus": [
                ["Role", "primary"],
                ["Strategy", "spread"],
                ["Filters", "health, port, containerslots, dependency, affinity, constraint"],
                ["Nodes", "2"],
                ["node-a", "192.168.45.10:2375"],
                [" └ ID", "AAAA:BBBB"],
                [" └ Status", "Healthy"],
                [" └ Containers", "4 (4 Running, 0 Paused, 0 Stopped)"],
                [" └ Reserved CPUs", "2 / 16"],
                [" └ Reserved Memory", "8 GiB / 32 GiB"],
                [" └ Labels", "executiondriver=, kernelversion=4.4"],
                [" └ UpdatedAt", "2017-05-12T09:00:00Z"],
                [" └ ServerVersion", "1.12.6"],
                ["node-b", "192.168.45.11:2375"],
                [" └ ID", "CCCC:DDDD"],
                [" └ Status", "Healthy"],
                [" └ Containers", "3 (3 Running, 0 Paused, 0 Stopped)"],
                [" └ Reserved CPUs", "0 / 16"],
                [" └ Reserved Memory", "0 B / 32 GiB"],
                [" └ Labels", ""],
                [" └ UpdatedAt", "2017-05-12T09:00:05Z"],
                [" └ ServerVersion", "1.12.6"]
            ]
        })
    }

    #[test]
    fn node_table_parses_by_fixed_offsets() {
        let stats = parse_info(&sample_info()).unwrap();
        assert_eq!(stats.placement_strategy, "spread");
        assert_eq!(stats.container_count, 7);
        assert_eq!(stats.nodes.len(), 2);

        let a = &stats.nodes[0];
        assert_eq!(a.name, "node-a");
        assert_eq!(a.status, "Healthy");
        assert_eq!(a.container_count, 4);
        assert_eq!(a.cores_reserved, 2.0);
        assert_eq!(a.cores_total, 16.0);
        assert_eq!(a.memory_reserved, 8 * GIB);
        assert_eq!(a.memory_total, 32 * GIB);
        assert_eq!(a.free_memory(), 24 * GIB);

        let b = &stats.nodes[1];
        assert_eq!(b.name, "node-b");
        assert_eq!(b.memory_reserved, 0);
        assert_eq!(b.free_cores(), 16.0);
    }

    #[test]
    fn manager_urls_resolve() {
        assert_eq!(resolve_manager("http://m:2375").unwrap(), "http://m:2375");
        assert_eq!(resolve_manager("https://m:2376").unwrap(), "https://m:2376");
        assert!(resolve_manager("ftp://m").is_err());
    }

    #[test]
    fn spawn_maps_resource_shortage_to_backend_error() {
        let mut server = mockito::Server::new();
        let _create = server
            .mock("POST", "/containers/create?name=svc")
            .with_status(500)
            .with_body(r#"{"message": "no resources available to schedule container"}"#)
            .create();
        let client = SwarmClient::with_endpoint(&server.url()).unwrap();
        let opts = DockerContainerOptions {
            name: "svc".to_string(),
            ..DockerContainerOptions::default()
        };
        let err = client.spawn_container("img", &opts).unwrap_err();
        match err.downcast::<BackendError>() {
            Ok(BackendError::NotEnoughResources(msg)) => assert!(msg.contains("no resources available")),
            other => panic!("expected NotEnoughResources, got {:?}", other),
        }
    }

    #[test]
    fn terminating_a_missing_container_is_fine() {
        let mut server = mockito::Server::new();
        let _delete = server
            .mock("DELETE", "/containers/gone?force=true&v=true")
            .with_status(404)
            .create();
        let client = SwarmClient::with_endpoint(&server.url()).unwrap();
        assert!(client.terminate_container("gone", true).is_ok());
    }
}
