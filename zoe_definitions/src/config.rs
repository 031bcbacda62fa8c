use std::fs::File;
use std::io::Read;
use std::path::Path;

use regex::Regex;
use url::Url;

use crate::Result;

const GIB: i64 = 1024 * 1024 * 1024;

/// Which container platform runs the services
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Kubernetes,
    Swarm,
}

/// Deployment-wide configuration, deserializable from zoe.yml
///
/// One Config describes one deployment; several deployments can share the
/// same database and the same cluster as long as their `deployment_name`
/// differs. The same file also carries the API collaborator's options, so
/// unknown fields are ignored rather than rejected.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Name of this deployment
    ///
    /// Namespaces the SQL schema, the container labels and the DNS names of
    /// every service, so it must be a valid identifier in all three worlds.
    ///
    /// ```yaml
    /// deployment_name: prod
    /// ```
    pub deployment_name: String,

    // ------------------------------------------------------------------------
    // State database
    // ------------------------------------------------------------------------
    /// ```yaml
    /// dbuser: zoe
    /// ```
    #[serde(default = "default_dbuser")]
    pub dbuser: String,

    #[serde(default)]
    pub dbpass: String,

    /// ```yaml
    /// dbhost: db.example.com
    /// ```
    #[serde(default = "default_dbhost")]
    pub dbhost: String,

    #[serde(default = "default_dbport")]
    pub dbport: u16,

    #[serde(default = "default_dbname")]
    pub dbname: String,

    // ------------------------------------------------------------------------
    // Placement limits
    // ------------------------------------------------------------------------
    /// Ceiling applied to every service memory reservation, in GiB
    ///
    /// ```yaml
    /// max_memory_limit: 64
    /// ```
    #[serde(default = "default_max_memory")]
    pub max_memory_limit: i64,

    /// Ceiling applied to every service core reservation
    ///
    /// ```yaml
    /// max_core_limit: 16
    /// ```
    #[serde(default = "default_max_cores")]
    pub max_core_limit: f64,

    // ------------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------------
    /// Queue ordering policy, FIFO or SIZE
    ///
    /// ```yaml
    /// scheduler_policy: SIZE
    /// ```
    #[serde(default = "default_policy")]
    pub scheduler_policy: String,

    // ------------------------------------------------------------------------
    // Container backend
    // ------------------------------------------------------------------------
    /// ```yaml
    /// backend: swarm
    /// ```
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Swarm manager, as a plain URL or behind a discovery service
    ///
    /// ```yaml
    /// swarm_url: zk://zk1:2181,zk2:2181/docker
    /// ```
    #[serde(default = "default_swarm_url")]
    pub swarm_url: String,

    /// Kubernetes API server
    ///
    /// ```yaml
    /// kubernetes_url: https://kube.example.com:6443
    /// ```
    #[serde(default)]
    pub kubernetes_url: String,

    /// Bearer token for the API server
    #[serde(default)]
    pub kubernetes_token: String,

    /// Namespace holding all objects created by this deployment
    #[serde(default = "default_kube_namespace")]
    pub kubernetes_namespace: String,

    /// Name of the overlay network services attach to by default
    ///
    /// ```yaml
    /// overlay_network_name: zoe-usernet
    /// ```
    #[serde(default = "default_overlay")]
    pub overlay_network_name: String,

    /// GELF endpoint for container logs; empty keeps the json-file driver
    ///
    /// ```yaml
    /// gelf_address: udp://gelf.example.com:12201
    /// ```
    #[serde(default)]
    pub gelf_address: String,

    // ------------------------------------------------------------------------
    // Workspaces and the shop
    // ------------------------------------------------------------------------
    /// ```yaml
    /// workspace_base_path: /mnt/zoe-workspaces
    /// ```
    #[serde(default = "default_workspace_base")]
    pub workspace_base_path: String,

    /// Subdirectory of the base path holding this deployment's workspaces;
    /// defaults to the deployment name when empty
    #[serde(default)]
    pub workspace_deployment_path: String,

    /// ```yaml
    /// zapp_shop_path: /var/lib/zoe-apps
    /// ```
    #[serde(default = "default_shop_path")]
    pub zapp_shop_path: String,
}

fn default_dbuser() -> String {
    "zoe".to_string()
}
fn default_dbhost() -> String {
    "localhost".to_string()
}
fn default_dbport() -> u16 {
    5432
}
fn default_dbname() -> String {
    "zoe".to_string()
}
fn default_max_memory() -> i64 {
    64
}
fn default_max_cores() -> f64 {
    16.0
}
fn default_policy() -> String {
    "FIFO".to_string()
}
fn default_backend() -> BackendKind {
    BackendKind::Swarm
}
fn default_swarm_url() -> String {
    "http://localhost:2375".to_string()
}
fn default_kube_namespace() -> String {
    "default".to_string()
}
fn default_overlay() -> String {
    "zoe".to_string()
}
fn default_workspace_base() -> String {
    "/mnt/zoe-workspaces".to_string()
}
fn default_shop_path() -> String {
    "/var/lib/zoe-apps".to_string()
}

impl Config {
    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let mut data = String::new();
        File::open(path.as_ref())?.read_to_string(&mut data)?;
        let conf: Config = serde_yaml::from_str(&data)?;
        conf.verify()?;
        Ok(conf)
    }

    /// Verify assumptions about the configuration
    pub fn verify(&self) -> Result<()> {
        // the deployment name ends up in SQL identifiers and DNS names
        let re = Regex::new(r"^[a-z][a-z0-9]{0,31}$").unwrap();
        if !re.is_match(&self.deployment_name) {
            bail!("deployment_name must be a short lower case alphanumeric identifier");
        }
        if self.max_memory_limit <= 0 {
            bail!("max_memory_limit must be at least 1 GiB");
        }
        if self.max_core_limit <= 0.0 {
            bail!("max_core_limit must be positive");
        }
        match self.backend {
            BackendKind::Kubernetes => {
                if self.kubernetes_url.is_empty() {
                    bail!("the kubernetes backend needs kubernetes_url");
                }
                Url::parse(&self.kubernetes_url)?;
            }
            BackendKind::Swarm => {
                if !self.swarm_url.starts_with("http://")
                    && !self.swarm_url.starts_with("https://")
                    && !self.swarm_url.starts_with("zk://")
                    && !self.swarm_url.starts_with("consul://")
                {
                    bail!("unsupported URL scheme for the Swarm manager: {}", self.swarm_url);
                }
            }
        }
        Ok(())
    }

    /// The global memory cap in bytes
    pub fn max_memory_limit_bytes(&self) -> i64 {
        self.max_memory_limit * GIB
    }

    /// Root of this deployment's user workspaces
    pub fn workspace_path(&self) -> String {
        let deployment_dir = if self.workspace_deployment_path.is_empty() {
            &self.deployment_name
        } else {
            &self.workspace_deployment_path
        };
        format!("{}/{}", self.workspace_base_path.trim_end_matches('/'), deployment_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        serde_yaml::from_str("deployment_name: test\n").unwrap()
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let conf = minimal();
        assert!(conf.verify().is_ok());
        assert_eq!(conf.dbport, 5432);
        assert_eq!(conf.backend, BackendKind::Swarm);
        assert_eq!(conf.max_memory_limit_bytes(), 64 * 1024 * 1024 * 1024);
        assert_eq!(conf.workspace_path(), "/mnt/zoe-workspaces/test");
    }

    #[test]
    fn bad_deployment_name_is_fatal() {
        let conf: Config = serde_yaml::from_str("deployment_name: 'Prod; DROP'\n").unwrap();
        assert!(conf.verify().is_err());
    }

    #[test]
    fn kubernetes_backend_needs_url() {
        let conf: Config = serde_yaml::from_str("deployment_name: test\nbackend: kubernetes\n").unwrap();
        assert!(conf.verify().is_err());
    }

    #[test]
    fn swarm_discovery_schemes_accepted() {
        for scheme in &["http://h:2375", "zk://zk1:2181/docker", "consul://consul.local"] {
            let yml = format!("deployment_name: test\nswarm_url: '{}'\n", scheme);
            let conf: Config = serde_yaml::from_str(&yml).unwrap();
            assert!(conf.verify().is_ok(), "{} should be accepted", scheme);
        }
    }
}
