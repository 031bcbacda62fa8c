use std::collections::BTreeMap;

use super::super::Result;

/// A network port exposed by a service
///
/// The `protocol` names what the user finds behind the port (http, tcp,
/// mysql, ...); the container backend only distinguishes tcp from udp.
///
/// ```json
/// {
///   "name": "Spark master web interface",
///   "protocol": "http",
///   "port_number": 8080,
///   "path": "/",
///   "is_main_endpoint": false
/// }
/// ```
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PortDescription {
    pub name: String,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    pub port_number: u16,

    /// URL path appended when building user-facing endpoint links
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub is_main_endpoint: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl PortDescription {
    /// The transport protocol the backend should use for the binding
    pub fn backend_protocol(&self) -> &'static str {
        if self.protocol == "udp" {
            "udp"
        } else {
            "tcp"
        }
    }

    pub fn verify(&self) -> Result<()> {
        if self.port_number == 0 {
            bail!("port 0 cannot be exposed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_maps_to_tcp_binding() {
        let p: PortDescription = serde_json::from_str(
            r#"{"name": "web", "protocol": "http", "port_number": 8080, "path": "/", "is_main_endpoint": true}"#,
        )
        .unwrap();
        assert_eq!(p.backend_protocol(), "tcp");
        assert!(p.is_main_endpoint);
        assert!(p.verify().is_ok());
    }
}
