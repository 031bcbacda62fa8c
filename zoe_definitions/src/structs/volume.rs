use super::super::Result;

/// A host directory requested by the application description
///
/// ```json
/// {"name": "datasets", "host_path": "/mnt/nfs/datasets", "read_only": true}
/// ```
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VolumeDescription {
    pub name: String,
    pub host_path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeDescription {
    /// Where the volume appears inside the container
    pub fn mount_point(&self) -> String {
        format!("/mnt/{}", self.name)
    }

    pub fn verify(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            bail!("volume names must be non-empty and cannot contain slashes");
        }
        if !self.host_path.starts_with('/') {
            bail!("volume host paths must be absolute");
        }
        Ok(())
    }
}

/// A fully resolved bind mount, ready for a container backend
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct VolumeBind {
    pub host_path: String,
    pub mount_point: String,
    pub read_only: bool,
}

impl VolumeBind {
    /// Docker bind syntax, `path:mountpoint:ro|rw`
    pub fn to_bind_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path,
            self.mount_point,
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

impl From<&VolumeDescription> for VolumeBind {
    fn from(v: &VolumeDescription) -> VolumeBind {
        VolumeBind {
            host_path: v.host_path.clone(),
            mount_point: v.mount_point(),
            read_only: v.read_only,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_string_has_docker_shape() {
        let v: VolumeDescription =
            serde_json::from_str(r#"{"name": "datasets", "host_path": "/srv/data", "read_only": true}"#).unwrap();
        assert!(v.verify().is_ok());
        let b = VolumeBind::from(&v);
        assert_eq!(b.to_bind_string(), "/srv/data:/mnt/datasets:ro");
    }

    #[test]
    fn relative_host_path_is_rejected() {
        let v = VolumeDescription {
            name: "x".into(),
            host_path: "data".into(),
            read_only: false,
        };
        assert!(v.verify().is_err());
    }
}
