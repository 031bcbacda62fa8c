use super::super::Result;

/// Reservation bounds for a single resource
///
/// Descriptions can give either a plain scalar (min == max) or an explicit
/// range:
///
/// ```json
/// "memory": 4294967296
/// ```
///
/// ```json
/// "memory": {"min": 4294967296, "max": 8589934592}
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(from = "RawLimits<T>")]
pub struct Limits<T: Copy> {
    pub min: T,
    pub max: T,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLimits<T: Copy> {
    Scalar(T),
    Range { min: T, max: T },
}

impl<T: Copy> From<RawLimits<T>> for Limits<T> {
    fn from(raw: RawLimits<T>) -> Limits<T> {
        match raw {
            RawLimits::Scalar(v) => Limits { min: v, max: v },
            RawLimits::Range { min, max } => Limits { min, max },
        }
    }
}

impl<T: Copy> Limits<T> {
    pub fn new(min: T, max: T) -> Limits<T> {
        Limits { min, max }
    }
}

/// What a service asks the platform to set aside for it
///
/// Memory is in bytes, cores are fractional. The scheduler places services at
/// their minimum reservation; the core-limit adjuster can raise the core
/// allocation later when a node has slack.
///
/// ```json
/// "required_resources": {
///   "memory": 8589934592,
///   "cores": {"min": 2, "max": 4}
/// }
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResourceReservation {
    /// Memory bounds in bytes
    pub memory: Limits<i64>,

    /// Core bounds, fractional cores allowed
    #[serde(default = "default_cores")]
    pub cores: Limits<f64>,

    /// Size of /dev/shm in bytes
    #[serde(default)]
    pub shm: Option<i64>,
}

fn default_cores() -> Limits<f64> {
    Limits::new(0.1, 16.0)
}

impl ResourceReservation {
    pub fn verify(&self) -> Result<()> {
        if self.memory.min <= 0 {
            bail!("memory reservation must be positive");
        }
        if self.memory.max < self.memory.min {
            bail!("memory maximum cannot be below the minimum");
        }
        if self.cores.min <= 0.0 {
            bail!("core reservation must be positive");
        }
        if self.cores.max < self.cores.min {
            bail!("core maximum cannot be below the minimum");
        }
        if let Some(shm) = self.shm {
            if shm < 0 {
                bail!("shm size cannot be negative");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_memory_becomes_min_max() {
        let r: ResourceReservation = serde_json::from_str(r#"{"memory": 4294967296}"#).unwrap();
        assert_eq!(r.memory, Limits::new(4294967296, 4294967296));
        assert_eq!(r.cores, default_cores());
    }

    #[test]
    fn explicit_range_is_kept() {
        let r: ResourceReservation =
            serde_json::from_str(r#"{"memory": {"min": 1024, "max": 2048}, "cores": {"min": 1.0, "max": 4.0}}"#)
                .unwrap();
        assert_eq!(r.memory, Limits::new(1024, 2048));
        assert_eq!(r.cores, Limits::new(1.0, 4.0));
        assert!(r.verify().is_ok());
    }

    #[test]
    fn inverted_range_fails_verify() {
        let r = ResourceReservation {
            memory: Limits::new(2048, 1024),
            cores: default_cores(),
            shm: None,
        };
        assert!(r.verify().is_err());
    }
}
