/// Resource reservation bounds
pub mod resources;
pub use self::resources::{Limits, ResourceReservation};

/// Network ports exposed by services
pub mod port;
pub use self::port::PortDescription;

/// Volumes mounted into service containers
pub mod volume;
pub use self::volume::{VolumeBind, VolumeDescription};
