/// The scheduling algorithm and its thread plumbing
pub mod elastic;
pub use self::elastic::{ElasticScheduler, Policy, SchedulerStats, SELF_TRIGGER_TIMEOUT};

/// Dry-run placement on a capacity snapshot
pub mod simulated_platform;
pub use self::simulated_platform::SimulatedPlatform;
