#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
#[macro_use]
extern crate serde_json;

// backend API clients
extern crate base64;
extern crate reqwest;
extern crate url;
extern crate zookeeper;

extern crate chrono;

#[macro_use]
extern crate log;

// parallel image preloading
extern crate threadpool;

#[macro_use]
extern crate failure;

pub use failure::Error;
pub type Result<T> = std::result::Result<T, Error>;

extern crate zoe_definitions;
pub use zoe_definitions::state::{Execution, ExecutionStatus, Service, StateStore};
pub use zoe_definitions::{BackendKind, Config};

/// Cluster and node capacity snapshots
pub mod stats;

/// Container platforms behind a uniform capability set
pub mod backends;

/// The size-based elastic scheduler
pub mod scheduler;

/// User workspace resolution
pub mod workspace;
