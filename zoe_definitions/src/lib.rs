#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;

#[macro_use]
extern crate log;

extern crate chrono;
extern crate postgres;
extern crate regex;
extern crate walkdir;

#[macro_use]
extern crate failure;

pub use failure::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Master config for a Zoe deployment
pub mod config;
pub use crate::config::{BackendKind, Config};

/// Typed model of the application descriptions users submit
pub mod application;
pub use crate::application::{AppDescription, ServiceDescription};

/// Structs shared between descriptions and the state store
pub mod structs;

/// PostgreSQL-backed state store
pub mod state;
pub use crate::state::{Execution, ExecutionStatus, Service, StateStore};

/// ZApp shop manifest handling
pub mod zapp_shop;
