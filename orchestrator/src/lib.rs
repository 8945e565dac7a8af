//! Ephemera
//!
//! Lifecycle orchestration of ephemeral multi-node database clusters:
//! planning, parallel provisioning, bootstrap, topology reconciliation and
//! the DNS, load balancer and certificate wiring around a cluster.

pub mod admin;
pub mod app;
pub mod cluster;
pub mod converge;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod image;
pub mod logs;
pub mod models;
pub mod runtime;
pub mod storage;
pub mod utils;
pub mod wiring;
pub mod workers;
