//! Data models

pub mod cluster;
