//! Cluster views and writer locks

pub mod locks;
pub mod view;
