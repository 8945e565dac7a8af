//! Admin API models
//!
//! Narrow request and response shapes for the node administrative REST API.
//! Only the fields the orchestrator reads are modelled; everything else in
//! the responses is ignored.

pub mod models;
