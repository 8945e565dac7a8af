//! Background workers

pub mod reaper;
