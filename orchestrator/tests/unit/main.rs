//! Integration tests against in-memory backends

mod support;

mod test_end_to_end;
mod test_fsm;
mod test_planner;
mod test_version;
mod test_wiring;
