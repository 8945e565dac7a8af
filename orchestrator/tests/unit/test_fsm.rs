//! FSM unit tests

use ephemera::deploy::fsm::{BootstrapEvent, BootstrapFsm, BootstrapState};

#[test]
fn test_fsm_initial_state() {
    let fsm = BootstrapFsm::new();
    assert_eq!(fsm.state(), BootstrapState::Pending);
    assert!(fsm.error().is_none());
    assert!(!fsm.is_terminal());
}

#[test]
fn test_fsm_bootstrap_success_flow() {
    let mut fsm = BootstrapFsm::new();

    // Pending -> Initialized
    fsm.process(BootstrapEvent::FirstNodeInitialized).unwrap();
    assert_eq!(fsm.state(), BootstrapState::Initialized);

    // Initialized -> Joined
    fsm.process(BootstrapEvent::NodesJoined).unwrap();
    assert_eq!(fsm.state(), BootstrapState::Joined);

    // Joined -> Rebalancing
    fsm.process(BootstrapEvent::RebalanceStarted).unwrap();
    assert_eq!(fsm.state(), BootstrapState::Rebalancing);

    // Rebalancing -> Ready
    fsm.process(BootstrapEvent::TasksDrained).unwrap();
    assert_eq!(fsm.state(), BootstrapState::Ready);
    assert!(fsm.is_terminal());
}

#[test]
fn test_fsm_failure_from_every_active_state() {
    let steps = [
        BootstrapEvent::FirstNodeInitialized,
        BootstrapEvent::NodesJoined,
        BootstrapEvent::RebalanceStarted,
    ];

    for depth in 0..=steps.len() {
        let mut fsm = BootstrapFsm::new();
        for event in steps.iter().take(depth) {
            fsm.process(event.clone()).unwrap();
        }

        let state = fsm
            .process(BootstrapEvent::Failed("add node rejected".to_string()))
            .unwrap();
        assert_eq!(state, BootstrapState::Failed);
        assert_eq!(fsm.error(), Some("add node rejected"));
        assert!(fsm.is_terminal());
    }
}

#[test]
fn test_fsm_invalid_transitions() {
    let mut fsm = BootstrapFsm::new();

    // Cannot join before the first node is initialized
    assert!(fsm.process(BootstrapEvent::NodesJoined).is_err());
    assert!(fsm.process(BootstrapEvent::TasksDrained).is_err());
    assert_eq!(fsm.state(), BootstrapState::Pending);
}

#[test]
fn test_fsm_ready_is_final() {
    let mut fsm = BootstrapFsm::new();
    fsm.process(BootstrapEvent::FirstNodeInitialized).unwrap();
    fsm.process(BootstrapEvent::NodesJoined).unwrap();
    fsm.process(BootstrapEvent::RebalanceStarted).unwrap();
    fsm.process(BootstrapEvent::TasksDrained).unwrap();

    assert!(fsm.process(BootstrapEvent::Failed("late".to_string())).is_err());
    assert_eq!(fsm.state(), BootstrapState::Ready);
    assert!(fsm.error().is_none());
}
