//! Simulated Container Tests
//!
//! ## Test Scopes
//! - **Agent calls**: spawn/terminate announce lifecycle events.
//! - **Local calls**: spawn/terminate stay silent.
//! - **Heartbeats**: snapshot contents and the periodic broadcast.

#[cfg(test)]
mod tests {
    use crate::aggregator::types::{ContainerHeartbeat, LifecycleEvent};
    use crate::bus::memory::InMemoryBus;
    use crate::bus::{MessageBus, event_topic};
    use crate::clock::ManualClock;
    use crate::container::SimulatedContainer;
    use crate::executor::agent::ContainerAgentClient;
    use crate::executor::local::LocalProcessManager;
    use crate::registry::types::{ContainerState, ProcessState};
    use std::sync::Arc;
    use std::time::Duration;

    fn container(bus: &Arc<InMemoryBus>) -> Arc<SimulatedContainer> {
        SimulatedContainer::new("C1", "default", bus.clone(), ManualClock::new(42), "bx_containers")
    }

    fn all_events() -> Vec<String> {
        vec![
            event_topic("ProcessLifecycleEvent"),
            event_topic("ContainerLifecycleEvent"),
        ]
    }

    // ============================================================
    // AGENT CALLS
    // ============================================================

    #[tokio::test]
    async fn test_agent_spawn_and_terminate_announce_events() {
        // ARRANGE
        let bus = InMemoryBus::new();
        let mut events = bus.subscribe("events", &all_events()).await.unwrap();
        let c1 = container(&bus);

        // ACT
        let pid = ContainerAgentClient::spawn_process(
            c1.as_ref(),
            "worker",
            "mod.worker",
            "Worker",
            None,
            Some("P1".to_string()),
        )
        .await
        .unwrap();
        ContainerAgentClient::terminate_process(c1.as_ref(), "P1")
            .await
            .unwrap();

        // ASSERT
        assert_eq!(pid, "P1");
        let first: LifecycleEvent = serde_json::from_value(events.recv().await.unwrap()).unwrap();
        let second: LifecycleEvent = serde_json::from_value(events.recv().await.unwrap()).unwrap();
        match (first, second) {
            (LifecycleEvent::ProcessLifecycleEvent(a), LifecycleEvent::ProcessLifecycleEvent(b)) => {
                assert_eq!(a.info.state, ProcessState::Running);
                assert_eq!(b.info.state, ProcessState::Terminated);
                assert_eq!(b.container_id, "C1");
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(c1.process_count(), 0);
    }

    #[tokio::test]
    async fn test_agent_generates_process_id_and_rejects_unknown_terminate() {
        let bus = InMemoryBus::new();
        let c1 = container(&bus);

        let pid = ContainerAgentClient::spawn_process(c1.as_ref(), "w", "m", "C", None, None)
            .await
            .unwrap();

        assert!(pid.starts_with("w_"));
        assert!(c1.has_process(&pid));
        assert!(
            ContainerAgentClient::terminate_process(c1.as_ref(), "missing")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_terminated_container_refuses_spawns() {
        let bus = InMemoryBus::new();
        let mut events = bus.subscribe("events", &all_events()).await.unwrap();
        let c1 = container(&bus);

        c1.terminate().await.unwrap();

        assert_eq!(c1.state(), ContainerState::Terminated);
        let event: LifecycleEvent = serde_json::from_value(events.recv().await.unwrap()).unwrap();
        assert!(matches!(
            event,
            LifecycleEvent::ContainerLifecycleEvent(e) if e.state == ContainerState::Terminated
        ));
        assert!(
            ContainerAgentClient::spawn_process(c1.as_ref(), "w", "m", "C", None, None)
                .await
                .is_err()
        );
    }

    // ============================================================
    // LOCAL CALLS
    // ============================================================

    #[tokio::test]
    async fn test_local_calls_publish_nothing() {
        let bus = InMemoryBus::new();
        let mut events = bus.subscribe("events", &all_events()).await.unwrap();
        let c1 = container(&bus);

        LocalProcessManager::spawn_process(c1.as_ref(), "w", "m", "C", None, "P9")
            .await
            .unwrap();
        assert!(c1.has_process("P9"));
        LocalProcessManager::terminate_process(c1.as_ref(), "P9")
            .await
            .unwrap();

        let nothing = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(nothing.is_err());
    }

    // ============================================================
    // HEARTBEATS
    // ============================================================

    #[tokio::test]
    async fn test_heartbeat_lists_processes() {
        let bus = InMemoryBus::new();
        let c1 = container(&bus);
        LocalProcessManager::spawn_process(c1.as_ref(), "b", "m", "C", None, "P2")
            .await
            .unwrap();
        LocalProcessManager::spawn_process(c1.as_ref(), "a", "m", "C", None, "P1")
            .await
            .unwrap();

        let heartbeat = c1.heartbeat();

        assert_eq!(heartbeat.ts, 42);
        assert_eq!(heartbeat.state, ContainerState::Running);
        let ids: Vec<&str> = heartbeat
            .processes
            .iter()
            .map(|p| p.process_id.as_str())
            .collect();
        assert_eq!(ids, vec!["P1", "P2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_heartbeats_until_stopped() {
        let bus = InMemoryBus::new();
        let mut heartbeats = bus
            .subscribe("hb", &["bx_containers".to_string()])
            .await
            .unwrap();
        let c1 = container(&bus);

        c1.clone().start_heartbeats(Duration::from_secs(5)).await;
        let first: ContainerHeartbeat =
            serde_json::from_value(heartbeats.recv().await.unwrap()).unwrap();
        let second: ContainerHeartbeat =
            serde_json::from_value(heartbeats.recv().await.unwrap()).unwrap();
        c1.stop().await;

        assert_eq!(first.container_id, "C1");
        assert_eq!(second.container_id, "C1");
        let after_stop = tokio::time::timeout(Duration::from_secs(30), heartbeats.recv()).await;
        assert!(after_stop.is_err());
    }
}
