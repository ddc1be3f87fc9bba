//! Executor Module Tests
//!
//! ## Test Scopes
//! - **Submission**: `add_action` validation and immediate rejection.
//! - **Result slots**: every accepted action resolves exactly once, with a
//!   value, a backend error or a captured panic.
//! - **Pool**: concurrency never exceeds the pool size.
//! - **Shutdown**: queued and stuck actions resolve with shutdown errors.
//! - **Backends**: agent routing, local spawn events and delayed spawns.

#[cfg(test)]
mod tests {
    use crate::aggregator::types::LifecycleEvent;
    use crate::bus::memory::InMemoryBus;
    use crate::bus::{MessageBus, event_topic};
    use crate::clock::ManualClock;
    use crate::container::SimulatedContainer;
    use crate::error::PdError;
    use crate::executor::ActionBackend;
    use crate::executor::agent::{AgentBackend, AgentDirectory};
    use crate::executor::executor::ActionExecutor;
    use crate::executor::local::LocalBackend;
    use crate::executor::types::*;
    use crate::registry::types::ProcessState;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Backend whose behaviour is picked by the requested process name.
    #[derive(Default)]
    struct ScriptedBackend {
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl ActionBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn spawn_process(&self, request: &SpawnProcess) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            let outcome = match request.proc_name.as_str() {
                "fail" => Err(anyhow::anyhow!("spawn refused")),
                "panic" => panic!("backend blew up"),
                "hang" => std::future::pending().await,
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok("slow_pid".to_string())
                }
                name => Ok(format!("{}_pid", name)),
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        }

        async fn terminate_process(&self, _request: &TerminateProcess) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn spawn(name: &str) -> Action {
        Action::SpawnProcess(SpawnProcess {
            cc_agent: "agent_C1".to_string(),
            proc_name: name.to_string(),
            module: "m".to_string(),
            cls: "C".to_string(),
            config: None,
            process_id: None,
        })
    }

    async fn executor(
        backend: Arc<ScriptedBackend>,
        pool_size: usize,
        shutdown_timeout: Duration,
    ) -> Arc<ActionExecutor> {
        let executor = ActionExecutor::new(backend, pool_size, shutdown_timeout);
        executor.clone().start().await;
        executor
    }

    // ============================================================
    // SUBMISSION
    // ============================================================

    #[tokio::test]
    async fn test_add_action_rejects_bad_shape_without_enqueue() {
        // ARRANGE
        let backend = Arc::new(ScriptedBackend::default());
        let executor = executor(backend.clone(), 2, Duration::from_secs(1)).await;
        let (slot, result) = ResultSlot::new();

        // ACT
        let submitted = executor.add_action(("spawn", slot, json!({"bad": "shape"})));

        // ASSERT: rejected on the spot, slot already carries the error
        assert!(matches!(submitted, Err(PdError::BadRequest(_))));
        assert!(matches!(result.wait().await, Err(PdError::BadRequest(_))));
        executor.stop().await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_add_action_rejects_missing_fields_and_non_object_kwargs() {
        let backend = Arc::new(ScriptedBackend::default());
        let executor = executor(backend.clone(), 1, Duration::from_secs(1)).await;

        let (slot, result) = ResultSlot::new();
        assert!(
            executor
                .add_action(("spawn_process", slot, json!({"proc_name": "x"})))
                .is_err()
        );
        assert!(result.wait().await.is_err());

        let (slot, result) = ResultSlot::new();
        assert!(
            executor
                .add_action(("terminate_process", slot, json!(["agent", "pid"])))
                .is_err()
        );
        assert!(result.wait().await.is_err());

        executor.stop().await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_add_action_accepts_well_formed_submission() {
        let backend = Arc::new(ScriptedBackend::default());
        let executor = executor(backend, 1, Duration::from_secs(1)).await;
        let (slot, result) = ResultSlot::new();

        executor
            .add_action((
                "terminate_process",
                slot,
                json!({"cc_agent": "agent_C1", "process_id": "P1"}),
            ))
            .unwrap();

        assert_eq!(result.wait().await.unwrap(), Value::Bool(true));
        executor.stop().await;
    }

    // ============================================================
    // RESULT SLOTS
    // ============================================================

    #[tokio::test]
    async fn test_execute_action_returns_process_id() {
        let backend = Arc::new(ScriptedBackend::default());
        let executor = executor(backend, 2, Duration::from_secs(1)).await;

        let outcome = executor.execute_action(spawn("ingest")).await;

        assert_eq!(outcome.unwrap(), json!("ingest_pid"));
        executor.stop().await;
    }

    #[tokio::test]
    async fn test_backend_error_and_panic_land_in_slot() {
        // ARRANGE
        let backend = Arc::new(ScriptedBackend::default());
        let executor = executor(backend, 1, Duration::from_secs(1)).await;

        // ACT
        let failed = executor.execute_action(spawn("fail")).await;
        let panicked = executor.execute_action(spawn("panic")).await;
        let after = executor.execute_action(spawn("ok")).await;

        // ASSERT: the single worker survives both
        assert!(matches!(failed, Err(PdError::Action(msg)) if msg.contains("spawn refused")));
        assert!(matches!(panicked, Err(PdError::Action(msg)) if msg.contains("panicked")));
        assert_eq!(after.unwrap(), json!("ok_pid"));
        executor.stop().await;
    }

    #[test]
    fn test_slot_resolves_once() {
        let (slot, _result) = ResultSlot::new();
        assert!(slot.resolve(Ok(json!(1))));
        // `resolve` consumed the slot; a second write does not compile
    }

    #[tokio::test]
    async fn test_dropped_slot_reads_as_shutdown() {
        let (slot, result) = ResultSlot::new();
        drop(slot);
        assert!(matches!(result.wait().await, Err(PdError::Shutdown(_))));
    }

    // ============================================================
    // POOL
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bounded_by_pool_size() {
        // ARRANGE
        let backend = Arc::new(ScriptedBackend::default());
        let executor = executor(backend.clone(), 3, Duration::from_secs(1)).await;

        // ACT
        let results: Vec<ActionResult> = (0..12).map(|_| executor.dispatch(spawn("slow"))).collect();
        for result in results {
            assert_eq!(result.wait().await.unwrap(), json!("slow_pid"));
        }

        // ASSERT
        assert_eq!(backend.calls.load(Ordering::SeqCst), 12);
        assert!(backend.max_running.load(Ordering::SeqCst) <= 3);
        executor.stop().await;
    }

    #[test]
    fn test_pool_size_is_capped() {
        let backend = Arc::new(ScriptedBackend::default());
        assert_eq!(
            ActionExecutor::new(backend.clone(), 10_000, Duration::from_secs(1)).pool_size(),
            crate::config::MAX_POOL_SIZE
        );
        assert_eq!(
            ActionExecutor::new(backend, 0, Duration::from_secs(1)).pool_size(),
            1
        );
    }

    // ============================================================
    // SHUTDOWN
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_stop_resolves_stuck_and_queued_actions() {
        // ARRANGE: one worker, stuck forever on the first action
        let backend = Arc::new(ScriptedBackend::default());
        let executor = executor(backend, 1, Duration::from_secs(2)).await;
        let stuck = executor.dispatch(spawn("hang"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued_a = executor.dispatch(spawn("a"));
        let queued_b = executor.dispatch(spawn("b"));

        // ACT
        executor.stop().await;

        // ASSERT
        assert!(matches!(stuck.wait().await, Err(PdError::Shutdown(_))));
        assert!(matches!(queued_a.wait().await, Err(PdError::Shutdown(_))));
        assert!(matches!(queued_b.wait().await, Err(PdError::Shutdown(_))));
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_rejected() {
        let backend = Arc::new(ScriptedBackend::default());
        let executor = executor(backend, 1, Duration::from_secs(1)).await;
        executor.stop().await;

        let (slot, result) = ResultSlot::new();
        let submitted = executor.submit(spawn("late"), slot);

        assert!(matches!(submitted, Err(PdError::Shutdown(_))));
        assert!(matches!(result.wait().await, Err(PdError::Shutdown(_))));
    }

    // ============================================================
    // BACKENDS
    // ============================================================

    #[tokio::test]
    async fn test_agent_backend_routes_by_agent_name() {
        // ARRANGE
        let bus = InMemoryBus::new();
        let clock = ManualClock::new(0);
        let c1 = SimulatedContainer::new("C1", "default", bus.clone(), clock.clone(), "hb");
        let c2 = SimulatedContainer::new("C2", "default", bus.clone(), clock, "hb");
        let agents = AgentDirectory::new();
        agents.register(c1.cc_agent(), c1.clone());
        agents.register(c2.cc_agent(), c2.clone());
        let executor = ActionExecutor::new(AgentBackend::new(agents), 2, Duration::from_secs(1));
        executor.clone().start().await;

        // ACT
        let mut request = SpawnProcess {
            cc_agent: "agent_C2".to_string(),
            proc_name: "w".to_string(),
            module: "m".to_string(),
            cls: "C".to_string(),
            config: Some(json!({"k": 1})),
            process_id: Some("P1".to_string()),
        };
        let spawned = executor
            .execute_action(Action::SpawnProcess(request.clone()))
            .await;
        request.cc_agent = "agent_C9".to_string();
        let unknown = executor.execute_action(Action::SpawnProcess(request)).await;

        // ASSERT
        assert_eq!(spawned.unwrap(), json!("P1"));
        assert!(c2.has_process("P1"));
        assert_eq!(c2.process("P1").unwrap().config, Some(json!({"k": 1})));
        assert!(!c1.has_process("P1"));
        assert!(matches!(unknown, Err(PdError::Action(msg)) if msg.contains("agent_C9")));
        executor.stop().await;
    }

    #[tokio::test]
    async fn test_local_backend_announces_pending_then_running() {
        // ARRANGE
        let bus = InMemoryBus::new();
        let mut events = bus
            .subscribe("ev", &[event_topic("ProcessLifecycleEvent")])
            .await
            .unwrap();
        let clock = ManualClock::new(7);
        let c1 = SimulatedContainer::new("C1", "default", bus.clone(), clock.clone(), "hb");
        let backend = LocalBackend::new(c1.clone(), bus.clone(), clock, Duration::ZERO);

        // ACT
        let pid = backend
            .spawn_process(&SpawnProcess {
                cc_agent: "local".to_string(),
                proc_name: "w".to_string(),
                module: "m".to_string(),
                cls: "C".to_string(),
                config: None,
                process_id: None,
            })
            .await
            .unwrap();

        // ASSERT
        assert!(pid.starts_with("w_"));
        assert!(c1.has_process(&pid));
        for expected in [ProcessState::Pending, ProcessState::Running] {
            let event: LifecycleEvent = serde_json::from_value(events.recv().await.unwrap()).unwrap();
            let LifecycleEvent::ProcessLifecycleEvent(event) = event else {
                panic!("expected a process event");
            };
            assert_eq!(event.origin, pid);
            assert_eq!(event.container_id, "C1");
            assert_eq!(event.ts_created, 7);
            assert_eq!(event.info.state, expected);
        }
    }

    #[tokio::test]
    async fn test_local_backend_failed_spawn_announces_failure() {
        let bus = InMemoryBus::new();
        let mut events = bus
            .subscribe("ev", &[event_topic("ProcessLifecycleEvent")])
            .await
            .unwrap();
        let clock = ManualClock::new(0);
        let c1 = SimulatedContainer::new("C1", "default", bus.clone(), clock.clone(), "hb");
        c1.set_fail_spawns(true);
        let backend = LocalBackend::new(c1, bus.clone(), clock, Duration::ZERO);

        let spawned = backend
            .spawn_process(&SpawnProcess {
                cc_agent: "local".to_string(),
                proc_name: "w".to_string(),
                module: "m".to_string(),
                cls: "C".to_string(),
                config: None,
                process_id: Some("P1".to_string()),
            })
            .await;

        assert!(spawned.is_err());
        let mut states = Vec::new();
        for _ in 0..2 {
            let event: LifecycleEvent = serde_json::from_value(events.recv().await.unwrap()).unwrap();
            if let LifecycleEvent::ProcessLifecycleEvent(event) = event {
                states.push(event.info.state);
            }
        }
        assert_eq!(states, vec![ProcessState::Pending, ProcessState::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_backend_delay_returns_before_process_exists() {
        // ARRANGE
        let bus = InMemoryBus::new();
        let clock = ManualClock::new(0);
        let c1 = SimulatedContainer::new("C1", "default", bus.clone(), clock.clone(), "hb");
        let backend = LocalBackend::new(c1.clone(), bus.clone(), clock, Duration::from_secs(3));
        let request = |pid: &str| SpawnProcess {
            cc_agent: "local".to_string(),
            proc_name: "w".to_string(),
            module: "m".to_string(),
            cls: "C".to_string(),
            config: None,
            process_id: Some(pid.to_string()),
        };

        // ACT
        let pid = backend.spawn_process(&request("P1")).await.unwrap();
        backend.spawn_process(&request("P2")).await.unwrap();

        // ASSERT: the id is known, the process is not there yet
        assert_eq!(pid, "P1");
        assert!(!c1.has_process("P1"));
        assert_eq!(backend.pending_spawns(), 2);

        // Terminating a pending spawn cancels it
        backend
            .terminate_process(&TerminateProcess {
                cc_agent: "local".to_string(),
                process_id: "P2".to_string(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(c1.has_process("P1"));
        assert!(!c1.has_process("P2"));
        assert_eq!(backend.pending_spawns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_backend_shutdown_aborts_pending_spawns() {
        let bus = InMemoryBus::new();
        let clock = ManualClock::new(0);
        let c1 = SimulatedContainer::new("C1", "default", bus.clone(), clock.clone(), "hb");
        let backend = LocalBackend::new(c1.clone(), bus.clone(), clock, Duration::from_secs(3));
        let executor = ActionExecutor::new(backend.clone(), 1, Duration::from_secs(1));
        executor.clone().start().await;

        let pid = executor.execute_action(spawn("w")).await.unwrap();
        executor.stop().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(pid.as_str().unwrap().starts_with("w_"));
        assert_eq!(backend.pending_spawns(), 0);
        assert_eq!(c1.process_count(), 0);
    }
}
