#[cfg(test)]
mod tests {
    use crate::admission::ConnectRequest;
    use crate::config::EngineConfig;
    use crate::engine::ArbiterEngine;
    use crate::error::{ArbiterError, BusyReason};
    use crate::event_log::ArbiterEvent;
    use crate::events::StatusListener;
    use crate::infrastructure::{AccessPolicy, ClientCallbacks, DisconnectReason, LivenessEvent};
    use crate::infrastructure_in_memory::{InMemoryHardware, InMemoryPriorityOracle};
    use crate::types::{
        CallerIdentity, ClientKind, DeviceId, DeviceInfo, DeviceStatus, EndpointId, Pid, Priority, TorchStatus,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::sync::{Arc, OnceLock};
    use std::thread;
    use std::time::{Duration, Instant};

    struct TestRemote {
        endpoint: EndpointId,
        forced: Mutex<Vec<(DeviceId, DisconnectReason)>>,
    }

    impl ClientCallbacks for TestRemote {
        fn endpoint(&self) -> EndpointId {
            self.endpoint.clone()
        }

        fn on_forced_disconnect(&self, device: &DeviceId, reason: DisconnectReason) {
            self.forced.lock().push((device.clone(), reason));
        }
    }

    fn make_remote(name: &str) -> Arc<TestRemote> {
        Arc::new(TestRemote {
            endpoint: EndpointId::new(name),
            forced: Mutex::new(Vec::new()),
        })
    }

    #[derive(Default)]
    struct StatusRecorder {
        statuses: Mutex<Vec<(DeviceId, DeviceStatus)>>,
        torches: Mutex<Vec<(DeviceId, TorchStatus)>>,
    }

    impl StatusRecorder {
        fn statuses_of(&self, device: &str) -> Vec<DeviceStatus> {
            self.statuses
                .lock()
                .iter()
                .filter(|(id, _)| id.as_str() == device)
                .map(|(_, status)| *status)
                .collect()
        }
    }

    impl StatusListener for StatusRecorder {
        fn on_status_changed(&self, device: &DeviceId, status: DeviceStatus) {
            self.statuses.lock().push((device.clone(), status));
        }

        fn on_torch_status_changed(&self, device: &DeviceId, status: TorchStatus) {
            self.torches.lock().push((device.clone(), status));
        }
    }

    struct DenyDevice(&'static str);

    impl AccessPolicy for DenyDevice {
        fn is_permitted(&self, _caller: &CallerIdentity, device: &DeviceId) -> bool {
            device.as_str() != self.0
        }
    }

    struct Fixture {
        engine: ArbiterEngine,
        hw: Arc<InMemoryHardware>,
        oracle: Arc<InMemoryPriorityOracle>,
    }

    impl Fixture {
        fn process(&self, pid: Pid, score: i32) {
            self.oracle.register_process(pid, Priority::new(score, 0));
        }

        fn connect(&self, device: &str, pid: Pid, remote: &Arc<TestRemote>) -> crate::Result<crate::Connection> {
            self.engine.connect(make_request(device, pid, remote))
        }

        fn holders(&self) -> Vec<(String, Pid)> {
            self.engine
                .clients()
                .iter()
                .map(|c| (c.device_id.to_string(), c.pid))
                .collect()
        }
    }

    fn devices() -> Vec<DeviceInfo> {
        vec![
            DeviceInfo::new("0", 50).with_flash_unit(),
            DeviceInfo::new("1", 30).with_conflicts(["2"]),
            DeviceInfo::new("2", 30),
        ]
    }

    fn setup_with(config: EngineConfig) -> Fixture {
        let hw = Arc::new(InMemoryHardware::new(devices()));
        let oracle = Arc::new(InMemoryPriorityOracle::new());
        let engine = ArbiterEngine::builder(hw.clone(), oracle.clone()).config(config).build();
        Fixture { engine, hw, oracle }
    }

    fn setup() -> Fixture {
        setup_with(EngineConfig::default())
    }

    fn caller(pid: Pid) -> CallerIdentity {
        CallerIdentity::new(pid, 10_000 + pid as u32, format!("com.example.app{pid}"))
    }

    fn make_request(device: &str, pid: Pid, remote: &Arc<TestRemote>) -> ConnectRequest {
        ConnectRequest::new(device, caller(pid), remote.clone())
    }

    /// Parks the first NOT_AVAILABLE notification for a device until released.
    struct ParkingListener {
        device: &'static str,
        parked: AtomicBool,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl StatusListener for ParkingListener {
        fn on_status_changed(&self, device: &DeviceId, status: DeviceStatus) {
            if device.as_str() != self.device || status != DeviceStatus::NotAvailable {
                return;
            }
            if !self.parked.swap(true, Ordering::SeqCst) {
                self.entered.lock().send(()).unwrap();
                self.release.lock().recv().unwrap();
            }
        }
    }

    /// Counts active clients at every NOT_AVAILABLE notification.
    #[derive(Default)]
    struct ClientCounter {
        engine: OnceLock<ArbiterEngine>,
        counts: Mutex<Vec<usize>>,
    }

    impl StatusListener for ClientCounter {
        fn on_status_changed(&self, _device: &DeviceId, status: DeviceStatus) {
            if status != DeviceStatus::NotAvailable {
                return;
            }
            if let Some(engine) = self.engine.get() {
                self.counts.lock().push(engine.clients().len());
            }
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    // ============================================================
    // Admission and eviction
    // ============================================================

    #[test]
    fn test_higher_priority_evicts_holder() {
        let f = setup();
        f.process(5, 10);
        f.process(6, 20);
        let (r5, r6) = (make_remote("r5"), make_remote("r6"));

        f.connect("0", 5, &r5).unwrap();
        let conn = f.connect("0", 6, &r6).unwrap();

        assert_eq!(f.holders(), vec![("0".to_string(), 6)]);
        assert_eq!(conn.evicted.len(), 1);
        assert_eq!(conn.evicted[0].pid, 5);
        assert_eq!(*r5.forced.lock(), vec![(DeviceId::from("0"), DisconnectReason::Evicted)]);
        assert!(r6.forced.lock().is_empty());
        assert_eq!(f.hw.open_sessions(), 1);
        assert_eq!(f.hw.closed_sessions(), 1);
    }

    #[test]
    fn test_higher_priority_holder_makes_candidate_busy() {
        let f = setup();
        f.process(5, 30);
        f.process(6, 20);
        let (r5, r6) = (make_remote("r5"), make_remote("r6"));

        f.connect("0", 5, &r5).unwrap();
        let err = f.connect("0", 6, &r6).unwrap_err();

        assert_eq!(
            err,
            ArbiterError::Busy {
                device: DeviceId::from("0"),
                reason: BusyReason::HigherPriority { blockers: vec![5] },
            }
        );
        assert_eq!(f.holders(), vec![("0".to_string(), 5)]);
        assert!(r5.forced.lock().is_empty());

        let denied = f.engine.event_log().into_iter().find_map(|r| match r.event {
            ArbiterEvent::Denied { blockers, .. } => Some(blockers),
            _ => None,
        });
        let blockers = denied.expect("Expected a DENIED record");
        assert_eq!(blockers.len(), 1);
        assert_eq!(blockers[0].pid, 5);
    }

    #[test]
    fn test_equal_priority_evicts_holder() {
        let f = setup();
        f.process(5, 10);
        f.process(6, 10);
        let (r5, r6) = (make_remote("r5"), make_remote("r6"));

        f.connect("0", 5, &r5).unwrap();
        f.connect("0", 6, &r6).unwrap();
        assert_eq!(f.holders(), vec![("0".to_string(), 6)]);
    }

    #[test]
    fn test_conflicting_device_is_evicted() {
        let f = setup();
        f.process(5, 10);
        f.process(6, 20);
        let (r5, r6) = (make_remote("r5"), make_remote("r6"));

        f.connect("1", 5, &r5).unwrap();
        f.connect("2", 6, &r6).unwrap();

        assert_eq!(f.holders(), vec![("2".to_string(), 6)]);
        assert_eq!(*r5.forced.lock(), vec![(DeviceId::from("1"), DisconnectReason::Evicted)]);
    }

    #[test]
    fn test_cost_budget_evicts_unrelated_client() {
        let f = setup_with(EngineConfig::default().with_max_total_cost(60));
        f.process(5, 10);
        f.process(6, 20);
        let (r5, r6) = (make_remote("r5"), make_remote("r6"));

        f.connect("0", 5, &r5).unwrap();
        f.connect("2", 6, &r6).unwrap();
        assert_eq!(f.holders(), vec![("2".to_string(), 6)]);
    }

    #[test]
    fn test_cost_budget_blocked_by_higher_priority() {
        let f = setup_with(EngineConfig::default().with_max_total_cost(60));
        f.process(5, 30);
        f.process(6, 20);
        let (r5, r6) = (make_remote("r5"), make_remote("r6"));

        f.connect("0", 5, &r5).unwrap();
        let err = f.connect("2", 6, &r6).unwrap_err();
        assert!(matches!(
            err,
            ArbiterError::Busy {
                reason: BusyReason::OverBudget { .. },
                ..
            }
        ));
        assert_eq!(f.holders(), vec![("0".to_string(), 5)]);
    }

    #[test]
    fn test_unrelated_devices_coexist() {
        let f = setup();
        let (r5, r6) = (make_remote("r5"), make_remote("r6"));
        f.connect("0", 5, &r5).unwrap();
        f.connect("2", 6, &r6).unwrap();
        assert_eq!(f.engine.clients().len(), 2);
    }

    #[test]
    fn test_legacy_duplicate_reconnect_reuses_session() {
        let f = setup();
        f.process(5, 10);
        let remote = make_remote("r5");

        let first = f
            .engine
            .connect(make_request("0", 5, &remote).with_kind(ClientKind::Legacy))
            .unwrap();
        let second = f
            .engine
            .connect(make_request("0", 5, &remote).with_kind(ClientKind::Legacy))
            .unwrap();

        assert_eq!(first.handle, second.handle);
        assert!(second.reused);
        assert!(second.evicted.is_empty());
        assert!(remote.forced.lock().is_empty());
        assert_eq!(f.hw.open_sessions(), 1);
        assert_eq!(f.hw.closed_sessions(), 0);
    }

    #[test]
    fn test_modern_duplicate_reconnect_replaces_session() {
        let f = setup();
        f.process(5, 10);
        let remote = make_remote("r5");

        let first = f.connect("0", 5, &remote).unwrap();
        let second = f.connect("0", 5, &remote).unwrap();

        assert_ne!(first.handle, second.handle);
        assert!(!second.reused);
        assert_eq!(second.evicted.len(), 1);
        assert_eq!(f.hw.open_sessions(), 1);
    }

    #[test]
    fn test_legacy_reconnect_from_other_endpoint_evicts() {
        let f = setup();
        f.process(5, 10);
        let (a, b) = (make_remote("a"), make_remote("b"));

        let first = f
            .engine
            .connect(make_request("0", 5, &a).with_kind(ClientKind::Legacy))
            .unwrap();
        let second = f
            .engine
            .connect(make_request("0", 5, &b).with_kind(ClientKind::Legacy))
            .unwrap();
        assert_ne!(first.handle, second.handle);
        assert_eq!(a.forced.lock().len(), 1);
    }

    // ============================================================
    // Teardown budget and the admission gate
    // ============================================================

    #[test]
    fn test_eviction_timeout_then_late_removal() {
        let f = setup();
        f.process(5, 10);
        f.process(6, 20);
        let (r5, r6) = (make_remote("r5"), make_remote("r6"));

        f.connect("0", 5, &r5).unwrap();
        f.hw.hold_closes();
        let err = f
            .engine
            .connect_within(make_request("0", 6, &r6), Duration::from_millis(50))
            .unwrap_err();

        assert!(matches!(err, ArbiterError::TimedOut { pending: 1, .. }));
        assert_eq!(f.holders(), vec![("0".to_string(), 5)]);

        f.hw.release_closes();
        assert!(wait_for(|| f.engine.clients().is_empty()));
        assert_eq!(f.engine.device(&DeviceId::from("0")).unwrap().status, DeviceStatus::Present);

        f.connect("0", 6, &r6).unwrap();
        assert_eq!(f.holders(), vec![("0".to_string(), 6)]);
    }

    #[test]
    fn test_device_removed_while_evicting_rejects_candidate() {
        let f = setup();
        f.process(5, 10);
        f.process(6, 20);
        let (r5, r6) = (make_remote("r5"), make_remote("r6"));
        f.connect("0", 5, &r5).unwrap();

        f.hw.hold_closes();
        let (result_tx, result_rx) = mpsc::channel();
        let engine = f.engine.clone();
        let request = make_request("0", 6, &r6);
        let admitting = thread::spawn(move || {
            result_tx
                .send(engine.connect_within(request, Duration::from_secs(5)))
                .unwrap();
        });
        // The holder is told once the table lock has been handed off.
        assert!(wait_for(|| !r5.forced.lock().is_empty()));

        let engine = f.engine.clone();
        let removing = thread::spawn(move || engine.set_device_status(&DeviceId::from("0"), DeviceStatus::NotPresent));

        let result = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            result.unwrap_err(),
            ArbiterError::DeviceUnavailable {
                device: DeviceId::from("0"),
                status: DeviceStatus::NotPresent,
            }
        );
        assert!(f.engine.clients().is_empty());

        f.hw.release_closes();
        admitting.join().unwrap();
        assert!(removing.join().unwrap().unwrap().accepted);
        assert!(wait_for(|| f.hw.open_sessions() == 0));
        assert!(f.engine.clients().is_empty());
        assert_eq!(f.engine.device(&DeviceId::from("0")).unwrap().status, DeviceStatus::NotPresent);
        assert!(r6.forced.lock().is_empty());
        assert!(
            f.engine
                .event_log()
                .iter()
                .any(|r| matches!(&r.event, ArbiterEvent::Rejected { pid: 6, .. }))
        );
    }

    #[test]
    fn test_concurrent_admission_fails_fast_when_gate_is_held() {
        let f = setup_with(EngineConfig::default().with_connect_timeout(Duration::from_millis(50)));
        f.process(5, 10);
        f.process(6, 20);
        let (r5, r6, r7) = (make_remote("r5"), make_remote("r6"), make_remote("r7"));

        f.connect("0", 5, &r5).unwrap();
        f.hw.hold_closes();

        let engine = f.engine.clone();
        let evictor = thread::spawn(move || {
            engine.connect_within(make_request("0", 6, &r6), Duration::from_secs(5))
        });
        assert!(wait_for(|| !r5.forced.lock().is_empty()));

        let err = f.connect("2", 7, &r7).unwrap_err();
        assert_eq!(
            err,
            ArbiterError::Busy {
                device: DeviceId::from("2"),
                reason: BusyReason::TooManyConnecting,
            }
        );

        f.hw.release_closes();
        evictor.join().unwrap().unwrap();
        assert_eq!(f.holders(), vec![("0".to_string(), 6)]);
    }

    #[test]
    fn test_concurrent_connects_keep_table_and_hardware_in_step() {
        let f = setup();
        for pid in 1..=8 {
            f.process(pid, pid * 3 % 7);
        }

        let handles: Vec<_> = (1..=8)
            .map(|pid| {
                let engine = f.engine.clone();
                thread::spawn(move || {
                    let remote = make_remote(&format!("r{pid}"));
                    let device = if pid % 2 == 0 { "0" } else { "2" };
                    let _ = engine.connect(make_request(device, pid, &remote));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let clients = f.engine.clients();
        assert!(clients.iter().filter(|c| c.device_id.as_str() == "0").count() <= 1);
        assert!(clients.iter().filter(|c| c.device_id.as_str() == "2").count() <= 1);
        assert!(wait_for(|| f.hw.open_sessions() == f.engine.clients().len()));
    }

    // ============================================================
    // Validation
    // ============================================================

    #[test]
    fn test_unknown_device_rejected() {
        let f = setup();
        let err = f.connect("9", 5, &make_remote("r5")).unwrap_err();
        assert_eq!(err, ArbiterError::UnknownDevice { device: DeviceId::from("9") });
        assert!(err.is_validation());
    }

    #[test]
    fn test_rejection_never_evicts() {
        let f = setup();
        f.process(5, 10);
        f.process(6, 20);
        let r5 = make_remote("r5");
        f.connect("0", 5, &r5).unwrap();

        // User 3 is not allowed.
        let outsider = ConnectRequest::new("0", CallerIdentity::new(6, 300_123, "com.example.other"), make_remote("r6"));
        let err = f.engine.connect(outsider).unwrap_err();

        assert!(matches!(err, ArbiterError::NotAuthorized { pid: 6, .. }));
        assert_eq!(f.holders(), vec![("0".to_string(), 5)]);
        assert!(r5.forced.lock().is_empty());
    }

    #[test]
    fn test_access_policy_is_consulted() {
        let hw = Arc::new(InMemoryHardware::new(devices()));
        let oracle = Arc::new(InMemoryPriorityOracle::new());
        let engine = ArbiterEngine::builder(hw, oracle)
            .access_policy(Arc::new(DenyDevice("2")))
            .build();

        let err = engine.connect(make_request("2", 5, &make_remote("r5"))).unwrap_err();
        assert!(matches!(err, ArbiterError::NotAuthorized { .. }));
        assert!(engine.connect(make_request("0", 5, &make_remote("r5"))).is_ok());
    }

    #[test]
    fn test_priority_query_failure_changes_nothing() {
        let f = setup();
        let r5 = make_remote("r5");
        f.connect("0", 5, &r5).unwrap();

        f.oracle.set_failing(true);
        let err = f.connect("0", 6, &make_remote("r6")).unwrap_err();
        assert!(matches!(err, ArbiterError::PriorityQuery(_)));
        assert_eq!(f.holders(), vec![("0".to_string(), 5)]);
    }

    #[test]
    fn test_hardware_open_failure_leaves_device_present() {
        let f = setup();
        f.hw.fail_next_open();
        let err = f.connect("2", 5, &make_remote("r5")).unwrap_err();

        assert!(matches!(err, ArbiterError::Hardware(_)));
        assert!(f.engine.clients().is_empty());
        assert_eq!(f.engine.device(&DeviceId::from("2")).unwrap().status, DeviceStatus::Present);
    }

    // ============================================================
    // Disconnect and status derivation
    // ============================================================

    #[test]
    fn test_disconnect_is_idempotent() {
        let f = setup();
        let recorder = Arc::new(StatusRecorder::default());
        f.engine.subscribe(recorder.clone()).unwrap();

        let conn = f.connect("2", 5, &make_remote("r5")).unwrap();
        f.engine.disconnect(&conn.handle).unwrap();
        f.engine.disconnect(&conn.handle).unwrap();

        let disconnects = f
            .engine
            .event_log()
            .iter()
            .filter(|r| matches!(r.event, ArbiterEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(
            recorder.statuses_of("2"),
            vec![DeviceStatus::NotAvailable, DeviceStatus::Present]
        );
        assert!(f.engine.clients().is_empty());
        assert_eq!(f.hw.closed_sessions(), 1);
    }

    #[test]
    fn test_eviction_status_sequence() {
        let f = setup();
        f.process(5, 10);
        f.process(6, 20);
        let recorder = Arc::new(StatusRecorder::default());
        f.engine.subscribe(recorder.clone()).unwrap();

        f.connect("0", 5, &make_remote("r5")).unwrap();
        f.connect("0", 6, &make_remote("r6")).unwrap();

        assert_eq!(
            recorder.statuses_of("0"),
            vec![DeviceStatus::NotAvailable, DeviceStatus::Present, DeviceStatus::NotAvailable]
        );
        assert_eq!(
            f.engine.device(&DeviceId::from("0")).unwrap().status,
            DeviceStatus::NotAvailable
        );
    }

    #[test]
    fn test_not_present_only_leaves_for_present_or_enumerating() {
        let f = setup();
        let id = DeviceId::from("2");
        f.engine.set_device_status(&id, DeviceStatus::NotPresent).unwrap();

        let recorder = Arc::new(StatusRecorder::default());
        f.engine.subscribe(recorder.clone()).unwrap();

        let t = f.engine.set_device_status(&id, DeviceStatus::NotAvailable).unwrap();
        assert!(!t.accepted);
        assert!(recorder.statuses_of("2").is_empty());
        assert_eq!(f.engine.device(&id).unwrap().status, DeviceStatus::NotPresent);

        assert!(f.engine.on_device_status_changed(&id, 2).unwrap().accepted);
        assert!(f.engine.on_device_status_changed(&id, 1).unwrap().accepted);
        assert_eq!(
            recorder.statuses_of("2"),
            vec![DeviceStatus::Enumerating, DeviceStatus::Present]
        );
    }

    // ============================================================
    // Hardware callbacks
    // ============================================================

    #[test]
    fn test_device_removal_forces_disconnect() {
        let f = setup();
        let remote = make_remote("r5");
        f.connect("2", 5, &remote).unwrap();

        let t = f.engine.on_device_status_changed(&DeviceId::from("2"), 0).unwrap();
        assert!(t.accepted);

        assert_eq!(*remote.forced.lock(), vec![(DeviceId::from("2"), DisconnectReason::DeviceRemoved)]);
        assert!(f.engine.clients().is_empty());
        assert!(!f.hw.is_open(&DeviceId::from("2")));
        assert_eq!(f.engine.device(&DeviceId::from("2")).unwrap().status, DeviceStatus::NotPresent);

        let err = f.connect("2", 6, &make_remote("r6")).unwrap_err();
        assert_eq!(
            err,
            ArbiterError::DeviceUnavailable {
                device: DeviceId::from("2"),
                status: DeviceStatus::NotPresent,
            }
        );
    }

    #[test]
    fn test_unrecognized_status_code_means_not_present() {
        let f = setup();
        let t = f.engine.on_device_status_changed(&DeviceId::from("2"), 42).unwrap();
        assert_eq!(t.new, DeviceStatus::NotPresent);
        assert!(t.accepted);
    }

    #[test]
    fn test_hot_plugged_device_is_registered() {
        let f = setup();
        let id = DeviceId::from("3");
        f.hw.add_device(DeviceInfo::new("3", 20).with_flash_unit());

        let t = f.engine.on_device_status_changed(&id, 1).unwrap();
        assert!(t.accepted);
        assert_eq!(t.old, DeviceStatus::NotPresent);
        assert_eq!(f.engine.device(&id).unwrap().resource_cost, 20);
        assert_eq!(f.engine.torch_status(&id), Some(TorchStatus::AvailableOff));
        assert!(
            f.engine
                .event_log()
                .iter()
                .any(|r| matches!(&r.event, ArbiterEvent::DeviceAdded { device, .. } if *device == id))
        );
    }

    #[test]
    fn test_status_for_unknown_device_is_an_error() {
        let f = setup();
        let err = f.engine.on_device_status_changed(&DeviceId::from("8"), 0).unwrap_err();
        assert!(matches!(err, ArbiterError::UnknownDevice { .. }));
    }

    // ============================================================
    // Torch
    // ============================================================

    #[test]
    fn test_torch_round_trip_through_hardware() {
        let f = setup();
        let id = DeviceId::from("0");
        let recorder = Arc::new(StatusRecorder::default());
        f.engine.subscribe(recorder.clone()).unwrap();

        f.engine.set_torch_mode(&id, 7, true).unwrap();
        assert_eq!(f.hw.torch_requests(), vec![(id.clone(), true)]);
        // Not confirmed yet.
        assert_eq!(f.engine.torch_status(&id), Some(TorchStatus::AvailableOff));

        f.engine.on_torch_status_changed(&id, 2).unwrap();
        assert_eq!(f.engine.torch_status(&id), Some(TorchStatus::AvailableOn));
        assert_eq!(
            *recorder.torches.lock(),
            vec![(id.clone(), TorchStatus::AvailableOff), (id.clone(), TorchStatus::AvailableOn)]
        );
    }

    #[test]
    fn test_torch_busy_while_camera_open() {
        let f = setup();
        let id = DeviceId::from("0");
        f.connect("0", 5, &make_remote("r5")).unwrap();
        assert_eq!(f.engine.torch_status(&id), Some(TorchStatus::NotAvailable));

        let err = f.engine.set_torch_mode(&id, 7, true).unwrap_err();
        assert!(matches!(err, ArbiterError::Busy { reason: BusyReason::CameraInUse, .. }));
        assert!(f.hw.torch_requests().is_empty());
    }

    #[test]
    fn test_torch_argument_errors() {
        let f = setup();
        for device in ["1", "9"] {
            let err = f.engine.set_torch_mode(&DeviceId::from(device), 7, true).unwrap_err();
            assert!(matches!(err, ArbiterError::IllegalArgument { .. }), "device {device}");
        }

        f.engine.set_device_status(&DeviceId::from("0"), DeviceStatus::NotPresent).unwrap();
        let err = f.engine.set_torch_mode(&DeviceId::from("0"), 7, true).unwrap_err();
        assert!(matches!(err, ArbiterError::IllegalArgument { .. }));
    }

    #[test]
    fn test_torch_on_rejected_while_camera_open() {
        let f = setup();
        let id = DeviceId::from("0");
        f.connect("0", 5, &make_remote("r5")).unwrap();

        f.engine.on_torch_status_changed(&id, 2).unwrap();
        assert_eq!(f.engine.torch_status(&id), Some(TorchStatus::NotAvailable));
        // Unknown codes are ignored.
        f.engine.on_torch_status_changed(&id, 17).unwrap();
        assert_eq!(f.engine.torch_status(&id), Some(TorchStatus::NotAvailable));
    }

    #[test]
    fn test_torch_callback_waits_for_camera_transition() {
        let f = setup();
        let id = DeviceId::from("0");
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        f.engine
            .subscribe(Arc::new(ParkingListener {
                device: "0",
                parked: AtomicBool::new(false),
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            }))
            .unwrap();

        let engine = f.engine.clone();
        let remote = make_remote("r5");
        let connecting = thread::spawn(move || engine.connect(make_request("0", 5, &remote)));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The camera transition is mid-flight; the torch confirmation must wait for it.
        let (done_tx, done_rx) = mpsc::channel();
        let engine = f.engine.clone();
        let torch_id = id.clone();
        let confirming = thread::spawn(move || {
            let result = engine.on_torch_status_changed(&torch_id, 2);
            done_tx.send(()).unwrap();
            result
        });
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        release_tx.send(()).unwrap();
        connecting.join().unwrap().unwrap();
        confirming.join().unwrap().unwrap();

        assert_eq!(f.engine.device(&id).unwrap().status, DeviceStatus::NotAvailable);
        assert_eq!(f.engine.torch_status(&id), Some(TorchStatus::NotAvailable));
    }

    // ============================================================
    // Subscriptions
    // ============================================================

    #[test]
    fn test_not_available_listener_can_read_clients() {
        let f = setup();
        let counter = Arc::new(ClientCounter::default());
        assert!(counter.engine.set(f.engine.clone()).is_ok());
        f.engine.subscribe(counter.clone()).unwrap();

        f.connect("2", 5, &make_remote("r5")).unwrap();
        f.connect("0", 6, &make_remote("r6")).unwrap();

        assert_eq!(*counter.counts.lock(), vec![1, 2]);
    }


    #[test]
    fn test_subscribe_returns_snapshot_and_replays_torch() {
        let f = setup();
        let recorder = Arc::new(StatusRecorder::default());
        let snapshot = f.engine.subscribe(recorder.clone()).unwrap();

        assert_eq!(
            snapshot,
            vec![
                (DeviceId::from("0"), DeviceStatus::Present),
                (DeviceId::from("1"), DeviceStatus::Present),
                (DeviceId::from("2"), DeviceStatus::Present),
            ]
        );
        assert_eq!(
            *recorder.torches.lock(),
            vec![(DeviceId::from("0"), TorchStatus::AvailableOff)]
        );
    }

    #[test]
    fn test_duplicate_and_unknown_subscriptions() {
        let f = setup();
        let listener: Arc<dyn StatusListener> = Arc::new(StatusRecorder::default());
        f.engine.subscribe(listener.clone()).unwrap();

        assert!(matches!(
            f.engine.subscribe(listener.clone()),
            Err(ArbiterError::IllegalArgument { .. })
        ));
        f.engine.unsubscribe(&listener).unwrap();
        assert!(matches!(
            f.engine.unsubscribe(&listener),
            Err(ArbiterError::IllegalArgument { .. })
        ));
    }

    #[test]
    fn test_unsubscribed_listener_stops_receiving() {
        let f = setup();
        let recorder = Arc::new(StatusRecorder::default());
        let listener: Arc<dyn StatusListener> = recorder.clone();
        f.engine.subscribe(listener.clone()).unwrap();
        f.engine.unsubscribe(&listener).unwrap();

        f.engine.set_device_status(&DeviceId::from("2"), DeviceStatus::NotPresent).unwrap();
        assert!(recorder.statuses.lock().is_empty());
    }

    // ============================================================
    // Process death and user switch
    // ============================================================

    #[test]
    fn test_process_death_disconnects_and_turns_off_torch() {
        let f = setup();
        f.connect("2", 5, &make_remote("r5")).unwrap();
        f.engine.set_torch_mode(&DeviceId::from("0"), 5, true).unwrap();
        f.engine.on_torch_status_changed(&DeviceId::from("0"), 2).unwrap();

        let disconnected = f.engine.on_process_died(5);

        assert_eq!(disconnected, 1);
        assert!(f.engine.clients().is_empty());
        assert_eq!(
            f.hw.torch_requests(),
            vec![(DeviceId::from("0"), true), (DeviceId::from("0"), false)]
        );
        assert!(
            f.engine
                .event_log()
                .iter()
                .any(|r| matches!(r.event, ArbiterEvent::ClientDied { pid: 5, .. }))
        );
    }

    #[test]
    fn test_liveness_channel_drives_cleanup() {
        let f = setup();
        f.connect("0", 5, &make_remote("r5")).unwrap();

        let (tx, rx) = mpsc::channel();
        let watcher = f.engine.watch_liveness(rx).unwrap();
        tx.send(LivenessEvent::ProcessDied(5)).unwrap();
        drop(tx);
        watcher.join().unwrap();

        assert!(f.engine.clients().is_empty());
    }

    #[test]
    fn test_switch_users_disconnects_stale_users() {
        let f = setup();
        let remote = make_remote("r5");
        f.connect("0", 5, &remote).unwrap();

        let disconnected = f.engine.switch_users(&[10]).unwrap();
        assert_eq!(disconnected, 1);
        assert!(f.engine.clients().is_empty());
        assert_eq!(*remote.forced.lock(), vec![(DeviceId::from("0"), DisconnectReason::UserSwitched)]);

        let err = f.connect("0", 5, &remote).unwrap_err();
        assert!(matches!(err, ArbiterError::NotAuthorized { .. }));

        let user_ten = ConnectRequest::new("0", CallerIdentity::new(9, 1_010_001, "com.example.ten"), make_remote("r9"));
        assert!(f.engine.connect(user_ten).is_ok());
    }

    #[test]
    fn test_switch_users_rejects_negative_ids() {
        let f = setup();
        let err = f.engine.switch_users(&[0, -1]).unwrap_err();
        assert!(matches!(err, ArbiterError::IllegalArgument { .. }));
        assert_eq!(f.engine.allowed_users().into_iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_switch_to_same_users_is_noop() {
        let f = setup();
        f.connect("0", 5, &make_remote("r5")).unwrap();
        assert_eq!(f.engine.switch_users(&[0]).unwrap(), 0);
        assert_eq!(f.engine.clients().len(), 1);
        assert!(
            !f.engine
                .event_log()
                .iter()
                .any(|r| matches!(r.event, ArbiterEvent::UserSwitch { .. }))
        );
    }

    // ============================================================
    // Legacy parameters and diagnostics
    // ============================================================

    #[test]
    fn test_legacy_parameters_are_cached() {
        let f = setup();
        let id = DeviceId::from("1");
        let first = f.engine.legacy_parameters(&id).unwrap();
        let second = f.engine.legacy_parameters(&id).unwrap();

        assert_eq!(first, second);
        assert_eq!(f.hw.legacy_queries(), 1);

        f.engine.set_device_status(&id, DeviceStatus::NotPresent).unwrap();
        assert!(matches!(
            f.engine.legacy_parameters(&id),
            Err(ArbiterError::DeviceUnavailable { .. })
        ));
        f.engine.set_device_status(&id, DeviceStatus::Present).unwrap();
        f.engine.legacy_parameters(&id).unwrap();
        assert_eq!(f.hw.legacy_queries(), 2);
    }

    #[test]
    fn test_dump_reflects_engine_state() {
        let f = setup();
        f.process(5, 10);
        f.connect("0", 5, &make_remote("r5")).unwrap();

        let dump = f.engine.dump();
        assert_eq!(dump.devices.len(), 3);
        assert_eq!(dump.clients.len(), 1);
        assert_eq!(dump.clients[0].priority, Priority::new(10, 0));
        assert_eq!(dump.clients[0].package.as_deref(), Some("com.example.app5"));
        assert_eq!(dump.torches.len(), 1);
        assert!(dump.allowed_users.contains(&0));
        assert!(matches!(dump.events[0].event, ArbiterEvent::Connected { pid: 5, .. }));
    }
}
