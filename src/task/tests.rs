#[cfg(test)]
mod tests {
    use crate::task::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::thread;
    use std::time::{Duration, Instant};

    const LONG: Duration = Duration::from_secs(10);

    fn builder() -> TaskBuilder {
        TaskBuilder::new(ThreadExecutor::with_name_prefix("progtree-test"))
    }

    fn running_tracker() -> Arc<TaskTracker> {
        let tracker = Arc::new(TaskTracker::new("test"));
        tracker.set_state(TaskState::Running).unwrap();
        tracker
    }

    fn complete(tracker: &TaskTracker) {
        tracker.set_state(TaskState::CompletionPending).unwrap();
        tracker.set_state(TaskState::Completed).unwrap();
    }

    /// Poll `condition` until it holds or the deadline passes
    fn eventually(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + LONG;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<TaskEvent>>,
        stopped: AtomicUsize,
        stopped_at_finish: Mutex<Option<usize>>,
    }

    impl RecordingHandler {
        fn events(&self) -> Vec<TaskEvent> {
            self.events.lock().unwrap().clone()
        }

        fn terminal_counts(&self) -> HashMap<TaskId, usize> {
            let mut counts = HashMap::new();
            for event in self.events() {
                match event {
                    TaskEvent::Completed { task_id, .. } | TaskEvent::Failed { task_id, .. } => {
                        *counts.entry(task_id).or_insert(0) += 1;
                    }
                    _ => {}
                }
            }
            counts
        }
    }

    impl TaskEventHandler for RecordingHandler {
        fn handle_event(&self, event: &TaskEvent) {
            match event {
                TaskEvent::Stopped { .. } => {
                    self.stopped.fetch_add(1, Ordering::SeqCst);
                }
                TaskEvent::RootFinished { .. } => {
                    *self.stopped_at_finish.lock().unwrap() =
                        Some(self.stopped.load(Ordering::SeqCst));
                }
                _ => {}
            }
            self.events.lock().unwrap().push(event.clone());
        }
    }

    // ------------------------------------------------------------------
    // Report strategies
    // ------------------------------------------------------------------

    #[test]
    fn test_strategy_none_and_all() {
        assert_eq!(ReportStrategy::none().parts_to_report(40).unwrap(), 0);
        assert_eq!(ReportStrategy::all().parts_to_report(40).unwrap(), 40);
    }

    #[test]
    fn test_strategy_constant_ignores_total() {
        let strategy = ReportStrategy::constant(100).unwrap();
        assert_eq!(strategy.parts_to_report(1).unwrap(), 100);
        assert_eq!(strategy.parts_to_report(5000).unwrap(), 100);
        assert!(matches!(
            ReportStrategy::constant(MAX_PARTS),
            Err(TaskError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_strategy_scale_range() {
        let half = ReportStrategy::scale(0.5).unwrap();
        assert_eq!(half.parts_to_report(10).unwrap(), 5);
        assert_eq!(half.parts_to_report(11).unwrap(), 5);
        assert!(matches!(
            ReportStrategy::scale(1.5),
            Err(TaskError::InvalidArgument(_))
        ));
        assert!(matches!(
            ReportStrategy::scale(-0.1),
            Err(TaskError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_strategy_manual_checked_when_applied() {
        let strategy = ReportStrategy::manual(|total| total as i64 - 5);
        assert_eq!(strategy.parts_to_report(10).unwrap(), 5);
        assert!(matches!(
            strategy.parts_to_report(2),
            Err(TaskError::ProtocolViolation(_))
        ));
    }

    // ------------------------------------------------------------------
    // Trackers
    // ------------------------------------------------------------------

    #[test]
    fn test_tracker_rejects_progress_when_not_running() {
        let tracker = TaskTracker::new("idle");
        assert!(matches!(
            tracker.increment(1),
            Err(TaskError::ProtocolViolation(_))
        ));
        assert!(matches!(tracker.set(1), Err(TaskError::ProtocolViolation(_))));
    }

    #[test]
    fn test_tracker_argument_validation() {
        let tracker = running_tracker();
        assert!(matches!(
            tracker.increment(0),
            Err(TaskError::InvalidArgument(_))
        ));
        assert!(matches!(
            tracker.set_total(MAX_PARTS),
            Err(TaskError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_tracker_accepts_largest_total() {
        let tracker = running_tracker();
        tracker.set_total(MAX_PARTS - 1).unwrap();
        assert_eq!(tracker.total_parts(), MAX_PARTS);

        tracker.increment(u64::MAX).unwrap();
        assert_eq!(tracker.parts_completed(), MAX_PARTS);
        complete(&tracker);
        assert_eq!(tracker.percentage(), 100.0);
    }

    #[test]
    fn test_tracker_clamps_and_stays_monotonic() {
        let tracker = running_tracker();
        tracker.set_total(10).unwrap();
        assert_eq!(tracker.total_parts(), 11);

        tracker.increment(4).unwrap();
        tracker.set(2).unwrap();
        assert_eq!(tracker.parts_completed(), 4);

        tracker.increment(100).unwrap();
        assert_eq!(tracker.parts_completed(), 11);
    }

    #[test]
    fn test_tracker_total_frozen_after_report() {
        let tracker = running_tracker();
        tracker.set_total(5).unwrap();
        tracker.set_total(8).unwrap();
        assert_eq!(tracker.total_parts(), 9);

        tracker.increment(1).unwrap();
        assert!(matches!(
            tracker.set_total(20),
            Err(TaskError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_tracker_completion_fills_total() {
        let tracker = running_tracker();
        tracker.set_total(50).unwrap();
        tracker.increment(3).unwrap();
        complete(&tracker);
        assert_eq!(tracker.state(), TaskState::Completed);
        assert_eq!(tracker.parts_completed(), tracker.total_parts());
        assert_eq!(tracker.percentage(), 100.0);
    }

    #[test]
    fn test_tracker_illegal_transitions() {
        let tracker = running_tracker();
        assert!(matches!(
            tracker.set_state(TaskState::Running),
            Err(TaskError::ProtocolViolation(_))
        ));
        assert!(matches!(
            tracker.set_state(TaskState::Completed),
            Err(TaskError::ProtocolViolation(_))
        ));
        assert_eq!(
            tracker.set_state(TaskState::Failed).unwrap(),
            TaskState::Running
        );
        assert!(tracker.set_state(TaskState::Failed).is_err());
    }

    #[test]
    fn test_scale_half_forwards_exactly_half() {
        let parent = running_tracker();
        let child = TaskTracker::child_of(
            &parent,
            "child",
            Weighting::Strategy(ReportStrategy::scale(0.5).unwrap()),
        )
        .unwrap();
        child.set_state(TaskState::Running).unwrap();
        child.set_total(9).unwrap();
        assert_eq!(child.total_parts(), 10);
        assert_eq!(child.parts_to_report(), 5);
        assert_eq!(parent.total_parts(), 6);

        for _ in 0..9 {
            child.increment(1).unwrap();
        }
        complete(&child);

        assert_eq!(child.parts_reported(), 5);
        assert_eq!(parent.parts_completed(), 5);
    }

    #[test]
    fn test_fixed_weight_rescales_progress() {
        let parent = running_tracker();
        let child = TaskTracker::child_of(&parent, "child", Weighting::Fixed(30)).unwrap();
        child.set_state(TaskState::Running).unwrap();
        child.set_total(99).unwrap();
        assert_eq!(parent.total_parts(), 31);

        child.increment(50).unwrap();
        assert_eq!(parent.parts_completed(), 15);
        complete(&child);
        assert_eq!(parent.parts_completed(), 30);
    }

    #[test]
    fn test_concurrent_reports_forward_exactly_once() {
        let parent = running_tracker();
        let child = Arc::new(
            TaskTracker::child_of(&parent, "child", Weighting::Strategy(ReportStrategy::all()))
                .unwrap(),
        );
        child.set_state(TaskState::Running).unwrap();
        child.set_total(999).unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let child = Arc::clone(&child);
                thread::spawn(move || {
                    for _ in 0..125 {
                        child.increment(1).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(child.parts_completed(), 1000);
        assert_eq!(child.parts_reported(), 1000);
        assert_eq!(parent.parts_completed(), 1000);
        assert!(parent.parts_completed() <= parent.total_parts());
    }

    #[test]
    fn test_manual_strategy_error_at_attach() {
        let parent = running_tracker();
        let result = TaskTracker::child_of(
            &parent,
            "child",
            Weighting::Strategy(ReportStrategy::manual(|_| -1)),
        );
        assert!(matches!(result, Err(TaskError::ProtocolViolation(_))));
    }

    // ------------------------------------------------------------------
    // Task trees
    // ------------------------------------------------------------------

    #[test]
    fn test_constant_strategy_sequential_subtasks_reach_full_progress() {
        let root = builder()
            .name("constant")
            .default_strategy(ReportStrategy::constant(100).unwrap())
            .build(|task| {
                for _ in 0..2 {
                    task.spawn(|sub| {
                        sub.set_total(10)?;
                        for _ in 0..10 {
                            sub.increment()?;
                        }
                        Ok(())
                    })?;
                }
                Ok(())
            });

        root.start().unwrap();
        assert!(root.wait().unwrap());
        assert_eq!(root.state(), RootState::Completed);
        assert_eq!(root.total_parts(), 201);
        assert_eq!(root.parts_completed(), root.total_parts());
        assert_eq!(root.percentage(), 100.0);
        assert!(root.outcome().is_ok());
    }

    #[test]
    fn test_completion_fills_underreported_body() {
        let root = builder().build(|task| {
            task.set_total(1000)?;
            task.increment_by(3)?;
            Ok(())
        });
        root.start().unwrap();
        assert!(root.wait().unwrap());
        assert_eq!(root.parts_completed(), 1001);
        assert_eq!(root.percentage(), 100.0);
    }

    #[test]
    fn test_sequential_subtasks_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let body_log = Arc::clone(&log);
        let root = builder().build(move |task| {
            for index in 0..5 {
                let log = Arc::clone(&body_log);
                task.spawn(move |sub| {
                    log.lock().unwrap().push(format!("start {}", index));
                    sub.sleep(Duration::from_millis(5))?;
                    log.lock().unwrap().push(format!("end {}", index));
                    Ok(())
                })?;
            }
            Ok(())
        });

        root.start().unwrap();
        assert!(root.wait().unwrap());

        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start {}", i), format!("end {}", i)])
            .collect();
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn test_body_error_fails_task_with_cause() {
        let root = builder().build(|task| {
            task.increment()?;
            anyhow::bail!("disk full");
        });

        root.start().unwrap();
        assert!(!root.wait().unwrap());
        assert!(root.is_failed());
        assert!(root.is_stopped());

        match root.failure_cause() {
            Some(TaskError::Body(error)) => assert_eq!(error.to_string(), "disk full"),
            other => panic!("Expected body failure, got {:?}", other),
        }
        match root.outcome() {
            Err(TaskError::Execution(cause)) => {
                assert!(cause.to_string().contains("disk full"));
            }
            other => panic!("Expected execution failure, got {:?}", other),
        }
    }

    #[test]
    fn test_panicking_body_is_recorded() {
        let root = builder().build(|_task| panic!("unexpected state"));
        root.start().unwrap();
        assert!(!root.wait().unwrap());
        match root.failure_cause() {
            Some(TaskError::Panicked(message)) => assert!(message.contains("unexpected state")),
            other => panic!("Expected panic cause, got {:?}", other),
        }
    }

    #[test]
    fn test_cancel_before_start_never_runs_body() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let root = builder().build(move |_task| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert!(root.cancel());
        assert!(!root.cancel());
        root.start().unwrap();

        assert!(!root.wait().unwrap());
        assert!(!ran.load(Ordering::SeqCst));
        assert!(root.is_failed());
        assert!(matches!(root.failure_cause(), Some(TaskError::Cancelled)));
    }

    #[test]
    fn test_double_start_is_protocol_violation() {
        let root = builder().build(|_task| Ok(()));
        root.start().unwrap();
        assert!(matches!(
            root.start(),
            Err(TaskError::ProtocolViolation(_))
        ));
        assert!(root.wait().unwrap());
    }

    #[test]
    fn test_cancel_drives_all_running_branches_to_failed() {
        let handler = Arc::new(RecordingHandler::default());
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);

        let root = builder()
            .event_handler(handler.clone())
            .build(move |task| {
                for _ in 0..4 {
                    let counter = Arc::clone(&counter);
                    task.spawn_parallel(move |sub| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        loop {
                            sub.sleep(Duration::from_millis(5))?;
                        }
                    })?;
                }
                Ok(())
            });

        root.start().unwrap();
        assert!(eventually(|| started.load(Ordering::SeqCst) == 4));
        assert!(root.cancel());

        assert_eq!(root.wait_timeout(LONG), Some(false));
        assert!(matches!(root.failure_cause(), Some(TaskError::Cancelled)));

        let failed = handler
            .events()
            .iter()
            .filter(|event| matches!(event, TaskEvent::Failed { .. }))
            .count();
        assert_eq!(failed, 5);
    }

    #[test]
    fn test_failure_cascades_and_root_waits_for_unwind() {
        let handler = Arc::new(RecordingHandler::default());
        let root = builder()
            .event_handler(handler.clone())
            .build(|task| {
                for index in 0..3 {
                    task.spawn_parallel(move |sub| {
                        if index == 0 {
                            sub.sleep(Duration::from_millis(20))?;
                            anyhow::bail!("branch {} broke", index);
                        }
                        loop {
                            sub.sleep(Duration::from_millis(5))?;
                        }
                    })?;
                }
                Ok(())
            });

        root.start().unwrap();
        assert_eq!(root.wait_timeout(LONG), Some(false));

        match root.failure_cause() {
            Some(TaskError::Body(error)) => assert_eq!(error.to_string(), "branch 0 broke"),
            other => panic!("Expected the first body failure, got {:?}", other),
        }

        assert!(eventually(|| handler.stopped_at_finish.lock().unwrap().is_some()));
        assert_eq!(*handler.stopped_at_finish.lock().unwrap(), Some(4));
    }

    #[test]
    fn test_terminal_side_effects_fire_once_under_racing_cancel() {
        for round in 0..30 {
            let handler = Arc::new(RecordingHandler::default());
            let root = builder()
                .event_handler(handler.clone())
                .build(|task| {
                    for _ in 0..2 {
                        task.spawn_parallel(|sub| {
                            sub.set_total(50)?;
                            for _ in 0..50 {
                                sub.check_cancel()?;
                                sub.increment()?;
                            }
                            Ok(())
                        })?;
                    }
                    task.spawn(|sub| {
                        sub.increment()?;
                        Ok(())
                    })?;
                    Ok(())
                });

            root.start().unwrap();
            for _ in 0..(round % 7) {
                thread::yield_now();
            }
            root.cancel();

            assert!(root.wait_timeout(LONG).is_some());
            let counts = handler.terminal_counts();
            assert!(!counts.is_empty());
            assert!(counts.values().all(|count| *count == 1), "round {}", round);
        }
    }

    #[test]
    fn test_progress_is_monotonic_for_observers() {
        let root = builder()
            .default_strategy(ReportStrategy::all())
            .build(|task| {
                for _ in 0..3 {
                    task.spawn_parallel(|sub| {
                        sub.set_total(200)?;
                        for _ in 0..200 {
                            sub.increment()?;
                        }
                        Ok(())
                    })?;
                }
                task.spawn(|sub| {
                    sub.set_total(100)?;
                    for _ in 0..100 {
                        sub.increment()?;
                    }
                    Ok(())
                })?;
                Ok(())
            });

        root.start().unwrap();
        let mut last = 0;
        while !root.is_stopped() {
            let completed = root.parts_completed();
            assert!(completed >= last);
            assert!(completed <= root.total_parts());
            last = completed;
        }
        assert!(root.wait().unwrap());
        assert_eq!(root.parts_completed(), root.total_parts());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let root = builder().build(|task| {
            task.sleep(Duration::from_secs(60))?;
            Ok(())
        });
        root.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        root.cancel();
        assert_eq!(root.wait_timeout(Duration::from_secs(5)), Some(false));
    }

    #[test]
    fn test_timed_wait_does_not_cancel() {
        let root = builder().build(|task| {
            task.sleep(Duration::from_millis(150))?;
            Ok(())
        });
        root.start().unwrap();
        assert_eq!(root.wait_timeout(Duration::from_millis(5)), None);
        assert!(!root.is_cancelled());
        assert!(root.wait_uninterruptibly());
    }

    #[test]
    fn test_interrupting_waiters() {
        let (release, gate) = mpsc::channel::<()>();
        let root = builder().build(move |_task| {
            gate.recv()?;
            Ok(())
        });
        root.start().unwrap();

        let observer = root.clone();
        let waiter = thread::spawn(move || observer.wait());
        let deadline = Instant::now() + LONG;
        while !waiter.is_finished() && Instant::now() < deadline {
            root.interrupt_waiters();
            thread::sleep(Duration::from_millis(2));
        }
        assert!(matches!(
            waiter.join().unwrap(),
            Err(TaskError::Interrupted)
        ));
        assert!(!root.is_stopped());

        release.send(()).unwrap();
        assert!(root.wait_uninterruptibly());
    }

    #[test]
    fn test_set_total_after_publish_rejected() {
        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        let root = builder().build(move |task| {
            task.increment()?;
            *slot.lock().unwrap() = Some(task.set_total(10));
            Ok(())
        });
        root.start().unwrap();
        assert!(root.wait().unwrap());
        assert!(matches!(
            outcome.lock().unwrap().take(),
            Some(Err(TaskError::ProtocolViolation(_)))
        ));
    }

    #[test]
    fn test_flatten_protocol_violations() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let root = builder().build(move |task| {
            let mut results = sink.lock().unwrap();
            results.push(task.end_flatten());
            task.begin_flatten()?;
            results.push(task.begin_flatten());
            results.push(task.spawn_parallel(|_| Ok(())));
            task.end_flatten()?;
            Ok(())
        });

        root.start().unwrap();
        assert!(root.wait().unwrap());
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 3);
        assert!(
            results
                .iter()
                .all(|result| matches!(result, Err(TaskError::ProtocolViolation(_))))
        );
    }

    #[test]
    fn test_unclosed_flatten_fails_task() {
        let root = builder().build(|task| {
            task.begin_flatten()?;
            task.spawn(|_| Ok(()))?;
            Ok(())
        });
        root.start().unwrap();
        assert!(!root.wait().unwrap());
        assert!(matches!(
            root.failure_cause(),
            Some(TaskError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_flattened_requests_run_as_one_unit() {
        let handler = Arc::new(RecordingHandler::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        let body_order = Arc::clone(&order);

        let root = builder()
            .event_handler(handler.clone())
            .build(move |task| {
                task.begin_flatten()?;
                for index in 0..4 {
                    let order = Arc::clone(&body_order);
                    task.spawn(move |sub| {
                        sub.set_total(10)?;
                        sub.increment_by(10)?;
                        assert!(sub.spawn(|_| Ok(())).is_err());
                        order.lock().unwrap().push(index);
                        Ok(())
                    })?;
                }
                task.end_flatten()?;
                Ok(())
            });

        root.start().unwrap();
        assert!(root.wait().unwrap());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);

        let started = handler
            .events()
            .iter()
            .filter(|event| matches!(event, TaskEvent::Started { .. }))
            .count();
        assert_eq!(started, 2);
        // One completion part plus one part per flattened body
        assert_eq!(root.total_parts(), 5);
        assert_eq!(root.parts_completed(), 5);
    }

    #[test]
    fn test_flattened_weight_sums_every_body() {
        let root = builder()
            .default_strategy(ReportStrategy::constant(3).unwrap())
            .build(|task| {
                task.begin_flatten()?;
                task.spawn_weighted(false, 10, |sub| {
                    sub.increment()?;
                    Ok(())
                })?;
                task.spawn(|sub| {
                    sub.increment()?;
                    Ok(())
                })?;
                task.spawn_with_strategy(false, ReportStrategy::none(), |_| Ok(()))?;
                task.end_flatten()?;
                Ok(())
            });

        root.start().unwrap();
        assert!(root.wait().unwrap());
        assert_eq!(root.total_parts(), 14);
        assert_eq!(root.parts_completed(), 14);
    }

    #[test]
    fn test_lightweight_task_cannot_spawn_or_resize() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let root = builder().build_lightweight(move |task| {
            let mut results = sink.lock().unwrap();
            results.push(task.spawn(|_| Ok(())));
            results.push(task.set_total(5));
            results.push(task.begin_flatten());
            task.increment()?;
            Ok(())
        });

        root.start().unwrap();
        assert!(root.wait().unwrap());
        let results = results.lock().unwrap();
        assert!(
            results
                .iter()
                .all(|result| matches!(result, Err(TaskError::ProtocolViolation(_))))
        );
    }

    #[test]
    fn test_lightweight_units_skip_composite_state() {
        use crate::task::unit::UnitKind;
        assert!(std::mem::size_of::<UnitKind>() <= 2 * std::mem::size_of::<usize>());
    }

    #[test]
    fn test_cascaded_chain_units_get_stopped_events() {
        let handler = Arc::new(RecordingHandler::default());
        let root = builder()
            .event_handler(handler.clone())
            .build(|task| {
                task.spawn(|_| anyhow::bail!("first link broke"))?;
                task.spawn(|_| Ok(()))?;
                task.spawn(|_| Ok(()))?;
                Ok(())
            });

        root.start().unwrap();
        assert!(!root.wait().unwrap());

        let events = handler.events();
        let mut stopped: HashMap<TaskId, usize> = HashMap::new();
        for event in &events {
            if let TaskEvent::Stopped { task_id, .. } = event {
                *stopped.entry(*task_id).or_insert(0) += 1;
            }
        }
        let terminal = handler.terminal_counts();
        assert_eq!(terminal.len(), 4);
        assert_eq!(stopped, terminal);

        // Stopped comes right before the matching terminal event
        for (index, event) in events.iter().enumerate() {
            if let TaskEvent::Failed { task_id, .. } | TaskEvent::Completed { task_id, .. } = event
            {
                assert!(matches!(
                    &events[index - 1],
                    TaskEvent::Stopped { task_id: stopped_id, .. } if stopped_id == task_id
                ));
            }
        }
    }

    /// Runs every job on one long-lived worker thread
    struct SingleWorker {
        sender: Mutex<mpsc::Sender<Job>>,
    }

    impl SingleWorker {
        fn new() -> Self {
            let (sender, receiver) = mpsc::channel::<Job>();
            thread::spawn(move || {
                for job in receiver {
                    job();
                }
            });
            Self {
                sender: Mutex::new(sender),
            }
        }
    }

    impl Executor for SingleWorker {
        fn execute(&self, job: Job) {
            let _ = self.sender.lock().unwrap().send(job);
        }
    }

    #[test]
    fn test_interrupt_does_not_leak_onto_reused_worker() {
        let worker: Arc<dyn Executor> = Arc::new(SingleWorker::new());

        let (entered, spinning) = mpsc::channel::<()>();
        let interrupted = TaskBuilder::with_shared_executor(Arc::clone(&worker)).build(
            move |task| {
                entered.send(())?;
                while !task.poll_cancel() {
                    std::hint::spin_loop();
                }
                Ok(())
            },
        );
        interrupted.start().unwrap();
        spinning.recv_timeout(LONG).unwrap();
        interrupted.cancel();
        assert_eq!(interrupted.wait_timeout(LONG), Some(false));

        let parked = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&parked);
        let next = TaskBuilder::with_shared_executor(worker).build(move |_task| {
            let began = Instant::now();
            thread::park_timeout(Duration::from_millis(200));
            *slot.lock().unwrap() = Some(began.elapsed());
            Ok(())
        });
        next.start().unwrap();
        assert!(next.wait().unwrap());

        let elapsed = parked.lock().unwrap().take().unwrap();
        assert!(elapsed >= Duration::from_millis(150), "woke after {:?}", elapsed);
    }

    #[test]
    fn test_light_subtasks_inside_composite() {
        let root = builder().build(|task| {
            for _ in 0..3 {
                task.spawn_light(true, |sub| {
                    sub.increment()?;
                    Ok(())
                })?;
            }
            Ok(())
        });
        root.start().unwrap();
        assert!(root.wait().unwrap());
        assert_eq!(root.total_parts(), 4);
        assert_eq!(root.percentage(), 100.0);
    }

    #[test]
    fn test_display_stack_tracks_active_levels() {
        let (release, gate) = mpsc::channel::<()>();
        let root = builder().name("display").build(move |task| {
            task.set_status("outer");
            task.spawn_parallel(move |sub| {
                sub.set_status("inner");
                sub.set_total(2)?;
                sub.increment()?;
                gate.recv()?;
                Ok(())
            })?;
            Ok(())
        });

        root.start().unwrap();
        assert!(eventually(|| root.active_tasks().len() == 2));

        let active = root.active_tasks();
        assert_eq!(active[0].depth(), 0);
        assert_eq!(active[0].status(), "outer");
        assert_eq!(active[1].depth(), 1);
        assert_eq!(active[1].status(), "inner");
        assert_eq!(active[1].parts_completed(), 1);

        let reports = root.progress_reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].total_parts, 3);

        release.send(()).unwrap();
        assert!(root.wait().unwrap());
        assert!(root.active_tasks().is_empty());
    }

    #[test]
    fn test_sequential_chain_shares_one_level() {
        let (release, gate) = mpsc::channel::<()>();
        let (entered, notify) = mpsc::channel::<()>();
        let root = builder().build(move |task| {
            task.spawn(|sub| {
                sub.set_status("first");
                Ok(())
            })?;
            task.spawn(move |sub| {
                sub.set_status("second");
                sub.increment()?;
                entered.send(())?;
                gate.recv()?;
                Ok(())
            })?;
            Ok(())
        });

        root.start().unwrap();
        notify.recv_timeout(LONG).unwrap();

        let active = root.active_tasks();
        assert_eq!(active.len(), 2);
        assert_eq!(active[1].status(), "second");

        release.send(()).unwrap();
        assert!(root.wait().unwrap());
    }

    #[test]
    fn test_result_task_yields_value() {
        let task = builder().build_with_result(|handle| {
            handle.set_total(2)?;
            handle.increment_by(2)?;
            Ok(6 * 7)
        });

        assert!(matches!(
            task.result(),
            Err(TaskError::Execution(cause)) if matches!(*cause, TaskError::NotFinished)
        ));
        task.start().unwrap();
        assert_eq!(task.wait_result().unwrap(), 42);
        assert_eq!(*task.result_ref().unwrap(), 42);
    }

    #[test]
    fn test_result_task_failure_wraps_cause() {
        let task = builder().build_with_result::<u32, _>(|_handle| {
            anyhow::bail!("no value today");
        });
        task.start().unwrap();
        match task.wait_result() {
            Err(TaskError::Execution(cause)) => {
                assert!(matches!(*cause, TaskError::Body(_)));
                assert!(cause.to_string().contains("no value today"));
            }
            other => panic!("Expected execution failure, got {:?}", other),
        }
    }

    #[test]
    fn test_manual_strategy_violation_fails_at_materialization() {
        let root = builder().build(|task| {
            task.spawn_with_strategy(false, ReportStrategy::manual(|_| -3), |_| Ok(()))?;
            Ok(())
        });
        root.start().unwrap();
        assert!(!root.wait().unwrap());
        assert!(matches!(
            root.failure_cause(),
            Some(TaskError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_check_cancel_error_is_recorded_as_cancellation() {
        let root = builder().build(|task| {
            loop {
                task.check_cancel()?;
                thread::sleep(Duration::from_millis(1));
            }
        });
        root.start().unwrap();
        thread::sleep(Duration::from_millis(10));
        root.cancel();
        assert_eq!(root.wait_timeout(LONG), Some(false));
        assert!(root.failure_cause().unwrap().is_cancellation());
    }
}
