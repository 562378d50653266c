// End-to-end behaviour of the scheduler: registry rules, both dispatch
// pipelines, dynamic removal and reconfiguration.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use cadence_core::config::{ExecutorConfig, JobEntry};
use cadence_scheduler::{
    ExecMethod, JobStatus, Scheduler, SchedulerError, StaticLoader, TimerService, ENTRY_SYMBOL,
};

struct Harness {
    scheduler: Scheduler,
    loader: Arc<StaticLoader>,
    _timers: TimerService,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

fn harness(executor: ExecutorConfig) -> Harness {
    let timers = TimerService::new().unwrap();
    let loader = Arc::new(StaticLoader::new());
    let scheduler = Scheduler::new(&executor, timers.timer(), loader.clone()).unwrap();
    Harness {
        scheduler,
        loader,
        _timers: timers,
    }
}

fn entry(name: &str, schedule: &str, method: &str, path: &str) -> JobEntry {
    JobEntry {
        name: name.to_string(),
        desc: format!("{name} job"),
        schedule: schedule.to_string(),
        exec_method: method.to_string(),
        path: path.to_string(),
        enable: true,
    }
}

fn noop_unit(loader: &StaticLoader, path: &str) {
    loader.register(path, ENTRY_SYMBOL, |_, _| 0);
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn duplicate_name_is_rejected_and_original_kept() {
    let h = harness(ExecutorConfig::default());
    noop_unit(&h.loader, "/units/report");

    h.scheduler
        .add_job(&entry("report", "0 0 3", "defer", "/units/report"))
        .unwrap();
    let err = h
        .scheduler
        .add_job(&entry("report", "0 30 4", "async", "/units/report"))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::DuplicateJob { .. }));

    let info = h.scheduler.job_info("report").unwrap();
    assert_eq!(info.schedule, "0 0 3");
    assert_eq!(info.method, ExecMethod::Queued);
    assert_eq!(h.scheduler.jobs().len(), 1);
}

#[test]
fn failed_registration_leaves_no_trace() {
    let h = harness(ExecutorConfig::default());

    let err = h
        .scheduler
        .add_job(&entry("ghost", "0 0 0", "defer", "/units/missing"))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::CodeUnit(_)));
    assert!(!h.scheduler.contains("ghost"));

    noop_unit(&h.loader, "/units/ok");
    let err = h
        .scheduler
        .add_job(&entry("bad-method", "0 0 0", "threaded", "/units/ok"))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownExecMethod(_)));

    // The name is free again after a failed attempt.
    h.scheduler
        .add_job(&entry("ghost", "0 0 0", "defer", "/units/ok"))
        .unwrap();
    assert!(h.scheduler.contains("ghost"));
}

#[test]
fn builtin_jobs_cannot_be_removed() {
    let h = harness(ExecutorConfig::default());
    h.scheduler
        .add_builtin("heartbeat", "liveness", "0 * *", |_| 0, false)
        .unwrap();

    let err = h.scheduler.remove_job("heartbeat").unwrap_err();
    assert!(matches!(err, SchedulerError::BuiltinRemoval { .. }));
    assert!(h.scheduler.contains("heartbeat"));
    assert!(h.scheduler.job_info("heartbeat").unwrap().builtin);
}

#[test]
fn removing_unknown_job_succeeds() {
    let h = harness(ExecutorConfig::default());
    h.scheduler.remove_job("never-added").unwrap();
}

#[test]
fn removal_waits_for_in_flight_firing() {
    let h = harness(ExecutorConfig::default());
    let (started_tx, started_rx) = mpsc::channel();
    let finished = Arc::new(AtomicBool::new(false));
    let done = Arc::clone(&finished);

    h.loader.register("/units/slow", ENTRY_SYMBOL, move |_, _| {
        let _ = started_tx.send(());
        thread::sleep(Duration::from_millis(1500));
        done.store(true, Ordering::SeqCst);
        0
    });
    h.scheduler
        .add_job(&entry("slow", "* * *", "defer", "/units/slow"))
        .unwrap();
    h.scheduler.start().unwrap();
    assert_eq!(h.loader.live_units(), 1);

    started_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("slow job never started");
    h.scheduler.remove_job("slow").unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert!(!h.scheduler.contains("slow"));
    assert_eq!(h.loader.live_units(), 0);
}

#[test]
fn removal_of_idle_job_releases_unit() {
    let h = harness(ExecutorConfig::default());
    noop_unit(&h.loader, "/units/nightly");
    h.scheduler
        .add_job(&entry("nightly", "0 0 2", "defer", "/units/nightly"))
        .unwrap();
    assert_eq!(h.loader.live_units(), 1);

    h.scheduler.remove_job("nightly").unwrap();
    assert!(!h.scheduler.contains("nightly"));
    assert_eq!(h.loader.live_units(), 0);
}

#[test]
fn queued_jobs_run_on_the_worker_pool() {
    let h = harness(ExecutorConfig::default());
    let (tx, rx) = mpsc::channel();
    h.scheduler
        .add_builtin(
            "tick",
            "every second",
            "* * *",
            move |_| {
                let name = thread::current().name().unwrap_or_default().to_string();
                let _ = tx.send(name);
                0
            },
            false,
        )
        .unwrap();
    h.scheduler.start().unwrap();

    let thread_name = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert!(thread_name.starts_with("cadence-worker"), "{thread_name}");
}

#[test]
fn dedicated_jobs_run_on_their_own_thread() {
    let h = harness(ExecutorConfig::default());
    let (tx, rx) = mpsc::channel();
    h.loader.register("/units/export", ENTRY_SYMBOL, move |req, rsp| {
        let name = thread::current().name().unwrap_or_default().to_string();
        let _ = tx.send((req.name.to_string(), name));
        rsp.output = "exported".to_string();
        0
    });
    h.scheduler
        .add_job(&entry("export", "* * *", "async", "/units/export"))
        .unwrap();
    h.scheduler.start().unwrap();

    let (job, thread_name) = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(job, "export");
    assert!(thread_name.starts_with("cadence-async"), "{thread_name}");
}

#[test]
fn full_dedicated_runner_holds_back_dispatch() {
    let h = harness(ExecutorConfig {
        thread_number_async: 1,
        ..ExecutorConfig::default()
    });
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runs: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    for (i, count) in runs.iter().enumerate() {
        let live = Arc::clone(&live);
        let peak = Arc::clone(&peak);
        let count = Arc::clone(count);
        h.scheduler
            .add_builtin(
                &format!("export-{i}"),
                "long running",
                "* * *",
                move |_| {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(400));
                    live.fetch_sub(1, Ordering::SeqCst);
                    count.fetch_add(1, Ordering::SeqCst);
                    0
                },
                true,
            )
            .unwrap();
    }
    h.scheduler.start().unwrap();

    assert!(wait_until(Duration::from_secs(8), || {
        runs.iter().all(|c| c.load(Ordering::SeqCst) > 0)
    }));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn paused_scheduler_keeps_jobs_armed_but_skips_bodies() {
    let h = harness(ExecutorConfig::default());
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    h.scheduler
        .add_builtin(
            "count",
            "counter",
            "* * *",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                0
            },
            false,
        )
        .unwrap();
    h.scheduler.set_running(false);
    h.scheduler.start().unwrap();

    thread::sleep(Duration::from_millis(2500));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.scheduler.job_info("count").unwrap().status,
        JobStatus::Running
    );

    h.scheduler.set_running(true);
    assert!(wait_until(Duration::from_secs(3), || runs.load(Ordering::SeqCst) > 0));
}

#[test]
fn reconfigure_adds_keeps_and_removes() {
    let h = harness(ExecutorConfig::default());
    noop_unit(&h.loader, "/units/a");
    noop_unit(&h.loader, "/units/b");
    h.scheduler
        .add_job(&entry("a", "0 0 1", "defer", "/units/a"))
        .unwrap();

    let mut changed = entry("a", "0 0 5", "defer", "/units/a");
    let report = h
        .scheduler
        .reconfigure(
            &ExecutorConfig::default(),
            &[
                entry("a", "0 0 1", "defer", "/units/a"),
                entry("b", "0 0 2", "async", "/units/b"),
                entry("c", "0 0 3", "defer", "/units/missing"),
            ],
        )
        .unwrap();
    assert_eq!(report.unchanged, vec!["a".to_string()]);
    assert_eq!(report.added, vec!["b".to_string()]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, "c");
    assert!(!report.is_clean());

    // A changed definition under an existing name is a duplicate.
    let report = h
        .scheduler
        .reconfigure(&ExecutorConfig::default(), &[changed.clone()])
        .unwrap();
    assert_eq!(report.rejected[0].0, "a");
    assert_eq!(h.scheduler.job_info("a").unwrap().schedule, "0 0 1");

    changed.enable = false;
    let mut disabled_b = entry("b", "0 0 2", "async", "/units/b");
    disabled_b.enable = false;
    let report = h
        .scheduler
        .reconfigure(&ExecutorConfig::default(), &[changed, disabled_b])
        .unwrap();
    assert_eq!(report.removed, vec!["a".to_string(), "b".to_string()]);
    assert!(report.is_clean());
    assert!(h.scheduler.jobs().is_empty());
    assert_eq!(h.loader.live_units(), 0);
}

#[test]
fn invalid_pool_configuration_changes_nothing() {
    let h = harness(ExecutorConfig::default());
    noop_unit(&h.loader, "/units/a");
    let before = h.scheduler.pool_config();

    let bad = ExecutorConfig {
        thread_number: 4,
        thread_number_hard: 2,
        thread_step_queue_size: 10,
        thread_number_async: 5,
    };
    let err = h
        .scheduler
        .reconfigure(&bad, &[entry("a", "0 0 1", "defer", "/units/a")])
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidPoolConfig(_)));
    assert_eq!(h.scheduler.pool_config(), before);
    assert!(!h.scheduler.contains("a"));

    let zero_async = ExecutorConfig {
        thread_number_async: 0,
        ..ExecutorConfig::default()
    };
    assert!(h.scheduler.reconfigure(&zero_async, &[]).is_err());
    assert!(Scheduler::new(
        &zero_async,
        TimerService::new().unwrap().timer(),
        h.loader.clone()
    )
    .is_err());
}

#[test]
fn worker_pool_follows_reconfigured_bounds() {
    let h = harness(ExecutorConfig {
        thread_number: 2,
        thread_number_hard: 2,
        thread_step_queue_size: 0,
        thread_number_async: 3,
    });
    h.scheduler.start().unwrap();
    assert_eq!(h.scheduler.worker_count(), 2);
    assert_eq!(h.scheduler.dedicated_slots_available(), 3);

    let grown = ExecutorConfig {
        thread_number: 4,
        thread_number_hard: 6,
        thread_step_queue_size: 5,
        thread_number_async: 1,
    };
    h.scheduler.reconfigure(&grown, &[]).unwrap();
    assert_eq!(h.scheduler.worker_count(), 4);
    assert_eq!(h.scheduler.dedicated_slots_available(), 1);

    // Empty queue: the elastic target is the base size.
    h.scheduler.adjust_pool();
    assert_eq!(h.scheduler.worker_count(), 4);

    let shrunk = ExecutorConfig {
        thread_number: 1,
        thread_number_hard: 1,
        ..grown
    };
    h.scheduler.reconfigure(&shrunk, &[]).unwrap();
    assert_eq!(h.scheduler.worker_count(), 1);
}

#[test]
fn status_report_lists_jobs() {
    let h = harness(ExecutorConfig::default());
    noop_unit(&h.loader, "/units/a");
    h.scheduler
        .add_builtin("heartbeat", "liveness", "0 * *", |_| 0, false)
        .unwrap();
    h.scheduler
        .add_job(&entry("backup", "0 0 4", "async", "/units/a"))
        .unwrap();

    let report = h.scheduler.status_report();
    assert!(report.contains("jobs: 2"));
    assert!(report.contains("heartbeat [defer, builtin] running"));
    assert!(report.contains("backup [async] running \"0 0 4\""));
}

#[test]
fn shutdown_is_idempotent_and_final() {
    let h = harness(ExecutorConfig::default());
    noop_unit(&h.loader, "/units/a");
    h.scheduler
        .add_job(&entry("a", "* * *", "defer", "/units/a"))
        .unwrap();
    h.scheduler.start().unwrap();

    h.scheduler.shutdown();
    h.scheduler.shutdown();

    assert!(h.scheduler.jobs().is_empty());
    assert_eq!(h.loader.live_units(), 0);
    assert!(matches!(
        h.scheduler.add_job(&entry("b", "0 0 0", "defer", "/units/a")),
        Err(SchedulerError::ShuttingDown)
    ));
    assert!(matches!(
        h.scheduler.start(),
        Err(SchedulerError::ShuttingDown)
    ));
}
