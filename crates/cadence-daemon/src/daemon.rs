//! Long-running mode: build the scheduler, then serve signals until asked to stop.
//!
//! | Signal          | Action                                         |
//! |-----------------|------------------------------------------------|
//! | SIGHUP          | Reload the config file and reconfigure         |
//! | SIGUSR1         | Log and print the status dump                  |
//! | SIGINT, SIGTERM | Graceful shutdown                              |

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use cadence_core::config::CadenceConfig;
use cadence_scheduler::{CodeUnitLoader, CommandLoader, Job, Scheduler, TimerService};
use tokio::runtime::Handle;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::pidfile::PidFile;

const HEARTBEAT_JOB: &str = "heartbeat";
const HEARTBEAT_SCHEDULE: &str = "0 * *";

pub async fn run(config_path: String, config: CadenceConfig) -> anyhow::Result<()> {
    let timers = TimerService::with_handle(Handle::current());
    let loader: Arc<dyn CodeUnitLoader> = Arc::new(CommandLoader::new());

    let scheduler = Scheduler::new(&config.executor, timers.timer(), loader)
        .context("invalid [executor] section")?;
    scheduler.set_running(config.daemon.active);

    register_heartbeat(&scheduler)?;
    scheduler
        .load_jobs(&config.jobs)
        .context("registering configured jobs")?;
    scheduler.start().context("starting scheduler")?;

    let _pid_file = config
        .daemon
        .pid_file
        .as_deref()
        .map(PidFile::create)
        .transpose()?;

    info!(
        config = %config_path,
        jobs = scheduler.jobs().len(),
        active = config.daemon.active,
        "cadenced started"
    );

    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                reload(&scheduler, &config_path).await;
            }
            _ = user1.recv() => {
                let report = scheduler.status_report();
                info!("status requested\n{report}");
                println!("{report}");
            }
            _ = interrupt.recv() => {
                info!("Received SIGINT, initiating shutdown");
                break;
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown");
                break;
            }
        }
    }

    // Shutdown joins worker threads; keep it off the runtime.
    let stopping = scheduler.clone();
    tokio::task::spawn_blocking(move || stopping.shutdown())
        .await
        .context("scheduler shutdown task")?;

    info!("cadenced shutdown complete");
    Ok(())
}

fn register_heartbeat(scheduler: &Scheduler) -> anyhow::Result<()> {
    let started = Instant::now();
    scheduler
        .add_builtin(
            HEARTBEAT_JOB,
            "daemon liveness",
            HEARTBEAT_SCHEDULE,
            move |job: &Job| {
                info!(
                    uptime_secs = started.elapsed().as_secs(),
                    beats = job.runs() + 1,
                    "heartbeat"
                );
                0
            },
            false,
        )
        .context("registering heartbeat job")
}

async fn reload(scheduler: &Scheduler, config_path: &str) {
    let config = match CadenceConfig::load(Some(config_path)) {
        Ok(config) => config,
        Err(e) => {
            error!(code = e.code(), error = %e, "reload failed, keeping current configuration");
            return;
        }
    };

    // Removal waits for in-flight firings, so this can block for a while.
    let target = scheduler.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let report = target.reconfigure(&config.executor, &config.jobs)?;
        target.set_running(config.daemon.active);
        Ok::<_, cadence_scheduler::SchedulerError>(report)
    })
    .await;

    match outcome {
        Ok(Ok(report)) => {
            for (name, reason) in &report.rejected {
                warn!(job = %name, reason = %reason, "job change not applied");
            }
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                rejected = report.rejected.len(),
                "configuration reloaded"
            );
        }
        Ok(Err(e)) => error!(error = %e, "reload rejected, keeping current configuration"),
        Err(e) => error!(error = %e, "reload task failed"),
    }
}
