//! One-shot subcommands: `check` and `status`.

use std::path::Path;

use cadence_core::config::{CadenceConfig, JobEntry};
use cadence_scheduler::{
    CodeUnitLoader, CommandLoader, ExecMethod, PoolConfig, SchedulerError, TimeSpec, ENTRY_SYMBOL,
};

/// Validate pool sizing and every job entry; fails if anything is wrong.
pub fn check(config: &CadenceConfig) -> anyhow::Result<()> {
    let pool = PoolConfig::try_from(&config.executor)?;
    println!(
        "executor: base={} hard={} step={} async={}",
        pool.base, pool.hard, pool.step_queue_size, pool.dedicated
    );

    let loader = CommandLoader::new();
    let mut failed = 0usize;
    for entry in &config.jobs {
        match check_entry(&loader, entry) {
            Ok(()) => println!("ok    {}", entry.name),
            Err(e) => {
                failed += 1;
                println!("FAIL  {}: {e}", entry.name);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} job(s) failed validation", config.jobs.len());
    }
    println!("configuration OK ({} jobs)", config.jobs.len());
    Ok(())
}

/// Print the configured job table.
pub fn status(config: &CadenceConfig) -> anyhow::Result<()> {
    println!(
        "{:<20} {:<6} {:<8} {:<16} {:>8}  DESCRIPTION",
        "NAME", "METHOD", "ENABLED", "SCHEDULE", "NEXT(s)"
    );
    for entry in &config.jobs {
        let next = TimeSpec::parse(&entry.schedule)
            .ok()
            .and_then(|spec| spec.next_interval_from_now())
            .map_or_else(|| "-".to_string(), |secs| secs.to_string());
        println!(
            "{:<20} {:<6} {:<8} {:<16} {:>8}  {}",
            entry.name, entry.exec_method, entry.enable, entry.schedule, next, entry.desc
        );
    }
    Ok(())
}

/// Disabled entries only need a valid schedule and method; enabled ones
/// must also resolve to a loadable code unit.
fn check_entry(loader: &dyn CodeUnitLoader, entry: &JobEntry) -> Result<(), SchedulerError> {
    TimeSpec::parse(&entry.schedule)?;
    entry.exec_method.parse::<ExecMethod>()?;
    if entry.enable {
        loader.load(Path::new(&entry.path))?.lookup(ENTRY_SYMBOL)?;
    }
    Ok(())
}
