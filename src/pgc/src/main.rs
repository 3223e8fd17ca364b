//! Composition root: parses the command line, wires up whichever
//! collaborators were requested, and runs until interrupted.

mod cli;

use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::AtomicUsize;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cli::Cli;
use pgc_keeper::hog::Hog;
use pgc_keeper::keeper::{Keeper, RunningKeeper};
use pgc_keeper::transient_pager::{RunningTransientPager, TransientPager};
use pgc_keeper::victim::VictimChecker;
use pgc_keeper::{page_size, KeeperConfig};

const MEMINFO_REPORT_INTERVAL: Duration = Duration::from_millis(500);
const VICTIM_MEASUREMENT_INTERVAL: Duration = Duration::from_secs(1);

/// Everything long-lived, torn down in the same order the original tool's
/// cascading cleanup used: meminfo reporter, hog, keeper, transient pager,
/// victim checker.
#[derive(Default)]
struct Running {
    meminfo: Option<pgc_meminfo::Reporter>,
    hog: Option<Hog>,
    keeper: Option<RunningKeeper>,
    pager: Option<RunningTransientPager>,
    victim: Option<VictimChecker>,
}

impl Running {
    fn shutdown(self) {
        if let Some(reporter) = self.meminfo {
            reporter.stop();
        }
        drop(self.hog);
        if let Some(running) = self.keeper {
            drop(running.stop());
        }
        if let Some(running) = self.pager {
            drop(running.stop());
        }
        drop(self.victim);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            eprintln!("pgc: {err:#}");
            ExitCode::from(err.downcast_ref::<ExitCode2>().map(|_| 2).unwrap_or(1))
        }
    }
}

/// Marker wrapped around an error to request exit code 2 (runtime
/// initialization failure) instead of the default 1 (configuration error).
#[derive(Debug)]
struct ExitCode2;

impl std::fmt::Display for ExitCode2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime initialization failed")
    }
}
impl std::error::Error for ExitCode2 {}

fn runtime_err(e: impl Into<anyhow::Error>) -> anyhow::Error {
    e.into().context(ExitCode2)
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(cli: Cli) -> Result<()> {
    cli::validate(&cli).context("command line error")?;

    pgc_faultshield::install().map_err(runtime_err)?;
    let page_size = page_size().map_err(runtime_err)?;

    let resident_set_size = cli
        .resident_set_size
        .as_deref()
        .map(cli::parse_size)
        .transpose()
        .context("command line error")?;
    let non_evictable_set_size = cli
        .non_evictable_set_size
        .as_deref()
        .map(cli::parse_size)
        .transpose()
        .context("command line error")?;
    let transient_refill_period = cli
        .transient_refill_period
        .as_deref()
        .map(cli::parse_period)
        .transpose()
        .context("command line error")?;

    let launch_meminfo_reporter = resident_set_size.is_none() && transient_refill_period.is_some();

    let mut running = Running::default();

    if launch_meminfo_reporter {
        running.meminfo = Some(pgc_meminfo::Reporter::start(page_size as u64, MEMINFO_REPORT_INTERVAL));
    }

    if let Some(victim_file) = &cli.victim_file {
        running.victim = Some(
            VictimChecker::open(victim_file, page_size, cli.map_victim_exec)
                .map_err(runtime_err)
                .context("failed to open victim file")?,
        );
    }

    let mut pager_to_start = None;
    if let (Some(pool_file), Some(period)) = (&cli.transient_pool_file, transient_refill_period) {
        pager_to_start = Some(
            TransientPager::open(pool_file, page_size, period, cli.map_transient_exec)
                .map_err(runtime_err)
                .context("failed to open transient pool file")?,
        );
    }

    let mut keeper_handoff = None;
    if let Some(resident_bytes) = resident_set_size {
        let target_n_pages = div_round_up(resident_bytes, page_size as u64) as usize;
        let config = KeeperConfig {
            target_n_pages,
            directories: cli.resident_set_directories.clone(),
            fillup_file: cli.resident_set_fillup_file.clone(),
            map_executable: cli.map_resident_exec,
            refresh_only_resident: cli.refresh_only_resident,
            launch_rewarmer: cli.launch_resident_rewarmer,
            rt_sched_refresher: cli.rt_sched_refresher,
            ..KeeperConfig::default()
        };

        let mut keeper = Keeper::new(&config).map_err(runtime_err)?;

        if let Some(fillup) = &cli.resident_set_fillup_file {
            keeper.set_fillup_file(fillup).map_err(runtime_err)?;
        }

        if !cli.resident_set_directories.is_empty() {
            info!("searching for resident files...");
        }
        for dir in &cli.resident_set_directories {
            keeper.scan_directory(Path::new(dir)).map_err(runtime_err)?;
        }
        if !cli.resident_set_directories.is_empty() {
            let stats = keeper.stats();
            info!(
                n_pages = stats.n_pages,
                n_pages_executable = stats.n_pages_executable,
                "found resident pages"
            );
        }

        keeper_handoff = Some(keeper);
    }

    if let Some(non_evictable_bytes) = non_evictable_set_size {
        running.hog = Some(Hog::allocate(non_evictable_bytes as usize, page_size).map_err(runtime_err)?);
    }

    if let Some(mut keeper) = keeper_handoff {
        let active_n_pages = Arc::new(AtomicUsize::new(0));
        keeper.warmup(&active_n_pages);
        running.keeper = Some(keeper.start(active_n_pages));
    }

    if let Some(pager) = pager_to_start {
        running.pager = Some(pager.start());
    }

    let (quit_tx, quit_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = quit_tx.send(());
    })
    .map_err(runtime_err)?;

    let outcome = if let Some(victim) = running.victim.as_mut() {
        measure_victim_until_interrupted(victim, &quit_rx)
    } else {
        quit_rx.recv().ok();
        Ok(())
    };

    running.shutdown();
    outcome
}

fn measure_victim_until_interrupted(victim: &mut VictimChecker, quit_rx: &mpsc::Receiver<()>) -> Result<()> {
    loop {
        if quit_rx.try_recv().is_ok() {
            return Ok(());
        }
        info!("making measurement");
        let elapsed = victim.measure_one().map_err(runtime_err)?;
        info!(eviction_ms = elapsed.as_millis() as u64, "victim page evicted");
        if quit_rx.recv_timeout(VICTIM_MEASUREMENT_INTERVAL).is_ok() {
            return Ok(());
        }
    }
}

fn div_round_up(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}
