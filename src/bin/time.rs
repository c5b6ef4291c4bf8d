//! `housetimed`: le process Time. Lit la ligne de commande, ouvre l'arène
//! mémoire partagée, démarre la liaison GPS si configurée, et fait tourner
//! le superviseur jusqu'à l'arrêt.

use anyhow::{Context, Result};
use housetime::clock::DisciplinedClock;
use housetime::clock_discipline::ClockDiscipline;
use housetime::config::{Cli, ConfigError, USAGE};
use housetime::net_io::NetIo;
use housetime::nmea::NmeaDecoder;
use housetime::ntp_engine::{NtpEngine, NtpEngineConfig};
use housetime::serial_link::SerialLink;
use housetime::shared::{SharedArena, Tables, ARENA_NAME, DEFAULT_ARENA_SIZE};
use housetime::supervisor::Supervisor;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let cli = match Cli::parse(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(ConfigError::HelpRequested) => {
            println!("{USAGE}");
            return Ok(());
        }
        Err(e) => {
            eprintln!("{e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    init_logging(cli.debug)?;
    info!("housetimed starting");

    let arena = SharedArena::create(ARENA_NAME, (cli.db_megabytes as usize) * DEFAULT_ARENA_SIZE)
        .context("failed to create shared memory arena")?;
    let tables = Tables::create(&arena).context("failed to create shared tables")?;

    let nmea_active = Arc::new(AtomicBool::new(false));

    let discipline = ClockDiscipline::new(
        cli.precision_ms,
        cli.test_mode,
        cli.drift_log,
        tables.clock_status,
        tables.clock_metrics,
    );
    let clock = Arc::new(DisciplinedClock::new(discipline.synchronized_flag(), precision_log2(cli.precision_ms)));

    let serial = cli.gps_device.as_ref().map(|device| {
        info!("GPS device configured: {}", device.display());
        SerialLink::new(device.display().to_string(), cli.baud_candidates.clone())
    });
    let decoder = NmeaDecoder::new(cli.privacy);

    let net_io = NetIo::bind(&cli.ntp_service).context("failed to bind NTP service")?;
    let engine = NtpEngine::new(
        tables.ntp_server_pool,
        tables.ntp_client_log,
        tables.ntp_traffic,
        tables.ntp_status,
        Arc::clone(&nmea_active),
        NtpEngineConfig {
            broadcast_period_secs: cli.ntp_period_secs,
            broadcast_without_gps: cli.ntp_broadcast,
            test_mode: cli.test_mode,
            calibration_host: cli.ntp_reference.clone(),
            ip_whitelist: vec![],
            ip_blacklist: vec![],
            max_requests_per_second: 0,
        },
    )?;

    let status_child = spawn_status_process(&cli.http_service);

    let mut supervisor = Supervisor::new(
        net_io,
        serial,
        decoder,
        engine,
        discipline,
        clock,
        tables.gps_state,
        nmea_active,
        cli.latency_ms,
        cli.show_nmea,
        status_child,
        cli.gps_device.as_ref().map(|p| p.display().to_string()).as_deref(),
    );

    let shutdown = install_shutdown_handler()?;

    info!("housetimed ready, press Ctrl+C twice (within 5 seconds) to stop");
    if let Err(e) = supervisor.run(shutdown) {
        error!("supervisor error: {:#}", e);
        return Err(e);
    }

    Ok(())
}

/// `precision_ms` (arrondi à la puissance de deux la plus proche en
/// secondes) -> exposant log2 signé attendu par le champ `precision` du
/// paquet NTP.
fn precision_log2(precision_ms: i64) -> i8 {
    let secs = (precision_ms.max(1) as f64) / 1000.0;
    secs.log2().round().clamp(i8::MIN as f64, -1.0) as i8
}

fn spawn_status_process(http_service: &str) -> Option<std::process::Child> {
    match std::process::Command::new(std::env::current_exe().ok()?.with_file_name("housetime-status"))
        .arg(format!("-http-service={http_service}"))
        .spawn()
    {
        Ok(child) => Some(child),
        Err(e) => {
            warn!("failed to spawn status process: {}", e);
            None
        }
    }
}

fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    let press_count = Arc::new(AtomicU8::new(0));
    let press_count_clone = Arc::clone(&press_count);

    ctrlc::set_handler(move || {
        let count = press_count_clone.fetch_add(1, Ordering::SeqCst);
        if count == 0 {
            warn!("Ctrl+C received. Press again within 5 seconds to stop housetimed.");
            let disarm = Arc::clone(&press_count_clone);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(5));
                if disarm.load(Ordering::SeqCst) == 1 {
                    disarm.store(0, Ordering::SeqCst);
                    info!("shutdown cancelled");
                }
            });
        } else {
            warn!("shutdown confirmed, stopping");
            shutdown_clone.store(true, Ordering::SeqCst);
            std::thread::spawn(|| {
                std::thread::sleep(std::time::Duration::from_secs(2));
                error!("forced exit (shutdown timeout)");
                std::process::exit(0);
            });
        }
    })
    .context("failed to install Ctrl+C handler")?;

    Ok(shutdown)
}

fn init_logging(debug: bool) -> Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("failed to build log filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}
