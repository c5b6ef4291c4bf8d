//! `housetime-status`: le process Status. Ouvre l'arène partagée en lecture
//! seule et sert des instantanés texte/JSON, indépendamment du process Time
//! qui l'a créée. S'arrête de lui-même si le process parent (Time) meurt.

use anyhow::{Context, Result};
use housetime::shared::{SharedArena, Tables, ARENA_NAME};
use housetime::status::StatusSnapshot;
use std::io::Write as _;
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PARENT_CHECK_INTERVAL: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    init_logging()?;
    info!("housetime-status starting");

    let http_service = std::env::args()
        .find_map(|a| a.strip_prefix("-http-service=").map(str::to_string))
        .unwrap_or_else(|| "8080".to_string());

    let arena = SharedArena::open_readonly(ARENA_NAME).context("failed to open shared memory arena")?;
    let tables = Tables::open(&arena).context("failed to open shared tables")?;

    let listener = bind_status_service(&http_service)?;
    listener
        .set_nonblocking(true)
        .context("failed to set status listener non-blocking")?;

    let parent_pid = parent_pid();
    let mut last_parent_check = std::time::Instant::now();

    info!("housetime-status ready on {}", http_service);
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = serve_snapshot(stream, &tables) {
                    warn!("failed to serve status snapshot to {}: {}", peer, e);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("status listener accept error: {}", e),
        }

        if last_parent_check.elapsed() >= PARENT_CHECK_INTERVAL {
            last_parent_check = std::time::Instant::now();
            if !parent_alive(parent_pid) {
                error!("Time process ({}) is gone, stopping housetime-status", parent_pid);
                std::process::exit(1);
            }
        }

        std::thread::sleep(Duration::from_millis(200));
    }
}

fn bind_status_service(service: &str) -> Result<TcpListener> {
    let port: u16 = service
        .parse()
        .with_context(|| format!("invalid -http-service value: {service}"))?;
    TcpListener::bind(("0.0.0.0", port)).with_context(|| format!("failed to bind status service on port {port}"))
}

fn serve_snapshot(mut stream: TcpStream, tables: &Tables) -> std::io::Result<()> {
    let snapshot = StatusSnapshot::capture(tables, now_ms());
    let body = snapshot.render_json().unwrap_or_else(|_| "{}".to_string());
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(target_os = "linux")]
fn parent_pid() -> libc::pid_t {
    unsafe { libc::getppid() }
}

#[cfg(not(target_os = "linux"))]
fn parent_pid() -> u32 {
    std::process::id()
}

#[cfg(target_os = "linux")]
fn parent_alive(pid: libc::pid_t) -> bool {
    // Le PPID retombe à 1 (init/reaper) quand le process Time d'origine a
    // disparu et que ce process Status a été réadopté.
    pid != 1 && unsafe { libc::kill(pid, 0) } == 0
}

#[cfg(not(target_os = "linux"))]
fn parent_alive(_pid: u32) -> bool {
    true
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to build log filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}
