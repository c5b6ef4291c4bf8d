//! Boucle d'événements principale: généralise le modèle
//! "poll-avec-timeout-puis-vérifier-le-flag-d'arrêt" de `server.rs::run`
//! (teacher) à deux sources (socket NTP, liaison série GPS) plus un tic par
//! seconde écoulée.

use crate::clock::DisciplinedClock;
use crate::clock_discipline::ClockDiscipline;
use crate::net_io::NetIo;
use crate::nmea::{DecodeOutcome, NmeaDecoder};
use crate::ntp_engine::NtpEngine;
use crate::serial_link::SerialLink;
use crate::shared::tables::{GpsState, MAX_NAME_LEN, MAX_TEXT_LEN, NmeaSentence};
use crate::shared::TableHandle;
use anyhow::Result;
use chrono::Utc;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

const GPS_EXPIRES_SECS: u64 = 5;
const WATCHDOG_GRACE_SECS: u64 = 15;

pub struct Supervisor {
    net_io: NetIo,
    serial: Option<SerialLink>,
    decoder: NmeaDecoder,
    engine: NtpEngine,
    discipline: ClockDiscipline,
    clock: Arc<DisciplinedClock>,
    gps_state: TableHandle<GpsState>,
    nmea_active: Arc<AtomicBool>,
    latency_ms: i64,
    show_nmea: bool,
    started_at: Instant,
    started_at_wall_ms: i64,
    last_tick_secs: Option<i64>,
    text_ring_head: u32,
    sentence_ring_head: u32,
    status_child: Option<Child>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        net_io: NetIo,
        serial: Option<SerialLink>,
        decoder: NmeaDecoder,
        engine: NtpEngine,
        discipline: ClockDiscipline,
        clock: Arc<DisciplinedClock>,
        gps_state: TableHandle<GpsState>,
        nmea_active: Arc<AtomicBool>,
        latency_ms: i64,
        show_nmea: bool,
        status_child: Option<Child>,
        gps_device: Option<&str>,
    ) -> Self {
        if let Some(device) = gps_device {
            let mut rec = gps_state.get(0).unwrap_or_default();
            let bytes = device.as_bytes();
            let n = bytes.len().min(rec.device.len());
            rec.device = [0u8; MAX_NAME_LEN];
            rec.device[..n].copy_from_slice(&bytes[..n]);
            rec.device_len = n as u16;
            gps_state.set(0, rec);
        }

        Supervisor {
            net_io,
            serial,
            decoder,
            engine,
            discipline,
            clock,
            gps_state,
            nmea_active,
            latency_ms,
            show_nmea,
            started_at: Instant::now(),
            started_at_wall_ms: now_ms(),
            last_tick_secs: None,
            text_ring_head: 0,
            sentence_ring_head: 0,
            status_child,
        }
    }

    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!("supervisor event loop starting");
        let mut buf = [0u8; 512];

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, stopping supervisor");
                break;
            }

            match self.net_io.recv_from(&mut buf) {
                Ok((size, addr)) => {
                    let t_read = Instant::now();
                    let t_read_wall = Utc::now();
                    if let Err(e) = self.engine.process(
                        &self.net_io,
                        &buf[..size],
                        addr,
                        t_read,
                        t_read_wall,
                        &mut self.discipline,
                        self.clock.as_ref(),
                    ) {
                        warn!("error handling NTP datagram from {}: {:#}", addr, e);
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock
                        && e.kind() != std::io::ErrorKind::TimedOut
                    {
                        warn!("NTP socket read error: {}", e);
                    }
                }
            }

            self.poll_gps();
            self.maybe_tick()?;
        }

        info!("supervisor event loop stopped");
        Ok(())
    }

    fn poll_gps(&mut self) {
        let Some(serial) = self.serial.as_mut() else {
            return;
        };
        serial.listen();
        match serial.read() {
            Ok(Some(bytes)) => {
                let t_read = Instant::now();
                let outcome = self.decoder.process_read(&bytes, t_read);
                self.apply_outcome(outcome);
            }
            Ok(None) => {}
            Err(e) => warn!("GPS serial read error: {}", e),
        }
    }

    fn apply_outcome(&mut self, outcome: DecodeOutcome) {
        for event in &outcome.discipline_events {
            if let Err(e) = self.discipline.discipline(event.source_utc, event.local_reference, self.latency_ms) {
                error!("clock discipline failed: {}", e);
            }
            self.nmea_active.store(true, Ordering::Relaxed);
        }

        if let Some(fix) = outcome.fix {
            let mut rec = self.gps_state.get(0).unwrap_or_default();
            rec.fix = fix.valid as u8;
            if fix.valid {
                rec.lat = fix.lat;
                rec.lon = fix.lon;
                rec.ns = fix.ns;
                rec.ew = fix.ew;
                rec.date = fix.date;
                rec.time = fix.time;
                rec.fix_acquired_at_ms = now_ms();
            }
            self.gps_state.set(0, rec);
        }

        for line in &outcome.text_lines {
            self.push_text_line(line);
        }
        for (text, flags, t_dollar) in &outcome.raw_sentences {
            if self.show_nmea {
                tracing::debug!("nmea: {}", text);
            }
            self.push_sentence(text, *flags, *t_dollar);
        }
    }

    fn push_text_line(&mut self, line: &str) {
        let mut rec = self.gps_state.get(0).unwrap_or_default();
        let idx = self.text_ring_head as usize % rec.text_ring.len();
        let bytes = line.as_bytes();
        let n = bytes.len().min(MAX_TEXT_LEN);
        rec.text_ring[idx] = [0u8; MAX_TEXT_LEN];
        rec.text_ring[idx][..n].copy_from_slice(&bytes[..n]);
        rec.text_ring_len[idx] = n as u16;
        self.text_ring_head = self.text_ring_head.wrapping_add(1);
        rec.text_ring_head = self.text_ring_head;
        self.gps_state.set(0, rec);
    }

    fn push_sentence(&mut self, text: &str, flags: u8, t_dollar: Instant) {
        let mut rec = self.gps_state.get(0).unwrap_or_default();
        let idx = self.sentence_ring_head as usize % rec.sentence_ring.len();
        let t_dollar_ms = self.started_at_wall_ms
            + t_dollar.saturating_duration_since(self.started_at).as_millis() as i64;
        rec.sentence_ring[idx] = NmeaSentence::from_str(text, flags, t_dollar_ms);
        self.sentence_ring_head = self.sentence_ring_head.wrapping_add(1);
        rec.sentence_ring_head = self.sentence_ring_head;
        self.gps_state.set(0, rec);
    }

    fn maybe_tick(&mut self) -> Result<()> {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        if self.last_tick_secs == Some(now_secs) {
            return Ok(());
        }
        self.last_tick_secs = Some(now_secs);

        self.engine
            .periodic(&self.net_io, SystemTime::now(), &self.discipline, self.clock.as_ref())?;

        if self.serial.is_some() {
            self.run_watchdog();
        }

        self.reap_status_child();
        Ok(())
    }

    fn run_watchdog(&mut self) {
        if self.started_at.elapsed().as_secs() < WATCHDOG_GRACE_SECS {
            return;
        }
        let stale = self
            .decoder
            .seconds_since_last_fix_sentence()
            .map(|secs| secs > GPS_EXPIRES_SECS)
            .unwrap_or(true);
        if stale {
            if self.nmea_active.swap(false, Ordering::Relaxed) {
                warn!("no fresh GPS fix sentence in {}s, marking GPS inactive", GPS_EXPIRES_SECS);
            }
            if let Some(serial) = self.serial.as_mut() {
                if serial.is_open() {
                    warn!("closing stale GPS link, will retry on next listen()");
                    serial.close();
                }
            }
        }
    }

    fn reap_status_child(&mut self) {
        let Some(child) = self.status_child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                error!("status process exited unexpectedly ({}), shutting down", status);
                std::process::exit(1);
            }
            Ok(None) => {}
            Err(e) => warn!("failed to poll status process: {}", e),
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmea::DecodedFix;
    use crate::ntp_engine::NtpEngineConfig;
    use crate::shared::{SharedArena, Tables};

    fn make_supervisor(name: &str, port: u16) -> (SharedArena, Supervisor) {
        let arena = SharedArena::create(name, 1024 * 1024).unwrap();
        let tables = Tables::create(&arena).unwrap();
        let nmea_active = Arc::new(AtomicBool::new(false));
        let net_io = NetIo::bind(&port.to_string()).unwrap();
        let engine = NtpEngine::new(
            tables.ntp_server_pool,
            tables.ntp_client_log,
            tables.ntp_traffic,
            tables.ntp_status,
            Arc::clone(&nmea_active),
            NtpEngineConfig {
                broadcast_period_secs: 300,
                broadcast_without_gps: false,
                test_mode: true,
                calibration_host: None,
                ip_whitelist: vec![],
                ip_blacklist: vec![],
                max_requests_per_second: 0,
            },
        )
        .unwrap();
        let discipline = ClockDiscipline::new(10, true, false, tables.clock_status, tables.clock_metrics);
        let clock = Arc::new(DisciplinedClock::new(discipline.synchronized_flag(), -20));
        let supervisor = Supervisor::new(
            net_io,
            None,
            NmeaDecoder::new(false),
            engine,
            discipline,
            clock,
            tables.gps_state,
            nmea_active,
            0,
            false,
            None,
            None,
        );
        (arena, supervisor)
    }

    #[test]
    fn test_apply_outcome_publishes_valid_fix() {
        let (_arena, mut supervisor) = make_supervisor("housetime-test-supervisor-fix", 17400);
        let outcome = DecodeOutcome {
            discipline_events: vec![],
            fix: Some(DecodedFix {
                valid: true,
                lat: 48.1,
                lon: 11.5,
                ns: b'N',
                ew: b'E',
                date: 230394,
                time: 123519,
                satellites: None,
            }),
            raw_sentences: vec![],
            text_lines: vec![],
        };
        supervisor.apply_outcome(outcome);
        let rec = supervisor.gps_state.get(0).unwrap();
        assert_eq!(rec.fix, 1);
        assert_eq!(rec.date, 230394);
    }

    #[test]
    fn test_push_sentence_advances_ring_head() {
        let (_arena, mut supervisor) = make_supervisor("housetime-test-supervisor-ring", 17401);
        supervisor.push_sentence("$GPRMC,test*00", 0, Instant::now());
        let rec = supervisor.gps_state.get(0).unwrap();
        assert_eq!(rec.sentence_ring_head, 1);
    }

    #[test]
    fn test_watchdog_clears_nmea_active_when_stale() {
        let (_arena, mut supervisor) = make_supervisor("housetime-test-supervisor-watchdog", 17402);
        supervisor.serial = Some(SerialLink::new("/dev/null-does-not-exist".to_string(), vec![9600]));
        supervisor.nmea_active.store(true, Ordering::Relaxed);
        supervisor.started_at = Instant::now() - std::time::Duration::from_secs(WATCHDOG_GRACE_SECS + 1);
        supervisor.run_watchdog();
        assert!(!supervisor.nmea_active.load(Ordering::Relaxed));
    }
}
