//! Discipline de l'horloge système à partir d'une source de temps de
//! référence (GPS ou pair NTP). Grounded sur l'idiome FFI de
//! `zbynekdrlik-dantetimesync`'s `src/clock/linux.rs` (`settimeofday`,
//! `adjtime`), que le teacher n'a pas: `SystemClock` ne fait que lire
//! l'heure, jamais l'ajuster.

use crate::shared::tables::ClockStatus as SharedClockStatus;
use crate::shared::TableHandle;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const HARD_SET_THRESHOLD_MS: i64 = 10_000;
const SAMPLING_SATURATION: u64 = 1_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ClockDisciplineError {
    #[error("failed to set system time: {0}")]
    SetTime(std::io::Error),
    #[error("failed to slew system time: {0}")]
    Slew(std::io::Error),
}

/// Discipline de l'horloge: accumulateur d'apprentissage, seuil de hard-set,
/// estimation de la période d'échantillonnage, hygiène des métriques.
pub struct ClockDiscipline {
    precision_ms: i64,
    test_mode: bool,
    log_corrections: bool,

    synchronized: Arc<AtomicBool>,
    first_call: bool,

    accumulator_ms: i64,
    learning_count: u32,
    last_avg_drift_ms: i64,

    reference_instant_ms: i64,
    last_wall_sec: Option<i64>,

    sampling_total_ms: u64,
    sampling_count: u64,
    sampling_period_ms: i64,
    last_call_instant: Option<Instant>,

    status_table: TableHandle<SharedClockStatus>,
    metrics_table: TableHandle<crate::shared::tables::ClockMetric>,
}

impl ClockDiscipline {
    pub fn new(
        precision_ms: i64,
        test_mode: bool,
        log_corrections: bool,
        status_table: TableHandle<SharedClockStatus>,
        metrics_table: TableHandle<crate::shared::tables::ClockMetric>,
    ) -> Self {
        ClockDiscipline {
            precision_ms,
            test_mode,
            log_corrections,
            synchronized: Arc::new(AtomicBool::new(false)),
            first_call: true,
            accumulator_ms: 0,
            learning_count: 0,
            last_avg_drift_ms: 0,
            reference_instant_ms: 0,
            last_wall_sec: None,
            sampling_total_ms: 0,
            sampling_count: 0,
            sampling_period_ms: 0,
            last_call_instant: None,
            status_table,
            metrics_table,
        }
    }

    pub fn synchronized_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.synchronized)
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Relaxed)
    }

    pub fn reference(&self) -> i64 {
        self.reference_instant_ms
    }

    /// Écart moyen de la dernière évaluation de la fenêtre d'apprentissage
    /// (utilisé par `NtpEngine` pour annoncer la dispersion).
    pub fn dispersion_ms(&self) -> i64 {
        self.last_avg_drift_ms.abs()
    }

    /// Discipline l'horloge avec un point de référence `(source_utc,
    /// local_capture)`. `latency_ms` compense un retard de parcours connu
    /// (GPS: latence de trame; réseau: généralement 0, le round-trip étant
    /// déjà pris en compte par l'appelant).
    pub fn discipline(
        &mut self,
        source_utc: DateTime<Utc>,
        local_capture: Instant,
        latency_ms: i64,
    ) -> Result<(), ClockDisciplineError> {
        let now_instant = Instant::now();
        let wall_now = SystemTime::now();
        let elapsed = now_instant.saturating_duration_since(local_capture);

        self.update_sampling_period(now_instant);
        self.zero_skipped_metrics(wall_now);

        let wall_now_ms = wall_now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let source_ms = source_utc.timestamp_millis();
        let drift_ms = source_ms - (wall_now_ms - elapsed.as_millis() as i64) + latency_ms;

        self.record_metric(wall_now, drift_ms);

        if self.first_call || drift_ms.abs() >= HARD_SET_THRESHOLD_MS {
            self.hard_set(source_utc, elapsed, latency_ms)?;
            self.first_call = false;
            self.accumulator_ms = 0;
            self.learning_count = 0;
            self.synchronized.store(true, Ordering::Relaxed);
            self.reference_instant_ms = wall_now_ms + drift_ms;
            if self.log_corrections {
                info!("clock hard-set, drift was {}ms", drift_ms);
            }
            self.publish_status();
            return Ok(());
        }

        self.accumulator_ms += drift_ms;
        self.learning_count += 1;

        let gated_by_latency = latency_ms > 0;
        let window = if gated_by_latency { 10 } else { 1 };
        if self.learning_count < window {
            self.publish_status();
            return Ok(());
        }

        let avg = self.accumulator_ms / self.learning_count as i64;
        self.last_avg_drift_ms = avg;

        if avg.abs() < self.precision_ms {
            self.synchronized.store(true, Ordering::Relaxed);
        } else {
            self.slew(avg)?;
            self.reference_instant_ms = wall_now_ms;
            if avg.abs() > 50 * self.precision_ms {
                self.synchronized.store(false, Ordering::Relaxed);
            }
            if self.log_corrections {
                debug!("clock slewed by {}ms (avg over {} samples)", avg, self.learning_count);
            }
        }

        self.accumulator_ms = 0;
        self.learning_count = 0;
        self.publish_status();
        Ok(())
    }

    fn update_sampling_period(&mut self, now_instant: Instant) {
        if let Some(last) = self.last_call_instant {
            let ms = now_instant.saturating_duration_since(last).as_millis() as u64;
            self.sampling_total_ms += ms;
            self.sampling_count += 1;
            if self.sampling_total_ms > SAMPLING_SATURATION || self.sampling_count > SAMPLING_SATURATION
            {
                self.sampling_total_ms /= 2;
                self.sampling_count = (self.sampling_count / 2).max(1);
            }
            self.sampling_period_ms =
                ((self.sampling_total_ms + self.sampling_count / 2) / self.sampling_count) as i64;
        }
        self.last_call_instant = Some(now_instant);
    }

    fn zero_skipped_metrics(&mut self, wall_now: SystemTime) {
        let wall_sec = wall_now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        if let Some(last_sec) = self.last_wall_sec {
            let len = self.metrics_table.len() as i64;
            let mut sec = last_sec + 1;
            while sec < wall_sec {
                let idx = (sec.rem_euclid(len)) as usize;
                self.metrics_table.set(
                    idx,
                    crate::shared::tables::ClockMetric {
                        drift_ms: 0,
                        adjust_count: 0,
                        _pad: 0,
                    },
                );
                sec += 1;
            }
        }
        self.last_wall_sec = Some(wall_sec);
    }

    fn record_metric(&mut self, wall_now: SystemTime, drift_ms: i64) {
        let wall_sec = wall_now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let len = self.metrics_table.len() as i64;
        let idx = (wall_sec.rem_euclid(len)) as usize;
        let mut rec = self.metrics_table.get(idx).unwrap_or_default();
        rec.drift_ms = drift_ms;
        rec.adjust_count += 1;
        self.metrics_table.set(idx, rec);
    }

    fn publish_status(&self) {
        let rec = SharedClockStatus {
            synchronized: self.is_synchronized() as u8,
            _pad: [0; 7],
            precision_ms: self.precision_ms,
            reference_instant_ms: self.reference_instant_ms,
            last_drift_ms: self.last_avg_drift_ms,
            last_avg_drift_ms: self.last_avg_drift_ms,
            learning_count: self.learning_count,
            accumulator_ms: self.accumulator_ms,
            sampling_period_ms: self.sampling_period_ms,
        };
        self.status_table.set(0, rec);
    }

    #[cfg(target_os = "linux")]
    fn hard_set(
        &self,
        source_utc: DateTime<Utc>,
        elapsed: std::time::Duration,
        latency_ms: i64,
    ) -> Result<(), ClockDisciplineError> {
        if self.test_mode {
            return Ok(());
        }
        let corrected = source_utc
            + chrono::Duration::from_std(elapsed).unwrap_or_default()
            + chrono::Duration::milliseconds(latency_ms);
        let tv = libc::timeval {
            tv_sec: corrected.timestamp() as libc::time_t,
            tv_usec: (corrected.timestamp_subsec_micros()) as libc::suseconds_t,
        };
        let ret = unsafe { libc::settimeofday(&tv, std::ptr::null()) };
        if ret != 0 {
            return Err(ClockDisciplineError::SetTime(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn slew(&self, drift_ms: i64) -> Result<(), ClockDisciplineError> {
        if self.test_mode {
            return Ok(());
        }
        let delta = libc::timeval {
            tv_sec: (drift_ms / 1000) as libc::time_t,
            tv_usec: ((drift_ms % 1000) * 1000) as libc::suseconds_t,
        };
        let ret = unsafe { libc::adjtime(&delta, std::ptr::null_mut()) };
        if ret != 0 {
            return Err(ClockDisciplineError::Slew(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn hard_set(
        &self,
        _source_utc: DateTime<Utc>,
        _elapsed: std::time::Duration,
        _latency_ms: i64,
    ) -> Result<(), ClockDisciplineError> {
        warn!("clock hard-set is a no-op on this platform");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn slew(&self, _drift_ms: i64) -> Result<(), ClockDisciplineError> {
        warn!("clock slew is a no-op on this platform");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{SharedArena, Tables};

    fn make_discipline(name: &str, precision_ms: i64) -> (SharedArena, ClockDiscipline) {
        let arena = SharedArena::create(name, 1024 * 1024).unwrap();
        let tables = Tables::create(&arena).unwrap();
        let discipline = ClockDiscipline::new(
            precision_ms,
            true,
            false,
            tables.clock_status,
            tables.clock_metrics,
        );
        (arena, discipline)
    }

    #[test]
    fn test_first_call_hard_sets_and_synchronizes() {
        let (_arena, mut d) = make_discipline("housetime-test-cd-first", 10);
        d.discipline(Utc::now(), Instant::now(), 0).unwrap();
        assert!(d.is_synchronized());
    }

    #[test]
    fn test_large_drift_forces_hard_set() {
        let (_arena, mut d) = make_discipline("housetime-test-cd-large", 10);
        d.discipline(Utc::now(), Instant::now(), 0).unwrap();
        assert!(d.is_synchronized());

        let far_future = Utc::now() + chrono::Duration::seconds(20);
        d.discipline(far_future, Instant::now(), 0).unwrap();
        assert!(d.is_synchronized());
    }

    #[test]
    fn test_average_rounds_toward_zero() {
        let (_arena, mut d) = make_discipline("housetime-test-cd-avg", 10);
        d.discipline(Utc::now(), Instant::now(), 0).unwrap(); // hard-set, resets accumulator

        let drifts = [8i64, -7, 9, -6, 8, -7, 9, -6, 8, -7];
        for drift in drifts {
            let source = Utc::now() + chrono::Duration::milliseconds(drift);
            // latency_ms=5 gates on the 10-sample learning window like GPS sources
            d.discipline(source, Instant::now(), 5).unwrap();
        }
        assert_eq!(d.last_avg_drift_ms, 0);
    }

    #[test]
    fn test_dispersion_reflects_last_average() {
        let (_arena, mut d) = make_discipline("housetime-test-cd-disp", 1);
        d.discipline(Utc::now(), Instant::now(), 0).unwrap();
        d.discipline(Utc::now() + chrono::Duration::milliseconds(3), Instant::now(), 0)
            .unwrap();
        assert_eq!(d.dispersion_ms(), 3);
    }
}
