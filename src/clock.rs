use crate::packet::NtpTimestamp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Différence entre l'epoch NTP (1900-01-01) et l'epoch Unix (1970-01-01) en secondes
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Trait pour les sources d'horloge
pub trait ClockSource: Send + Sync {
    /// Retourne le temps actuel sous forme de timestamp NTP
    fn now(&self) -> NtpTimestamp;

    /// Retourne le type de source d'horloge (pour reference_identifier)
    fn reference_id(&self) -> [u8; 4];

    /// Retourne le stratum (0 pour non synchronisé, 1 pour source primaire)
    fn stratum(&self) -> u8;

    /// Retourne la précision estimée en log2 secondes (ex: -20 = ~1µs)
    fn precision(&self) -> i8;
}

/// Horloge système haute précision
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        SystemClock
    }

    /// Obtient le temps avec la meilleure précision disponible sur la plateforme
    #[cfg(target_os = "windows")]
    fn get_precise_time() -> (u64, u32) {
        // Sur Windows, utiliser GetSystemTimePreciseAsFileTime via SystemTime
        // SystemTime::now() utilise déjà cette API sur Windows 8+
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System time before UNIX epoch");

        let unix_seconds = duration.as_secs();
        let nanos = duration.subsec_nanos();

        // Convertir en temps NTP (depuis 1900)
        let ntp_seconds = unix_seconds + NTP_UNIX_OFFSET;

        (ntp_seconds, nanos)
    }

    #[cfg(target_os = "linux")]
    fn get_precise_time() -> (u64, u32) {
        use libc::{clock_gettime, timespec, CLOCK_REALTIME};
        use std::mem::MaybeUninit;

        unsafe {
            let mut ts = MaybeUninit::<timespec>::uninit();
            if clock_gettime(CLOCK_REALTIME, ts.as_mut_ptr()) == 0 {
                let ts = ts.assume_init();
                let unix_seconds = ts.tv_sec as u64;
                let nanos = ts.tv_nsec as u32;

                // Convertir en temps NTP
                let ntp_seconds = unix_seconds + NTP_UNIX_OFFSET;
                (ntp_seconds, nanos)
            } else {
                // Fallback vers SystemTime
                Self::fallback_time()
            }
        }
    }

    #[cfg(target_os = "macos")]
    fn get_precise_time() -> (u64, u32) {
        use libc::{clock_gettime, timespec, CLOCK_REALTIME};
        use std::mem::MaybeUninit;

        unsafe {
            let mut ts = MaybeUninit::<timespec>::uninit();
            if clock_gettime(CLOCK_REALTIME, ts.as_mut_ptr()) == 0 {
                let ts = ts.assume_init();
                let unix_seconds = ts.tv_sec as u64;
                let nanos = ts.tv_nsec as u32;

                let ntp_seconds = unix_seconds + NTP_UNIX_OFFSET;
                (ntp_seconds, nanos)
            } else {
                Self::fallback_time()
            }
        }
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    fn get_precise_time() -> (u64, u32) {
        Self::fallback_time()
    }

    #[allow(dead_code)]
    fn fallback_time() -> (u64, u32) {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System time before UNIX epoch");

        let unix_seconds = duration.as_secs();
        let nanos = duration.subsec_nanos();
        let ntp_seconds = unix_seconds + NTP_UNIX_OFFSET;

        (ntp_seconds, nanos)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn now(&self) -> NtpTimestamp {
        let (seconds, nanos) = Self::get_precise_time();
        NtpTimestamp::from_seconds_and_nanos(seconds, nanos)
    }

    fn reference_id(&self) -> [u8; 4] {
        // "LOCL" pour horloge locale non synchronisée
        *b"LOCL"
    }

    fn stratum(&self) -> u8 {
        // Stratum 16 = non synchronisé (horloge locale seulement)
        16
    }

    fn precision(&self) -> i8 {
        // Précision typique d'horloge système: ~100ns = 2^-23
        #[cfg(target_os = "windows")]
        return -23; // ~119ns

        #[cfg(target_os = "linux")]
        return -24; // ~60ns avec CLOCK_REALTIME

        #[cfg(target_os = "macos")]
        return -24;

        #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
        return -20; // ~1µs par défaut
    }
}

/// Source d'horloge pour les réponses NTP une fois le GPS en jeu: le temps
/// lui-même est lu sur l'horloge système (déjà disciplinée par
/// `ClockDiscipline` via `settimeofday`/`adjtime`), mais stratum et
/// reference_id reflètent l'état de synchronisation courant.
pub struct DisciplinedClock {
    system_clock: SystemClock,
    synchronized: Arc<AtomicBool>,
    precision_log2: i8,
}

impl DisciplinedClock {
    pub fn new(synchronized: Arc<AtomicBool>, precision_log2: i8) -> Self {
        DisciplinedClock {
            system_clock: SystemClock::new(),
            synchronized,
            precision_log2,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Relaxed)
    }
}

impl ClockSource for DisciplinedClock {
    fn now(&self) -> NtpTimestamp {
        self.system_clock.now()
    }

    fn reference_id(&self) -> [u8; 4] {
        if self.is_synchronized() {
            *b"GPS\0"
        } else {
            *b"LOCL"
        }
    }

    fn stratum(&self) -> u8 {
        if self.is_synchronized() {
            1
        } else {
            16
        }
    }

    fn precision(&self) -> i8 {
        self.precision_log2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock() {
        let clock = SystemClock::new();
        let ts1 = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let ts2 = clock.now();

        // Le deuxième timestamp doit être plus grand
        assert!(ts2.seconds() >= ts1.seconds());
    }

    #[test]
    fn test_disciplined_clock_reflects_synchronized_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let clock = DisciplinedClock::new(Arc::clone(&flag), -20);

        assert_eq!(clock.stratum(), 16);
        assert_eq!(&clock.reference_id(), b"LOCL");

        flag.store(true, Ordering::Relaxed);
        assert_eq!(clock.stratum(), 1);
        assert_eq!(&clock.reference_id(), b"GPS\0");
    }
}
