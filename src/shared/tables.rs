//! Structures `#[repr(C)]` publiées dans l'arène mémoire partagée.
//!
//! Toutes les tables ont une taille fixée au moment de leur création: pas de
//! `Vec`, pas de `String`, pas de pointeur interne au process Time. Chaque
//! champ texte est porté par un tableau d'octets de taille fixe accompagné
//! d'une longueur.

pub const GPS_TEXT_RING_LEN: usize = 16;
pub const GPS_SENTENCE_RING_LEN: usize = 32;
pub const CLOCK_METRICS_LEN: usize = 360;
pub const NTP_SERVER_POOL_LEN: usize = 4;
pub const NTP_CLIENT_LOG_LEN: usize = 128;
pub const NTP_TRAFFIC_LEN: usize = 128;
pub const MAX_SENTENCE_LEN: usize = 82;
pub const MAX_TEXT_LEN: usize = 80;
pub const MAX_NAME_LEN: usize = 64;

pub const NEW_FIX: u8 = 0b0000_0001;
pub const NEW_BURST: u8 = 0b0000_0010;

/// Une trame NMEA brute conservée pour diagnostic (anneau de 32 entrées).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NmeaSentence {
    pub text: [u8; MAX_SENTENCE_LEN],
    pub len: u16,
    pub flags: u8,
    pub _pad: u8,
    /// Instant de capture estimé du `$` initial, en millisecondes Unix.
    pub t_dollar_ms: i64,
}

impl Default for NmeaSentence {
    fn default() -> Self {
        NmeaSentence {
            text: [0; MAX_SENTENCE_LEN],
            len: 0,
            flags: 0,
            _pad: 0,
            t_dollar_ms: 0,
        }
    }
}

impl NmeaSentence {
    pub fn from_str(text: &str, flags: u8, t_dollar_ms: i64) -> Self {
        let mut rec = NmeaSentence {
            flags,
            t_dollar_ms,
            ..Default::default()
        };
        let bytes = text.as_bytes();
        let n = bytes.len().min(MAX_SENTENCE_LEN);
        rec.text[..n].copy_from_slice(&bytes[..n]);
        rec.len = n as u16;
        rec
    }
}

/// État courant du récepteur GPS: dernière position, dernière heure décodée,
/// anneau de texte libre (TXT) et anneau des trames brutes récentes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GpsState {
    pub fix: u8,
    pub _pad0: [u8; 7],
    pub lat: f64,
    pub lon: f64,
    pub ns: u8,
    pub ew: u8,
    pub _pad1: [u8; 6],
    /// ddmmyy numérique
    pub date: u32,
    /// hhmmss numérique
    pub time: u32,
    pub fix_acquired_at_ms: i64,
    pub device: [u8; MAX_NAME_LEN],
    pub device_len: u16,
    pub _pad2: [u8; 6],
    pub text_ring: [[u8; MAX_TEXT_LEN]; GPS_TEXT_RING_LEN],
    pub text_ring_len: [u16; GPS_TEXT_RING_LEN],
    pub text_ring_head: u32,
    pub sentence_ring: [NmeaSentence; GPS_SENTENCE_RING_LEN],
    pub sentence_ring_head: u32,
}

impl Default for GpsState {
    fn default() -> Self {
        GpsState {
            fix: 0,
            _pad0: [0; 7],
            lat: 0.0,
            lon: 0.0,
            ns: b' ',
            ew: b' ',
            _pad1: [0; 6],
            date: 0,
            time: 0,
            fix_acquired_at_ms: 0,
            device: [0; MAX_NAME_LEN],
            device_len: 0,
            _pad2: [0; 6],
            text_ring: [[0; MAX_TEXT_LEN]; GPS_TEXT_RING_LEN],
            text_ring_len: [0; GPS_TEXT_RING_LEN],
            text_ring_head: 0,
            sentence_ring: [NmeaSentence {
                text: [0; MAX_SENTENCE_LEN],
                len: 0,
                flags: 0,
                _pad: 0,
                t_dollar_ms: 0,
            }; GPS_SENTENCE_RING_LEN],
            sentence_ring_head: 0,
        }
    }
}

/// Statut courant de la discipline d'horloge.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ClockStatus {
    pub synchronized: u8,
    pub _pad: [u8; 7],
    pub precision_ms: i64,
    pub reference_instant_ms: i64,
    pub last_drift_ms: i64,
    pub last_avg_drift_ms: i64,
    pub learning_count: u32,
    pub accumulator_ms: i64,
    pub sampling_period_ms: i64,
}

/// Une seconde d'historique de dérive (anneau de 360 = 6 minutes à 1/s).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ClockMetric {
    pub drift_ms: i64,
    pub adjust_count: u32,
    pub _pad: u32,
}

/// Un pair NTP connu (mode 5, diffusion) dans le pool d'élection.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NtpServerSlot {
    pub in_use: u8,
    pub elected: u8,
    /// Vrai une fois qu'un message "nouveau pair" a été journalisé pour ce
    /// slot; conservé tel quel tant que le slot reste occupé par le même
    /// pair, pour ne journaliser la découverte qu'une seule fois.
    pub logged: u8,
    pub _pad: [u8; 5],
    pub addr_v4: [u8; 4],
    pub port: u16,
    pub _pad2: u16,
    pub name: [u8; MAX_NAME_LEN],
    pub name_len: u16,
    pub stratum: u8,
    pub _pad3: u8,
    pub last_receive_ms: i64,
    pub peer_transmit: u64,
}

impl Default for NtpServerSlot {
    fn default() -> Self {
        NtpServerSlot {
            in_use: 0,
            elected: 0,
            logged: 0,
            _pad: [0; 5],
            addr_v4: [0; 4],
            port: 0,
            _pad2: 0,
            name: [0; MAX_NAME_LEN],
            name_len: 0,
            stratum: 16,
            _pad3: 0,
            last_receive_ms: 0,
            peer_transmit: 0,
        }
    }
}

/// Une entrée du journal des clients mode 3 (anneau de 128).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct NtpClientSlot {
    pub in_use: u8,
    /// Vrai une fois qu'un message "nouveau client" a été journalisé pour
    /// cette adresse.
    pub logged: u8,
    pub _pad: [u8; 6],
    pub addr_v4: [u8; 4],
    pub port: u16,
    pub _pad2: u16,
    pub peer_transmit: u64,
    pub local_receive_ms: i64,
}

/// Un compartiment de trafic de 10 secondes (anneau de 128 = ~21 minutes).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct NtpTraffic {
    pub bucket_start_ms: i64,
    pub received: u32,
    pub client_replies: u32,
    pub broadcasts_sent: u32,
    pub _pad: u32,
}

/// État global du moteur NTP.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct NtpStatus {
    /// 'S' (synchronized/serving), 'C' (calibrating), 'I' (idle)
    pub mode: u8,
    pub _pad0: [u8; 7],
    pub source_index: i32,
    pub stratum: u8,
    pub _pad1: [u8; 3],
    pub current_bucket_received: u32,
    pub current_bucket_client_replies: u32,
    pub current_bucket_broadcasts_sent: u32,
    pub current_bucket_start_ms: i64,
}
