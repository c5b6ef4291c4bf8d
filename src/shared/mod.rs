pub mod store;
pub mod tables;

pub use store::{ArenaError, SharedArena, TableHandle};

/// Nom de l'arène POSIX partagée entre `housetimed` et `housetime-status`.
pub const ARENA_NAME: &str = "housetime";

/// Taille totale par défaut de l'arène (largement suffisante pour les tables
/// fixes de `tables.rs`).
pub const DEFAULT_ARENA_SIZE: usize = 1024 * 1024;

pub const TABLE_GPS_STATE: &str = "gps_state";
pub const TABLE_CLOCK_STATUS: &str = "clock_status";
pub const TABLE_CLOCK_METRICS: &str = "clock_metrics";
pub const TABLE_NTP_SERVER_POOL: &str = "ntp_server_pool";
pub const TABLE_NTP_CLIENT_LOG: &str = "ntp_client_log";
pub const TABLE_NTP_TRAFFIC: &str = "ntp_traffic";
pub const TABLE_NTP_STATUS: &str = "ntp_status";

use tables::{
    ClockMetric, ClockStatus, GpsState, NtpClientSlot, NtpServerSlot, NtpStatus, NtpTraffic,
    CLOCK_METRICS_LEN, NTP_CLIENT_LOG_LEN, NTP_SERVER_POOL_LEN, NTP_TRAFFIC_LEN,
};

/// Handles typés vers chacune des tables publiées par le process Time.
/// Le process Status ouvre le même ensemble en lecture seule.
pub struct Tables {
    pub gps_state: TableHandle<GpsState>,
    pub clock_status: TableHandle<ClockStatus>,
    pub clock_metrics: TableHandle<ClockMetric>,
    pub ntp_server_pool: TableHandle<NtpServerSlot>,
    pub ntp_client_log: TableHandle<NtpClientSlot>,
    pub ntp_traffic: TableHandle<NtpTraffic>,
    pub ntp_status: TableHandle<NtpStatus>,
}

impl Tables {
    /// Crée toutes les tables dans une arène fraîchement créée.
    pub fn create(arena: &SharedArena) -> Result<Self, ArenaError> {
        Ok(Tables {
            gps_state: arena.create_table(TABLE_GPS_STATE, 1)?,
            clock_status: arena.create_table(TABLE_CLOCK_STATUS, 1)?,
            clock_metrics: arena.create_table(TABLE_CLOCK_METRICS, CLOCK_METRICS_LEN)?,
            ntp_server_pool: arena.create_table(TABLE_NTP_SERVER_POOL, NTP_SERVER_POOL_LEN)?,
            ntp_client_log: arena.create_table(TABLE_NTP_CLIENT_LOG, NTP_CLIENT_LOG_LEN)?,
            ntp_traffic: arena.create_table(TABLE_NTP_TRAFFIC, NTP_TRAFFIC_LEN)?,
            ntp_status: arena.create_table(TABLE_NTP_STATUS, 1)?,
        })
    }

    /// Ouvre toutes les tables d'une arène existante, en lecture seule.
    pub fn open(arena: &SharedArena) -> Result<Self, ArenaError> {
        Ok(Tables {
            gps_state: arena.open_table(TABLE_GPS_STATE)?,
            clock_status: arena.open_table(TABLE_CLOCK_STATUS)?,
            clock_metrics: arena.open_table(TABLE_CLOCK_METRICS)?,
            ntp_server_pool: arena.open_table(TABLE_NTP_SERVER_POOL)?,
            ntp_client_log: arena.open_table(TABLE_NTP_CLIENT_LOG)?,
            ntp_traffic: arena.open_table(TABLE_NTP_TRAFFIC)?,
            ntp_status: arena.open_table(TABLE_NTP_STATUS)?,
        })
    }
}
