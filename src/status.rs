//! Instantané de statut, lu depuis l'arène partagée par le process Status.
//! Grounded sur la forme de `ServerStats` (teacher's `stats.rs`): une
//! structure sérialisable unique regroupant GPS, horloge et NTP. Le rendu
//! HTTP/WebSocket du teacher est hors-périmètre: seul un rendu texte brut
//! est fourni ici.

use crate::shared::tables::{ClockStatus, GpsState, NtpServerSlot, NtpStatus};
use crate::shared::Tables;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct GpsSnapshot {
    pub fix: bool,
    pub lat: f64,
    pub lon: f64,
    pub date: u32,
    pub time: u32,
    pub fix_age_ms: i64,
    pub device: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClockSnapshot {
    pub synchronized: bool,
    pub precision_ms: i64,
    pub last_avg_drift_ms: i64,
    pub sampling_period_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NtpPeerSnapshot {
    pub name: String,
    pub stratum: u8,
    pub elected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NtpSnapshot {
    pub mode: char,
    pub stratum: u8,
    pub current_bucket_received: u32,
    pub current_bucket_client_replies: u32,
    pub current_bucket_broadcasts_sent: u32,
    pub peers: Vec<NtpPeerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub gps: GpsSnapshot,
    pub clock: ClockSnapshot,
    pub ntp: NtpSnapshot,
}

impl StatusSnapshot {
    /// Construit un instantané en lisant chaque table de l'arène. Bon marché:
    /// une poignée de lectures volatiles, pas d'allocation hormis les
    /// quelques `String`/`Vec` du résultat.
    pub fn capture(tables: &Tables, now_ms: i64) -> Self {
        let gps: GpsState = tables.gps_state.get(0).unwrap_or_default();
        let clock: ClockStatus = tables.clock_status.get(0).unwrap_or_default();
        let ntp: NtpStatus = tables.ntp_status.get(0).unwrap_or_default();

        let device_len = gps.device_len as usize;
        let device = String::from_utf8_lossy(&gps.device[..device_len.min(gps.device.len())]).into_owned();

        let mut peers = Vec::new();
        for i in 0..tables.ntp_server_pool.len() {
            let slot: NtpServerSlot = tables.ntp_server_pool.get(i).unwrap_or_default();
            if slot.in_use == 1 {
                let name_len = slot.name_len as usize;
                let name = String::from_utf8_lossy(&slot.name[..name_len.min(slot.name.len())]).into_owned();
                peers.push(NtpPeerSnapshot {
                    name,
                    stratum: slot.stratum,
                    elected: slot.elected == 1,
                });
            }
        }

        StatusSnapshot {
            gps: GpsSnapshot {
                fix: gps.fix == 1,
                lat: gps.lat,
                lon: gps.lon,
                date: gps.date,
                time: gps.time,
                fix_age_ms: if gps.fix_acquired_at_ms == 0 {
                    -1
                } else {
                    now_ms - gps.fix_acquired_at_ms
                },
                device,
            },
            clock: ClockSnapshot {
                synchronized: clock.synchronized == 1,
                precision_ms: clock.precision_ms,
                last_avg_drift_ms: clock.last_avg_drift_ms,
                sampling_period_ms: clock.sampling_period_ms,
            },
            ntp: NtpSnapshot {
                mode: ntp.mode as char,
                stratum: ntp.stratum,
                current_bucket_received: ntp.current_bucket_received,
                current_bucket_client_replies: ntp.current_bucket_client_replies,
                current_bucket_broadcasts_sent: ntp.current_bucket_broadcasts_sent,
                peers,
            },
        }
    }

    pub fn render_plaintext(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "gps: fix={} lat={:.5} lon={:.5} date={} time={} age_ms={} device={}\n",
            self.gps.fix, self.gps.lat, self.gps.lon, self.gps.date, self.gps.time,
            self.gps.fix_age_ms, self.gps.device
        ));
        out.push_str(&format!(
            "clock: synchronized={} precision_ms={} drift_ms={} sampling_ms={}\n",
            self.clock.synchronized, self.clock.precision_ms, self.clock.last_avg_drift_ms,
            self.clock.sampling_period_ms
        ));
        out.push_str(&format!(
            "ntp: mode={} stratum={} received={} replies={} broadcasts={}\n",
            self.ntp.mode, self.ntp.stratum, self.ntp.current_bucket_received,
            self.ntp.current_bucket_client_replies, self.ntp.current_bucket_broadcasts_sent
        ));
        for peer in &self.ntp.peers {
            out.push_str(&format!(
                "  peer {} stratum={} elected={}\n",
                peer.name, peer.stratum, peer.elected
            ));
        }
        out
    }

    pub fn render_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedArena;

    #[test]
    fn test_capture_defaults_to_no_fix() {
        let arena = SharedArena::create("housetime-test-status-default", 1024 * 1024).unwrap();
        let tables = Tables::create(&arena).unwrap();
        let snapshot = StatusSnapshot::capture(&tables, 1_000);
        assert!(!snapshot.gps.fix);
        assert_eq!(snapshot.gps.fix_age_ms, -1);
        assert!(!snapshot.clock.synchronized);
        assert_eq!(snapshot.ntp.mode, 'I');
    }

    #[test]
    fn test_plaintext_render_contains_sections() {
        let arena = SharedArena::create("housetime-test-status-render", 1024 * 1024).unwrap();
        let tables = Tables::create(&arena).unwrap();
        let snapshot = StatusSnapshot::capture(&tables, 1_000);
        let text = snapshot.render_plaintext();
        assert!(text.contains("gps:"));
        assert!(text.contains("clock:"));
        assert!(text.contains("ntp:"));
    }

    #[test]
    fn test_json_render_roundtrips() {
        let arena = SharedArena::create("housetime-test-status-json", 1024 * 1024).unwrap();
        let tables = Tables::create(&arena).unwrap();
        let snapshot = StatusSnapshot::capture(&tables, 1_000);
        let json = snapshot.render_json().unwrap();
        assert!(json.contains("\"gps\""));
    }
}
