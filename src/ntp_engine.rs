//! Moteur NTP: extension du codec et du gestionnaire de requêtes de
//! `server.rs`/`packet.rs` (teacher) aux modes 3/4/5, au pool de pairs en
//! diffusion avec élection, et à un client de calibration.

use crate::clock::ClockSource;
use crate::clock_discipline::ClockDiscipline;
use crate::net_io::NetIo;
use crate::packet::{short_format_from_ms, LeapIndicator, NtpMode, NtpPacket, NtpTimestamp};
use crate::security::{IpFilter, PacketValidator, RateLimiter};
use crate::shared::tables::{NtpClientSlot, NtpServerSlot, NtpStatus, NtpTraffic};
use crate::shared::TableHandle;
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const MIN_BROADCAST_PERIOD_SECS: u32 = 10;
const DEFAULT_BROADCAST_PERIOD_SECS: u32 = 300;
const CALIBRATION_PERIOD_SECS: u64 = 10;
const TRAFFIC_BUCKET_SECS: i64 = 10;

fn ntp_timestamp_from_ms(ms: i64) -> NtpTimestamp {
    let dt = Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now);
    NtpTimestamp::from_datetime(dt)
}

fn ms_from_ntp(ts: NtpTimestamp) -> i64 {
    ts.to_datetime().timestamp_millis()
}

pub struct NtpEngine {
    pool: TableHandle<NtpServerSlot>,
    client_log: TableHandle<NtpClientSlot>,
    traffic: TableHandle<NtpTraffic>,
    status: TableHandle<NtpStatus>,

    ip_filter: IpFilter,
    rate_limiter: Option<RateLimiter>,
    nmea_active: Arc<AtomicBool>,

    broadcast_period: u32,
    broadcast_without_gps: bool,
    test_mode: bool,
    calibration_addr: Option<SocketAddr>,

    client_log_head: u32,
    mode: u8,
    source_index: i32,
    effective_stratum: u8,

    current_received: u32,
    current_client_replies: u32,
    current_broadcasts_sent: u32,
    current_bucket_index: i64,

    last_broadcast_at: Option<Instant>,
    last_calibration_at: Option<Instant>,
    calibration_transmit: Option<NtpTimestamp>,
}

pub struct NtpEngineConfig {
    pub broadcast_period_secs: u32,
    pub broadcast_without_gps: bool,
    pub test_mode: bool,
    pub calibration_host: Option<String>,
    pub ip_whitelist: Vec<String>,
    pub ip_blacklist: Vec<String>,
    pub max_requests_per_second: u32,
}

impl NtpEngine {
    pub fn new(
        pool: TableHandle<NtpServerSlot>,
        client_log: TableHandle<NtpClientSlot>,
        traffic: TableHandle<NtpTraffic>,
        status: TableHandle<NtpStatus>,
        nmea_active: Arc<AtomicBool>,
        cfg: NtpEngineConfig,
    ) -> Result<Self> {
        let calibration_addr = match cfg.calibration_host {
            Some(host) => {
                use std::net::ToSocketAddrs;
                let resolved = format!("{host}:123")
                    .to_socket_addrs()
                    .map_err(|e| anyhow::anyhow!("failed to resolve calibration host {host}: {e}"))?
                    .next();
                resolved
            }
            None => None,
        };

        Ok(NtpEngine {
            pool,
            client_log,
            traffic,
            status,
            ip_filter: IpFilter::new(cfg.ip_whitelist, cfg.ip_blacklist),
            rate_limiter: if cfg.max_requests_per_second > 0 {
                Some(RateLimiter::new(cfg.max_requests_per_second))
            } else {
                None
            },
            nmea_active,
            broadcast_period: cfg
                .broadcast_period_secs
                .max(MIN_BROADCAST_PERIOD_SECS),
            broadcast_without_gps: cfg.broadcast_without_gps,
            test_mode: cfg.test_mode,
            calibration_addr,
            client_log_head: 0,
            mode: b'I',
            source_index: -1,
            effective_stratum: 0,
            current_received: 0,
            current_client_replies: 0,
            current_broadcasts_sent: 0,
            current_bucket_index: -1,
            last_broadcast_at: None,
            last_calibration_at: None,
            calibration_transmit: None,
        })
    }

    /// Traite un datagramme reçu sur la socket de service.
    pub fn process(
        &mut self,
        net_io: &NetIo,
        buf: &[u8],
        client_addr: SocketAddr,
        t_read: Instant,
        t_read_wall: DateTime<Utc>,
        discipline: &mut ClockDiscipline,
        clock: &dyn ClockSource,
    ) -> Result<()> {
        self.current_received += 1;

        let ip = client_addr.ip();
        if !self.ip_filter.is_allowed(ip) {
            return Ok(());
        }
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.check_rate_limit(ip) {
                return Ok(());
            }
        }

        let packet = match NtpPacket::from_bytes(buf) {
            Ok(p) => p,
            Err(e) => {
                debug!("failed to parse NTP packet from {}: {}", client_addr, e);
                return Ok(());
            }
        };

        match packet.mode {
            NtpMode::Client => {
                if let Err(e) = PacketValidator::validate_request(&packet) {
                    debug!("rejected client request from {}: {}", client_addr, e);
                    return Ok(());
                }
                self.handle_client_request(net_io, &packet, client_addr, t_read_wall, discipline, clock)
            }
            NtpMode::Broadcast => {
                self.handle_broadcast_peer(&packet, client_addr, t_read, t_read_wall, discipline)
            }
            NtpMode::Server => self.handle_calibration_reply(&packet, client_addr),
            _ => Ok(()),
        }
    }

    fn handle_client_request(
        &mut self,
        net_io: &NetIo,
        request: &NtpPacket,
        client_addr: SocketAddr,
        t_read_wall: DateTime<Utc>,
        discipline: &ClockDiscipline,
        clock: &dyn ClockSource,
    ) -> Result<()> {
        if !discipline.is_synchronized() || self.effective_stratum == 0 {
            return Ok(());
        }

        let refid = if self.effective_stratum == 1 {
            u32::from_be_bytes(*b"GPS\0")
        } else if self.source_index >= 0 {
            let slot = self.pool.get(self.source_index as usize).unwrap_or_default();
            u32::from_be_bytes(slot.addr_v4)
        } else {
            u32::from_be_bytes(*b"LOCL")
        };

        let mut response = NtpPacket::new_server_response();
        response.leap_indicator = LeapIndicator::NoWarning;
        response.version = request.version;
        response.mode = NtpMode::Server;
        response.stratum = self.effective_stratum;
        response.poll = request.poll;
        response.precision = clock.precision();
        response.root_delay = 0;
        response.root_dispersion = short_format_from_ms(discipline.dispersion_ms());
        response.reference_identifier = refid;
        response.reference_timestamp = ntp_timestamp_from_ms(discipline.reference());
        response.originate_timestamp = request.transmit_timestamp;
        response.receive_timestamp = NtpTimestamp::from_datetime(t_read_wall);
        response.transmit_timestamp = clock.now();

        net_io.send_to(&response.to_bytes(), client_addr)?;
        self.current_client_replies += 1;
        self.log_client(client_addr, request.transmit_timestamp, t_read_wall);
        Ok(())
    }

    fn log_client(&mut self, client_addr: SocketAddr, peer_transmit: NtpTimestamp, t_read_wall: DateTime<Utc>) {
        let addr_v4 = match client_addr.ip() {
            std::net::IpAddr::V4(v4) => v4.octets(),
            std::net::IpAddr::V6(_) => return,
        };
        let len = self.client_log.len() as u32;
        let idx = self.client_log_head as usize;

        let already_logged = (0..self.client_log.len()).any(|i| {
            let slot = self.client_log.get(i).unwrap_or_default();
            slot.in_use == 1 && slot.logged == 1 && slot.addr_v4 == addr_v4
        });
        if !already_logged {
            info!("new NTP client: {}", client_addr);
        }

        self.client_log.set(
            idx,
            NtpClientSlot {
                in_use: 1,
                logged: 1,
                _pad: [0; 6],
                addr_v4,
                port: client_addr.port(),
                _pad2: 0,
                peer_transmit: peer_transmit.0,
                local_receive_ms: t_read_wall.timestamp_millis(),
            },
        );
        self.client_log_head = (self.client_log_head + 1) % len;
    }

    fn handle_broadcast_peer(
        &mut self,
        request: &NtpPacket,
        client_addr: SocketAddr,
        t_read: Instant,
        t_read_wall: DateTime<Utc>,
        discipline: &mut ClockDiscipline,
    ) -> Result<()> {
        if self.nmea_active.load(Ordering::Relaxed) {
            return Ok(());
        }
        if request.stratum < 1 {
            return Ok(());
        }
        let addr_v4 = match client_addr.ip() {
            std::net::IpAddr::V4(v4) => v4.octets(),
            std::net::IpAddr::V6(_) => return Ok(()),
        };

        let now_ms = t_read_wall.timestamp_millis();
        let stale_after_ms = 3 * self.broadcast_period as i64 * 1000;

        let pool_len = self.pool.len();
        let mut target: Option<usize> = None;

        for i in 0..pool_len {
            let slot = self.pool.get(i).unwrap_or_default();
            if slot.in_use == 1 && slot.addr_v4 == addr_v4 {
                target = Some(i);
                break;
            }
        }
        if target.is_none() {
            for i in 0..pool_len {
                let slot = self.pool.get(i).unwrap_or_default();
                if slot.in_use == 0 {
                    target = Some(i);
                    break;
                }
            }
        }
        if target.is_none() {
            for i in 0..pool_len {
                let slot = self.pool.get(i).unwrap_or_default();
                if slot.in_use == 1 && now_ms - slot.last_receive_ms > stale_after_ms {
                    target = Some(i);
                    break;
                }
            }
        }
        if target.is_none() {
            let mut worst: Option<(usize, u8)> = None;
            for i in 0..pool_len {
                let slot = self.pool.get(i).unwrap_or_default();
                if slot.in_use == 1 && slot.stratum > request.stratum {
                    if worst.map(|(_, s)| slot.stratum > s).unwrap_or(true) {
                        worst = Some((i, slot.stratum));
                    }
                }
            }
            target = worst.map(|(i, _)| i);
        }

        let idx = match target {
            Some(i) => i,
            None => {
                debug!("broadcast peer pool full, dropping {}", client_addr);
                return Ok(());
            }
        };

        let existing = self.pool.get(idx).unwrap_or_default();
        let is_new_peer = !(existing.in_use == 1 && existing.addr_v4 == addr_v4);
        if is_new_peer {
            info!("new broadcast peer: {} (stratum {})", client_addr, request.stratum);
        }

        let name_str = match client_addr.ip() {
            std::net::IpAddr::V4(v4) => v4.to_string(),
            _ => String::new(),
        };
        let mut name = [0u8; crate::shared::tables::MAX_NAME_LEN];
        let name_bytes = name_str.as_bytes();
        let n = name_bytes.len().min(name.len());
        name[..n].copy_from_slice(&name_bytes[..n]);

        self.pool.set(
            idx,
            NtpServerSlot {
                in_use: 1,
                elected: existing.elected,
                logged: 1,
                _pad: [0; 5],
                addr_v4,
                port: client_addr.port(),
                _pad2: 0,
                name,
                name_len: n as u16,
                stratum: request.stratum,
                _pad3: 0,
                last_receive_ms: now_ms,
                peer_transmit: request.transmit_timestamp.0,
            },
        );

        if self.source_index < 0 {
            self.elect_lowest_stratum();
        } else if (idx as i32) != self.source_index {
            let current = self.pool.get(self.source_index as usize).unwrap_or_default();
            if request.stratum < current.stratum {
                self.switch_source(idx);
            }
        }

        if self.source_index == idx as i32 {
            let peer_transmit_dt = Utc
                .timestamp_millis_opt(ms_from_ntp(request.transmit_timestamp))
                .single()
                .unwrap_or_else(Utc::now);
            discipline.discipline(peer_transmit_dt, t_read, 0)?;
            self.effective_stratum = request.stratum + 1;
            self.mode = b'C';
        }

        Ok(())
    }

    fn elect_lowest_stratum(&mut self) {
        let mut best: Option<(usize, u8)> = None;
        for i in 0..self.pool.len() {
            let slot = self.pool.get(i).unwrap_or_default();
            if slot.in_use == 1 {
                if best.map(|(_, s)| slot.stratum < s).unwrap_or(true) {
                    best = Some((i, slot.stratum));
                }
            }
        }
        match best {
            Some((i, _)) => self.switch_source(i),
            None => self.source_index = -1,
        }
    }

    fn switch_source(&mut self, idx: usize) {
        if self.source_index >= 0 && self.source_index as usize != idx {
            let mut prev = self.pool.get(self.source_index as usize).unwrap_or_default();
            prev.elected = 0;
            self.pool.set(self.source_index as usize, prev);
        }
        let mut slot = self.pool.get(idx).unwrap_or_default();
        slot.elected = 1;
        self.pool.set(idx, slot);
        self.source_index = idx as i32;
    }

    fn handle_calibration_reply(&mut self, response: &NtpPacket, client_addr: SocketAddr) -> Result<()> {
        let Some(expected_addr) = self.calibration_addr else {
            return Ok(());
        };
        if client_addr.ip() != expected_addr.ip() {
            return Ok(());
        }
        let Some(sent_transmit) = self.calibration_transmit else {
            return Ok(());
        };
        if response.originate_timestamp.0 != sent_transmit.0 {
            return Ok(());
        }

        let t1 = ms_from_ntp(sent_transmit);
        let t2 = ms_from_ntp(response.receive_timestamp);
        let t3 = ms_from_ntp(response.transmit_timestamp);
        let t4 = Utc::now().timestamp_millis();
        let offset_ms = ((t2 - t1) + (t3 - t4)) / 2;

        if self.test_mode {
            info!("calibration offset vs {}: {}ms", expected_addr, offset_ms);
        }
        Ok(())
    }

    /// Réclamation des pairs périmés, bascule de mode, diffusion et
    /// calibration périodiques, et bascule du compartiment de trafic.
    /// Appelé une fois par seconde écoulée par le superviseur.
    pub fn periodic(
        &mut self,
        net_io: &NetIo,
        now_wall: SystemTime,
        discipline: &ClockDiscipline,
        clock: &dyn ClockSource,
    ) -> Result<()> {
        let now_ms = now_wall
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let stale_after_ms = 3 * self.broadcast_period as i64 * 1000;

        for i in 0..self.pool.len() {
            let slot = self.pool.get(i).unwrap_or_default();
            if slot.in_use == 1 && now_ms - slot.last_receive_ms > stale_after_ms {
                self.pool.set(i, NtpServerSlot::default());
                if self.source_index == i as i32 {
                    self.source_index = -1;
                    self.elect_lowest_stratum();
                }
            }
        }

        let nmea_active = self.nmea_active.load(Ordering::Relaxed);
        if nmea_active && discipline.is_synchronized() {
            self.mode = b'S';
            self.effective_stratum = 1;
            self.source_index = -1;
        } else if self.source_index >= 0 {
            let slot = self.pool.get(self.source_index as usize).unwrap_or_default();
            self.mode = b'C';
            self.effective_stratum = slot.stratum + 1;
        } else {
            self.mode = b'C';
            self.effective_stratum = 0;
        }

        let should_broadcast = (nmea_active || self.broadcast_without_gps)
            && discipline.is_synchronized()
            && self
                .last_broadcast_at
                .map(|t| t.elapsed().as_secs() >= self.broadcast_period as u64)
                .unwrap_or(true);
        if should_broadcast {
            self.send_broadcast(net_io, discipline, clock);
            self.last_broadcast_at = Some(Instant::now());
        }

        if let Some(addr) = self.calibration_addr {
            let should_calibrate = self
                .last_calibration_at
                .map(|t| t.elapsed().as_secs() >= CALIBRATION_PERIOD_SECS)
                .unwrap_or(true);
            if should_calibrate {
                self.send_calibration_request(net_io, addr, clock)?;
                self.last_calibration_at = Some(Instant::now());
            }
        }

        self.rollover_traffic_bucket(now_ms);
        self.publish_status();
        Ok(())
    }

    fn send_broadcast(&mut self, net_io: &NetIo, discipline: &ClockDiscipline, clock: &dyn ClockSource) {
        let mut packet = NtpPacket::new_server_response();
        packet.mode = NtpMode::Broadcast;
        packet.stratum = 1;
        packet.reference_identifier = u32::from_be_bytes(*b"GPS\0");
        packet.reference_timestamp = ntp_timestamp_from_ms(discipline.reference());
        packet.root_dispersion = short_format_from_ms(discipline.dispersion_ms());
        packet.transmit_timestamp = clock.now();

        let sent = net_io.broadcast(&packet.to_bytes(), 123);
        if sent > 0 {
            self.current_broadcasts_sent += sent as u32;
        }
    }

    fn send_calibration_request(
        &mut self,
        net_io: &NetIo,
        addr: SocketAddr,
        clock: &dyn ClockSource,
    ) -> Result<()> {
        let mut packet = NtpPacket::new_server_response();
        packet.mode = NtpMode::Client;
        packet.stratum = 0;
        packet.transmit_timestamp = clock.now();
        net_io.send_to(&packet.to_bytes(), addr)?;
        self.calibration_transmit = Some(packet.transmit_timestamp);
        Ok(())
    }

    fn rollover_traffic_bucket(&mut self, now_ms: i64) {
        let bucket_index = (now_ms / 1000) / TRAFFIC_BUCKET_SECS;
        if self.current_bucket_index < 0 {
            self.current_bucket_index = bucket_index;
            return;
        }
        if bucket_index == self.current_bucket_index {
            return;
        }

        let slot_count = self.traffic.len() as i64;
        let idx = (self.current_bucket_index.rem_euclid(slot_count)) as usize;
        self.traffic.set(
            idx,
            NtpTraffic {
                bucket_start_ms: self.current_bucket_index * TRAFFIC_BUCKET_SECS * 1000,
                received: self.current_received,
                client_replies: self.current_client_replies,
                broadcasts_sent: self.current_broadcasts_sent,
                _pad: 0,
            },
        );

        self.current_received = 0;
        self.current_client_replies = 0;
        self.current_broadcasts_sent = 0;
        self.current_bucket_index = bucket_index;
    }

    fn publish_status(&self) {
        self.status.set(
            0,
            NtpStatus {
                mode: self.mode,
                _pad0: [0; 7],
                source_index: self.source_index,
                stratum: self.effective_stratum,
                _pad1: [0; 3],
                current_bucket_received: self.current_received,
                current_bucket_client_replies: self.current_client_replies,
                current_bucket_broadcasts_sent: self.current_broadcasts_sent,
                current_bucket_start_ms: self.current_bucket_index * TRAFFIC_BUCKET_SECS * 1000,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{SharedArena, Tables};
    use std::net::{IpAddr, Ipv4Addr};

    fn make_engine(name: &str) -> (SharedArena, NtpEngine) {
        let arena = SharedArena::create(name, 1024 * 1024).unwrap();
        let tables = Tables::create(&arena).unwrap();
        let engine = NtpEngine::new(
            tables.ntp_server_pool,
            tables.ntp_client_log,
            tables.ntp_traffic,
            tables.ntp_status,
            Arc::new(AtomicBool::new(false)),
            NtpEngineConfig {
                broadcast_period_secs: 10,
                broadcast_without_gps: false,
                test_mode: true,
                calibration_host: None,
                ip_whitelist: vec![],
                ip_blacklist: vec![],
                max_requests_per_second: 0,
            },
        )
        .unwrap();
        (arena, engine)
    }

    fn peer_addr(octet: u8, stratum: u8) -> (SocketAddr, NtpPacket) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)), 123);
        let mut packet = NtpPacket::new_server_response();
        packet.mode = NtpMode::Broadcast;
        packet.stratum = stratum;
        packet.transmit_timestamp = NtpTimestamp::from_datetime(Utc::now());
        (addr, packet)
    }

    fn make_discipline(name: &str) -> (SharedArena, ClockDiscipline) {
        let arena = SharedArena::create(name, 1024 * 1024).unwrap();
        let tables = Tables::create(&arena).unwrap();
        let discipline = ClockDiscipline::new(10, true, false, tables.clock_status, tables.clock_metrics);
        (arena, discipline)
    }

    #[test]
    fn test_broadcast_election_prefers_lower_stratum() {
        let (_arena, mut engine) = make_engine("housetime-test-ntp-election");
        let (_darena, mut discipline) = make_discipline("housetime-test-ntp-election-clock");

        let (addr_a, pkt_a) = peer_addr(2, 3);
        engine
            .handle_broadcast_peer(&pkt_a, addr_a, Instant::now(), Utc::now(), &mut discipline)
            .unwrap();
        assert_eq!(engine.source_index, 0);
        assert_eq!(engine.effective_stratum, 4);

        let (addr_b, pkt_b) = peer_addr(3, 2);
        engine
            .handle_broadcast_peer(&pkt_b, addr_b, Instant::now(), Utc::now(), &mut discipline)
            .unwrap();
        assert_eq!(engine.source_index, 1);
        assert_eq!(engine.effective_stratum, 3);

        let (addr_a2, pkt_a2) = peer_addr(2, 3);
        engine
            .handle_broadcast_peer(&pkt_a2, addr_a2, Instant::now(), Utc::now(), &mut discipline)
            .unwrap();
        // Stratum 3 does not beat the already-elected stratum 2 peer.
        assert_eq!(engine.source_index, 1);
    }

    #[test]
    fn test_reject_request_when_not_synchronized() {
        let (_arena, engine) = make_engine("housetime-test-ntp-unsynced");
        assert_eq!(engine.effective_stratum, 0);
    }

    #[test]
    fn test_traffic_bucket_rollover_resets_counters() {
        let (_arena, mut engine) = make_engine("housetime-test-ntp-traffic");
        engine.rollover_traffic_bucket(0); // establishes bucket 0, no write yet
        engine.current_received = 5;
        engine.rollover_traffic_bucket(5_000); // still inside bucket 0
        assert_eq!(engine.current_received, 5);

        engine.rollover_traffic_bucket(TRAFFIC_BUCKET_SECS * 1000); // rolls into bucket 1
        let rec = engine.traffic.get(0).unwrap();
        assert_eq!(rec.received, 5);
        assert_eq!(engine.current_received, 0);
    }
}
