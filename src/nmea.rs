//! Décodage des trames NMEA 0183 avec estimation du temps de capture.
//!
//! Contrairement à `gps_reader.rs` du teacher (qui traite les lignes au fil
//! de l'eau dès qu'un `\n` apparaît, sans modèle de timing), ce décodeur
//! accumule les octets d'une lecture série, détecte les rafales (bursts) et
//! estime, pour chaque sentence, l'instant où son `$` initial est réellement
//! arrivé sur le fil — en tenant compte du débit d'arrivée mesuré des octets.

use crate::shared::tables::{NmeaSentence, NEW_BURST, NEW_FIX};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use std::time::{Duration, Instant};
use tracing::debug;

const MAX_BUFFER: usize = 2048;
const BURST_GAP: Duration = Duration::from_millis(500);
const RATE_SAMPLE_GAP: Duration = Duration::from_millis(300);
const SATURATION: u64 = 1_000_000;
const INITIAL_RATE_BYTES_PER_MS_X1000: u64 = 115_000; // 115 bytes/ms, a plausible NMEA burst rate

/// Estime un débit en octets/milliseconde, mis à jour uniquement à partir
/// d'intervalles de lecture courts (< 300ms), avec repli exponentiel pour
/// éviter la saturation des compteurs sur une session longue.
struct ByteRateEstimator {
    total_bytes: u64,
    total_ms: u64,
}

impl ByteRateEstimator {
    fn new() -> Self {
        ByteRateEstimator {
            total_bytes: 115,
            total_ms: 1,
        }
    }

    fn add_sample(&mut self, bytes: u64, ms: u64) {
        self.total_bytes += bytes;
        self.total_ms += ms.max(1);
        if self.total_bytes > SATURATION || self.total_ms > SATURATION {
            self.total_bytes /= 2;
            self.total_ms = (self.total_ms / 2).max(1);
        }
    }

    /// Débit exprimé en `octets * 1000 / ms` (1000x de précision entière).
    fn rate_x1000(&self) -> u64 {
        ((self.total_bytes * 1000) / self.total_ms).max(1)
    }
}

impl Default for ByteRateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Un point de discipline à soumettre à `ClockDiscipline`: l'heure GPS décodée
/// et la référence locale (monotone) à laquelle elle correspond.
#[derive(Debug, Clone, Copy)]
pub struct DisciplineEvent {
    pub source_utc: DateTime<Utc>,
    pub local_reference: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct DecodedFix {
    pub valid: bool,
    pub lat: f64,
    pub lon: f64,
    pub ns: u8,
    pub ew: u8,
    pub date: u32,
    pub time: u32,
    pub satellites: Option<u8>,
}

/// Résultat de `process_read`: les événements de discipline d'horloge
/// déclenchés, le dernier état de fix connu, et les trames brutes décodées
/// pour publication dans l'anneau de diagnostic.
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    pub discipline_events: Vec<DisciplineEvent>,
    pub fix: Option<DecodedFix>,
    pub raw_sentences: Vec<(String, u8, Instant)>,
    pub text_lines: Vec<String>,
}

pub struct NmeaDecoder {
    buf: Vec<u8>,
    last_read_at: Option<Instant>,
    rate: ByteRateEstimator,
    burst_flags: u8,
    t_burst: Option<Instant>,
    last_time_field: Option<u32>,
    last_date_field: Option<u32>,
    last_fix_bearing_sentence: Option<Instant>,
    privacy: bool,
}

impl NmeaDecoder {
    pub fn new(privacy: bool) -> Self {
        NmeaDecoder {
            buf: Vec::with_capacity(MAX_BUFFER),
            last_read_at: None,
            rate: ByteRateEstimator::new(),
            burst_flags: 0,
            t_burst: None,
            last_time_field: None,
            last_date_field: None,
            last_fix_bearing_sentence: None,
            privacy,
        }
    }

    /// Délai, en secondes, depuis la dernière trame porteuse de fix. `None`
    /// si aucune trame n'a jamais été vue.
    pub fn seconds_since_last_fix_sentence(&self) -> Option<u64> {
        self.last_fix_bearing_sentence
            .map(|instant| instant.elapsed().as_secs())
    }

    pub fn process_read(&mut self, bytes: &[u8], t_read: Instant) -> DecodeOutcome {
        let mut is_new_burst = false;
        if let Some(prev) = self.last_read_at {
            let gap = t_read.saturating_duration_since(prev);
            if gap > BURST_GAP {
                is_new_burst = true;
            }
            if gap < RATE_SAMPLE_GAP {
                self.rate.add_sample(bytes.len() as u64, gap.as_millis() as u64);
            }
        } else {
            is_new_burst = true;
        }
        self.last_read_at = Some(t_read);

        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_BUFFER {
            debug!("NMEA accumulator overflow, dropping {} bytes", self.buf.len());
            self.buf.clear();
            return DecodeOutcome::default();
        }

        let gps_count = self.buf.len() as i64;
        let rate_x1000 = self.rate.rate_x1000() as i64;

        if is_new_burst {
            self.burst_flags |= NEW_BURST;
            let delay_ms = (gps_count * 1000) / rate_x1000;
            self.t_burst = Some(t_read - Duration::from_millis(delay_ms.max(0) as u64));
            // Une nouvelle rafale invalide toute notion de "même seconde" pour
            // la prochaine trame de fix.
            self.last_time_field = None;
            self.last_date_field = None;
        }

        let mut outcome = DecodeOutcome::default();
        let mut k: usize = 0;
        loop {
            let rel = self.buf[k..]
                .iter()
                .position(|&b| b == b'\r' || b == b'\n');
            let rel_pos = match rel {
                Some(p) => p,
                None => break,
            };
            let line_end = k + rel_pos;
            let line = self.buf[k..line_end].to_vec();

            let delay_ms = ((gps_count - k as i64) * 1000) / rate_x1000;
            let t_dollar = t_read - Duration::from_millis(delay_ms.max(0) as u64);

            let mut next_k = line_end;
            if next_k < self.buf.len() && self.buf[next_k] == b'\r' {
                next_k += 1;
            }
            if next_k < self.buf.len() && self.buf[next_k] == b'\n' {
                next_k += 1;
            }
            k = next_k;

            if !line.is_empty() && line[0] == b'$' {
                let local_ref = if self.burst_flags & NEW_BURST != 0 {
                    self.t_burst.unwrap_or(t_dollar)
                } else {
                    t_dollar
                };
                self.handle_sentence(&line, t_dollar, local_ref, &mut outcome);
            }
        }
        self.buf.drain(0..k);
        outcome
    }

    fn is_new_fix_time(&mut self, time_field: u32, date_field: u32) -> bool {
        let changed = self.last_time_field != Some(time_field)
            || self.last_date_field != Some(date_field);
        self.last_time_field = Some(time_field);
        self.last_date_field = Some(date_field);
        changed
    }

    fn handle_sentence(
        &mut self,
        line: &[u8],
        t_dollar: Instant,
        local_reference: Instant,
        outcome: &mut DecodeOutcome,
    ) {
        let text = String::from_utf8_lossy(line).into_owned();
        let body = match text.find('*') {
            Some(i) => &text[..i],
            None => text.as_str(),
        };
        if body.len() < 6 || !body.starts_with('$') {
            return;
        }
        let talker = &body[1..3];
        let kind = &body[3..6];

        if !matches!(talker, "GP" | "GA" | "GL") {
            outcome
                .raw_sentences
                .push((text.clone(), 0, t_dollar));
            return;
        }

        let fields: Vec<&str> = body.split(',').collect();
        let mut flags = 0u8;

        match kind {
            "RMC" => {
                if fields.len() > 9 {
                    let valid = fields.get(2) == Some(&"A")
                        && matches!(fields.get(12), Some(&"A") | Some(&"D"));
                    if !valid {
                        outcome.fix = Some(DecodedFix {
                            valid: false,
                            ..Default::default()
                        });
                    } else if let (Some(time_str), Some(date_str)) =
                        (fields.get(1), fields.get(9))
                    {
                        if let (Some(time_num), Some(date_num)) =
                            (parse_numeric_field(time_str, 6), parse_numeric_field(date_str, 6))
                        {
                            self.last_fix_bearing_sentence = Some(Instant::now());
                            let is_new = self.is_new_fix_time(time_num, date_num);
                            if is_new {
                                flags |= NEW_FIX;
                                let lat = fields.get(3).copied().unwrap_or("");
                                let ns = fields.get(4).and_then(|s| s.bytes().next()).unwrap_or(b' ');
                                let lon = fields.get(5).copied().unwrap_or("");
                                let ew = fields.get(6).and_then(|s| s.bytes().next()).unwrap_or(b' ');

                                let fix = DecodedFix {
                                    valid: true,
                                    lat: if self.privacy { 0.0 } else { parse_coordinate(lat) },
                                    lon: if self.privacy { 0.0 } else { parse_coordinate(lon) },
                                    ns,
                                    ew,
                                    date: date_num,
                                    time: time_num,
                                    satellites: None,
                                };
                                outcome.fix = Some(fix);

                                if self.burst_flags & NEW_BURST != 0 {
                                    if let Some(utc) = assemble_utc(date_num, time_num) {
                                        outcome.discipline_events.push(DisciplineEvent {
                                            source_utc: utc,
                                            local_reference,
                                        });
                                    }
                                    self.burst_flags &= !NEW_BURST;
                                }
                            }
                        }
                    }
                }
            }
            "GGA" => {
                if let (Some(status), Some(sat_count)) = (fields.get(6), fields.get(7)) {
                    let quality_ok = status
                        .chars()
                        .next()
                        .map(|c| matches!(c, '1'..='5'))
                        .unwrap_or(false);
                    let sats: Option<u8> = sat_count.parse().ok();
                    if let (true, Some(sats)) = (quality_ok, sats) {
                        if sats >= 3 {
                            if let Some(existing) = outcome.fix.as_mut() {
                                existing.satellites = Some(sats);
                            }
                        }
                    } else if !quality_ok {
                        outcome.fix = Some(DecodedFix {
                            valid: false,
                            ..Default::default()
                        });
                    }
                }
            }
            "GLL" => {
                if fields.get(6) == Some(&"A") {
                    // position-only fix, folded into the RMC-driven discipline path
                } else if fields.get(6).is_some() {
                    outcome.fix = Some(DecodedFix {
                        valid: false,
                        ..Default::default()
                    });
                }
            }
            "TXT" => {
                outcome.text_lines.push(text.clone());
            }
            _ => {}
        }

        outcome.raw_sentences.push((text, flags, t_dollar));
    }
}

fn parse_numeric_field(field: &str, width: usize) -> Option<u32> {
    let digits: String = field.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() < width {
        return None;
    }
    digits[..width].parse().ok()
}

/// "ddmm.mmmm" / "dddmm.mmmm" -> degrés décimaux.
fn parse_coordinate(raw: &str) -> f64 {
    if raw.len() < 4 {
        return 0.0;
    }
    let dot = match raw.find('.') {
        Some(d) => d,
        None => return raw.parse().unwrap_or(0.0),
    };
    let deg_len = dot - 2;
    let degrees: f64 = raw[..deg_len].parse().unwrap_or(0.0);
    let minutes: f64 = raw[deg_len..].parse().unwrap_or(0.0);
    degrees + minutes / 60.0
}

fn assemble_utc(date_ddmmyy: u32, time_hhmmss: u32) -> Option<DateTime<Utc>> {
    let day = date_ddmmyy / 10000;
    let month = (date_ddmmyy / 100) % 100;
    let year = 2000 + date_ddmmyy % 100;
    let hour = time_hhmmss / 10000;
    let minute = (time_hhmmss / 100) % 100;
    let second = time_hhmmss % 100;

    let date = NaiveDate::from_ymd_opt(year as i32, month, day)?;
    let time = NaiveTime::from_hms_opt(hour, minute, second)?;
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_detection_on_first_read() {
        let mut decoder = NmeaDecoder::new(false);
        let outcome = decoder.process_read(b"$GPRMC,", Instant::now());
        assert!(decoder.burst_flags & NEW_BURST != 0);
        assert!(outcome.discipline_events.is_empty());
    }

    #[test]
    fn test_rmc_triggers_discipline_on_burst() {
        let mut decoder = NmeaDecoder::new(false);
        let t0 = Instant::now();
        let sentence = b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W,A*6A\r\n";
        let outcome = decoder.process_read(sentence, t0);
        assert_eq!(outcome.discipline_events.len(), 1);
        let event = outcome.discipline_events[0];
        assert_eq!(event.source_utc.format("%H:%M:%S").to_string(), "12:35:19");
        assert!(outcome.fix.unwrap().valid);
    }

    #[test]
    fn test_rmc_rejects_valid_status_with_degraded_mode_indicator() {
        let mut decoder = NmeaDecoder::new(false);
        let sentence = b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W,N*00\r\n";
        let outcome = decoder.process_read(sentence, Instant::now());
        assert_eq!(outcome.fix.map(|f| f.valid), Some(false));
    }

    #[test]
    fn test_invalid_fix_clears_validity() {
        let mut decoder = NmeaDecoder::new(false);
        let sentence = b"$GPRMC,123519,V,,,,,,,230394,,*normal\r\n";
        let outcome = decoder.process_read(sentence, Instant::now());
        assert_eq!(outcome.fix.map(|f| f.valid), Some(false));
    }

    #[test]
    fn test_non_fix_talker_ignored_for_discipline() {
        let mut decoder = NmeaDecoder::new(false);
        let sentence = b"$PGLOR,STATUS*00\r\n"; // unsupported talker/type
        let outcome = decoder.process_read(sentence, Instant::now());
        assert!(outcome.discipline_events.is_empty());
        assert!(outcome.fix.is_none());
    }

    #[test]
    fn test_privacy_zeroes_coordinates() {
        let mut decoder = NmeaDecoder::new(true);
        let sentence = b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W,A*6A\r\n";
        let outcome = decoder.process_read(sentence, Instant::now());
        let fix = outcome.fix.unwrap();
        assert_eq!(fix.lat, 0.0);
        assert_eq!(fix.lon, 0.0);
    }

    #[test]
    fn test_byte_rate_estimator_saturation_halves() {
        let mut rate = ByteRateEstimator::new();
        rate.total_bytes = SATURATION + 10;
        rate.total_ms = 10;
        rate.add_sample(1, 1);
        assert!(rate.total_bytes < SATURATION);
    }
}
