//! Analyse de la ligne de commande (§6): pas de fichier de configuration,
//! un script d'init est censé construire la ligne de commande en amont.
//! Le style d'options suit l'esprit `echttp_option_*`: `-flag` ou
//! `-flag=valeur`, sans double tiret ni sous-commandes.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid value for {flag}: {value}")]
    InvalidValue { flag: String, value: String },
    #[error("help requested")]
    HelpRequested,
}

#[derive(Debug, Clone)]
pub struct Cli {
    pub debug: bool,
    pub test_mode: bool,
    pub db_megabytes: u32,
    pub precision_ms: i64,
    pub drift_log: bool,
    pub gps_device: Option<PathBuf>,
    pub latency_ms: i64,
    pub baud_candidates: Vec<u32>,
    pub burst: bool,
    pub privacy: bool,
    pub show_nmea: bool,
    pub ntp_service: String,
    pub ntp_period_secs: u32,
    pub ntp_reference: Option<String>,
    pub ntp_broadcast: bool,
    pub http_service: String,
}

fn default_baud_candidates() -> Vec<u32> {
    vec![115_200, 57_600, 38_400, 19_200, 9_600, 4_800]
}

impl Default for Cli {
    fn default() -> Self {
        Cli {
            debug: false,
            test_mode: false,
            db_megabytes: 1,
            precision_ms: 10,
            drift_log: false,
            gps_device: None,
            latency_ms: 0,
            baud_candidates: default_baud_candidates(),
            burst: false,
            privacy: false,
            show_nmea: false,
            ntp_service: "123".to_string(),
            ntp_period_secs: 64,
            ntp_reference: None,
            ntp_broadcast: false,
            http_service: "8080".to_string(),
        }
    }
}

pub const USAGE: &str = "\
Usage: housetimed [options]

  -h                    show this help and exit
  -debug                enable verbose (debug-level) logging
  -test                 run in test mode (no clock step/slew applied)
  -db=<MiB>             shared arena size in mebibytes (default 1)
  -precision=<ms>       advertised clock precision in milliseconds (default 10)
  -drift                log every clock discipline correction
  -gps=<path>           GPS serial device (e.g. /dev/ttyACM0)
  -latency=<ms>         fixed GPS sentence latency compensation, in milliseconds
  -baud=<rate>          try this baud rate first when opening the GPS device
  -burst                enable burst-mode NMEA timing diagnostics
  -privacy              do not expose the decoded GPS position
  -show-nmea            echo raw NMEA sentences to the log at debug level
  -ntp-service=<port>   NTP service port or name (default 123)
  -ntp-period=<secs>    broadcast/calibration period in seconds (default 64)
  -ntp-reference=<host> calibration NTP server to poll for offset sanity checks
  -ntp-broadcast        enable NTP mode-5 broadcast transmission
  -http-service=<port>  status HTTP service port or name (default 8080)
";

impl Cli {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self, ConfigError> {
        let mut cli = Cli::default();

        for arg in args {
            let (flag, value) = match arg.split_once('=') {
                Some((f, v)) => (f, Some(v)),
                None => (arg.as_str(), None),
            };

            match flag {
                "-h" | "--help" => return Err(ConfigError::HelpRequested),
                "-debug" => cli.debug = true,
                "-test" => cli.test_mode = true,
                "-drift" => cli.drift_log = true,
                "-burst" => cli.burst = true,
                "-privacy" => cli.privacy = true,
                "-show-nmea" => cli.show_nmea = true,
                "-ntp-broadcast" => cli.ntp_broadcast = true,
                "-db" => cli.db_megabytes = parse_value(flag, value)?,
                "-precision" => cli.precision_ms = parse_value(flag, value)?,
                "-latency" => cli.latency_ms = parse_value(flag, value)?,
                "-baud" => {
                    let rate: u32 = parse_value(flag, value)?;
                    cli.baud_candidates.retain(|&b| b != rate);
                    cli.baud_candidates.insert(0, rate);
                }
                "-gps" => {
                    cli.gps_device = Some(PathBuf::from(require_value(flag, value)?));
                }
                "-ntp-service" => cli.ntp_service = require_value(flag, value)?.to_string(),
                "-ntp-period" => cli.ntp_period_secs = parse_value(flag, value)?,
                "-ntp-reference" => {
                    cli.ntp_reference = Some(require_value(flag, value)?.to_string());
                }
                "-http-service" => cli.http_service = require_value(flag, value)?.to_string(),
                other => return Err(ConfigError::UnknownOption(other.to_string())),
            }
        }

        Ok(cli)
    }
}

fn require_value<'a>(flag: &str, value: Option<&'a str>) -> Result<&'a str, ConfigError> {
    value.ok_or_else(|| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: String::new(),
    })
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<&str>) -> Result<T, ConfigError> {
    let raw = require_value(flag, value)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cli() {
        let cli = Cli::default();
        assert_eq!(cli.ntp_service, "123");
        assert_eq!(cli.db_megabytes, 1);
        assert!(!cli.debug);
    }

    #[test]
    fn test_parse_flags_and_values() {
        let args = vec![
            "-debug".to_string(),
            "-gps=/dev/ttyACM0".to_string(),
            "-precision=5".to_string(),
            "-ntp-broadcast".to_string(),
            "-baud=9600".to_string(),
        ];
        let cli = Cli::parse(args).unwrap();
        assert!(cli.debug);
        assert_eq!(cli.gps_device, Some(PathBuf::from("/dev/ttyACM0")));
        assert_eq!(cli.precision_ms, 5);
        assert!(cli.ntp_broadcast);
        assert_eq!(cli.baud_candidates[0], 9600);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = Cli::parse(vec!["-bogus".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption(_)));
    }

    #[test]
    fn test_help_requested() {
        let err = Cli::parse(vec!["-h".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::HelpRequested));
    }

    #[test]
    fn test_invalid_numeric_value() {
        let err = Cli::parse(vec!["-precision=not-a-number".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
