use bias_core::tags::RECORD_PREFIX;
use bias_io::{BridgeConfig, SerialSettings, DEFAULT_MODEL};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub show_version: bool,
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub expect_model: String,
    pub simulate: bool,
    pub cycle_config_path: Option<PathBuf>,
    pub bind_addr: String,
    pub bridge_enabled: bool,
    pub poll_ms: u64,
    pub record_prefix: String,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    pub run_seconds: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let serial = SerialSettings::default();
        Self {
            show_help: false,
            show_version: false,
            port: serial.path,
            baud_rate: serial.baud_rate,
            read_timeout_ms: serial.read_timeout.as_millis() as u64,
            expect_model: DEFAULT_MODEL.to_string(),
            simulate: false,
            cycle_config_path: None,
            bind_addr: BridgeConfig::default().bind_addr,
            bridge_enabled: true,
            poll_ms: 500,
            record_prefix: RECORD_PREFIX.to_string(),
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
            run_seconds: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Self {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--port" => {
                    if i + 1 < args.len() {
                        cfg.port = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--baud" => {
                    if i + 1 < args.len() {
                        cfg.baud_rate = args[i + 1].parse().unwrap_or(cfg.baud_rate);
                        i += 1;
                    }
                }
                "--read-timeout-ms" => {
                    if i + 1 < args.len() {
                        cfg.read_timeout_ms = args[i + 1].parse().unwrap_or(cfg.read_timeout_ms);
                        i += 1;
                    }
                }
                "--expect-model" => {
                    if i + 1 < args.len() {
                        cfg.expect_model = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--simulate" => {
                    cfg.simulate = true;
                }
                "--cycle-config" => {
                    if i + 1 < args.len() {
                        cfg.cycle_config_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--bind" => {
                    if i + 1 < args.len() {
                        cfg.bind_addr = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--no-bridge" => {
                    cfg.bridge_enabled = false;
                }
                "--poll-ms" => {
                    if i + 1 < args.len() {
                        cfg.poll_ms = args[i + 1].parse().unwrap_or(cfg.poll_ms);
                        i += 1;
                    }
                }
                "--record-prefix" => {
                    if i + 1 < args.len() {
                        cfg.record_prefix = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    if i + 1 < args.len() {
                        cfg.log_dir = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--metrics-addr" => {
                    if i + 1 < args.len() {
                        cfg.metrics_addr = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--audit-log" => {
                    if i + 1 < args.len() {
                        cfg.audit_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--run-seconds" => {
                    if i + 1 < args.len() {
                        cfg.run_seconds = args[i + 1].parse::<u64>().ok();
                        i += 1;
                    }
                }
                "--version" | "-V" => {
                    cfg.show_version = true;
                    break;
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        cfg
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            path: self.port.clone(),
            baud_rate: self.baud_rate,
            read_timeout: self.read_timeout(),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Readback period. Zero falls back to the default so the poller cannot spin.
    pub fn poll_interval(&self) -> Duration {
        match self.poll_ms {
            0 => bias_io::control::POLL_INTERVAL,
            ms => Duration::from_millis(ms),
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            bind_addr: self.bind_addr.clone(),
            record_prefix: self.record_prefix.clone(),
            ..Default::default()
        }
    }

    pub fn print_help() {
        println!(
            r#"hv-bias - High-voltage bias supply controller for a Keithley 24xx source-meter

USAGE:
    hv-bias [OPTIONS]

OPTIONS:
    --port <PATH>           Serial device of the source-meter [default: /dev/ttyUSB0]
    --baud <RATE>           Serial baud rate [default: 38400]
    --read-timeout-ms <MS>  Reply timeout per query [default: 1000]
    --expect-model <STR>    Substring required in the *idn? reply [default: MODEL 24]
    --simulate              Run against the built-in simulated instrument
    --cycle-config <PATH>   JSON file with the initial depolarisation configuration
    --bind <ADDR>           Record bridge TCP bind address [default: 127.0.0.1:7010]
    --no-bridge             Disable the record bridge
    --poll-ms <MS>          Readback poll period [default: 500]
    --record-prefix <STR>   Record name prefix published to clients [default: BL15J-EA-HV-01]
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-dir <PATH>        Also write daily-rolling JSON logs to this directory
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>      Enable audit logging to specified JSONL file
    --run-seconds <SECS>    Run for a fixed duration then exit
    -V, --version           Print version and exit
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,bias_io=trace)

EXAMPLES:
    # Beamline run with metrics and an audit trail
    hv-bias --port /dev/ttyUSB0 --metrics-addr 0.0.0.0:9090 --audit-log /var/log/hv-bias/audit.jsonl

    # Short simulated run
    hv-bias --simulate --run-seconds 10 --no-bridge
"#
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("hv-bias")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_match_the_instrument_link() {
        let cfg = RuntimeConfig::from_args(&args(&[]));
        let serial = cfg.serial_settings();
        assert_eq!(serial.path, "/dev/ttyUSB0");
        assert_eq!(serial.baud_rate, 38_400);
        assert_eq!(serial.read_timeout, Duration::from_secs(1));
        assert_eq!(cfg.expect_model, "MODEL 24");
        assert_eq!(cfg.poll_interval(), Duration::from_millis(500));
        assert!(cfg.bridge_enabled);
        assert!(!cfg.simulate);
        assert_eq!(cfg.bridge_config().record_prefix, "BL15J-EA-HV-01");
    }

    #[test]
    fn parses_link_and_surface_options() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--port",
            "/dev/ttyS3",
            "--baud",
            "9600",
            "--read-timeout-ms",
            "250",
            "--simulate",
            "--cycle-config",
            "cycle.json",
            "--bind",
            "0.0.0.0:7100",
            "--no-bridge",
            "--poll-ms",
            "200",
            "--record-prefix",
            "TEST-HV",
            "--json-logs",
            "--log-dir",
            "/tmp/hv",
            "--metrics-addr",
            "0.0.0.0:9090",
            "--audit-log",
            "audit.jsonl",
            "--run-seconds",
            "5",
        ]));
        assert_eq!(cfg.port, "/dev/ttyS3");
        assert_eq!(cfg.baud_rate, 9600);
        assert_eq!(cfg.read_timeout(), Duration::from_millis(250));
        assert!(cfg.simulate);
        assert_eq!(cfg.cycle_config_path, Some(PathBuf::from("cycle.json")));
        assert_eq!(cfg.bridge_config().bind_addr, "0.0.0.0:7100");
        assert!(!cfg.bridge_enabled);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(200));
        assert_eq!(cfg.bridge_config().record_prefix, "TEST-HV");
        assert!(cfg.json_logs);
        assert_eq!(cfg.log_dir, Some(PathBuf::from("/tmp/hv")));
        assert_eq!(cfg.metrics_addr.as_deref(), Some("0.0.0.0:9090"));
        assert_eq!(cfg.audit_path, Some(PathBuf::from("audit.jsonl")));
        assert_eq!(cfg.run_seconds, Some(5));
    }

    #[test]
    fn bad_numbers_keep_defaults() {
        let cfg = RuntimeConfig::from_args(&args(&["--baud", "fast", "--poll-ms", "0"]));
        assert_eq!(cfg.baud_rate, 38_400);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn help_and_version_stop_parsing() {
        let cfg = RuntimeConfig::from_args(&args(&["-h", "--simulate"]));
        assert!(cfg.show_help);
        assert!(!cfg.simulate);

        let cfg = RuntimeConfig::from_args(&args(&["--version"]));
        assert!(cfg.show_version);
    }
}
