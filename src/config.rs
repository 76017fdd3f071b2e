//! Multiplexer configuration.
//!
//! Every knob is a named field on a plain struct with a `Default`. A
//! [`MuxConfig`] can additionally be layered from `VDKMUX_*` environment
//! variables and a simple `key = value` file.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{MuxError, Result};
use crate::format::ts::clock::ms_to_ticks;
use crate::format::ts::types::{PID_MAX, PID_PMT, PTS_HZ};
use crate::mux::frame::index_flags;

/// Default output clock quantum: 50ms.
pub const DEFAULT_PCR_PERIOD: u64 = 4500;
/// Default output bitrate in bits per second.
pub const DEFAULT_BITRATE: u64 = 20_000_000;
/// Default frame slots per multiplexer.
pub const DEFAULT_MAX_BUFFERS: usize = 512;
/// Default bounded wait of a pull.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_millis(200);
/// Wall-clock time a stream may go without data before it stops shielding others.
pub const DEFAULT_STREAM_WAIT_TIME: Duration = Duration::from_secs(7);
/// 90kHz ticks a lone discontinuous stream waits before forcing a restart.
pub const DEFAULT_FULL_DISCONTINUITY_WAIT: u64 = 5 * PTS_HZ;
/// Default DTS jump tolerated between consecutive frames: 10s.
pub const DEFAULT_DTS_INTEGRITY_THRESHOLD: u64 = 10 * PTS_HZ;
/// Default data a stream must hold past the next period: 200ms.
pub const DEFAULT_MULTIPLEX_AHEAD_LIMIT: u64 = 18_000;
/// Default lead over the reference point before a stream is auto-paused: 2s.
pub const DEFAULT_DONT_WAIT_LIMIT: u64 = 2 * PTS_HZ;
/// Default PID of the program clock packets.
pub const DEFAULT_PCR_PID: u16 = 0x01ff;

/// Table generation flags.
pub mod table_generation {
    /// Generate PAT and PMT.
    pub const PAT_PMT: u32 = 1;
    /// Generate SDT.
    pub const SDT: u32 = 4;
}

/// What `stop` does while the multiplexer is still flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    /// Refuse to stop until flushed data has been drained.
    #[default]
    Complete,
    /// Drop everything immediately.
    Forced,
}

impl StopMode {
    pub(crate) fn from_value(v: u64) -> Result<Self> {
        match v {
            0 => Ok(StopMode::Complete),
            1 => Ok(StopMode::Forced),
            _ => Err(MuxError::Config(format!("invalid stop mode {}", v))),
        }
    }

    pub(crate) fn value(self) -> u64 {
        match self {
            StopMode::Complete => 0,
            StopMode::Forced => 1,
        }
    }
}

/// Output packet framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputType {
    /// Plain 188-byte transport stream packets
    #[default]
    Ts,
    /// 192-byte packets prefixed with a 4-byte arrival timestamp
    Tts,
}

/// How index sink reads behave on an empty ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    #[default]
    Blocking,
    NonBlocking,
}

/// Session-wide multiplexer settings.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Output time produced per transform, in 90kHz ticks.
    pub pcr_period: u64,
    /// Output bitrate in bits per second.
    pub bitrate: u64,
    /// Pad each period with null packets up to the bitrate.
    pub fixed_bitrate: bool,
    /// Frame slots shared by all streams.
    pub max_buffers: usize,
    /// Memory budget for queued payload; defaults to two seconds at `bitrate`.
    pub max_memory: Option<usize>,
    pub pull_timeout: Duration,
    pub stream_wait_time: Duration,
    /// 90kHz ticks a lone discontinuous stream may keep failing before a restart.
    pub full_discontinuity_wait: u64,
    /// Union of [`table_generation`] flags.
    pub table_generation: u32,
    /// Table repetition period in 90kHz ticks.
    pub table_period: u64,
    pub transport_stream_id: u16,
    pub program_number: u16,
    pub pmt_pid: u16,
    pub pcr_pid: u16,
    pub output_type: OutputType,
    pub stop_mode: StopMode,
    pub provider_name: String,
    pub service_name: String,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            pcr_period: DEFAULT_PCR_PERIOD,
            bitrate: DEFAULT_BITRATE,
            fixed_bitrate: true,
            max_buffers: DEFAULT_MAX_BUFFERS,
            max_memory: None,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            stream_wait_time: DEFAULT_STREAM_WAIT_TIME,
            full_discontinuity_wait: DEFAULT_FULL_DISCONTINUITY_WAIT,
            table_generation: table_generation::PAT_PMT,
            table_period: ms_to_ticks(100),
            transport_stream_id: 1,
            program_number: 1,
            pmt_pid: PID_PMT,
            pcr_pid: DEFAULT_PCR_PID,
            output_type: OutputType::Ts,
            stop_mode: StopMode::Complete,
            provider_name: String::from("vdkmux"),
            service_name: String::from("service01"),
        }
    }
}

impl MuxConfig {
    /// Defaults overlaid with `VDKMUX_*` variables, then the first config file found.
    pub fn from_sources() -> Result<Self> {
        let mut config = Self::from_env()?;

        let config_paths = ["./vdkmux.toml", "./vdkmux_config.toml"];
        if let Some(path) = config_paths.iter().find(|p| Path::new(p).exists()) {
            let content = fs::read_to_string(path)?;
            config.apply_str(&content)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `VDKMUX_<KEY>` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        for key in Self::KEYS {
            if let Ok(value) = env::var(format!("VDKMUX_{}", key.to_uppercase())) {
                config.apply(key, &value)?;
            }
        }
        Ok(config)
    }

    /// Defaults overlaid with the `key = value` lines of `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config = Self::default();
        config.apply_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    const KEYS: [&'static str; 18] = [
        "pcr_period",
        "bitrate",
        "fixed_bitrate",
        "max_buffers",
        "max_memory",
        "pull_timeout_ms",
        "stream_wait_time_ms",
        "full_discontinuity_wait",
        "table_generation",
        "table_period",
        "transport_stream_id",
        "program_number",
        "pmt_pid",
        "pcr_pid",
        "output_type",
        "stop_mode",
        "provider_name",
        "service_name",
    ];

    fn apply_str(&mut self, content: &str) -> Result<()> {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(MuxError::Config(format!("malformed line: {}", line)));
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            self.apply(key.trim(), value)?;
        }
        Ok(())
    }

    /// Sets one field by name.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "pcr_period" => self.pcr_period = value.parse()?,
            "bitrate" => self.bitrate = value.parse()?,
            "fixed_bitrate" => self.fixed_bitrate = parse_bool(value)?,
            "max_buffers" => self.max_buffers = value.parse()?,
            "max_memory" => self.max_memory = Some(value.parse()?),
            "pull_timeout_ms" => self.pull_timeout = Duration::from_millis(value.parse()?),
            "stream_wait_time_ms" => {
                self.stream_wait_time = Duration::from_millis(value.parse()?)
            }
            "full_discontinuity_wait" => self.full_discontinuity_wait = value.parse()?,
            "table_generation" => self.table_generation = value.parse()?,
            "table_period" => self.table_period = value.parse()?,
            "transport_stream_id" => self.transport_stream_id = value.parse()?,
            "program_number" => self.program_number = value.parse()?,
            "pmt_pid" => self.pmt_pid = parse_pid(value)?,
            "pcr_pid" => self.pcr_pid = parse_pid(value)?,
            "output_type" => {
                self.output_type = match value {
                    "ts" => OutputType::Ts,
                    "tts" => OutputType::Tts,
                    other => {
                        return Err(MuxError::Config(format!("unknown output type {}", other)))
                    }
                }
            }
            "stop_mode" => {
                self.stop_mode = match value {
                    "complete" => StopMode::Complete,
                    "forced" => StopMode::Forced,
                    other => return Err(MuxError::Config(format!("unknown stop mode {}", other))),
                }
            }
            "provider_name" => self.provider_name = value.to_string(),
            "service_name" => self.service_name = value.to_string(),
            other => return Err(MuxError::Config(format!("unknown key {}", other))),
        }
        Ok(())
    }

    /// Rejects settings the multiplexer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pcr_period == 0 {
            return Err(MuxError::Config("pcr_period must be non-zero".into()));
        }
        if self.bitrate == 0 {
            return Err(MuxError::Config("bitrate must be non-zero".into()));
        }
        if self.max_buffers <= crate::mux::BUFFER_RESERVE {
            return Err(MuxError::Config(format!(
                "max_buffers must exceed the reserve of {}",
                crate::mux::BUFFER_RESERVE
            )));
        }
        if self.pmt_pid == 0 || self.pmt_pid > PID_MAX || self.pcr_pid > PID_MAX {
            return Err(MuxError::Config("PID out of range".into()));
        }
        if self.pmt_pid == self.pcr_pid {
            return Err(MuxError::Config("PMT and PCR PIDs collide".into()));
        }
        Ok(())
    }

    /// Bytes of queued payload allowed before auto-pause kicks in.
    pub fn max_memory(&self) -> usize {
        self.max_memory
            .unwrap_or_else(|| (self.bitrate / 8 * 2) as usize)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(MuxError::Config(format!("not a boolean: {}", other))),
    }
}

fn parse_pid(value: &str) -> Result<u16> {
    let pid = match value.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16)?,
        None => value.parse()?,
    };
    if pid > PID_MAX {
        return Err(MuxError::Config(format!("PID {:#x} out of range", pid)));
    }
    Ok(pid)
}

/// Settings of one elementary stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// MPEG-TS stream_type written into the PMT.
    pub stream_type: u8,
    /// Output PID; allocated from 0x100 upward when unset.
    pub pid: Option<u16>,
    /// PES stream_id; derived from the stream type when unset.
    pub stream_id: Option<u8>,
    /// Payloads already carry a PES header with their timestamps.
    pub stream_is_pes: bool,
    /// Sparse stream (e.g. subtitles) never required for readiness.
    pub scattered: bool,
    /// Largest forward DTS jump accepted, 0 disables the check.
    pub dts_integrity_threshold: u64,
    pub multiplex_ahead_limit: u64,
    pub dont_wait_limit: u64,
    /// Decoder buffer size used to seed the initial clock.
    pub decoder_buffer_bits: u64,
    pub ignore_auto_pause: bool,
    /// Skip the first-frame cross check against sibling streams.
    pub ignore_first_dts_check: bool,
    /// Produce RAP index records for random access frames.
    pub include_rap: bool,
}

impl StreamConfig {
    /// A stream of the given MPEG-TS stream type with default timing.
    pub fn new(stream_type: u8) -> Self {
        Self {
            stream_type,
            pid: None,
            stream_id: None,
            stream_is_pes: false,
            scattered: false,
            dts_integrity_threshold: DEFAULT_DTS_INTEGRITY_THRESHOLD,
            multiplex_ahead_limit: DEFAULT_MULTIPLEX_AHEAD_LIMIT,
            dont_wait_limit: DEFAULT_DONT_WAIT_LIMIT,
            decoder_buffer_bits: 0,
            ignore_auto_pause: false,
            ignore_first_dts_check: false,
            include_rap: false,
        }
    }

    pub fn with_pid(mut self, pid: u16) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_stream_is_pes(mut self, stream_is_pes: bool) -> Self {
        self.stream_is_pes = stream_is_pes;
        self
    }

    pub fn with_scattered(mut self, scattered: bool) -> Self {
        self.scattered = scattered;
        self
    }

    pub fn with_dts_integrity_threshold(mut self, ticks: u64) -> Self {
        self.dts_integrity_threshold = ticks;
        self
    }

    pub fn with_multiplex_ahead_limit(mut self, ticks: u64) -> Self {
        self.multiplex_ahead_limit = ticks;
        self
    }

    pub fn with_dont_wait_limit(mut self, ticks: u64) -> Self {
        self.dont_wait_limit = ticks;
        self
    }

    pub fn with_decoder_buffer_bits(mut self, bits: u64) -> Self {
        self.decoder_buffer_bits = bits;
        self
    }

    pub fn with_include_rap(mut self, include_rap: bool) -> Self {
        self.include_rap = include_rap;
        self
    }
}

/// Settings of a section (PSI/SI table) stream.
#[derive(Debug, Clone)]
pub struct SectionConfig {
    pub pid: u16,
}

/// Settings of an index sink.
#[derive(Debug, Clone)]
pub struct IndexSinkConfig {
    /// Records held before the oldest is overwritten.
    pub capacity: usize,
    /// Union of [`index_flags`] the sink subscribes to.
    pub mask: u32,
    pub mode: ReadMode,
}

impl Default for IndexSinkConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            mask: index_flags::ALL,
            mode: ReadMode::Blocking,
        }
    }
}

/// Creates a default config template file if it doesn't exist
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        let template = r#"# vdkmux configuration
# Output clock quantum in 90kHz ticks
pcr_period = 4500

# Output bitrate in bits per second
bitrate = 20000000
fixed_bitrate = true

max_buffers = 512
pull_timeout_ms = 200

# 1 = PAT/PMT, 4 = SDT
table_generation = 1
pmt_pid = 0x1000
pcr_pid = 0x1ff
stop_mode = "complete"
"#;
        fs::write(path, template)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = MuxConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_memory(), 5_000_000);
        assert_eq!(config.table_period, 9000);
    }

    #[test]
    fn test_apply_lines() {
        let mut config = MuxConfig::default();
        config
            .apply_str(
                "# comment\npcr_period = 9000\npcr_pid = 0x100\nstop_mode = \"forced\"\noutput_type = tts\n",
            )
            .unwrap();
        assert_eq!(config.pcr_period, 9000);
        assert_eq!(config.pcr_pid, 0x100);
        assert_eq!(config.stop_mode, StopMode::Forced);
        assert_eq!(config.output_type, OutputType::Tts);
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = MuxConfig::default();
        assert!(matches!(
            config.apply("bitrate", "fast"),
            Err(MuxError::ParseInt(_))
        ));
        assert!(matches!(
            config.apply("pcr_pid", "0x1fff"),
            Err(MuxError::Config(_))
        ));
        assert!(matches!(
            config.apply("colour", "red"),
            Err(MuxError::Config(_))
        ));
    }

    #[test]
    fn test_validate_catches_bad_ranges() {
        let config = MuxConfig {
            bitrate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MuxConfig {
            max_buffers: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_template_round_trips_through_load() {
        let dir = std::env::temp_dir().join(format!("vdkmux-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("vdkmux.toml");
        let _ = std::fs::remove_file(&path);

        create_default_config_template(&path).unwrap();
        let config = MuxConfig::load(&path).unwrap();
        assert_eq!(config.pcr_period, 4500);
        assert_eq!(config.pmt_pid, 0x1000);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
