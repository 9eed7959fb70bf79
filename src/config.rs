//! Boot-time SMP configuration.
//!
//! Parsed from whitespace-separated `key=value` tokens on the kernel command
//! line. Unknown keys belong to someone else and are skipped; known keys with
//! bad values are reported and leave the default in place.
//!
//! | key                 | values               | default  |
//! |---------------------|----------------------|----------|
//! | `smp.sipi`          | `single`, `double`   | `single` |
//! | `smp.trampoline`    | `direct`, `callgate` | `direct` |
//! | `smp.init_delay_us` | integer              | `10000`  |
//! | `smp.sipi_delay_us` | integer              | `200`    |
//! | `loglevel` / `log`  | `error` ... `trace`  | unset    |

use thiserror::Error;

use crate::logger::LogLevel;
use crate::smp::TrampolineKind;

pub const DEFAULT_INIT_DELAY_US: u64 = 10_000;
pub const DEFAULT_SIPI_DELAY_US: u64 = 200;

/// How many STARTUP pulses bring-up sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SipiPolicy {
    Single,
    /// Intel's recommended INIT-SIPI-SIPI, with `sipi_delay_us` between pulses.
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError<'a> {
    #[error("unknown value `{value}` for `{key}`")]
    UnknownValue { key: &'static str, value: &'a str },
    #[error("`{key}` expects an integer, got `{value}`")]
    InvalidNumber { key: &'static str, value: &'a str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SmpConfig {
    pub sipi: SipiPolicy,
    pub trampoline: TrampolineKind,
    pub init_delay_us: u64,
    pub sipi_delay_us: u64,
    pub log_level: Option<LogLevel>,
}

impl SmpConfig {
    pub const fn new() -> Self {
        Self {
            sipi: SipiPolicy::Single,
            trampoline: TrampolineKind::Direct,
            init_delay_us: DEFAULT_INIT_DELAY_US,
            sipi_delay_us: DEFAULT_SIPI_DELAY_US,
            log_level: None,
        }
    }

    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::new();
        for token in cmdline.split_whitespace() {
            if let Err(err) = config.apply(token) {
                crate::kwarn!("SMP config: {}, keeping default", err);
            }
        }
        config
    }

    /// Applies one `key=value` token. Tokens without `=` or with a foreign
    /// key are ignored.
    pub fn apply<'a>(&mut self, token: &'a str) -> Result<(), ConfigError<'a>> {
        let Some((key, value)) = token.split_once('=') else {
            return Ok(());
        };

        match key {
            "smp.sipi" => {
                self.sipi = if value.eq_ignore_ascii_case("single") {
                    SipiPolicy::Single
                } else if value.eq_ignore_ascii_case("double") {
                    SipiPolicy::Double
                } else {
                    return Err(ConfigError::UnknownValue {
                        key: "smp.sipi",
                        value,
                    });
                };
            }
            "smp.trampoline" => {
                self.trampoline =
                    TrampolineKind::from_str(value).ok_or(ConfigError::UnknownValue {
                        key: "smp.trampoline",
                        value,
                    })?;
            }
            "smp.init_delay_us" => {
                self.init_delay_us = parse_number("smp.init_delay_us", value)?;
            }
            "smp.sipi_delay_us" => {
                self.sipi_delay_us = parse_number("smp.sipi_delay_us", value)?;
            }
            "log" | "loglevel" => {
                let level = LogLevel::from_str(value)
                    .ok_or(ConfigError::UnknownValue { key: "loglevel", value })?;
                self.log_level = Some(level);
            }
            _ => {}
        }
        Ok(())
    }
}

impl Default for SmpConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number<'a>(key: &'static str, value: &'a str) -> Result<u64, ConfigError<'a>> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidNumber { key, value })
}
