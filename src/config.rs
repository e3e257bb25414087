// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use crate::error::ConfigError;

/// Session bandwidth in bytes per second (64 kbit/s)
pub const DEFAULT_BANDWIDTH: u32 = 8_000;
pub const DEFAULT_RTCP_FRACTION: f64 = 0.05;
pub const DEFAULT_MIN_RTCP_INTERVAL: Duration = Duration::from_secs(5);
/// UDP + IPv4 header overhead
pub const DEFAULT_HEADER_LEN: usize = 28;
pub const DEFAULT_MTU: usize = 1200;
pub const DEFAULT_PROBATION: u32 = 2;
pub const DEFAULT_BYE_TIMEOUT: Duration = Duration::from_secs(5);

// RTCP header + SR sender info + one report block
const MIN_MTU: usize = 28 + 24 + 28;

const BANDWIDTH_ENV_VAR: &str = "RTPSESSION_BANDWIDTH";
const RTCP_FRACTION_ENV_VAR: &str = "RTPSESSION_RTCP_FRACTION";
const MIN_RTCP_INTERVAL_MS_ENV_VAR: &str = "RTPSESSION_MIN_RTCP_INTERVAL_MS";
const MTU_ENV_VAR: &str = "RTPSESSION_MTU";
const PROBATION_ENV_VAR: &str = "RTPSESSION_PROBATION";

/// Configuration of a [`Session`](crate::Session)
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Session bandwidth in bytes per second.  0 estimates the bandwidth from the bitrate of the
    /// active senders.
    pub bandwidth: u32,
    /// Fraction of the session bandwidth used for RTCP.  0 disables RTCP.
    pub rtcp_fraction: f64,
    pub min_rtcp_interval: Duration,
    /// Canonical name of the local participant.  A random one is generated if unset.
    pub cname: Option<String>,
    pub name: Option<String>,
    pub tool: Option<String>,
    pub note: Option<String>,
    /// Transport overhead added to every RTCP packet size for the average size calculation
    pub header_len: usize,
    /// Maximum size of a generated RTCP compound packet
    pub mtu: usize,
    /// Number of consecutive packets required to validate a new RTP source
    pub probation: u32,
    /// Minimum time a source is kept around after it sent a BYE
    pub bye_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bandwidth: DEFAULT_BANDWIDTH,
            rtcp_fraction: DEFAULT_RTCP_FRACTION,
            min_rtcp_interval: DEFAULT_MIN_RTCP_INTERVAL,
            cname: None,
            name: None,
            tool: None,
            note: None,
            header_len: DEFAULT_HEADER_LEN,
            mtu: DEFAULT_MTU,
            probation: DEFAULT_PROBATION,
            bye_timeout: DEFAULT_BYE_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn bandwidth(mut self, bandwidth: u32) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn rtcp_fraction(mut self, rtcp_fraction: f64) -> Self {
        self.rtcp_fraction = rtcp_fraction;
        self
    }

    pub fn min_rtcp_interval(mut self, min_rtcp_interval: Duration) -> Self {
        self.min_rtcp_interval = min_rtcp_interval;
        self
    }

    pub fn cname(mut self, cname: impl Into<String>) -> Self {
        self.cname = Some(cname.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn header_len(mut self, header_len: usize) -> Self {
        self.header_len = header_len;
        self
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn probation(mut self, probation: u32) -> Self {
        self.probation = probation;
        self
    }

    pub fn bye_timeout(mut self, bye_timeout: Duration) -> Self {
        self.bye_timeout = bye_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.rtcp_fraction) {
            return Err(ConfigError::InvalidRtcpFraction(self.rtcp_fraction));
        }
        if self.mtu < MIN_MTU {
            return Err(ConfigError::MtuTooSmall {
                mtu: self.mtu,
                min: MIN_MTU,
            });
        }
        if self.min_rtcp_interval.is_zero() {
            return Err(ConfigError::ZeroMinRtcpInterval);
        }
        Ok(())
    }

    /// The default configuration with any `RTPSESSION_*` environment variable overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(bandwidth) = env_var(BANDWIDTH_ENV_VAR)? {
            config.bandwidth = bandwidth;
        }
        if let Some(rtcp_fraction) = env_var(RTCP_FRACTION_ENV_VAR)? {
            config.rtcp_fraction = rtcp_fraction;
        }
        if let Some(ms) = env_var::<u64>(MIN_RTCP_INTERVAL_MS_ENV_VAR)? {
            config.min_rtcp_interval = Duration::from_millis(ms);
        }
        if let Some(mtu) = env_var(MTU_ENV_VAR)? {
            config.mtu = mtu;
        }
        if let Some(probation) = env_var(PROBATION_ENV_VAR)? {
            config.probation = probation;
        }

        config.validate()?;
        Ok(config)
    }
}

fn env_var<T>(env_var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + std::fmt::Display,
{
    match std::env::var(env_var) {
        Ok(val) => {
            let Ok(val) = val.parse::<T>() else {
                return Err(ConfigError::InvalidEnvVar { env_var });
            };
            info!("{env_var} defined => using value {val}");
            Ok(Some(val))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(_) => Err(ConfigError::InvalidEnvVar { env_var }),
    }
}
