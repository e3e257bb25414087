// SPDX-License-Identifier: MPL-2.0

use std::{
    ops::{Add, Sub},
    time::{Duration, SystemTime},
};

// time between the NTP time at 1900-01-01 and the unix EPOCH (1970-01-01)
const NTP_OFFSET: Duration = Duration::from_secs((365 * 70 + 17) * 24 * 60 * 60);

// 2^32
const F32: f64 = 4_294_967_296.0;

/// A 64-bit NTP timestamp in 32.32 fixed point format
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpTime(u64);

impl NtpTime {
    /// An NTP timestamp `dur` after the NTP epoch, or a plain NTP duration
    pub fn from_duration(dur: Duration) -> Self {
        Self((dur.as_secs_f64() * F32) as u64)
    }

    /// The time since the NTP epoch.  Fails only for values that do not fit a [`Duration`].
    pub fn as_duration(&self) -> Result<Duration, std::time::TryFromFloatSecsError> {
        Duration::try_from_secs_f64(self.0 as f64 / F32)
    }

    /// The middle 32 bits, as used in the LSR and DLSR fields of report blocks
    pub fn as_u32(self) -> u32 {
        ((self.0 >> 16) & 0xffffffff) as u32
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Sub for NtpTime {
    type Output = NtpTime;
    fn sub(self, rhs: Self) -> Self::Output {
        NtpTime(self.0.wrapping_sub(rhs.0))
    }
}

impl Add for NtpTime {
    type Output = NtpTime;
    fn add(self, rhs: Self) -> Self::Output {
        NtpTime(self.0.wrapping_add(rhs.0))
    }
}

/// Converts a wall-clock time into an NTP timestamp.  Times before the unix epoch are clamped
/// to the epoch.
pub fn system_time_to_ntp_time_u64(time: SystemTime) -> NtpTime {
    let dur = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        + NTP_OFFSET;

    NtpTime::from_duration(dur)
}

impl From<u64> for NtpTime {
    fn from(value: u64) -> Self {
        NtpTime(value)
    }
}

/// Converts a 16.16 fixed point NTP duration into a [`Duration`]
pub fn ntp_short_to_duration(value: u32) -> Duration {
    Duration::from_nanos((value as u64 * 1_000_000_000) >> 16)
}
