// SPDX-License-Identifier: MPL-2.0

use rtcp_types::RtcpWriteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketKind::Rtp => f.write_str("RTP"),
            PacketKind::Rtcp => f.write_str("RTCP"),
        }
    }
}

/// Errors returned by the session entry points.  None of them are fatal to the session.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Invalid {kind} packet")]
    InvalidPacket { kind: PacketKind },
    #[error("SSRC {ssrc:#010x} is not the local source of this session")]
    UnknownSendSsrc { ssrc: u32 },
    #[error("Could not find an unused SSRC after {attempts} attempts")]
    SsrcExhausted { attempts: usize },
    #[error("Failed to write RTCP packet: {0:?}")]
    RtcpWrite(RtcpWriteError),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("RTCP bandwidth fraction {0} is outside of [0, 1]")]
    InvalidRtcpFraction(f64),
    #[error("MTU {mtu} is smaller than the minimum of {min}")]
    MtuTooSmall { mtu: usize, min: usize },
    #[error("Minimum RTCP interval must not be zero")]
    ZeroMinRtcpInterval,
    #[error("Invalid value for env var {env_var}")]
    InvalidEnvVar { env_var: &'static str },
}
