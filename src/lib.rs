// SPDX-License-Identifier: MPL-2.0

//! RTP/RTCP session management following RFC 3550.
//!
//! A [`Session`] tracks every participant of one RTP session, validates and accounts incoming
//! RTP and RTCP packets, and decides when RTCP reports are sent and what they contain.  It does
//! no I/O on its own: the embedder feeds packets in and receives outgoing packets and
//! notifications through [`SessionCallbacks`].
//!
//! [`SharedSession`] together with [`spawn_rtcp_task`] runs the RTCP timer on a tokio runtime.

#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod events;
mod report;
pub mod scheduler;
mod session;
mod shared;
pub mod source;
mod table;
pub mod time;
mod timer;
pub mod utils;

pub use config::SessionConfig;
pub use error::{ConfigError, PacketKind, SessionError};
pub use events::{SessionCallbacks, SessionEvent};
pub use report::MAX_REPORT_BLOCKS;
pub use scheduler::RtcpState;
pub use session::Session;
pub use shared::SharedSession;
pub use source::{ReceivedRb, Rb, Source, SourceState, Sr};
pub use timer::{spawn_rtcp_task, RtcpTask, RtcpTimer};

#[cfg(test)]
pub(crate) mod tests {
    pub(crate) fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }
}
