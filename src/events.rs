// SPDX-License-Identifier: MPL-2.0

use std::net::SocketAddr;
use std::time::SystemTime;

/// Notifications raised by a [`Session`](crate::Session) while processing packets or timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new ssrc was discovered
    NewSsrc(u32),
    /// Two participants claim the same ssrc.  `local` is set when the remote claims our own ssrc.
    SsrcCollision {
        ssrc: u32,
        from: Option<SocketAddr>,
        local: bool,
    },
    /// A source has been validated and now counts as an active member
    SsrcValidated(u32),
    /// A BYE was received for the ssrc
    ByeSsrc(u32),
    /// A source that sent a BYE has been removed
    ByeTimeout(u32),
    /// A source has been removed because of inactivity
    Timeout(u32),
    /// A sender has not sent any RTP for a while and is now considered a receiver
    SenderTimeout(u32),
    /// The SDES items of a source changed
    SsrcSdes(u32),
}

/// The environment of a [`Session`](crate::Session).
///
/// All methods have no-op defaults so that an embedder only needs to implement what it uses.
/// Methods are called with the session borrowed and must not call back into it.
pub trait SessionCallbacks {
    /// A (validated) RTP packet from `ssrc` is ready for the application
    fn deliver_rtp_to_application(&mut self, _ssrc: u32, _data: &[u8]) {}

    /// An outgoing RTP packet of the local source should be sent to the network
    fn transmit_rtp(&mut self, _ssrc: u32, _data: &[u8]) {}

    /// A generated RTCP compound packet should be sent to the network
    fn transmit_rtcp(&mut self, _ssrc: u32, _data: Vec<u8>) {}

    /// A RTCP compound packet containing a sender report from `ssrc` was received
    fn sync_rtcp(&mut self, _ssrc: u32, _data: &[u8]) {}

    /// Retrieve the clock rate for an unknown payload type
    fn lookup_clock_rate(&mut self, _payload_type: u8) -> Option<u32> {
        None
    }

    /// The current wall-clock time, if a clock is available
    fn current_time(&mut self) -> Option<SystemTime> {
        None
    }

    /// The next RTCP timeout changed.  Any pending wait should be re-armed with the value
    /// returned by [`Session::next_timeout`](crate::Session::next_timeout).
    fn request_reconsideration(&mut self) {}

    fn on_event(&mut self, _event: SessionEvent) {}
}
