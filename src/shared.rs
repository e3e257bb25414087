// SPDX-License-Identifier: MPL-2.0

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    task::Waker,
    time::Instant,
};

use crate::error::SessionError;
use crate::events::SessionCallbacks;
use crate::session::Session;

#[derive(Debug)]
pub(crate) struct SharedSessionInner<C: SessionCallbacks> {
    pub(crate) session: Session<C>,
    pub(crate) rtcp_waker: Option<Waker>,
}

impl<C: SessionCallbacks> SharedSessionInner<C> {
    fn wake_rtcp_if_reconsidered(&mut self) {
        if self.session.take_reconsideration_request() {
            if let Some(waker) = self.rtcp_waker.take() {
                trace!("waking RTCP timer for reconsideration");
                waker.wake();
            }
        }
    }
}

/// A [`Session`] that can be shared between the packet handling and the RTCP timer task.
///
/// Every operation runs with the whole session locked.
#[derive(Debug)]
pub struct SharedSession<C: SessionCallbacks> {
    pub(crate) inner: Arc<Mutex<SharedSessionInner<C>>>,
}

impl<C: SessionCallbacks> Clone for SharedSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: SessionCallbacks> SharedSession<C> {
    pub fn new(session: Session<C>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SharedSessionInner {
                session,
                rtcp_waker: None,
            })),
        }
    }

    /// Run `f` with exclusive access to the session.  A pending RTCP wait is re-armed if `f`
    /// changed the RTCP timeout.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session<C>) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        let ret = f(&mut inner.session);
        inner.wake_rtcp_if_reconsidered();
        ret
    }

    pub fn process_rtp(
        &self,
        data: &[u8],
        arrival_time: Instant,
        from: Option<SocketAddr>,
    ) -> Result<(), SessionError> {
        self.with_session(|session| session.process_rtp(data, arrival_time, from))
    }

    pub fn process_rtcp(
        &self,
        data: &[u8],
        arrival_time: Instant,
        from: Option<SocketAddr>,
    ) -> Result<(), SessionError> {
        self.with_session(|session| session.process_rtcp(data, arrival_time, from))
    }

    pub fn send_rtp(&self, data: &[u8], now: Instant) -> Result<(), SessionError> {
        self.with_session(|session| session.send_rtp(data, now))
    }

    pub fn send_bye(&self, reason: &str, now: Instant) -> Result<(), SessionError> {
        self.with_session(|session| session.send_bye(reason, now))
    }

    pub fn set_bandwidth(&self, bandwidth: u32) {
        self.with_session(|session| session.set_bandwidth(bandwidth))
    }
}
