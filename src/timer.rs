// SPDX-License-Identifier: MPL-2.0

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant, SystemTime},
};

use futures::{
    future::{AbortHandle, Abortable},
    StreamExt,
};

use crate::error::SessionError;
use crate::events::SessionCallbacks;
use crate::shared::SharedSession;

/// Drives the RTCP timeouts of a [`SharedSession`].
///
/// Every item is the result of a [`Session::on_timeout`](crate::Session::on_timeout) call.  The
/// stream ends once the session has no more timeouts, i.e. after our BYE was sent.
#[derive(Debug)]
pub struct RtcpTimer<C: SessionCallbacks> {
    shared: SharedSession<C>,
    sleep: Pin<Box<tokio::time::Sleep>>,
    // deadline the sleep is currently armed for
    armed: Option<Instant>,
}

impl<C: SessionCallbacks> RtcpTimer<C> {
    pub fn new(shared: SharedSession<C>) -> Self {
        Self {
            shared,
            sleep: Box::pin(tokio::time::sleep(Duration::from_secs(1))),
            armed: None,
        }
    }
}

impl<C: SessionCallbacks> futures::stream::Stream for RtcpTimer<C> {
    type Item = Result<(), SessionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut inner = this.shared.inner.lock().unwrap();
        let now = tokio::time::Instant::now().into_std();

        // the armed deadline must be handled before asking for a new one, which would move a
        // passed deadline
        let next = match this.armed {
            Some(armed) if armed <= now => Some(armed),
            _ => inner.session.next_timeout(now),
        };
        let Some(next) = next else {
            debug!("no more RTCP timeouts");
            this.armed = None;
            inner.rtcp_waker = None;
            return Poll::Ready(None);
        };

        if next <= now {
            this.armed = None;
            let ntp_now = inner
                .session
                .callbacks_mut()
                .current_time()
                .unwrap_or_else(SystemTime::now);
            let ret = inner.session.on_timeout(now, ntp_now);
            // we are about to re-read the timeout anyway
            inner.session.take_reconsideration_request();
            return Poll::Ready(Some(ret));
        }

        inner.rtcp_waker = Some(cx.waker().clone());
        drop(inner);

        trace!("waiting for RTCP timeout at {next:?}");
        this.armed = Some(next);
        this.sleep
            .as_mut()
            .reset(tokio::time::Instant::from_std(next));
        if !std::future::Future::poll(this.sleep.as_mut(), cx).is_pending() {
            // wake us again if the delay is not pending for another go at finding the next timeout
            // value
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }
}

/// Handle to a running RTCP task
#[derive(Debug)]
pub struct RtcpTask {
    abort_handle: AbortHandle,
}

impl RtcpTask {
    pub fn stop(&self) {
        self.abort_handle.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.abort_handle.is_aborted()
    }
}

async fn rtcp_task<C: SessionCallbacks>(mut stream: RtcpTimer<C>) {
    while let Some(ret) = stream.next().await {
        if let Err(err) = ret {
            warn!("Failed to send RTCP: {err}");
        }
    }
    debug!("RTCP task finished");
}

/// Run the RTCP timeouts of `shared` on `handle` until the session sent its BYE or the returned
/// task is stopped.
pub fn spawn_rtcp_task<C>(shared: SharedSession<C>, handle: &tokio::runtime::Handle) -> RtcpTask
where
    C: SessionCallbacks + Send + 'static,
{
    let (abort_handle, abort_registration) = AbortHandle::new_pair();
    let stream = RtcpTimer::new(shared);
    handle.spawn(Abortable::new(rtcp_task(stream), abort_registration));
    RtcpTask { abort_handle }
}
