// SPDX-License-Identifier: MPL-2.0

//! RTCP transmission interval computation and timer rules of RFC 3550 section 6.3 and
//! appendix A.7.

use std::time::{Duration, Instant};

use rand::{rngs::StdRng, Rng};

/// Minimum RTCP bandwidth in bytes per second when estimating the session bandwidth
pub const RTCP_MIN_BANDWIDTH: f64 = 400.0;
/// Initial average RTCP packet size, also used when starting to send a BYE
pub const INITIAL_AVG_RTCP_SIZE: usize = 100;
/// BYE reconsideration only applies with at least this many members
pub const BYE_RECONSIDERATION_MEMBERS: usize = 50;

const RTCP_SENDER_FRACTION: f64 = 0.25;
const RTCP_RECEIVER_FRACTION: f64 = 1.0 - RTCP_SENDER_FRACTION;
// e - 3/2
const COMPENSATION: f64 = std::f64::consts::E - 1.5;
const MAX_RTCP_INTERVAL: Duration = Duration::from_secs(u32::MAX as u64);

/// Snapshot of the session membership used for the interval computation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberStats {
    /// Number of active sources, the local one included
    pub members: usize,
    /// Number of sending sources, the local one included
    pub senders: usize,
    /// Whether the local source is a sender
    pub we_send: bool,
    /// Sum of the bitrates (bytes/s) of all active senders
    pub sender_bitrate: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpState {
    /// No RTCP timeout was requested yet
    Idle,
    /// Waiting for the first report
    FirstReport,
    SteadyReporting,
    /// A BYE has been requested but not sent
    ByePending,
    ByeSent,
}

#[derive(Debug)]
struct ByeState {
    reason: String,
    /// number of BYE packets seen since the BYE was requested, our own included
    members: usize,
    /// number of active members when the BYE was requested
    initial_members: usize,
    sent: bool,
}

#[derive(Debug)]
pub struct RtcpScheduler {
    rng: StdRng,
    bandwidth: u32,
    rtcp_fraction: f64,
    min_rtcp_interval: Duration,
    average_rtcp_size: usize,
    first_rtcp: bool,
    next_rtcp_check: Option<Instant>,
    last_rtcp_send: Option<Instant>,
    bye: Option<ByeState>,
}

impl RtcpScheduler {
    pub fn new(
        rng: StdRng,
        bandwidth: u32,
        rtcp_fraction: f64,
        min_rtcp_interval: Duration,
    ) -> Self {
        Self {
            rng,
            bandwidth,
            rtcp_fraction,
            min_rtcp_interval,
            average_rtcp_size: INITIAL_AVG_RTCP_SIZE,
            first_rtcp: true,
            next_rtcp_check: None,
            last_rtcp_send: None,
            bye: None,
        }
    }

    pub(crate) fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn state(&self) -> RtcpState {
        match &self.bye {
            Some(bye) if bye.sent => RtcpState::ByeSent,
            Some(_) => RtcpState::ByePending,
            None if self.next_rtcp_check.is_none() => RtcpState::Idle,
            None if self.first_rtcp => RtcpState::FirstReport,
            None => RtcpState::SteadyReporting,
        }
    }

    pub fn average_rtcp_size(&self) -> usize {
        self.average_rtcp_size
    }

    pub fn next_rtcp_check(&self) -> Option<Instant> {
        self.next_rtcp_check
    }

    pub fn last_rtcp_send(&self) -> Option<Instant> {
        self.last_rtcp_send
    }

    pub fn is_first_rtcp(&self) -> bool {
        self.first_rtcp
    }

    pub fn bye_pending(&self) -> bool {
        self.bye.as_ref().is_some_and(|bye| !bye.sent)
    }

    pub fn bye_sent(&self) -> bool {
        self.bye.as_ref().is_some_and(|bye| bye.sent)
    }

    pub fn bye_reason(&self) -> Option<&str> {
        self.bye.as_ref().map(|bye| bye.reason.as_str())
    }

    pub fn bye_members(&self) -> Option<usize> {
        self.bye.as_ref().map(|bye| bye.members)
    }

    pub fn set_bandwidth(&mut self, bandwidth: u32) {
        self.bandwidth = bandwidth;
    }

    fn rtcp_bandwidth(&self, stats: &MemberStats) -> f64 {
        if self.rtcp_fraction <= 0.0 {
            return 0.0;
        }
        if self.bandwidth == 0 {
            // 5% of the bandwidth used by the senders
            (stats.sender_bitrate as f64 / 20.0).max(RTCP_MIN_BANDWIDTH)
        } else {
            self.bandwidth as f64 * self.rtcp_fraction
        }
    }

    /// The RTCP interval without any randomization, `None` if RTCP is disabled.
    pub fn deterministic_interval(&self, stats: &MemberStats, first: bool) -> Option<Duration> {
        let rtcp_bw = self.rtcp_bandwidth(stats);
        if rtcp_bw <= 0.0 {
            return None;
        }

        if let Some(bye) = self.bye.as_ref().filter(|bye| !bye.sent) {
            if bye.initial_members < BYE_RECONSIDERATION_MEMBERS {
                return Some(Duration::ZERO);
            }
            let secs = self.average_rtcp_size as f64 * bye.members as f64
                / (RTCP_RECEIVER_FRACTION * rtcp_bw)
                / COMPENSATION;
            let t = Duration::try_from_secs_f64(secs).unwrap_or(MAX_RTCP_INTERVAL);
            return Some(t.max(self.min_rtcp_interval / 2));
        }

        let members = stats.members.max(1);
        let senders = stats.senders.min(members);
        let (n, rtcp_bw) = if senders * 4 <= members {
            if stats.we_send {
                (senders, rtcp_bw * RTCP_SENDER_FRACTION)
            } else {
                (members - senders, rtcp_bw * RTCP_RECEIVER_FRACTION)
            }
        } else {
            (members, rtcp_bw)
        };
        let n = n.max(1);

        let min_rtcp_interval = if first {
            self.min_rtcp_interval / 2
        } else {
            self.min_rtcp_interval
        };

        let secs = self.average_rtcp_size as f64 * n as f64 / rtcp_bw / COMPENSATION;
        let t = Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_RTCP_INTERVAL)
            .max(min_rtcp_interval);
        trace!("deterministic rtcp interval {t:?} for {n} members");
        Some(t)
    }

    /// Multiply `interval` by a random factor in [0.5, 1.5)
    pub fn add_jitter(&mut self, interval: Duration) -> Duration {
        interval.mul_f64(self.rng.gen_range(0.5..1.5))
    }

    fn jittered_interval(&mut self, stats: &MemberStats, first: bool) -> Option<Duration> {
        let interval = self.deterministic_interval(stats, first)?;
        Some(self.add_jitter(interval))
    }

    /// The time at which the next RTCP packet should be considered, `None` once our BYE has been
    /// sent or RTCP is disabled.
    ///
    /// A deadline that passed without being handled by [`RtcpScheduler::is_rtcp_time`] is
    /// replaced by a new one counted from `now`.
    pub fn next_timeout(&mut self, now: Instant, stats: &MemberStats) -> Option<Instant> {
        if let Some(bye) = &self.bye {
            if bye.sent {
                return None;
            }
            if bye.initial_members >= BYE_RECONSIDERATION_MEMBERS {
                trace!("reconsidering BYE with {} members", bye.initial_members);
                let last = self.last_rtcp_send.unwrap_or(now);
                let next = last + self.jittered_interval(stats, true)?;
                self.next_rtcp_check = Some(next);
                return Some(next);
            }
        }

        let next = match self.next_rtcp_check {
            None => now + self.jittered_interval(stats, true)?,
            Some(next) if next <= now && self.bye.is_none() => {
                now + self.jittered_interval(stats, self.first_rtcp)?
            }
            Some(next) => next,
        };
        self.next_rtcp_check = Some(next);
        Some(next)
    }

    /// Forward reconsideration.  Returns whether a report should be sent now.
    pub fn is_rtcp_time(&mut self, now: Instant, stats: &MemberStats) -> bool {
        if self.bye_sent() {
            return false;
        }
        let Some(next) = self.next_rtcp_check else {
            return false;
        };
        if next > now {
            trace!("too early to send RTCP, next check at {next:?}");
            return false;
        }

        let candidate = match self.last_rtcp_send {
            Some(last) => {
                let Some(interval) = self.jittered_interval(stats, self.first_rtcp) else {
                    return false;
                };
                last + interval
            }
            None => now,
        };
        if candidate > now {
            debug!("forward reconsideration, deferring RTCP to {candidate:?}");
            self.next_rtcp_check = Some(candidate);
            return false;
        }

        let Some(interval) = self.deterministic_interval(stats, false) else {
            return false;
        };
        self.next_rtcp_check = Some(now + interval);
        true
    }

    /// A report of `size` bytes (transport overhead included) was sent at `now`
    pub fn report_sent(&mut self, now: Instant, size: usize) {
        self.update_average(size);
        self.last_rtcp_send = Some(now);
        self.first_rtcp = false;
        if let Some(bye) = self.bye.as_mut() {
            bye.sent = true;
            self.next_rtcp_check = None;
        }
    }

    fn update_average(&mut self, size: usize) {
        self.average_rtcp_size = (size + 15 * self.average_rtcp_size) / 16;
    }

    /// Account for a received RTCP compound packet of `size` bytes (transport overhead
    /// included).  While our BYE is pending only packets containing a BYE are counted.
    pub fn rtcp_received(&mut self, size: usize, has_bye: bool) {
        match self.bye.as_mut() {
            Some(bye) if bye.sent => (),
            Some(bye) => {
                if has_bye {
                    bye.members += 1;
                    self.update_average(size);
                }
            }
            None => self.update_average(size),
        }
    }

    /// Start leaving the session.  Returns `false` if a BYE was already requested.
    pub fn schedule_bye(&mut self, reason: &str, now: Instant, stats: &MemberStats) -> bool {
        if self.bye.is_some() {
            return false;
        }

        self.bye = Some(ByeState {
            reason: reason.to_owned(),
            members: 1,
            initial_members: stats.members,
            sent: false,
        });
        self.average_rtcp_size = INITIAL_AVG_RTCP_SIZE;
        self.first_rtcp = true;
        self.last_rtcp_send = Some(now);
        let interval = self.jittered_interval(stats, true).unwrap_or(Duration::ZERO);
        self.next_rtcp_check = Some(now + interval);
        debug!("scheduled BYE at {:?}", self.next_rtcp_check);
        true
    }

    /// Reverse reconsideration after the number of members dropped from `pmembers` to
    /// `members`.  Returns whether the next RTCP time changed.
    pub fn reverse_reconsideration(&mut self, now: Instant, members: usize, pmembers: usize) -> bool {
        if self.bye.is_some() {
            trace!("rtcp reverse consideration not applied, BYE scheduled");
            return false;
        }
        if members >= pmembers || pmembers == 0 {
            trace!("rtcp reverse consideration not applied, members >= pmembers");
            return false;
        }
        let Some(next) = self.next_rtcp_check else {
            trace!("rtcp reverse consideration not applied, no rtcp scheduled");
            return false;
        };
        if now >= next {
            trace!("rtcp reverse consideration not applied, last timeout in the past");
            return false;
        }

        let member_factor = members as f64 / pmembers as f64;
        self.next_rtcp_check = Some(now + (next - now).mul_f64(member_factor));
        if let Some(last) = self.last_rtcp_send.as_mut() {
            let dur = now.saturating_duration_since(*last);
            *last = now.checked_sub(dur.mul_f64(member_factor)).unwrap_or(*last);
        }
        debug!(
            "rtcp reverse consideration applied, next rtcp at {:?}",
            self.next_rtcp_check
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logs;
    use rand::SeedableRng;

    fn scheduler() -> RtcpScheduler {
        RtcpScheduler::new(
            StdRng::seed_from_u64(42),
            8_000,
            0.05,
            Duration::from_secs(5),
        )
    }

    fn stats(members: usize, senders: usize, we_send: bool) -> MemberStats {
        MemberStats {
            members,
            senders,
            we_send,
            sender_bitrate: 0,
        }
    }

    #[test]
    fn interval_minimum() {
        init_logs();
        let scheduler = scheduler();
        let stats = stats(1, 0, false);
        assert_eq!(
            scheduler.deterministic_interval(&stats, true),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(
            scheduler.deterministic_interval(&stats, false),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn interval_monotonic_in_members() {
        init_logs();
        let scheduler = scheduler();
        let mut previous = Duration::ZERO;
        for members in [1, 2, 10, 50, 100, 500, 1000] {
            let interval = scheduler
                .deterministic_interval(&stats(members, 0, false), false)
                .unwrap();
            assert!(interval >= previous);
            previous = interval;
        }
        // 1000 receivers share 75% of 400 B/s with 100 byte packets
        let expected = 100.0 * 1000.0 / 300.0 / COMPENSATION;
        assert!((previous.as_secs_f64() - expected).abs() < 0.001);
    }

    #[test]
    fn interval_senders_share() {
        init_logs();
        let scheduler = scheduler();
        let sender = scheduler
            .deterministic_interval(&stats(400, 1, true), false)
            .unwrap();
        let receiver = scheduler
            .deterministic_interval(&stats(400, 1, false), false)
            .unwrap();
        // a single sender gets a quarter of the bandwidth for itself
        assert_eq!(sender, Duration::from_secs(5));
        assert!(receiver > Duration::from_secs(100));
    }

    #[test]
    fn disabled_rtcp() {
        init_logs();
        let mut scheduler =
            RtcpScheduler::new(StdRng::seed_from_u64(1), 8_000, 0.0, Duration::from_secs(5));
        let stats = stats(1, 0, false);
        assert_eq!(scheduler.deterministic_interval(&stats, false), None);
        assert_eq!(scheduler.next_timeout(Instant::now(), &stats), None);
    }

    #[test]
    fn jitter_bounds() {
        init_logs();
        let mut scheduler = scheduler();
        let interval = Duration::from_secs(10);
        for _ in 0..1000 {
            let jittered = scheduler.add_jitter(interval);
            assert!(jittered >= interval / 2);
            assert!(jittered < interval * 3 / 2);
        }
    }

    #[test]
    fn first_timeout_then_steady() {
        init_logs();
        let mut scheduler = scheduler();
        let stats = stats(1, 0, false);
        let now = Instant::now();
        assert_eq!(scheduler.state(), RtcpState::Idle);
        let first = scheduler.next_timeout(now, &stats).unwrap();
        assert_eq!(scheduler.state(), RtcpState::FirstReport);
        assert!(first >= now + Duration::from_millis(1250));
        assert!(first < now + Duration::from_millis(3750));
        // stable until it passes
        assert_eq!(scheduler.next_timeout(now, &stats), Some(first));

        assert!(!scheduler.is_rtcp_time(now, &stats));
        assert!(scheduler.is_rtcp_time(first, &stats));
        scheduler.report_sent(first, 100);
        assert_eq!(scheduler.state(), RtcpState::SteadyReporting);
        assert_eq!(
            scheduler.next_timeout(first, &stats),
            Some(first + Duration::from_secs(5))
        );
    }

    #[test]
    fn forward_reconsideration_defers() {
        init_logs();
        let mut scheduler = scheduler();
        let stats = stats(1, 0, false);
        let now = Instant::now();
        let first = scheduler.next_timeout(now, &stats).unwrap();
        assert!(scheduler.is_rtcp_time(first, &stats));
        scheduler.report_sent(first, 100);

        // many members appeared since, the candidate moves into the future
        let crowd = MemberStats {
            members: 1000,
            ..stats
        };
        let next = scheduler.next_timeout(first, &crowd).unwrap();
        assert!(!scheduler.is_rtcp_time(next, &crowd));
        assert!(scheduler.next_rtcp_check().unwrap() > next);
    }

    #[test]
    fn reverse_reconsideration() {
        init_logs();
        let mut scheduler = scheduler();
        let stats = stats(10, 0, false);
        let now = Instant::now();
        let next = scheduler.next_timeout(now, &stats).unwrap();
        let t = now + (next - now) / 4;
        assert!(scheduler.reverse_reconsideration(t, 5, 10));
        let expected = t + (next - t).mul_f64(0.5);
        assert_eq!(scheduler.next_rtcp_check(), Some(expected));

        // no change when the members did not decrease
        assert!(!scheduler.reverse_reconsideration(t, 5, 5));
    }

    #[test]
    fn bye_small_session() {
        init_logs();
        let mut scheduler = scheduler();
        let stats = stats(3, 0, false);
        let now = Instant::now();
        scheduler.next_timeout(now, &stats);
        assert!(scheduler.schedule_bye("done", now, &stats));
        assert!(!scheduler.schedule_bye("again", now, &stats));
        assert_eq!(scheduler.state(), RtcpState::ByePending);
        assert_eq!(scheduler.bye_reason(), Some("done"));
        assert_eq!(scheduler.average_rtcp_size(), INITIAL_AVG_RTCP_SIZE);
        // less than 50 members, send immediately
        assert_eq!(scheduler.next_timeout(now, &stats), Some(now));
        assert!(scheduler.is_rtcp_time(now, &stats));
        scheduler.report_sent(now, 60);
        assert_eq!(scheduler.state(), RtcpState::ByeSent);
        assert_eq!(scheduler.next_timeout(now, &stats), None);
        assert!(!scheduler.is_rtcp_time(now + Duration::from_secs(10), &stats));
    }

    #[test]
    fn bye_large_session() {
        init_logs();
        let mut scheduler = scheduler();
        let stats = stats(100, 0, false);
        let now = Instant::now();
        scheduler.next_timeout(now, &stats);
        assert!(scheduler.schedule_bye("done", now, &stats));
        let next = scheduler.next_timeout(now, &stats).unwrap();
        assert!(next >= now + Duration::from_millis(1250));

        // other BYE packets arriving while ours is pending are counted
        scheduler.rtcp_received(100, false);
        assert_eq!(scheduler.bye_members(), Some(1));
        scheduler.rtcp_received(100, true);
        assert_eq!(scheduler.bye_members(), Some(2));
        assert!(!scheduler.reverse_reconsideration(now, 1, 100));
    }

    #[test]
    fn average_size() {
        init_logs();
        let mut scheduler = scheduler();
        scheduler.rtcp_received(260, false);
        assert_eq!(scheduler.average_rtcp_size(), (260 + 15 * 100) / 16);
    }
}
