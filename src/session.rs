// SPDX-License-Identifier: MPL-2.0

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant, SystemTime},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use rtcp_types::*;
use rtp_types::RtpPacket;

use crate::config::SessionConfig;
use crate::error::{ConfigError, PacketKind, SessionError};
use crate::events::{SessionCallbacks, SessionEvent};
use crate::report;
use crate::scheduler::{MemberStats, RtcpScheduler, RtcpState};
use crate::source::{ArrivalStats, Source, SourceRecvReply};
use crate::table::{Obtained, SourceTable};
use crate::time::NtpTime;

const SOURCE_TIMEOUT_N_INTERVALS: u32 = 5;
const SENDER_TIMEOUT_N_INTERVALS: u32 = 2;
const MIN_SOURCE_TIMEOUT: Duration = Duration::from_secs(5);
const ADDRESS_CONFLICT_TIMEOUT_N_INTERVALS: u32 = 12;

/// A single RTP session: all participants, their statistics and the RTCP timing state.
///
/// The session does no I/O itself.  Packets are passed in through [`Session::process_rtp`],
/// [`Session::process_rtcp`] and [`Session::send_rtp`], and everything that has to leave the
/// session goes through the [`SessionCallbacks`] implementation.  The embedder asks
/// [`Session::next_timeout`] when to call [`Session::on_timeout`] next.
#[derive(Debug)]
pub struct Session<C: SessionCallbacks> {
    config: SessionConfig,
    callbacks: C,
    table: SourceTable,
    scheduler: RtcpScheduler,
    pt_map: HashMap<u8, u32>,
    invalid_packets: u64,
    dropped_report_blocks: u64,
    reconsideration_requested: bool,
}

impl<C: SessionCallbacks> Session<C> {
    pub fn new(config: SessionConfig, callbacks: C) -> Result<Self, ConfigError> {
        Self::with_rng(config, callbacks, StdRng::from_entropy())
    }

    /// Create a session drawing all of its randomness (ssrc, cname, RTCP jitter) from `rng`
    pub fn with_rng(
        config: SessionConfig,
        callbacks: C,
        mut rng: StdRng,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let ssrc = rng.gen::<u32>();
        let cname = config
            .cname
            .clone()
            .unwrap_or_else(|| generate_cname(&mut rng));

        let mut local = Source::new_local(ssrc, Instant::now());
        local.set_sdes_item(SdesItem::CNAME, cname.as_bytes());
        for (ty, val) in [
            (SdesItem::NAME, &config.name),
            (SdesItem::TOOL, &config.tool),
            (SdesItem::NOTE, &config.note),
        ] {
            if let Some(val) = val {
                local.set_sdes_item(ty, val.as_bytes());
            }
        }
        let mut table = SourceTable::new(local);
        table.associate_cname(ssrc, &cname);

        info!("new session with ssrc {ssrc:#010x} and cname {cname}");

        let scheduler = RtcpScheduler::new(
            rng,
            config.bandwidth,
            config.rtcp_fraction,
            config.min_rtcp_interval,
        );

        Ok(Self {
            config,
            callbacks,
            table,
            scheduler,
            pt_map: HashMap::new(),
            invalid_packets: 0,
            dropped_report_blocks: 0,
            reconsideration_requested: false,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    /// Set the RTP clock rate for a particular payload type
    pub fn set_pt_clock_rate(&mut self, pt: u8, clock_rate: u32) {
        self.pt_map.insert(pt, clock_rate);
    }

    /// Retrieve the RTP clock rate for a particular payload type
    pub fn clock_rate_from_pt(&self, pt: u8) -> Option<u32> {
        self.pt_map.get(&pt).copied()
    }

    fn lookup_clock_rate(&mut self, pt: u8) -> Option<u32> {
        if let Some(clock_rate) = self.clock_rate_from_pt(pt) {
            return Some(clock_rate);
        }
        let clock_rate = self.callbacks.lookup_clock_rate(pt)?;
        debug!("payload type {pt} has clock rate {clock_rate}");
        self.pt_map.insert(pt, clock_rate);
        Some(clock_rate)
    }

    /// Change the session bandwidth (bytes per second, 0 to estimate it from the senders)
    pub fn set_bandwidth(&mut self, bandwidth: u32) {
        self.config.bandwidth = bandwidth;
        self.scheduler.set_bandwidth(bandwidth);
        self.request_reconsideration();
    }

    fn request_reconsideration(&mut self) {
        self.reconsideration_requested = true;
        self.callbacks.request_reconsideration();
    }

    /// Returns whether the RTCP timeout changed since the last call
    pub fn take_reconsideration_request(&mut self) -> bool {
        std::mem::take(&mut self.reconsideration_requested)
    }

    pub fn local_ssrc(&self) -> u32 {
        self.table.local_ssrc()
    }

    pub fn local_source(&self) -> &Source {
        self.table.local()
    }

    pub fn source(&self, ssrc: u32) -> Option<&Source> {
        self.table.lookup_by_ssrc(ssrc)
    }

    pub fn source_by_cname(&self, cname: &str) -> Option<&Source> {
        self.table.lookup_by_cname(cname)
    }

    /// Retrieve a list of all ssrc's currently handled by this session
    pub fn ssrcs(&self) -> impl Iterator<Item = u32> + '_ {
        self.table.ssrcs()
    }

    pub fn total_sources(&self) -> usize {
        self.table.total_sources()
    }

    pub fn active_sources(&self) -> usize {
        self.table.active_sources()
    }

    pub fn sender_sources(&self) -> usize {
        self.table.sender_sources()
    }

    /// Number of malformed packets that were dropped
    pub fn invalid_packets(&self) -> u64 {
        self.invalid_packets
    }

    /// Number of report blocks that did not fit into the generated RTCP packets
    pub fn dropped_report_blocks(&self) -> u64 {
        self.dropped_report_blocks
    }

    pub fn rtcp_state(&self) -> RtcpState {
        self.scheduler.state()
    }

    /// Average size of RTCP packets in this session, transport overhead included
    pub fn average_rtcp_size(&self) -> usize {
        self.scheduler.average_rtcp_size()
    }

    fn member_stats(&self) -> MemberStats {
        MemberStats {
            members: self.table.active_sources(),
            senders: self.table.sender_sources(),
            we_send: self.table.local().is_sender(),
            sender_bitrate: self
                .table
                .iter()
                .filter(|source| source.is_active() && source.is_sender())
                .map(Source::bitrate)
                .sum(),
        }
    }

    fn invalid_packet(&mut self, kind: PacketKind) -> SessionError {
        self.invalid_packets += 1;
        SessionError::InvalidPacket { kind }
    }

    /// Handle receiving an RTP packet.  Validated packets are handed to
    /// [`SessionCallbacks::deliver_rtp_to_application`].
    pub fn process_rtp(
        &mut self,
        data: &[u8],
        arrival_time: Instant,
        from: Option<SocketAddr>,
    ) -> Result<(), SessionError> {
        let rtp = match RtpPacket::parse(data) {
            Ok(rtp) => rtp,
            Err(err) => {
                debug!("dropping invalid RTP packet from {from:?}: {err:?}");
                return Err(self.invalid_packet(PacketKind::Rtp));
            }
        };
        trace!(
            "receive rtp from:{from:?} at {arrival_time:?}, ssrc:{}, pt:{}, seqno:{}, rtp ts:{}, bytes:{}",
            rtp.ssrc(),
            rtp.payload_type(),
            rtp.sequence_number(),
            rtp.timestamp(),
            rtp.payload().len()
        );

        if self.table.local().received_bye() {
            trace!("we are leaving the session, dropping RTP");
            return Ok(());
        }

        let arrival = ArrivalStats {
            time: arrival_time,
            ntp_time: None,
            bytes: data.len() + self.config.header_len,
            payload_len: rtp.payload().len(),
            address: from,
        };

        let ssrc = rtp.ssrc();
        let obtained = self
            .table
            .obtain_source(ssrc, &arrival, true, self.config.probation);
        match obtained {
            Obtained::Collision { local } => {
                warn!("ssrc collision for {ssrc:#010x} from {from:?}, local: {local}");
                self.callbacks
                    .on_event(SessionEvent::SsrcCollision { ssrc, from, local });
                return Ok(());
            }
            Obtained::Looped => {
                trace!("dropping looped RTP packet for ssrc {ssrc:#010x}");
                return Ok(());
            }
            Obtained::Found | Obtained::Created => (),
        }

        let clock_rate = self.lookup_clock_rate(rtp.payload_type());
        let Some((reply, became_active, validated)) = self.table.update(ssrc, |source| {
            let was_active = source.is_active();
            let reply = source.process_rtp(&rtp, data, &arrival, clock_rate);
            (
                reply,
                !was_active && source.is_active(),
                source.is_validated(),
            )
        }) else {
            return Ok(());
        };

        if obtained == Obtained::Created {
            info!("new ssrc {ssrc:#010x}");
            self.callbacks.on_event(SessionEvent::NewSsrc(ssrc));
        }
        if became_active {
            info!("ssrc {ssrc:#010x} validated");
            self.callbacks.on_event(SessionEvent::SsrcValidated(ssrc));
        }

        match reply {
            SourceRecvReply::Hold | SourceRecvReply::Ignore => (),
            SourceRecvReply::Passthrough => {
                self.callbacks.deliver_rtp_to_application(ssrc, data);
            }
            SourceRecvReply::Release(held) => {
                for packet in held {
                    self.callbacks.deliver_rtp_to_application(ssrc, &packet);
                }
                self.callbacks.deliver_rtp_to_application(ssrc, data);
            }
        }

        if validated {
            for csrc in rtp.csrc() {
                self.obtain_csrc(csrc, arrival_time);
            }
        }

        Ok(())
    }

    fn obtain_csrc(&mut self, csrc: u32, time: Instant) {
        // the address is the one of the mixer, not of the contributing source
        let arrival = ArrivalStats {
            time,
            ntp_time: None,
            bytes: 0,
            payload_len: 0,
            address: None,
        };
        if self.table.obtain_source(csrc, &arrival, false, 0) == Obtained::Created {
            self.table.update(csrc, Source::set_as_csrc);
            debug!("new csrc {csrc:#010x}");
            self.callbacks.on_event(SessionEvent::NewSsrc(csrc));
        }
    }

    fn obtain_rtcp_source(&mut self, ssrc: u32, arrival: &ArrivalStats) -> bool {
        match self.table.obtain_source(ssrc, arrival, false, 0) {
            Obtained::Collision { local } => {
                warn!(
                    "ssrc collision for {ssrc:#010x} from {:?}, local: {local}",
                    arrival.address
                );
                self.callbacks.on_event(SessionEvent::SsrcCollision {
                    ssrc,
                    from: arrival.address,
                    local,
                });
                false
            }
            Obtained::Looped => false,
            Obtained::Found => true,
            Obtained::Created => {
                info!("new ssrc {ssrc:#010x} from RTCP");
                self.callbacks.on_event(SessionEvent::NewSsrc(ssrc));
                true
            }
        }
    }

    fn handle_report_blocks<'a>(
        &mut self,
        reporter: u32,
        rbs: impl Iterator<Item = ReportBlock<'a>>,
        arrival: &ArrivalStats,
    ) {
        let local_ssrc = self.table.local_ssrc();
        for rb in rbs {
            if rb.ssrc() != local_ssrc {
                trace!(
                    "ignoring report block from {reporter:#010x} about {:#010x}",
                    rb.ssrc()
                );
                continue;
            }
            trace!("report block from {reporter:#010x} about us: {rb:?}");
            self.table.update(local_ssrc, |local| {
                local.process_rb(reporter, rb.into(), arrival.time, arrival.ntp_time)
            });
        }
    }

    fn handle_sdes(&mut self, sdes: &Sdes<'_>, arrival: &ArrivalStats) {
        for chunk in sdes.chunks() {
            let ssrc = chunk.ssrc();
            if !self.obtain_rtcp_source(ssrc, arrival) {
                continue;
            }
            let mut changed = false;
            let mut cname = None;
            for item in chunk.items() {
                let ty = item.type_();
                if !(SdesItem::CNAME..=SdesItem::NOTE).contains(&ty) {
                    trace!("ignoring sdes item {ty} from {ssrc:#010x}");
                    continue;
                }
                let value = item.value();
                changed |= self
                    .table
                    .update(ssrc, |source| source.set_sdes_item(ty, value))
                    .unwrap_or(false);
                if ty == SdesItem::CNAME {
                    cname = std::str::from_utf8(value).ok().map(str::to_owned);
                }
            }
            if let Some(cname) = cname {
                self.table.associate_cname(ssrc, &cname);
            }
            if changed {
                debug!("sdes of {ssrc:#010x} changed");
                self.callbacks.on_event(SessionEvent::SsrcSdes(ssrc));
            }
        }
    }

    fn handle_bye(&mut self, bye: &Bye<'_>, arrival: &ArrivalStats) {
        let reason = bye
            .reason()
            .map(|reason| String::from_utf8_lossy(reason).into_owned());
        for ssrc in bye.ssrcs() {
            // a source only created by this BYE was never counted as a member
            let pmembers = self.table.active_sources();
            if !self.obtain_rtcp_source(ssrc, arrival) {
                continue;
            }
            self.table
                .update(ssrc, |source| source.process_bye(arrival.time, reason.clone()));
            let members = self.table.active_sources();
            info!("ssrc {ssrc:#010x} left the session, reason: {reason:?}");

            if members < pmembers
                && self
                    .scheduler
                    .reverse_reconsideration(arrival.time, members, pmembers)
            {
                self.request_reconsideration();
            }
            self.callbacks.on_event(SessionEvent::ByeSsrc(ssrc));
        }
    }

    /// Handle receiving a RTCP compound packet
    pub fn process_rtcp(
        &mut self,
        data: &[u8],
        arrival_time: Instant,
        from: Option<SocketAddr>,
    ) -> Result<(), SessionError> {
        let packets = match Compound::parse(data)
            .and_then(|rtcp| rtcp.collect::<Result<Vec<_>, _>>())
        {
            Ok(packets) => packets,
            Err(err) => {
                debug!("dropping invalid RTCP packet from {from:?}: {err:?}");
                return Err(self.invalid_packet(PacketKind::Rtcp));
            }
        };

        if self.scheduler.bye_sent() {
            trace!("BYE already sent, dropping RTCP");
            return Ok(());
        }

        let arrival = ArrivalStats {
            time: arrival_time,
            ntp_time: self.callbacks.current_time(),
            bytes: data.len() + self.config.header_len,
            payload_len: 0,
            address: from,
        };
        trace!("receive rtcp from:{from:?} at {arrival_time:?}, bytes:{}", data.len());

        let has_bye = packets.iter().any(|packet| matches!(packet, Packet::Bye(_)));
        self.scheduler.rtcp_received(arrival.bytes, has_bye);

        let bye_pending = self.scheduler.bye_pending();
        let mut sync_ssrc = None;
        for packet in packets.iter() {
            if bye_pending && !matches!(packet, Packet::Bye(_)) {
                trace!("leaving the session, skipping {packet:?}");
                continue;
            }
            match packet {
                Packet::Sr(sr) => {
                    let ssrc = sr.ssrc();
                    if !self.obtain_rtcp_source(ssrc, &arrival) {
                        continue;
                    }
                    self.table.update(ssrc, |source| {
                        source.process_sr(
                            NtpTime::from(sr.ntp_timestamp()),
                            sr.rtp_timestamp(),
                            sr.packet_count(),
                            sr.octet_count(),
                            &arrival,
                        )
                    });
                    self.handle_report_blocks(ssrc, sr.report_blocks(), &arrival);
                    sync_ssrc.get_or_insert(ssrc);
                }
                Packet::Rr(rr) => {
                    let ssrc = rr.ssrc();
                    if !self.obtain_rtcp_source(ssrc, &arrival) {
                        continue;
                    }
                    self.handle_report_blocks(ssrc, rr.report_blocks(), &arrival);
                }
                Packet::Sdes(sdes) => self.handle_sdes(sdes, &arrival),
                Packet::Bye(bye) => self.handle_bye(bye, &arrival),
                Packet::App(app) => {
                    trace!("ignoring APP packet from {:#010x}", app.ssrc());
                }
                packet => trace!("ignoring unhandled RTCP packet {packet:?}"),
            }
        }

        if let Some(ssrc) = sync_ssrc {
            self.callbacks.sync_rtcp(ssrc, data);
        }

        Ok(())
    }

    /// Send an RTP packet of the local source.  The packet is handed unchanged to
    /// [`SessionCallbacks::transmit_rtp`].
    pub fn send_rtp(&mut self, data: &[u8], now: Instant) -> Result<(), SessionError> {
        let rtp = match RtpPacket::parse(data) {
            Ok(rtp) => rtp,
            Err(err) => {
                debug!("refusing to send invalid RTP packet: {err:?}");
                return Err(self.invalid_packet(PacketKind::Rtp));
            }
        };
        let ssrc = rtp.ssrc();
        if ssrc != self.table.local_ssrc() {
            return Err(SessionError::UnknownSendSsrc { ssrc });
        }
        if self.table.local().received_bye() {
            debug!("we are leaving the session, not sending RTP");
            return Ok(());
        }

        trace!(
            "sending rtp ssrc:{ssrc}, pt:{}, seqno:{}, rtp ts:{}, bytes:{}",
            rtp.payload_type(),
            rtp.sequence_number(),
            rtp.timestamp(),
            rtp.payload().len()
        );
        let was_sender = self.table.local().is_sender();
        self.table.update(ssrc, |local| {
            local.sent_rtp(
                rtp.payload().len(),
                now,
                rtp.timestamp(),
                rtp.payload_type(),
            )
        });
        if !was_sender {
            debug!("local ssrc {ssrc:#010x} became a sender");
        }

        self.callbacks.transmit_rtp(ssrc, data);
        Ok(())
    }

    /// Start leaving the session.  A BYE is sent with the next RTCP packet.
    pub fn send_bye(&mut self, reason: &str, now: Instant) -> Result<(), SessionError> {
        if self.scheduler.bye_pending() || self.scheduler.bye_sent() {
            return Ok(());
        }
        let stats = self.member_stats();
        let ssrc = self.table.local_ssrc();
        self.table.update(ssrc, |local| local.mark_bye(reason, now));
        self.scheduler.schedule_bye(reason, now, &stats);
        info!("ssrc {ssrc:#010x} leaving the session: {reason}");
        self.request_reconsideration();
        Ok(())
    }

    /// Pick a new, unused ssrc for the local source, e.g. after a collision with our own ssrc.
    /// The SDES items are kept.
    pub fn change_local_ssrc(&mut self, now: Instant) -> Result<u32, SessionError> {
        let mut local = self
            .table
            .create_unique_source(self.scheduler.rng(), now)?;
        for (ty, val) in self.table.local().sdes() {
            local.set_sdes_item(*ty, val.as_bytes());
        }
        let ssrc = local.ssrc();
        let cname = local.cname().map(str::to_owned);
        let old = self.table.replace_local(local);
        if let Some(cname) = cname {
            self.table.associate_cname(ssrc, &cname);
        }
        info!("changed local ssrc from {:#010x} to {ssrc:#010x}", old.ssrc());
        Ok(ssrc)
    }

    /// The time at which [`Session::on_timeout`] should be called next, `None` when no more RTCP
    /// will be sent.
    pub fn next_timeout(&mut self, now: Instant) -> Option<Instant> {
        let stats = self.member_stats();
        self.scheduler.next_timeout(now, &stats)
    }

    // RFC 3550 6.3.5
    fn handle_timeouts(&mut self, now: Instant) {
        let stats = self.member_stats();
        let interval = self
            .scheduler
            .deterministic_interval(&stats, false)
            .unwrap_or(self.config.min_rtcp_interval);
        let source_timeout = (interval * SOURCE_TIMEOUT_N_INTERVALS).max(MIN_SOURCE_TIMEOUT);
        let sender_timeout = (interval * SENDER_TIMEOUT_N_INTERVALS).max(MIN_SOURCE_TIMEOUT);
        trace!("handling rtcp timeouts with interval {interval:?}");

        let mut removed = vec![];
        let mut demoted = vec![];
        for source in self.table.iter() {
            let ssrc = source.ssrc();
            if !source.is_local() {
                if let Some(bye_time) = source.bye_time() {
                    if now.saturating_duration_since(bye_time) > self.config.bye_timeout {
                        removed.push((ssrc, SessionEvent::ByeTimeout(ssrc)));
                    }
                    continue;
                }
                if now.saturating_duration_since(source.last_activity()) > source_timeout {
                    removed.push((ssrc, SessionEvent::Timeout(ssrc)));
                    continue;
                }
            }
            if source.is_sender()
                && now.saturating_duration_since(source.last_rtp_activity()) > sender_timeout
            {
                demoted.push(ssrc);
            }
        }

        for (ssrc, event) in removed {
            self.table.remove(ssrc);
            info!("removed ssrc {ssrc:#010x}: {event:?}");
            self.callbacks.on_event(event);
        }

        for ssrc in demoted {
            self.table.update(ssrc, |source| source.set_sender(false));
            debug!("ssrc {ssrc:#010x} has become a receiver");
            self.callbacks.on_event(SessionEvent::SenderTimeout(ssrc));
        }

        // remove outdated conflicting addresses
        self.table.expire_conflicting_addresses(
            now,
            self.config.min_rtcp_interval * ADDRESS_CONFLICT_TIMEOUT_N_INTERVALS,
        );
    }

    /// Run the timeout handling and send a RTCP packet if it is time to do so.
    pub fn on_timeout(&mut self, now: Instant, ntp_now: SystemTime) -> Result<(), SessionError> {
        self.handle_timeouts(now);

        let stats = self.member_stats();
        if !self.scheduler.is_rtcp_time(now, &stats) {
            return Ok(());
        }

        let clock_rate = self
            .table
            .local()
            .payload_type()
            .and_then(|pt| self.lookup_clock_rate(pt));
        let bye_reason = self
            .scheduler
            .bye_pending()
            .then(|| self.scheduler.bye_reason())
            .flatten();

        let report = report::generate_report(
            &mut self.table,
            self.config.mtu,
            clock_rate,
            bye_reason,
            now,
            ntp_now,
        )?;
        let bye = bye_reason.is_some();
        self.dropped_report_blocks += report.n_dropped_report_blocks as u64;
        self.scheduler
            .report_sent(now, report.data.len() + self.config.header_len);

        debug!(
            "sending {} of {} bytes with {} report blocks{}",
            if report.is_sender_report { "SR" } else { "RR" },
            report.data.len(),
            report.n_report_blocks,
            if bye { " with BYE" } else { "" }
        );
        self.callbacks.transmit_rtcp(report.ssrc, report.data);
        Ok(())
    }
}

fn generate_cname(rng: &mut StdRng) -> String {
    let user = rng.gen::<u32>();
    let host = rng.gen::<u32>();
    format!("user{user}@host-{host:08x}")
}
