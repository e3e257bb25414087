// SPDX-License-Identifier: MPL-2.0

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    time::{Duration, Instant, SystemTime},
};

use muldiv::MulDiv;
use rtcp_types::{ReportBlock, ReportBlockBuilder, SdesItem};
use rtp_types::RtpPacket;

use crate::time::{ntp_short_to_duration, system_time_to_ntp_time_u64, NtpTime};
use crate::utils::{i64_to_raw_2_comp_24, raw_2_comp_to_i32, ExtendedSeqnum};

pub const DEFAULT_MAX_DROPOUT: u32 = 3000;
pub const DEFAULT_MAX_MISORDER: u32 = 100;

const BITRATE_WINDOW: Duration = Duration::from_secs(3);

/// Per packet information about an incoming packet
#[derive(Debug, Clone, Copy)]
pub struct ArrivalStats {
    /// When the packet was received
    pub time: Instant,
    /// Wall-clock time of the arrival, if a clock is available
    pub ntp_time: Option<SystemTime>,
    /// Size of the packet including the transport overhead
    pub bytes: usize,
    /// RTP payload length, 0 for RTCP
    pub payload_len: usize,
    /// Where the packet came from
    pub address: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rb {
    ssrc: u32,
    /// fraction out of 256 of packets lost since the last Rb
    fraction_lost: u8,
    /// signed 24-bit number of expected packets - received packets (including duplicates and late
    /// packets)
    cumulative_lost: u32,
    extended_sequence_number: u32,
    /// jitter in clock rate units
    jitter: u32,
    /// 16.16 fixed point ntp time
    last_sr: u32,
    /// 16.16 fixed point ntp duration
    delay_since_last_sr: u32,
}

impl Rb {
    /// The ssrc this report block is about
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    pub fn cumulative_lost(&self) -> i32 {
        raw_2_comp_to_i32(self.cumulative_lost, 24)
    }

    pub fn extended_sequence_number(&self) -> u32 {
        self.extended_sequence_number
    }

    pub fn jitter(&self) -> u32 {
        self.jitter
    }

    pub fn last_sr_ntp_time(&self) -> u32 {
        self.last_sr
    }

    pub fn delay_since_last_sr(&self) -> u32 {
        self.delay_since_last_sr
    }
}

impl From<ReportBlock<'_>> for Rb {
    fn from(value: ReportBlock) -> Self {
        Self {
            ssrc: value.ssrc(),
            fraction_lost: value.fraction_lost(),
            cumulative_lost: value.cumulative_lost(),
            extended_sequence_number: value.extended_sequence_number(),
            jitter: value.interarrival_jitter(),
            last_sr: value.last_sender_report_timestamp(),
            delay_since_last_sr: value.delay_since_last_sender_report_timestamp(),
        }
    }
}

impl From<Rb> for ReportBlockBuilder {
    fn from(value: Rb) -> Self {
        ReportBlock::builder(value.ssrc)
            .fraction_lost(value.fraction_lost)
            .cumulative_lost(value.cumulative_lost)
            .extended_sequence_number(value.extended_sequence_number)
            .interarrival_jitter(value.jitter)
            .last_sender_report_timestamp(value.last_sr)
            .delay_since_last_sender_report_timestamp(value.delay_since_last_sr)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReceivedRb {
    pub rb: Rb,
    pub receive_time: Instant,
    pub receive_ntp_time: Option<NtpTime>,
}

impl ReceivedRb {
    /// Round trip time derived from the LSR and DLSR fields, `None` if the reporter has not
    /// received a sender report yet or the arrival wall-clock time is unknown.
    pub fn round_trip_time(&self) -> Option<Duration> {
        if self.rb.last_sr == 0 {
            return None;
        }
        let receive_ntp_time = self.receive_ntp_time?.as_u32();

        // 16.16 fixed point, wrapping around every 65536 seconds
        let rtt = receive_ntp_time
            .wrapping_sub(self.rb.last_sr)
            .wrapping_sub(self.rb.delay_since_last_sr);
        // clock skew or bogus values would appear as a huge round trip time
        if rtt > 0x8000_0000 {
            return None;
        }
        Some(ntp_short_to_duration(rtt))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sr {
    /// local arrival (or send) time
    local_time: Instant,
    /// local wall-clock of the arrival (or send) time
    local_ntp_time: Option<SystemTime>,
    remote_time: NtpTime,
    rtp_time: u32,
    octet_count: u32,
    packet_count: u32,
}

impl Sr {
    pub fn ntp_timestamp(&self) -> NtpTime {
        self.remote_time
    }

    pub fn rtp_timestamp(&self) -> u32 {
        self.rtp_time
    }

    pub fn octet_count(&self) -> u32 {
        self.octet_count
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    /// When the sender report was received (or sent for local sources)
    pub fn local_time(&self) -> Instant {
        self.local_time
    }

    pub fn local_ntp_time(&self) -> Option<SystemTime> {
        self.local_ntp_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Probation(u32),
    Validated,
    Bye,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SourceRecvReply {
    /// The packet has been stored while the source is on probation
    Hold,
    /// The source has just been validated.  Deliver these stored packets (in order) before the
    /// input packet.
    Release(Vec<Vec<u8>>),
    /// Deliver the input packet
    Passthrough,
    /// Drop the input packet
    Ignore,
}

#[derive(Debug, Clone)]
struct HeldPacket {
    data: Vec<u8>,
    time: Instant,
    ext_seqnum: u64,
    rtp_timestamp: u32,
    payload_len: usize,
}

/// The record of a single participant (ssrc or csrc) in a session
#[derive(Debug, Clone)]
pub struct Source {
    ssrc: u32,
    is_local: bool,
    is_csrc: bool,
    probation_packets: u32,
    probation: u32,
    validated: bool,
    is_sender: bool,
    received_bye: bool,
    bye_time: Option<Instant>,
    bye_reason: Option<String>,
    last_activity: Instant,
    last_rtp_activity: Instant,
    rtp_from: Option<SocketAddr>,
    rtcp_from: Option<SocketAddr>,
    sdes: HashMap<u8, String>,
    payload_type: Option<u8>,
    bitrate: Bitrate,

    // receive statistics
    ext_seqnum: ExtendedSeqnum,
    base_seqnum: Option<u64>,
    bad_seqnum: Option<u16>,
    recv_bytes: u64,
    recv_packets: u64,
    expected_at_last_rtcp: u64,
    recv_packets_at_last_rtcp: u64,
    // scaled by 16
    jitter: u32,
    transit: Option<i32>,
    jitter_base: Option<Instant>,
    // packets received while on probation
    held_packets: VecDeque<HeldPacket>,
    last_received_sr: Option<Sr>,
    last_sent_rb: Option<Rb>,

    // send statistics
    sent_bytes: u64,
    sent_packets: u64,
    last_rtp_sent: Option<(u32, Instant)>,
    last_sent_sr: Option<Sr>,
    last_received_rb: HashMap<u32, ReceivedRb>,
    last_rb_reporter: Option<u32>,
}

impl Source {
    /// A new remote source that needs `probation` consecutive RTP packets to be validated
    pub fn new(ssrc: u32, probation: u32, now: Instant) -> Self {
        Self {
            ssrc,
            is_local: false,
            is_csrc: false,
            probation_packets: probation,
            probation,
            validated: false,
            is_sender: false,
            received_bye: false,
            bye_time: None,
            bye_reason: None,
            last_activity: now,
            last_rtp_activity: now,
            rtp_from: None,
            rtcp_from: None,
            sdes: HashMap::new(),
            payload_type: None,
            bitrate: Bitrate::new(BITRATE_WINDOW),
            ext_seqnum: ExtendedSeqnum::default(),
            base_seqnum: None,
            bad_seqnum: None,
            recv_bytes: 0,
            recv_packets: 0,
            expected_at_last_rtcp: 0,
            recv_packets_at_last_rtcp: 0,
            jitter: 0,
            transit: None,
            jitter_base: None,
            held_packets: VecDeque::new(),
            last_received_sr: None,
            last_sent_rb: None,
            sent_bytes: 0,
            sent_packets: 0,
            last_rtp_sent: None,
            last_sent_sr: None,
            last_received_rb: HashMap::new(),
            last_rb_reporter: None,
        }
    }

    /// The source representing ourselves in a session
    pub fn new_local(ssrc: u32, now: Instant) -> Self {
        let mut source = Self::new(ssrc, 0, now);
        source.is_local = true;
        source.validated = true;
        source
    }

    /// Retrieve the ssrc for this source
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Whether this source was only discovered as a contributing source of a mixer
    pub fn is_csrc(&self) -> bool {
        self.is_csrc
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn is_sender(&self) -> bool {
        self.is_sender
    }

    /// An active source is a validated source that has not left the session
    pub fn is_active(&self) -> bool {
        self.validated && !self.received_bye
    }

    pub fn received_bye(&self) -> bool {
        self.received_bye
    }

    pub fn state(&self) -> SourceState {
        if self.received_bye {
            SourceState::Bye
        } else if self.validated {
            SourceState::Validated
        } else {
            SourceState::Probation(self.probation)
        }
    }

    pub fn bye_time(&self) -> Option<Instant> {
        self.bye_time
    }

    pub fn bye_reason(&self) -> Option<&str> {
        self.bye_reason.as_deref()
    }

    /// The last time when activity was seen for this source
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// The last time when RTP was received from (or sent by) this source
    pub fn last_rtp_activity(&self) -> Instant {
        self.last_rtp_activity
    }

    pub(crate) fn set_last_activity(&mut self, time: Instant) {
        self.last_activity = time;
    }

    pub(crate) fn set_last_rtp_activity(&mut self, time: Instant) {
        self.last_rtp_activity = time;
    }

    pub fn rtp_from(&self) -> Option<SocketAddr> {
        self.rtp_from
    }

    pub(crate) fn set_rtp_from(&mut self, from: Option<SocketAddr>) {
        self.rtp_from = from;
    }

    pub fn rtcp_from(&self) -> Option<SocketAddr> {
        self.rtcp_from
    }

    pub(crate) fn set_rtcp_from(&mut self, from: Option<SocketAddr>) {
        self.rtcp_from = from;
    }

    pub(crate) fn set_as_csrc(&mut self) {
        self.is_csrc = true;
        self.validated = true;
        self.probation = 0;
    }

    /// RTCP is a strong indication that we are dealing with a valid source
    pub(crate) fn set_validated(&mut self) {
        self.validated = true;
        self.probation = 0;
    }

    pub(crate) fn set_sender(&mut self, is_sender: bool) {
        self.is_sender = is_sender;
    }

    /// Retrieve the last seen payload type for this source
    pub fn payload_type(&self) -> Option<u8> {
        self.payload_type
    }

    /// Bitrate in bytes per second over the last few seconds
    pub fn bitrate(&self) -> usize {
        self.bitrate.bitrate()
    }

    /// Set an sdes item for this source.  Returns whether the value changed.
    pub(crate) fn set_sdes_item(&mut self, type_: u8, value: &[u8]) -> bool {
        let Ok(s) = std::str::from_utf8(value) else {
            return false;
        };
        if self.sdes.get(&type_).map(String::as_str) == Some(s) {
            return false;
        }
        self.sdes.insert(type_, s.to_owned());
        true
    }

    /// Retrieve the sdes for this source
    pub fn sdes(&self) -> &HashMap<u8, String> {
        &self.sdes
    }

    pub fn cname(&self) -> Option<&str> {
        self.sdes.get(&SdesItem::CNAME).map(String::as_str)
    }

    fn init_sequence(&mut self, ext_seqnum: u64) {
        self.base_seqnum = Some(ext_seqnum);
        self.bad_seqnum = None;
        self.recv_bytes = 0;
        self.recv_packets = 0;
        self.expected_at_last_rtcp = 0;
        self.recv_packets_at_last_rtcp = 0;
        self.bitrate.reset();
    }

    /// Run probation and sequence number validation for an incoming RTP packet and update the
    /// receive statistics.
    pub(crate) fn process_rtp(
        &mut self,
        rtp: &RtpPacket<'_>,
        data: &[u8],
        arrival: &ArrivalStats,
        clock_rate: Option<u32>,
    ) -> SourceRecvReply {
        if self.received_bye {
            trace!("source {} already sent a BYE, ignoring RTP", self.ssrc);
            return SourceRecvReply::Ignore;
        }

        let seqnum = rtp.sequence_number();
        let rtp_timestamp = rtp.timestamp();
        self.payload_type = Some(rtp.payload_type());

        if !self.validated {
            let previous = self.ext_seqnum.current();
            let ext_seqnum = self.ext_seqnum.next(seqnum);
            let consecutive = previous.is_some_and(|previous| ext_seqnum == previous + 1);
            if previous.is_some() && !consecutive {
                debug!(
                    "source {} resetting probation counter to {} at seqnum {seqnum}",
                    self.ssrc, self.probation_packets
                );
                self.probation = self.probation_packets;
                self.held_packets.clear();
                self.ext_seqnum.reset();
                self.ext_seqnum.next(seqnum);
            }
            self.probation = self.probation.saturating_sub(1);

            let current = HeldPacket {
                data: data.to_vec(),
                time: arrival.time,
                ext_seqnum: self.ext_seqnum.current().unwrap_or(ext_seqnum),
                rtp_timestamp,
                payload_len: arrival.payload_len,
            };

            if self.probation > 0 {
                debug!("source {} holding seqnum {seqnum} on probation", self.ssrc);
                self.held_packets.push_back(current);
                while self.held_packets.len() > self.probation_packets as usize {
                    self.held_packets.pop_front();
                }
                return SourceRecvReply::Hold;
            }

            info!("source {} leaving probation", self.ssrc);
            self.validated = true;
            let base = self
                .held_packets
                .front()
                .map(|held| held.ext_seqnum)
                .unwrap_or(current.ext_seqnum);
            self.init_sequence(base);

            let held = std::mem::take(&mut self.held_packets);
            let mut release = Vec::with_capacity(held.len());
            for packet in held {
                self.add_to_stats(
                    packet.time,
                    packet.rtp_timestamp,
                    packet.payload_len,
                    clock_rate,
                );
                release.push(packet.data);
            }
            self.add_to_stats(
                current.time,
                current.rtp_timestamp,
                current.payload_len,
                clock_rate,
            );

            return if release.is_empty() {
                SourceRecvReply::Passthrough
            } else {
                SourceRecvReply::Release(release)
            };
        }

        let Some(highest) = self.ext_seqnum.current() else {
            // validated through RTCP, this is the first RTP packet
            let ext_seqnum = self.ext_seqnum.next(seqnum);
            self.init_sequence(ext_seqnum);
            self.add_to_stats(arrival.time, rtp_timestamp, arrival.payload_len, clock_rate);
            return SourceRecvReply::Passthrough;
        };
        let ext_seqnum = self.ext_seqnum.extend(seqnum);
        let diff = ext_seqnum as i64 - highest as i64;
        trace!(
            "source {} received seqnum {seqnum} with a difference of {diff} from the highest seqnum",
            self.ssrc
        );

        if diff < DEFAULT_MAX_DROPOUT as i64 && diff >= -(DEFAULT_MAX_MISORDER as i64) {
            // in order, duplicate or reordered packet within the limits
            self.ext_seqnum.next(seqnum);
        } else if self.bad_seqnum == Some(seqnum) {
            // two sequential packets after a large jump, assume the other side restarted
            debug!("source {} resyncing at seqnum {seqnum}", self.ssrc);
            self.ext_seqnum.reset();
            let ext_seqnum = self.ext_seqnum.next(seqnum);
            self.init_sequence(ext_seqnum);
        } else {
            debug!(
                "source {} non-consecutive seqnum {seqnum} outside of configured limits, dropping",
                self.ssrc
            );
            self.bad_seqnum = Some(seqnum.wrapping_add(1));
            return SourceRecvReply::Ignore;
        }

        self.add_to_stats(arrival.time, rtp_timestamp, arrival.payload_len, clock_rate);
        SourceRecvReply::Passthrough
    }

    fn add_to_stats(
        &mut self,
        now: Instant,
        rtp_timestamp: u32,
        payload_len: usize,
        clock_rate: Option<u32>,
    ) {
        /* calculate jitter */
        if let Some(clock_rate) = clock_rate {
            let base = *self.jitter_base.get_or_insert(now);
            let rtparrival = (now.duration_since(base).as_micros() as u64)
                .mul_div_round(clock_rate as u64, 1_000_000)
                .unwrap_or(0) as u32;
            let transit = rtparrival.wrapping_sub(rtp_timestamp) as i32;
            if let Some(previous) = self.transit {
                let d = transit.wrapping_sub(previous).unsigned_abs() as i64;
                let jitter = self.jitter as i64;
                self.jitter = (jitter + d - ((jitter + 8) >> 4)).clamp(0, u32::MAX as i64) as u32;
            }
            self.transit = Some(transit);
            trace!("source {} jitter {}", self.ssrc, self.jitter >> 4);
        }

        self.bitrate.add_entry(payload_len, now);
        self.recv_bytes = self.recv_bytes.wrapping_add(payload_len as u64);
        self.recv_packets += 1;
        if payload_len > 0 {
            self.is_sender = true;
        }
    }

    /// Account for an RTP packet sent by this (local) source
    pub(crate) fn sent_rtp(
        &mut self,
        payload_len: usize,
        now: Instant,
        rtp_timestamp: u32,
        payload_type: u8,
    ) {
        self.bitrate.add_entry(payload_len, now);
        self.payload_type = Some(payload_type);
        self.sent_bytes = self.sent_bytes.wrapping_add(payload_len as u64);
        self.sent_packets += 1;
        self.last_rtp_sent = Some((rtp_timestamp, now));
        self.last_rtp_activity = now;
        self.last_activity = now;
        self.is_sender = true;
    }

    /// Retrieve the last rtp timestamp (and time) that data was sent for this source
    pub fn last_rtp_sent_timestamp(&self) -> Option<(u32, Instant)> {
        self.last_rtp_sent
    }

    pub fn sent_packet_count(&self) -> u64 {
        self.sent_packets
    }

    pub fn sent_octet_count(&self) -> u64 {
        self.sent_bytes
    }

    pub fn received_packet_count(&self) -> u64 {
        self.recv_packets
    }

    pub fn received_octet_count(&self) -> u64 {
        self.recv_bytes
    }

    /// The highest extended sequence number received
    pub fn extended_sequence_number(&self) -> u32 {
        (self.ext_seqnum.current().unwrap_or(0x10000).saturating_sub(0x10000) & 0xffff_ffff)
            as u32
    }

    fn expected_packets(&self) -> u64 {
        match (self.ext_seqnum.current(), self.base_seqnum) {
            (Some(highest), Some(base)) if highest >= base => highest - base + 1,
            _ => 0,
        }
    }

    /// The total number of packets lost over the lifetime of this source
    pub fn packets_lost(&self) -> i64 {
        self.expected_packets() as i64 - self.recv_packets as i64
    }

    /// The amount of jitter (in clock-rate units)
    pub fn jitter(&self) -> u32 {
        self.jitter >> 4
    }

    pub(crate) fn process_sr(
        &mut self,
        ntp_timestamp: NtpTime,
        rtp_timestamp: u32,
        packet_count: u32,
        octet_count: u32,
        arrival: &ArrivalStats,
    ) {
        self.last_received_sr = Some(Sr {
            local_time: arrival.time,
            local_ntp_time: arrival.ntp_time,
            remote_time: ntp_timestamp,
            rtp_time: rtp_timestamp,
            octet_count,
            packet_count,
        });
        self.is_sender = true;
    }

    /// Retrieve the last received Sr for this source
    pub fn last_received_sr(&self) -> Option<Sr> {
        self.last_received_sr
    }

    /// Store a report block sent by `reporter` about this source
    pub(crate) fn process_rb(
        &mut self,
        reporter: u32,
        rb: Rb,
        now: Instant,
        ntp_now: Option<SystemTime>,
    ) {
        self.last_received_rb.insert(
            reporter,
            ReceivedRb {
                rb,
                receive_time: now,
                receive_ntp_time: ntp_now.map(system_time_to_ntp_time_u64),
            },
        );
        self.last_rb_reporter = Some(reporter);
    }

    pub fn received_report_blocks(&self) -> impl Iterator<Item = (u32, &ReceivedRb)> + '_ {
        self.last_received_rb.iter().map(|(&k, v)| (k, v))
    }

    /// The most recently received report block about this source
    pub fn last_received_rb(&self) -> Option<&ReceivedRb> {
        self.last_rb_reporter
            .and_then(|reporter| self.last_received_rb.get(&reporter))
    }

    pub(crate) fn process_bye(&mut self, time: Instant, reason: Option<String>) {
        if self.received_bye {
            return;
        }
        self.received_bye = true;
        self.bye_time = Some(time);
        self.bye_reason = reason;
        self.is_sender = false;
        self.held_packets.clear();
    }

    /// Mark our own source as leaving the session
    pub(crate) fn mark_bye(&mut self, reason: &str, time: Instant) {
        if self.received_bye {
            return;
        }
        self.received_bye = true;
        self.bye_time = Some(time);
        self.bye_reason = Some(reason.to_string());
    }

    pub(crate) fn generate_report_block(&self, now: Instant) -> Rb {
        let (last_sr, delay_since_last_sr) = self
            .last_received_sr
            .as_ref()
            .map(|sr| {
                (
                    sr.remote_time.as_u32(),
                    NtpTime::from_duration(now.saturating_duration_since(sr.local_time)).as_u32(),
                )
            })
            .unwrap_or((0, 0));

        let expected = self.expected_packets();
        let expected_since_last_rtcp = expected.saturating_sub(self.expected_at_last_rtcp);
        let recv_packets_since_last_rtcp = self.recv_packets - self.recv_packets_at_last_rtcp;
        let lost_packets_since_last_rtcp =
            expected_since_last_rtcp as i64 - recv_packets_since_last_rtcp as i64;
        let fraction_lost = if expected_since_last_rtcp == 0 || lost_packets_since_last_rtcp <= 0 {
            0
        } else {
            (((lost_packets_since_last_rtcp as u64) << 8) / expected_since_last_rtcp).min(255) as u8
        };

        trace!(
            "ssrc {} expected {expected_since_last_rtcp} lost {lost_packets_since_last_rtcp} fraction lost {fraction_lost}",
            self.ssrc
        );

        Rb {
            ssrc: self.ssrc,
            fraction_lost,
            cumulative_lost: i64_to_raw_2_comp_24(self.packets_lost()),
            extended_sequence_number: self.extended_sequence_number(),
            jitter: self.jitter(),
            last_sr,
            delay_since_last_sr,
        }
    }

    /// Remember the current counters after a report block about this source has been sent
    pub(crate) fn update_last_rtcp(&mut self, rb: Rb) {
        self.recv_packets_at_last_rtcp = self.recv_packets;
        self.expected_at_last_rtcp = self.expected_packets();
        self.last_sent_rb = Some(rb);
    }

    /// Get the last sent RTCP report block for this source
    pub fn last_sent_rb(&self) -> Option<Rb> {
        self.last_sent_rb
    }

    pub(crate) fn take_sr_snapshot(
        &mut self,
        now: Instant,
        ntp_now: SystemTime,
        ntp_time: NtpTime,
        rtp_timestamp: u32,
    ) {
        self.last_sent_sr = Some(Sr {
            local_time: now,
            local_ntp_time: Some(ntp_now),
            remote_time: ntp_time,
            rtp_time: rtp_timestamp,
            octet_count: (self.sent_bytes & 0xffff_ffff) as u32,
            packet_count: (self.sent_packets & 0xffff_ffff) as u32,
        });
    }

    pub fn last_sent_sr(&self) -> Option<Sr> {
        self.last_sent_sr
    }

    #[cfg(test)]
    pub(crate) fn set_probation_packets(&mut self, n_packets: u32) {
        self.probation_packets = n_packets;
        if !self.validated && n_packets < self.probation {
            self.probation = n_packets;
        }
    }
}

#[derive(Debug, Clone)]
struct Bitrate {
    max_time: Duration,
    entries: VecDeque<(usize, Instant)>,
}

impl Bitrate {
    fn new(max_time: Duration) -> Self {
        Self {
            max_time,
            entries: VecDeque::new(),
        }
    }

    fn add_entry(&mut self, bytes: usize, time: Instant) {
        self.entries.push_back((bytes, time));
        while let Some((bytes, latest_time)) = self.entries.pop_front() {
            if time.saturating_duration_since(latest_time) < self.max_time {
                self.entries.push_front((bytes, latest_time));
                break;
            }
        }
    }

    fn bitrate(&self) -> usize {
        let (Some(front), Some(back)) = (self.entries.front(), self.entries.back()) else {
            return 0;
        };
        let dur_micros = back.1.saturating_duration_since(front.1).as_micros();
        if dur_micros == 0 {
            return front.0;
        }
        let bytes = self.entries.iter().map(|entry| entry.0).sum::<usize>();

        (bytes as u64)
            .mul_div_round(1_000_000, dur_micros as u64)
            .unwrap_or(front.0 as u64) as usize
    }

    fn reset(&mut self) {
        self.entries.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logs;
    use rtp_types::RtpPacketBuilder;

    const TEST_PT: u8 = 96;

    fn rtp_data(seqnum: u16, rtp_ts: u32) -> Vec<u8> {
        let mut rtp_data = [0; 128];
        let payload = vec![1; 16];
        let len = RtpPacketBuilder::new()
            .payload_type(TEST_PT)
            .ssrc(100)
            .sequence_number(seqnum)
            .timestamp(rtp_ts)
            .payload(payload.as_slice())
            .write_into(&mut rtp_data)
            .unwrap();
        rtp_data[..len].to_vec()
    }

    fn arrival(time: Instant) -> ArrivalStats {
        ArrivalStats {
            time,
            ntp_time: None,
            bytes: 16 + 12 + 28,
            payload_len: 16,
            address: None,
        }
    }

    fn recv(source: &mut Source, seqnum: u16, now: Instant) -> SourceRecvReply {
        let data = rtp_data(seqnum, 100);
        let packet = RtpPacket::parse(&data).unwrap();
        source.process_rtp(&packet, &data, &arrival(now), None)
    }

    #[test]
    fn bitrate_single_value() {
        init_logs();
        // the bitrate of a single entry is the entry itself
        let mut bitrate = Bitrate::new(BITRATE_WINDOW);
        bitrate.add_entry(100, Instant::now());
        assert_eq!(bitrate.bitrate(), 100);
    }

    #[test]
    fn bitrate_two_values_over_half_second() {
        init_logs();
        let mut bitrate = Bitrate::new(Duration::from_secs(1));
        let now = Instant::now();
        bitrate.add_entry(100, now);
        bitrate.add_entry(300, now + Duration::from_millis(500));
        assert_eq!(bitrate.bitrate(), (100 + 300) * 2);
    }

    #[test]
    fn receive_probation() {
        init_logs();
        let mut source = Source::new(100, 2, Instant::now());
        let now = Instant::now();
        assert_eq!(source.state(), SourceState::Probation(2));
        assert_eq!(recv(&mut source, 500, now), SourceRecvReply::Hold);
        assert!(!source.is_active());
        let first = rtp_data(500, 100);
        assert_eq!(
            recv(&mut source, 501, now),
            SourceRecvReply::Release(vec![first])
        );
        assert_eq!(source.state(), SourceState::Validated);
        assert!(source.is_active());
        assert!(source.is_sender());
        assert_eq!(source.received_packet_count(), 2);
        assert_eq!(recv(&mut source, 502, now), SourceRecvReply::Passthrough);
        assert_eq!(source.received_packet_count(), 3);
        assert_eq!(source.packets_lost(), 0);
    }

    #[test]
    fn receive_probation_gap() {
        init_logs();
        let mut source = Source::new(100, 2, Instant::now());
        let now = Instant::now();
        assert_eq!(recv(&mut source, 500, now), SourceRecvReply::Hold);
        // a sequence gap resets the probation counter and drops what was held
        assert_eq!(recv(&mut source, 502, now), SourceRecvReply::Hold);
        let held = rtp_data(502, 100);
        assert_eq!(
            recv(&mut source, 503, now),
            SourceRecvReply::Release(vec![held])
        );
        assert_eq!(source.state(), SourceState::Validated);
        assert_eq!(source.received_packet_count(), 2);
    }

    #[test]
    fn receive_probation_gap_restarts() {
        init_logs();
        let mut source = Source::new(100, 3, Instant::now());
        let now = Instant::now();
        assert_eq!(recv(&mut source, 500, now), SourceRecvReply::Hold);
        assert_eq!(recv(&mut source, 501, now), SourceRecvReply::Hold);
        // nothing from before the gap survives
        assert_eq!(recv(&mut source, 600, now), SourceRecvReply::Hold);
        assert_eq!(recv(&mut source, 601, now), SourceRecvReply::Hold);
        assert_eq!(
            recv(&mut source, 602, now),
            SourceRecvReply::Release(vec![rtp_data(600, 100), rtp_data(601, 100)])
        );
        assert_eq!(source.state(), SourceState::Validated);
        assert_eq!(source.received_packet_count(), 3);
        assert_eq!(source.packets_lost(), 0);
        assert_eq!(source.extended_sequence_number(), 602);
        assert_eq!(source.generate_report_block(now).fraction_lost(), 0);
    }

    #[test]
    fn receive_no_probation() {
        init_logs();
        let mut source = Source::new(100, 2, Instant::now());
        source.set_probation_packets(0);
        assert_eq!(source.state(), SourceState::Probation(0));
        assert_eq!(
            recv(&mut source, 500, Instant::now()),
            SourceRecvReply::Passthrough
        );
        assert_eq!(source.state(), SourceState::Validated);
    }

    #[test]
    fn receive_wraparound() {
        init_logs();
        let mut source = Source::new(100, 0, Instant::now());
        let now = Instant::now();
        assert_eq!(recv(&mut source, u16::MAX, now), SourceRecvReply::Passthrough);
        assert_eq!(recv(&mut source, 0, now), SourceRecvReply::Passthrough);
        assert_eq!(source.extended_sequence_number(), 0x1_0000);
        assert_eq!(source.packets_lost(), 0);
    }

    #[test]
    fn receive_after_rtcp_validation() {
        init_logs();
        let mut source = Source::new(100, 2, Instant::now());
        source.set_validated();
        assert_eq!(
            recv(&mut source, 40000, Instant::now()),
            SourceRecvReply::Passthrough
        );
        assert_eq!(source.received_packet_count(), 1);
        assert_eq!(source.packets_lost(), 0);
    }

    #[test]
    fn receive_large_jump_resyncs() {
        init_logs();
        let mut source = Source::new(100, 0, Instant::now());
        let now = Instant::now();
        assert_eq!(recv(&mut source, 100, now), SourceRecvReply::Passthrough);
        assert_eq!(recv(&mut source, 20000, now), SourceRecvReply::Ignore);
        assert_eq!(recv(&mut source, 20001, now), SourceRecvReply::Passthrough);
        assert_eq!(source.extended_sequence_number() & 0xffff, 20001);
        assert_eq!(source.received_packet_count(), 1);
    }

    #[test]
    fn report_block_loss() {
        init_logs();
        let mut source = Source::new(100, 0, Instant::now());
        let now = Instant::now();
        for seqnum in [10, 11, 14, 15] {
            assert_eq!(recv(&mut source, seqnum, now), SourceRecvReply::Passthrough);
        }
        let rb = source.generate_report_block(now);
        assert_eq!(rb.ssrc(), 100);
        assert_eq!(rb.cumulative_lost(), 2);
        // 2 out of 6
        assert_eq!(rb.fraction_lost(), 85);
        assert_eq!(rb.extended_sequence_number(), 15);
        assert_eq!(rb.last_sr_ntp_time(), 0);
        assert_eq!(rb.delay_since_last_sr(), 0);
        source.update_last_rtcp(rb);

        assert_eq!(recv(&mut source, 16, now), SourceRecvReply::Passthrough);
        let rb = source.generate_report_block(now);
        assert_eq!(rb.fraction_lost(), 0);
        assert_eq!(rb.cumulative_lost(), 2);
    }

    #[test]
    fn report_block_duplicates_negative_loss() {
        init_logs();
        let mut source = Source::new(100, 0, Instant::now());
        let now = Instant::now();
        assert_eq!(recv(&mut source, 10, now), SourceRecvReply::Passthrough);
        assert_eq!(recv(&mut source, 10, now), SourceRecvReply::Passthrough);
        let rb = source.generate_report_block(now);
        assert_eq!(rb.cumulative_lost(), -1);
        assert_eq!(rb.fraction_lost(), 0);
    }

    #[test]
    fn report_block_lsr_dlsr() {
        init_logs();
        let now = Instant::now();
        let mut source = Source::new(100, 0, now);
        let ntp = NtpTime::from(0x1234_5678_9abc_def0);
        source.process_sr(ntp, 1000, 5, 500, &arrival(now));
        assert!(source.is_sender());
        let rb = source.generate_report_block(now + Duration::from_secs(2));
        assert_eq!(rb.last_sr_ntp_time(), 0x5678_9abc);
        assert_eq!(rb.delay_since_last_sr(), 2 << 16);
    }

    #[test]
    fn jitter_steady_stream_is_zero() {
        init_logs();
        let mut source = Source::new(100, 0, Instant::now());
        let now = Instant::now();
        for i in 0..10u16 {
            let data = rtp_data(i, 90 * i as u32);
            let packet = RtpPacket::parse(&data).unwrap();
            let time = now + Duration::from_millis(i as u64);
            source.process_rtp(&packet, &data, &arrival(time), Some(90_000));
        }
        assert_eq!(source.jitter(), 0);
    }

    #[test]
    fn round_trip_time() {
        let ntp_now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let now_short = system_time_to_ntp_time_u64(ntp_now).as_u32();
        let lsr = now_short.wrapping_sub(3 << 16);
        let rb = Rb {
            ssrc: 1,
            fraction_lost: 0,
            cumulative_lost: 0,
            extended_sequence_number: 0,
            jitter: 0,
            last_sr: lsr,
            delay_since_last_sr: 2 << 16,
        };
        let received = ReceivedRb {
            rb,
            receive_time: Instant::now(),
            receive_ntp_time: Some(system_time_to_ntp_time_u64(ntp_now)),
        };
        assert_eq!(received.round_trip_time(), Some(Duration::from_secs(1)));

        let received = ReceivedRb {
            receive_ntp_time: None,
            ..received
        };
        assert_eq!(received.round_trip_time(), None);
    }
}
