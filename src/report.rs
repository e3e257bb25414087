// SPDX-License-Identifier: MPL-2.0

use std::time::{Instant, SystemTime};

use muldiv::MulDiv;
use rtcp_types::*;

use crate::error::SessionError;
use crate::source::Rb;
use crate::table::SourceTable;
use crate::time::system_time_to_ntp_time_u64;

/// Maximum number of report blocks in a SR or RR
pub const MAX_REPORT_BLOCKS: usize = 31;
/// Size of a single report block on the wire
const REPORT_BLOCK_SIZE: usize = 24;

#[derive(Debug, Clone, Copy)]
struct SenderInfo {
    packet_count: u32,
    octet_count: u32,
    ntp_timestamp: u64,
    rtp_timestamp: u32,
}

#[derive(Debug)]
struct ReportContents {
    ssrc: u32,
    sender_info: Option<SenderInfo>,
    report_blocks: Vec<Rb>,
    sdes: Vec<(u8, String)>,
    bye_reason: Option<String>,
}

impl ReportContents {
    fn compound(&self, n_report_blocks: usize) -> CompoundBuilder<'_> {
        let mut rtcp = Compound::builder();
        let rbs = self
            .report_blocks
            .iter()
            .take(n_report_blocks)
            .map(|rb| ReportBlockBuilder::from(*rb));

        if let Some(info) = self.sender_info {
            let mut sr = SenderReport::builder(self.ssrc)
                .packet_count(info.packet_count)
                .octet_count(info.octet_count)
                .ntp_timestamp(info.ntp_timestamp)
                .rtp_timestamp(info.rtp_timestamp);
            for rb in rbs {
                sr = sr.add_report_block(rb);
            }
            rtcp = rtcp.add_packet(sr);
        } else {
            let mut rr = ReceiverReport::builder(self.ssrc);
            for rb in rbs {
                rr = rr.add_report_block(rb);
            }
            rtcp = rtcp.add_packet(rr);
        }

        let mut chunk = SdesChunk::builder(self.ssrc);
        for (ty, val) in self.sdes.iter() {
            chunk = chunk.add_item_owned(SdesItem::builder(*ty, val));
        }
        rtcp = rtcp.add_packet(Sdes::builder().add_chunk(chunk));

        if let Some(reason) = self.bye_reason.as_ref() {
            let mut bye = Bye::builder().add_source(self.ssrc);
            if !reason.is_empty() {
                bye = bye.reason_owned(reason);
            }
            rtcp = rtcp.add_packet(bye);
        }

        rtcp
    }
}

/// A generated RTCP compound packet
#[derive(Debug)]
pub(crate) struct Report {
    pub data: Vec<u8>,
    pub ssrc: u32,
    pub is_sender_report: bool,
    pub n_report_blocks: usize,
    pub n_dropped_report_blocks: usize,
}

/// Build the RTCP compound packet for the local source of `table` and record what was reported
/// on the sources.
///
/// `clock_rate` is the clock rate of the payload last sent by the local source and is used to
/// extrapolate the RTP timestamp of a sender report.
pub(crate) fn generate_report(
    table: &mut SourceTable,
    mtu: usize,
    clock_rate: Option<u32>,
    bye_reason: Option<&str>,
    now: Instant,
    ntp_now: SystemTime,
) -> Result<Report, SessionError> {
    let ntp_time = system_time_to_ntp_time_u64(ntp_now);
    let local = table.local();

    let sender_info = if local.is_sender() {
        // get last rtp sent timestamp
        let rtp_timestamp = local
            .last_rtp_sent_timestamp()
            .map(|(last_rtp_ts, instant)| {
                let dur_since_last_rtp = now.saturating_duration_since(instant);
                trace!("last_rtp_ts: {last_rtp_ts}, dur since last rtp: {dur_since_last_rtp:?}");
                // assume that the rtp times and clock times advance at a rate close to 1.0 and do
                // a direct linear extrapolation to get the rtp time for 'now'
                let advance = clock_rate
                    .and_then(|clock_rate| {
                        (dur_since_last_rtp.as_nanos() as u64)
                            .mul_div_round(clock_rate as u64, 1_000_000_000)
                            .map(|v| (v & 0xffff_ffff) as u32)
                    })
                    .unwrap_or(0);
                last_rtp_ts.wrapping_add(advance)
            })
            .unwrap_or(0);

        Some(SenderInfo {
            packet_count: (local.sent_packet_count() & 0xffff_ffff) as u32,
            octet_count: (local.sent_octet_count() & 0xffff_ffff) as u32,
            ntp_timestamp: ntp_time.as_u64(),
            rtp_timestamp,
        })
    } else {
        None
    };

    let mut senders = table
        .iter()
        .filter(|source| !source.is_local() && source.is_validated() && source.is_sender())
        .collect::<Vec<_>>();
    senders.sort_by_key(|source| source.ssrc());
    let report_blocks = senders
        .iter()
        .map(|source| source.generate_report_block(now))
        .collect::<Vec<_>>();

    let mut sdes = local
        .sdes()
        .iter()
        .map(|(ty, val)| (*ty, val.clone()))
        .collect::<Vec<_>>();
    // CNAME first
    sdes.sort_by_key(|(ty, _)| *ty);

    let contents = ReportContents {
        ssrc: local.ssrc(),
        sender_info,
        report_blocks,
        sdes,
        bye_reason: bye_reason.map(str::to_owned),
    };

    let base_size = contents
        .compound(0)
        .calculate_size()
        .map_err(SessionError::RtcpWrite)?;
    let max_report_blocks =
        (mtu.saturating_sub(base_size) / REPORT_BLOCK_SIZE).min(MAX_REPORT_BLOCKS);
    let n_report_blocks = contents.report_blocks.len().min(max_report_blocks);
    let n_dropped_report_blocks = contents.report_blocks.len() - n_report_blocks;
    if n_dropped_report_blocks > 0 {
        warn!(
            "only {n_report_blocks} report blocks fit into a RTCP packet, dropping {n_dropped_report_blocks}"
        );
    }

    let data = {
        let rtcp = contents.compound(n_report_blocks);
        let size = rtcp.calculate_size().map_err(SessionError::RtcpWrite)?;
        let mut data = vec![0; size];
        rtcp.write_into(&mut data)
            .map_err(SessionError::RtcpWrite)?;
        data
    };

    for rb in contents.report_blocks.iter().take(n_report_blocks) {
        table.update(rb.ssrc(), |source| source.update_last_rtcp(*rb));
    }
    if let Some(info) = sender_info {
        let ssrc = contents.ssrc;
        table.update(ssrc, |local| {
            local.take_sr_snapshot(now, ntp_now, ntp_time, info.rtp_timestamp)
        });
    }

    trace!(
        "generated {} of {} bytes for ssrc {} with {n_report_blocks} report blocks",
        if sender_info.is_some() { "SR" } else { "RR" },
        data.len(),
        contents.ssrc
    );

    Ok(Report {
        data,
        ssrc: contents.ssrc,
        is_sender_report: sender_info.is_some(),
        n_report_blocks,
        n_dropped_report_blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ArrivalStats, Source};
    use crate::tests::init_logs;
    use std::time::Duration;

    fn receive_rtcp_source(table: &mut SourceTable, ssrc: u32, now: Instant) {
        let arrival = ArrivalStats {
            time: now,
            ntp_time: None,
            bytes: 100,
            payload_len: 0,
            address: None,
        };
        table.obtain_source(ssrc, &arrival, false, 0);
        table.update(ssrc, |source| source.set_sender(true));
    }

    fn local_table(now: Instant) -> SourceTable {
        let mut local = Source::new_local(0x1234, now);
        local.set_sdes_item(SdesItem::CNAME, b"me@host");
        local.set_sdes_item(SdesItem::TOOL, b"rtpsession");
        SourceTable::new(local)
    }

    #[test]
    fn receiver_report() {
        init_logs();
        let now = Instant::now();
        let mut table = local_table(now);
        receive_rtcp_source(&mut table, 3, now);
        receive_rtcp_source(&mut table, 2, now);

        let report =
            generate_report(&mut table, 1200, None, None, now, SystemTime::now()).unwrap();
        assert!(!report.is_sender_report);
        assert_eq!(report.n_report_blocks, 2);

        let rtcp = Compound::parse(&report.data).unwrap();
        let mut n_packets = 0;
        for (i, packet) in rtcp.enumerate() {
            n_packets += 1;
            match (i, packet) {
                (0, Ok(Packet::Rr(rr))) => {
                    assert_eq!(rr.ssrc(), 0x1234);
                    let ssrcs = rr.report_blocks().map(|rb| rb.ssrc()).collect::<Vec<_>>();
                    assert_eq!(ssrcs, vec![2, 3]);
                }
                (1, Ok(Packet::Sdes(sdes))) => {
                    let chunk = sdes.chunks().next().unwrap();
                    assert_eq!(chunk.ssrc(), 0x1234);
                    let items = chunk
                        .items()
                        .map(|item| (item.type_(), item.value().to_vec()))
                        .collect::<Vec<_>>();
                    assert_eq!(
                        items,
                        vec![
                            (SdesItem::CNAME, b"me@host".to_vec()),
                            (SdesItem::TOOL, b"rtpsession".to_vec())
                        ]
                    );
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(n_packets, 2);
        assert_eq!(table.lookup_by_ssrc(2).unwrap().last_sent_rb().map(|rb| rb.ssrc()), Some(2));
    }

    #[test]
    fn sender_report_with_bye() {
        init_logs();
        let now = Instant::now();
        let mut table = local_table(now);
        table.update(0x1234, |local| local.sent_rtp(100, now, 1000, 96));
        let later = now + Duration::from_millis(500);
        let ntp_now = SystemTime::now();

        let report =
            generate_report(&mut table, 1200, Some(90_000), Some("leaving"), later, ntp_now)
                .unwrap();
        assert!(report.is_sender_report);

        let rtcp = Compound::parse(&report.data).unwrap();
        let packets = rtcp.collect::<Vec<_>>();
        assert_eq!(packets.len(), 3);
        match &packets[0] {
            Ok(Packet::Sr(sr)) => {
                assert_eq!(sr.ssrc(), 0x1234);
                assert_eq!(sr.packet_count(), 1);
                assert_eq!(sr.octet_count(), 100);
                assert_eq!(sr.rtp_timestamp(), 1000 + 45_000);
                assert_eq!(sr.ntp_timestamp(), system_time_to_ntp_time_u64(ntp_now).as_u64());
                assert_eq!(sr.n_reports(), 0);
            }
            _ => unreachable!(),
        }
        match &packets[2] {
            Ok(Packet::Bye(bye)) => {
                assert_eq!(bye.ssrcs().collect::<Vec<_>>(), vec![0x1234]);
                assert_eq!(bye.reason(), Some(b"leaving".as_slice()));
            }
            _ => unreachable!(),
        }
        let sr = table.local().last_sent_sr().unwrap();
        assert_eq!(sr.rtp_timestamp(), 46_000);
    }

    #[test]
    fn report_blocks_truncated() {
        init_logs();
        let now = Instant::now();
        let mut table = local_table(now);
        for ssrc in 1..=40 {
            receive_rtcp_source(&mut table, ssrc, now);
        }

        let report =
            generate_report(&mut table, 1200, None, None, now, SystemTime::now()).unwrap();
        assert_eq!(report.n_report_blocks, MAX_REPORT_BLOCKS);
        assert_eq!(report.n_dropped_report_blocks, 40 - MAX_REPORT_BLOCKS);
        assert!(report.data.len() <= 1200);
        // the lowest ssrcs are reported
        assert!(table.lookup_by_ssrc(31).unwrap().last_sent_rb().is_some());
        assert!(table.lookup_by_ssrc(32).unwrap().last_sent_rb().is_none());

        // a smaller mtu reduces the number of report blocks further
        let report =
            generate_report(&mut table, 300, None, None, now, SystemTime::now()).unwrap();
        assert!(report.data.len() <= 300);
        assert!(report.n_report_blocks < MAX_REPORT_BLOCKS);
        assert!(report.n_report_blocks > 0);
    }
}
