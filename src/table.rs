// SPDX-License-Identifier: MPL-2.0

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::Rng;
use smallvec::SmallVec;

use crate::error::SessionError;
use crate::source::{ArrivalStats, Source};

const MAX_SSRC_ATTEMPTS: usize = 30;

/// Result of looking up (or creating) the source of an incoming packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Obtained {
    Found,
    Created,
    /// Another participant uses this ssrc.  `local` is set when it is our own ssrc.
    Collision { local: bool },
    /// Our own packet looped back to us
    Looped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Flags {
    active: bool,
    sender: bool,
}

impl Flags {
    fn of(source: &Source) -> Self {
        Self {
            active: source.is_active(),
            sender: source.is_sender(),
        }
    }
}

/// All participants of a session keyed by ssrc, including the local one
#[derive(Debug)]
pub(crate) struct SourceTable {
    local: Source,
    remote: HashMap<u32, Source>,
    cnames: HashMap<String, SmallVec<[u32; 4]>>,
    conflicting_addresses: HashMap<SocketAddr, Instant>,
    active_sources: usize,
    sender_sources: usize,
}

impl SourceTable {
    pub(crate) fn new(local: Source) -> Self {
        let mut table = Self {
            local,
            remote: HashMap::new(),
            cnames: HashMap::new(),
            conflicting_addresses: HashMap::new(),
            active_sources: 0,
            sender_sources: 0,
        };
        table.account(None, Some(Flags::of(&table.local)));
        table
    }

    fn account(&mut self, before: Option<Flags>, after: Option<Flags>) {
        if let Some(before) = before {
            self.active_sources -= before.active as usize;
            self.sender_sources -= before.sender as usize;
        }
        if let Some(after) = after {
            self.active_sources += after.active as usize;
            self.sender_sources += after.sender as usize;
        }
    }

    pub fn local_ssrc(&self) -> u32 {
        self.local.ssrc()
    }

    pub fn local(&self) -> &Source {
        &self.local
    }

    /// Number of sources, local one included
    pub fn total_sources(&self) -> usize {
        self.remote.len() + 1
    }

    pub fn active_sources(&self) -> usize {
        self.active_sources
    }

    pub fn sender_sources(&self) -> usize {
        self.sender_sources
    }

    pub fn lookup_by_ssrc(&self, ssrc: u32) -> Option<&Source> {
        if ssrc == self.local.ssrc() {
            Some(&self.local)
        } else {
            self.remote.get(&ssrc)
        }
    }

    /// The first source that announced `cname`
    pub fn lookup_by_cname(&self, cname: &str) -> Option<&Source> {
        self.ssrcs_by_cname(cname)
            .iter()
            .find_map(|&ssrc| self.lookup_by_ssrc(ssrc))
    }

    pub fn ssrcs_by_cname(&self, cname: &str) -> &[u32] {
        self.cnames
            .get(cname)
            .map(|ssrcs| ssrcs.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> + '_ {
        std::iter::once(&self.local).chain(self.remote.values())
    }

    pub fn ssrcs(&self) -> impl Iterator<Item = u32> + '_ {
        self.iter().map(Source::ssrc)
    }

    /// Apply `f` to the source with `ssrc` and keep the aggregate counters in sync with the
    /// flags of the source.
    pub(crate) fn update<R>(&mut self, ssrc: u32, f: impl FnOnce(&mut Source) -> R) -> Option<R> {
        let source = if ssrc == self.local.ssrc() {
            &mut self.local
        } else {
            self.remote.get_mut(&ssrc)?
        };
        let before = Flags::of(source);
        let ret = f(source);
        let after = Flags::of(source);
        if before != after {
            self.account(Some(before), Some(after));
        }
        Some(ret)
    }

    /// Insert `source` if its ssrc is unknown
    pub(crate) fn add_source(&mut self, source: Source) -> bool {
        if self.lookup_by_ssrc(source.ssrc()).is_some() {
            return false;
        }
        self.account(None, Some(Flags::of(&source)));
        self.remote.insert(source.ssrc(), source);
        true
    }

    /// Remove a remote source.  The local source can not be removed.
    pub(crate) fn remove(&mut self, ssrc: u32) -> Option<Source> {
        let source = self.remote.remove(&ssrc)?;
        self.account(Some(Flags::of(&source)), None);
        self.dissociate_cname(ssrc);
        Some(source)
    }

    fn dissociate_cname(&mut self, ssrc: u32) {
        self.cnames.retain(|_, ssrcs| {
            ssrcs.retain(|s| *s != ssrc);
            !ssrcs.is_empty()
        });
    }

    /// Index `ssrc` under `cname`, moving it away from any previous cname
    pub(crate) fn associate_cname(&mut self, ssrc: u32, cname: &str) {
        if self.ssrcs_by_cname(cname).contains(&ssrc) {
            return;
        }
        self.dissociate_cname(ssrc);
        self.cnames.entry(cname.to_owned()).or_default().push(ssrc);
    }

    fn handle_ssrc_conflict(&mut self, addr: SocketAddr, now: Instant) -> bool {
        if let Some(time) = self.conflicting_addresses.get_mut(&addr) {
            trace!("ignoring looped packet from known collision address {addr:?}");
            *time = now;
            false
        } else {
            trace!("New collision address {addr:?}");
            self.conflicting_addresses.insert(addr, now);
            true
        }
    }

    /// Forget collision addresses that have not been seen for `max_age`
    pub(crate) fn expire_conflicting_addresses(&mut self, now: Instant, max_age: Duration) {
        self.conflicting_addresses
            .retain(|_addr, time| now.saturating_duration_since(*time) < max_age);
    }

    /// Find the source for an incoming RTP (`is_rtp`) or RTCP packet, creating it if needed.
    ///
    /// New RTP sources need `probation` packets to be validated, RTCP sources are validated
    /// immediately.
    pub(crate) fn obtain_source(
        &mut self,
        ssrc: u32,
        arrival: &ArrivalStats,
        is_rtp: bool,
        probation: u32,
    ) -> Obtained {
        if ssrc == self.local.ssrc() {
            let Some(addr) = arrival.address else {
                return Obtained::Looped;
            };
            return if self.handle_ssrc_conflict(addr, arrival.time) {
                Obtained::Collision { local: true }
            } else {
                Obtained::Looped
            };
        }

        if let Some(source) = self.remote.get_mut(&ssrc) {
            if let Some(addr) = arrival.address {
                let stored = if is_rtp {
                    source.rtp_from()
                } else {
                    source.rtcp_from()
                };
                match stored {
                    // favour the source we already know about
                    Some(stored) if stored != addr => {
                        debug!("ssrc {ssrc} already in use from {stored}, got a packet from {addr}");
                        return Obtained::Collision { local: false };
                    }
                    Some(_) => (),
                    None if is_rtp => source.set_rtp_from(Some(addr)),
                    None => source.set_rtcp_from(Some(addr)),
                }
            }
            source.set_last_activity(arrival.time);
            if is_rtp {
                source.set_last_rtp_activity(arrival.time);
            }
            return Obtained::Found;
        }

        let mut source = if is_rtp {
            Source::new(ssrc, probation, arrival.time)
        } else {
            let mut source = Source::new(ssrc, 0, arrival.time);
            source.set_validated();
            source
        };
        if is_rtp {
            source.set_rtp_from(arrival.address);
        } else {
            source.set_rtcp_from(arrival.address);
        }
        debug!(
            "new {} source {ssrc} from {:?}",
            if is_rtp { "RTP" } else { "RTCP" },
            arrival.address
        );
        self.add_source(source);
        Obtained::Created
    }

    /// Create a local source with an ssrc that is not used in this session yet
    pub(crate) fn create_unique_source<R: Rng>(
        &self,
        rng: &mut R,
        now: Instant,
    ) -> Result<Source, SessionError> {
        for _ in 0..MAX_SSRC_ATTEMPTS {
            let ssrc = rng.gen::<u32>();
            if self.lookup_by_ssrc(ssrc).is_none() {
                return Ok(Source::new_local(ssrc, now));
            }
        }
        Err(SessionError::SsrcExhausted {
            attempts: MAX_SSRC_ATTEMPTS,
        })
    }

    /// Replace the local source, returning the previous one
    pub(crate) fn replace_local(&mut self, local: Source) -> Source {
        self.account(None, Some(Flags::of(&local)));
        let old = std::mem::replace(&mut self.local, local);
        self.account(Some(Flags::of(&old)), None);
        self.dissociate_cname(old.ssrc());
        old
    }

    #[cfg(test)]
    pub(crate) fn counts_consistent(&self) -> bool {
        self.active_sources == self.iter().filter(|s| s.is_active()).count()
            && self.sender_sources == self.iter().filter(|s| s.is_sender()).count()
    }
}
