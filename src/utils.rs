// SPDX-License-Identifier: MPL-2.0

/// Computes the seqnum distance
///
/// This makes sense if both seqnums are in the same cycle.
pub fn seqnum_distance(seqnum1: u16, seqnum2: u16) -> i16 {
    // See http://en.wikipedia.org/wiki/Serial_number_arithmetic

    let seqnum1 = i16::from_ne_bytes(seqnum1.to_ne_bytes());
    let seqnum2 = i16::from_ne_bytes(seqnum2.to_ne_bytes());

    seqnum1.wrapping_sub(seqnum2)
}

/// Converts a raw two's complement value of len `bit_len` into an i32.
///
/// # Panic
///
/// Panics if `bit_len` > 32.
pub fn raw_2_comp_to_i32(val: u32, bit_len: u8) -> i32 {
    assert!(bit_len <= 32);

    if val < 1u32 << (bit_len - 1) as u32 {
        // val is positive
        val as i32
    } else {
        ((0x1_0000_0000 - (1u64 << bit_len)) as u32 + val) as i32
    }
}

/// Clamps `val` to the signed 24-bit range and encodes it as a raw two's complement value, as
/// used for the cumulative number of packets lost in report blocks.
pub fn i64_to_raw_2_comp_24(val: i64) -> u32 {
    (val.clamp(-0x80_0000, 0x7f_ffff) as i32 as u32) & 0xff_ffff
}

/// Extends 16-bit RTP sequence numbers into a monotonic 64-bit space.
///
/// The first sequence number is placed at `0x10000 + seqnum` so that packets reordered across
/// the very first wraparound can still be represented.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtendedSeqnum {
    highest: Option<u64>,
}

impl ExtendedSeqnum {
    /// Extends `seqnum` relative to the highest sequence number seen so far without storing it.
    pub fn extend(&self, seqnum: u16) -> u64 {
        match self.highest {
            None => 0x10000 + seqnum as u64,
            Some(highest) => {
                let diff = seqnum_distance(seqnum, (highest & 0xffff) as u16) as i64;
                (highest as i64 + diff).max(0) as u64
            }
        }
    }

    /// Extends `seqnum` relative to the highest sequence number seen so far and returns it.
    pub fn next(&mut self, seqnum: u16) -> u64 {
        let ext = self.extend(seqnum);
        if self.highest.is_none_or(|highest| ext > highest) {
            self.highest = Some(ext);
        }
        ext
    }

    /// The highest extended sequence number seen so far
    pub fn current(&self) -> Option<u64> {
        self.highest
    }

    pub fn reset(&mut self) {
        self.highest = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance() {
        assert_eq!(seqnum_distance(1, 0), 1);
        assert_eq!(seqnum_distance(0, 1), -1);
        assert_eq!(seqnum_distance(0, u16::MAX), 1);
        assert_eq!(seqnum_distance(u16::MAX, 0), -1);
    }

    #[test]
    fn two_comp_24() {
        assert_eq!(raw_2_comp_to_i32(0xff_ffff, 24), -1);
        assert_eq!(raw_2_comp_to_i32(0x7f_ffff, 24), 0x7f_ffff);
        assert_eq!(i64_to_raw_2_comp_24(-1), 0xff_ffff);
        assert_eq!(i64_to_raw_2_comp_24(5), 5);
        // clamped
        assert_eq!(i64_to_raw_2_comp_24(0x1000_0000), 0x7f_ffff);
        assert_eq!(i64_to_raw_2_comp_24(-0x1000_0000), 0x80_0000);
        assert_eq!(raw_2_comp_to_i32(i64_to_raw_2_comp_24(-1234), 24), -1234);
    }

    #[test]
    fn extended_seqnum_wraparound() {
        let mut ext = ExtendedSeqnum::default();
        assert_eq!(ext.current(), None);
        assert_eq!(ext.next(u16::MAX - 1), 0x10000 + 0xfffe);
        assert_eq!(ext.next(u16::MAX), 0x1ffff);
        assert_eq!(ext.next(0), 0x20000);
        assert_eq!(ext.next(1), 0x20001);
        assert_eq!(ext.current(), Some(0x20001));
    }

    #[test]
    fn extended_seqnum_reordered() {
        let mut ext = ExtendedSeqnum::default();
        ext.next(10);
        ext.next(12);
        // a late packet does not lower the highest sequence number
        assert_eq!(ext.next(11), 0x10000 + 11);
        assert_eq!(ext.current(), Some(0x10000 + 12));
    }
}
