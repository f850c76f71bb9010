//! Log Sequence Numbers and WAL segment naming (spec §6 "File formats
//! consumed", §9 Open Question on cross-timeline comparison).

use std::fmt;

/// A 64-bit monotonic byte position into the WAL stream (glossary "LSN").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub fn segment_number(self, segment_size: u64) -> u64 {
        self.0 / segment_size
    }

    pub fn offset_in_segment(self, segment_size: u64) -> u64 {
        self.0 % segment_size
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// A parsed 24-hex-character WAL segment filename, `{timeline}{log}{seg}`
/// (spec §6). Comparison is `Ord` on `(timeline, log, seg)`, which the
/// spec's design notes call out as only meaningful within a single
/// timeline (resolving the "startwal" Open Question via typed
/// comparison instead of filename string comparison).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalSegmentName {
    pub timeline: u32,
    pub log: u32,
    pub seg: u32,
}

impl WalSegmentName {
    pub fn parse(name: &str) -> Option<WalSegmentName> {
        if name.len() != 24 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let timeline = u32::from_str_radix(&name[0..8], 16).ok()?;
        let log = u32::from_str_radix(&name[8..16], 16).ok()?;
        let seg = u32::from_str_radix(&name[16..24], 16).ok()?;
        Some(WalSegmentName { timeline, log, seg })
    }

    pub fn filename(&self) -> String {
        format!("{:08X}{:08X}{:08X}", self.timeline, self.log, self.seg)
    }

    /// The segment containing `lsn`, given `segments_per_log = 0x100000000 / segment_size`.
    pub fn containing(timeline: u32, lsn: Lsn, segment_size: u64) -> WalSegmentName {
        let segno = lsn.segment_number(segment_size);
        let segments_per_log = 0x1_0000_0000u64 / segment_size;
        WalSegmentName {
            timeline,
            log: (segno / segments_per_log) as u32,
            seg: (segno % segments_per_log) as u32,
        }
    }

    pub fn start_lsn(&self, segment_size: u64) -> Lsn {
        let segments_per_log = 0x1_0000_0000u64 / segment_size;
        let segno = self.log as u64 * segments_per_log + self.seg as u64;
        Lsn(segno * segment_size)
    }
}

impl fmt::Display for WalSegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.filename())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_reformats_segment_name() {
        let name = "0000000100000000000000A1";
        // 24 chars required; trim to 24
        let name = &name[0..24];
        let parsed = WalSegmentName::parse(name).unwrap();
        assert_eq!(parsed.filename(), name);
    }

    #[test]
    fn orders_by_timeline_then_log_then_seg() {
        let a = WalSegmentName { timeline: 1, log: 0, seg: 5 };
        let b = WalSegmentName { timeline: 1, log: 0, seg: 6 };
        let c = WalSegmentName { timeline: 1, log: 1, seg: 0 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn rejects_wrong_length_or_nonhex() {
        assert!(WalSegmentName::parse("too_short").is_none());
        assert!(WalSegmentName::parse(&"g".repeat(24)).is_none());
    }
}
