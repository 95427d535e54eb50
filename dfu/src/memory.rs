use std::sync::LazyLock;

use nonempty::NonEmpty;
use regex::{Captures, Regex};

use crate::{DEFAULT_ERASE_SIZE, DfuError};

// "@Internal Flash  /0x08000000/04*016Kg,01*064Kg/0x08020000/03*128Ka"
static REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@\s*([^/]*?)\s*(/.*)$").unwrap());
static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"/\s*0x([\da-fA-F]{1,8})\s*/",
        r"((?:\s*\d+\s*\*\s*\d+\s?[ BKM]\s*[a-g]\s*,?\s*)+)",
    ))
    .unwrap()
});
static SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*(\d+)\s*\*\s*(\d+)\s?([ BKM])\s*([a-g])\s*,?\s*").unwrap()
});

/// Matches of `re` in `text`, `None` unless they cover all of it.
fn captures_all<'t>(
    re: &Regex,
    text: &'t str,
) -> Option<Vec<Captures<'t>>> {
    let mut end = 0;
    let mut all = Vec::new();
    for caps in re.captures_iter(text) {
        let m = caps.get(0)?;
        if m.start() != end {
            return None;
        }
        end = m.end();
        all.push(caps);
    }
    (end == text.len()).then_some(all)
}

/// DfuSe memory region announced in an alternate setting name
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DfuMemory {
    pub name: String,
    pub segments: NonEmpty<DfuMemSegment>,
}

/// Contiguous run of equally sized, equally protected sectors
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DfuMemSegment {
    start_addr: u32,
    end_addr: u32,
    sector_size: u32,
    readable: bool,
    erasable: bool,
    writable: bool,
}

impl DfuMemory {
    /// Parse a DfuSe interface name.
    ///
    /// Each sector group is `<count>*<size><unit><type>`, the unit being
    /// `B`/` `, `K` or `M`, and the type letter `a`..`g` encoding the
    /// bitmask `letter - 'a' + 1` (1: readable, 2: erasable, 4: writable).
    pub fn parse(desc: &str) -> Result<Self, DfuError> {
        let invalid = |reason: &str| {
            DfuError::InvalidMemoryLayout(format!("{reason}: \"{desc}\""))
        };

        let captures = REGION_RE
            .captures(desc.trim())
            .ok_or_else(|| invalid("not a DfuSe memory descriptor"))?;
        let name = String::from(&captures[1]);

        let blocks = captures_all(&BLOCK_RE, &captures[2])
            .ok_or_else(|| invalid("unreadable address block"))?;
        let mut layout = Vec::new();
        for block in blocks {
            let mut current_addr = u32::from_str_radix(&block[1], 16)
                .map_err(|_| invalid("bad start address"))?;

            let groups = captures_all(&SEGMENT_RE, &block[2])
                .ok_or_else(|| invalid("unreadable sector group"))?;
            for seg_match in groups {
                let count: u32 = seg_match[1]
                    .parse()
                    .map_err(|_| invalid("bad sector count"))?;
                let size: u32 = seg_match[2]
                    .parse()
                    .map_err(|_| invalid("bad sector size"))?;
                let multiplier = match &seg_match[3] {
                    "K" => 1024,
                    "M" => 1024 * 1024,
                    _ => 1,
                };
                let sector_size = size
                    .checked_mul(multiplier)
                    .ok_or_else(|| invalid("sector size overflow"))?;
                let mem_type = seg_match[4].as_bytes()[0] - b'a' + 1;

                let start_addr = current_addr;
                current_addr = count
                    .checked_mul(sector_size)
                    .and_then(|len| start_addr.checked_add(len))
                    .ok_or_else(|| invalid("segment exceeds address space"))?;

                layout.push(DfuMemSegment {
                    start_addr,
                    end_addr: current_addr,
                    sector_size,
                    readable: mem_type & 1 != 0,
                    erasable: mem_type & 2 != 0,
                    writable: mem_type & 4 != 0,
                });
            }
        }

        layout.sort_by_key(|s| s.start_addr);
        if layout.windows(2).any(|w| w[0].end_addr > w[1].start_addr) {
            return Err(invalid("overlapping segments"));
        }

        let segments = NonEmpty::from_vec(layout)
            .ok_or_else(|| invalid("no memory segments"))?;
        Ok(DfuMemory { name, segments })
    }

    pub fn size(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    pub fn first_writable_segment(&self) -> Option<&DfuMemSegment> {
        self.segments.iter().find(|s| s.writable())
    }

    pub fn segment(&self, addr: u32) -> Option<&DfuMemSegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    /// Default download address: start of the first writable segment.
    ///
    /// The first `reserved` bytes of the external flash at `external_base`
    /// hold the bootloader and are skipped.
    pub fn default_start_address(
        &self,
        external_base: u32,
        reserved: u32,
    ) -> Option<u32> {
        let start = self.first_writable_segment()?.start_addr();
        Some(if start == external_base {
            start.wrapping_add(reserved)
        } else {
            start
        })
    }

    /// Make sure `[start, start + length)` lies in writable memory.
    pub fn check_writable(
        &self,
        start: u32,
        length: u32,
    ) -> Result<(), DfuError> {
        let end = start.checked_add(length).ok_or(DfuError::OutOfMemoryRange {
            start,
            end: u32::MAX,
        })?;
        let out_of_range = DfuError::OutOfMemoryRange { start, end };
        let mut addr = start;
        while addr < end {
            match self.segment(addr) {
                Some(segment) if segment.writable() => addr = segment.end_addr,
                _ => return Err(out_of_range),
            }
        }
        Ok(())
    }

    /// Start addresses of the sectors to erase before writing
    /// `[start, start + length)`. Segments that cannot be erased are skipped.
    pub fn erase_sectors(
        &self,
        start: u32,
        length: u32,
    ) -> Result<Vec<u32>, DfuError> {
        let mut sectors = Vec::new();
        if length == 0 {
            return Ok(sectors);
        }
        let last = start
            .checked_add(length - 1)
            .ok_or(DfuError::OutOfMemoryRange {
                start,
                end: u32::MAX,
            })?;
        let out_of_range = || DfuError::OutOfMemoryRange {
            start,
            end: last.wrapping_add(1),
        };

        let mut addr = self
            .segment(start)
            .ok_or_else(out_of_range)?
            .sector_start(start);
        let end =
            self.segment(last).ok_or_else(out_of_range)?.sector_end(last);
        while addr < end {
            let segment = self.segment(addr).ok_or_else(out_of_range)?;
            if !segment.erasable() {
                addr = segment.end_addr;
                continue;
            }
            let sector = segment.sector_start(addr);
            sectors.push(sector);
            addr = sector.saturating_add(segment.erase_size());
        }
        Ok(sectors)
    }
}

impl DfuMemSegment {
    pub fn start_addr(&self) -> u32 {
        self.start_addr
    }
    /// First address past the segment
    pub fn end_addr(&self) -> u32 {
        self.end_addr
    }
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }
    pub fn len(&self) -> u32 {
        self.end_addr - self.start_addr
    }
    pub fn is_empty(&self) -> bool {
        self.start_addr == self.end_addr
    }
    pub fn sectors(&self) -> u32 {
        self.len() / self.erase_size()
    }
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start_addr && addr < self.end_addr
    }
    pub fn readable(&self) -> bool {
        self.readable
    }
    pub fn erasable(&self) -> bool {
        self.erasable
    }
    pub fn writable(&self) -> bool {
        self.writable
    }

    fn erase_size(&self) -> u32 {
        if self.sector_size > 0 {
            self.sector_size
        } else {
            DEFAULT_ERASE_SIZE
        }
    }

    fn sector_start(&self, addr: u32) -> u32 {
        let size = self.erase_size();
        self.start_addr + (addr - self.start_addr) / size * size
    }

    fn sector_end(&self, addr: u32) -> u32 {
        self.sector_start(addr).saturating_add(self.erase_size())
    }
}
