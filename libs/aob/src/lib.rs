// This file is part of OpenAffix.
//
// OpenAffix is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// OpenAffix is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with OpenAffix.  If not, see <http://www.gnu.org/licenses/>.

//! Array-of-bytes signatures: hex pairs with `??` wildcards, matched over a
//! remote address space in page-sized reads.
use log::trace;
use remote::{RemoteMemory, PAGE_SIZE};
use std::{fmt, ops::Range, str::FromStr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,
    #[error("odd pattern length; tokens are hex pairs or ??")]
    OddLength,
    #[error("bad hex token {0:?}")]
    BadToken(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cell {
    Byte(u8),
    Any,
}

impl Cell {
    fn matches(&self, b: u8) -> bool {
        match self {
            Cell::Byte(v) => *v == b,
            Cell::Any => true,
        }
    }
}

/// A parsed signature. Non-empty; each cell is a literal byte or a wildcard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    cells: Vec<Cell>,
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<Vec<char>>();
        if stripped.is_empty() {
            return Err(PatternError::Empty);
        }
        if stripped.len() % 2 != 0 {
            return Err(PatternError::OddLength);
        }
        let mut cells = Vec::with_capacity(stripped.len() / 2);
        for tok in stripped.chunks(2) {
            let (hi, lo) = (tok[0], tok[1]);
            if hi == '?' && lo == '?' {
                cells.push(Cell::Any);
                continue;
            }
            match (hi.to_digit(16), lo.to_digit(16)) {
                (Some(h), Some(l)) => cells.push(Cell::Byte((h * 16 + l) as u8)),
                _ => return Err(PatternError::BadToken([hi, lo].iter().collect())),
            }
        }
        Ok(Pattern { cells })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, cell) in self.cells.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match cell {
                Cell::Byte(b) => write!(f, "{:02X}", b)?,
                Cell::Any => write!(f, "??")?,
            }
        }
        Ok(())
    }
}

impl Pattern {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Does the pattern match at the start of `window`?
    pub fn matches_at(&self, window: &[u8]) -> bool {
        window.len() >= self.cells.len()
            && self
                .cells
                .iter()
                .zip(window.iter())
                .all(|(c, &b)| c.matches(b))
    }

    /// First match within `hay`; lowest offset wins.
    pub fn find(&self, hay: &[u8]) -> Option<usize> {
        if self.cells.is_empty() || hay.len() < self.cells.len() {
            return None;
        }
        (0..=hay.len() - self.cells.len()).find(|&off| self.matches_at(&hay[off..]))
    }
}

/// Scan `[region.start, region.end)` of the target for `pattern`, reading in
/// [PAGE_SIZE] chunks. Unreadable pages are skipped, not fatal; successive
/// reads overlap by the pattern length so boundary-straddling matches are
/// seen. Returns the absolute address of the first match.
pub fn scan(process: &dyn RemoteMemory, pattern: &Pattern, region: Range<u64>) -> Option<u64> {
    let plen = pattern.len();
    if plen == 0 || plen >= PAGE_SIZE {
        return None;
    }
    let step = (PAGE_SIZE - plen) as u64;
    let mut buf = vec![0u8; PAGE_SIZE];

    let mut addr = region.start;
    while addr < region.end {
        let want = PAGE_SIZE.min((region.end - addr) as usize);
        match process.read_into(addr, &mut buf[..want]) {
            Ok(got) => {
                if let Some(off) = pattern.find(&buf[..got]) {
                    return Some(addr + off as u64);
                }
                addr += step;
            }
            Err(_) => {
                trace!("unreadable page at {:#x}, skipping", addr);
                addr = (addr / PAGE_SIZE as u64 + 1) * PAGE_SIZE as u64;
            }
        }
    }
    None
}

/// Scan the target's primary module.
pub fn scan_module(process: &dyn RemoteMemory, pattern: &Pattern) -> Option<u64> {
    let module = process.main_module().ok()?;
    scan(process, pattern, module.range())
}

/// Convenience entry point in the shape of the classic AOB scanner: parse
/// failure and no-match both come back as None. `region` of None means the
/// primary module.
pub fn find(process: &dyn RemoteMemory, pattern: &str, region: Option<Range<u64>>) -> Option<u64> {
    let pattern = pattern.parse::<Pattern>().ok()?;
    match region {
        Some(r) => scan(process, &pattern, r),
        None => scan_module(process, &pattern),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote::{FakeProcess, Protection};

    #[test]
    fn parse_then_render_round_trips() {
        for text in ["48 8B D5 49 8B CA", "?? ?? ?? ??", "0F 85 ?? ?? ?? ?? 48"] {
            let p = text.parse::<Pattern>().unwrap();
            assert_eq!(format!("{}", p), text);
            assert_eq!(format!("{}", p).parse::<Pattern>().unwrap(), p);
        }
    }

    #[test]
    fn parse_is_case_insensitive_and_whitespace_tolerant() {
        let a = "de AD be ef".parse::<Pattern>().unwrap();
        let b = "  DE AD BE EF ".parse::<Pattern>().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(matches!("".parse::<Pattern>(), Err(PatternError::Empty)));
        assert!(matches!(
            "   ".parse::<Pattern>(),
            Err(PatternError::Empty)
        ));
        assert!(matches!(
            "48 8".parse::<Pattern>(),
            Err(PatternError::OddLength)
        ));
        assert!(matches!(
            "48 GG".parse::<Pattern>(),
            Err(PatternError::BadToken(_))
        ));
        // A lone ? inside a token is not a wildcard.
        assert!("4? 00".parse::<Pattern>().is_err());
    }

    #[test]
    fn wildcards_match_any_window() {
        let p = "?? ?? ?? ??".parse::<Pattern>().unwrap();
        assert_eq!(p.find(&[1, 2, 3, 4, 5]), Some(0));
        assert_eq!(p.find(&[0xFF; 4]), Some(0));
        assert_eq!(p.find(&[1, 2, 3]), None);
    }

    #[test]
    fn literals_match_exactly() {
        let p = "DE AD BE EF".parse::<Pattern>().unwrap();
        assert_eq!(p.find(&[0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x01]), Some(1));
        assert_eq!(p.find(&[0xDE, 0xAD, 0xBE, 0x00]), None);
    }

    #[test]
    fn first_match_wins_with_wildcard_in_the_middle() {
        // 90 90 ?? 90 against ...,89,90,90,AB,90,EF,...
        let p = "90 90 ?? 90".parse::<Pattern>().unwrap();
        let hay = [0x11, 0x89, 0x90, 0x90, 0xAB, 0x90, 0xEF, 0x22];
        assert_eq!(p.find(&hay), Some(2));
    }

    #[test]
    fn scan_finds_match_in_module() {
        let p = FakeProcess::new();
        let mut image = vec![0u8; 0x3000];
        image[0x1234..0x1239].copy_from_slice(&[0x75, 0x43, 0x0F, 0xB7, 0xCF]);
        p.map_module(0x14000_0000, image);
        let pat = "75 43 0F B7 CF".parse::<Pattern>().unwrap();
        assert_eq!(scan_module(&p, &pat), Some(0x14000_1234));
    }

    #[test]
    fn scan_finds_match_straddling_a_page_boundary() {
        let p = FakeProcess::new();
        let mut image = vec![0u8; 0x2000];
        // Start 3 bytes before the page boundary; 5 bytes long.
        image[0xFFD..0x1002].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x99]);
        p.map_module(0x4000_0000, image);
        let pat = "DE AD BE EF 99".parse::<Pattern>().unwrap();
        assert_eq!(scan_module(&p, &pat), Some(0x4000_0FFD));
    }

    #[test]
    fn scan_skips_unreadable_pages() {
        let p = FakeProcess::new();
        // Three pages: readable, unreadable, readable-with-match. The
        // middle one is mapped without READ so reads of it fail.
        p.map(0x1_0000, vec![0u8; 0x1000], Protection::RX);
        p.map(0x1_1000, vec![0u8; 0x1000], Protection::empty());
        let mut tail = vec![0u8; 0x1000];
        tail[0x10..0x14].copy_from_slice(&[0xCA, 0xFE, 0xBA, 0xBE]);
        p.map(0x1_2000, tail, Protection::RX);
        let pat = "CA FE BA BE".parse::<Pattern>().unwrap();
        assert_eq!(scan(&p, &pat, 0x1_0000..0x1_3000), Some(0x1_2010));
    }

    #[test]
    fn scan_respects_region_end() {
        let p = FakeProcess::new();
        let mut image = vec![0u8; 0x1000];
        image[0x800..0x804].copy_from_slice(&[0xCA, 0xFE, 0xBA, 0xBE]);
        p.map_module(0x1_0000, image);
        let pat = "CA FE BA BE".parse::<Pattern>().unwrap();
        assert_eq!(scan(&p, &pat, 0x1_0000..0x1_0800), None);
        assert_eq!(scan(&p, &pat, 0x1_0000..0x1_0804), Some(0x1_0800));
    }

    #[test]
    fn find_tolerates_parse_failure() {
        let p = FakeProcess::new();
        p.map_module(0x1_0000, vec![0u8; 0x1000]);
        assert_eq!(find(&p, "not a pattern", None), None);
    }
}
