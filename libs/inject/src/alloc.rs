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

//! Finding an RWX code cave close enough to the injection site that a 5-byte
//! near jump can reach it.
use crate::{emit::JMP_REL32_LEN, InjectError};
use anyhow::Result;
use log::debug;
use remote::{Protection, RemoteMemory, ALLOC_GRANULARITY};

/// How far on either side of the site we are willing to place the cave.
/// Narrower than the full ±2 GiB so the rel32 check afterwards is formality.
pub const NEAR_RANGE: u64 = 0x7000_0000;

/// 64 KiB-aligned candidate bases around `site`, low to high.
pub fn candidate_bases(site: u64) -> impl Iterator<Item = u64> {
    let start = site
        .saturating_sub(NEAR_RANGE)
        .max(ALLOC_GRANULARITY)
        .wrapping_add(ALLOC_GRANULARITY - 1)
        & !(ALLOC_GRANULARITY - 1);
    let end = site.saturating_add(NEAR_RANGE);
    (start..end).step_by(ALLOC_GRANULARITY as usize)
}

/// Reserve and commit `size` bytes of RWX within near-jump range of `site`:
/// walk free regions at allocation granularity and take the first placed
/// allocation that succeeds. Falls back to letting the OS choose (the caller
/// must still verify reachability before emitting a rel32).
pub fn allocate_near(process: &dyn RemoteMemory, site: u64, size: usize) -> Result<u64> {
    let placed = candidate_bases(site)
        .filter(|&base| match process.query(base) {
            Ok(region) => region.free && region.end() >= base + size as u64,
            Err(_) => false,
        })
        .find_map(|base| process.alloc(Some(base), size, Protection::RWX).ok());
    if let Some(base) = placed {
        debug!("code cave at {:#x} for site {:#x}", base, site);
        return Ok(base);
    }
    // Anywhere at all beats nothing; rejected later if out of reach.
    match process.alloc(None, size, Protection::RWX) {
        Ok(base) => {
            debug!("fallback code cave at {:#x} for site {:#x}", base, site);
            Ok(base)
        }
        Err(_) => Err(InjectError::AllocateNearFailed { site }.into()),
    }
}

/// Is a 5-byte near jump from `site` able to reach `base`?
pub fn reachable(site: u64, base: u64) -> bool {
    let disp = (base as i128) - (site as i128 + JMP_REL32_LEN as i128);
    i32::try_from(disp).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote::FakeProcess;

    #[test]
    fn candidates_are_aligned_and_bounded_below() {
        let mut it = candidate_bases(0x1000_0000);
        assert_eq!(it.next(), Some(ALLOC_GRANULARITY));
        for base in candidate_bases(0x9000_0000).take(64) {
            assert_eq!(base % ALLOC_GRANULARITY, 0);
            assert!(base >= 0x9000_0000 - NEAR_RANGE);
        }
    }

    #[test]
    fn allocates_within_reach() -> Result<()> {
        let p = FakeProcess::new();
        p.map_module(0x1_4000_0000, vec![0u8; 0x1000]);
        let site = 0x1_4000_0100u64;
        let base = allocate_near(&p, site, 0x1000)?;
        assert!(reachable(site, base));
        assert!(base.abs_diff(site + 5) <= i32::MAX as u64);
        Ok(())
    }

    #[test]
    fn skips_occupied_candidates() -> Result<()> {
        let p = FakeProcess::new();
        // Occupy the first few granules above the floor.
        p.map(0x1_0000, vec![0u8; 0x3_0000], Protection::RX);
        let base = allocate_near(&p, 0x1000_0000, 0x1000)?;
        assert!(base >= 0x4_0000);
        Ok(())
    }

    #[test]
    fn falls_back_to_anywhere_when_placement_fails() -> Result<()> {
        let p = FakeProcess::new();
        p.deny_placed_alloc();
        p.set_anywhere_alloc_base(0x2_0000_0000);
        let site = 0x1000_0000u64;
        let base = allocate_near(&p, site, 0x1000)?;
        assert_eq!(base, 0x2_0000_0000);
        // The fallback may land out of reach; that is the caller's check.
        assert!(!reachable(site, base));
        Ok(())
    }
}
