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

//! NOP patches over conditional branches. Each site keeps the bytes it
//! displaced so it can be restored exactly.
use crate::emit::NOP;
use anyhow::{bail, ensure, Context, Result};
use log::debug;
use remote::{Protection, RemoteMemory};

/// One located patch site: the saved original bytes and the bytes to write
/// in their place.
pub struct PatchSite {
    address: u64,
    original: Vec<u8>,
    patch: Vec<u8>,
}

impl PatchSite {
    /// Snapshot `len` bytes at `address` and build a patch that NOPs the
    /// first `nop_len` of them, re-writing the rest unchanged so every site
    /// goes through one uniform full-length write.
    pub fn nop_prefix(
        process: &dyn RemoteMemory,
        address: u64,
        len: usize,
        nop_len: usize,
    ) -> Result<Self> {
        ensure!(nop_len <= len, "nop length exceeds patch length");
        let mut original = vec![0u8; len];
        process
            .read_exact(address, &mut original)
            .context("reading branch bytes")?;
        let mut patch = original.clone();
        patch[..nop_len].fill(NOP);
        Ok(Self {
            address,
            original,
            patch,
        })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn original(&self) -> &[u8] {
        &self.original
    }

    fn write_guarded(&self, process: &dyn RemoteMemory, data: &[u8]) -> Result<()> {
        let old = process
            .protect(self.address, data.len(), Protection::RWX)
            .context("unprotecting branch site")?;
        let wrote = process.write(self.address, data);
        let _ = process.protect(self.address, data.len(), old);
        wrote.context("writing branch site")
    }

    fn apply(&self, process: &dyn RemoteMemory) -> Result<()> {
        debug!("patching branch at {:#x} ({} bytes)", self.address, self.patch.len());
        self.write_guarded(process, &self.patch)
    }

    fn restore(&self, process: &dyn RemoteMemory) -> Result<()> {
        debug!("restoring branch at {:#x}", self.address);
        self.write_guarded(process, &self.original)
    }
}

/// A set of independently-located patch sites enabled and disabled as one
/// feature. At least one site must have been located.
pub struct BranchPatcher {
    sites: Vec<PatchSite>,
    enabled: bool,
}

impl BranchPatcher {
    pub fn new(sites: Vec<PatchSite>) -> Result<Self> {
        ensure!(!sites.is_empty(), "no patch sites located");
        Ok(Self {
            sites,
            enabled: false,
        })
    }

    /// Apply every site. On any failure, everything is rolled back and the
    /// whole enable fails. Idempotent when already enabled.
    pub fn enable(&mut self, process: &dyn RemoteMemory) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        for (i, site) in self.sites.iter().enumerate() {
            if let Err(e) = site.apply(process) {
                for done in &self.sites[..i] {
                    let _ = done.restore(process);
                }
                return Err(e);
            }
        }
        self.enabled = true;
        Ok(())
    }

    /// Restore every site, attempting all of them even after a failure.
    /// Idempotent when not enabled.
    pub fn disable(&mut self, process: &dyn RemoteMemory) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut failed = 0usize;
        for site in &self.sites {
            if site.restore(process).is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            bail!("{} of {} branch restores failed", failed, self.sites.len());
        }
        self.enabled = false;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn sites(&self) -> &[PatchSite] {
        &self.sites
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote::FakeProcess;

    const GATE: [u8; 5] = [0x75, 0x43, 0x0F, 0xB7, 0xCF];

    fn target() -> FakeProcess {
        let p = FakeProcess::new();
        let mut image = vec![0u8; 0x2000];
        image[0x1234..0x1239].copy_from_slice(&GATE);
        image[0x1800..0x1806].copy_from_slice(&[0x0F, 0x85, 0x11, 0x22, 0x33, 0x44]);
        p.map_module(0x1_0000, image);
        p
    }

    #[test]
    fn nop_prefix_preserves_the_tail() -> Result<()> {
        let p = target();
        let site = PatchSite::nop_prefix(&p, 0x1_1234, 5, 2)?;
        site.apply(&p)?;
        assert_eq!(p.snapshot(0x1_1234, 5), vec![0x90, 0x90, 0x0F, 0xB7, 0xCF]);
        site.restore(&p)?;
        assert_eq!(p.snapshot(0x1_1234, 5), GATE.to_vec());
        Ok(())
    }

    #[test]
    fn full_nop_patch() -> Result<()> {
        let p = target();
        let site = PatchSite::nop_prefix(&p, 0x1_1800, 6, 6)?;
        site.apply(&p)?;
        assert_eq!(p.snapshot(0x1_1800, 6), vec![0x90; 6]);
        Ok(())
    }

    #[test]
    fn enable_patches_all_sites_and_disable_restores() -> Result<()> {
        let p = target();
        let mut patcher = BranchPatcher::new(vec![
            PatchSite::nop_prefix(&p, 0x1_1234, 5, 2)?,
            PatchSite::nop_prefix(&p, 0x1_1800, 6, 6)?,
        ])?;
        patcher.enable(&p)?;
        assert!(patcher.is_enabled());
        assert_eq!(p.snapshot(0x1_1234, 2), vec![0x90, 0x90]);
        assert_eq!(p.snapshot(0x1_1800, 6), vec![0x90; 6]);
        patcher.disable(&p)?;
        assert!(!patcher.is_enabled());
        assert_eq!(p.snapshot(0x1_1234, 5), GATE.to_vec());
        assert_eq!(
            p.snapshot(0x1_1800, 6),
            vec![0x0F, 0x85, 0x11, 0x22, 0x33, 0x44]
        );
        Ok(())
    }

    #[test]
    fn failed_enable_rolls_back_applied_sites() -> Result<()> {
        let p = target();
        let first = PatchSite::nop_prefix(&p, 0x1_1234, 5, 2)?;
        // A site in a region that disappears before enable.
        let doomed_base = p.alloc(Some(0x9_0000), 0x1000, Protection::RWX)?;
        p.poke(doomed_base, &[0x75, 0x10]);
        let second = PatchSite::nop_prefix(&p, doomed_base, 2, 2)?;
        p.free(doomed_base)?;

        let mut patcher = BranchPatcher::new(vec![first, second])?;
        assert!(patcher.enable(&p).is_err());
        assert!(!patcher.is_enabled());
        assert_eq!(p.snapshot(0x1_1234, 5), GATE.to_vec());
        Ok(())
    }

    #[test]
    fn requires_at_least_one_site() {
        assert!(BranchPatcher::new(Vec::new()).is_err());
    }

    #[test]
    fn enable_is_idempotent() -> Result<()> {
        let p = target();
        let mut patcher =
            BranchPatcher::new(vec![PatchSite::nop_prefix(&p, 0x1_1234, 5, 2)?])?;
        patcher.enable(&p)?;
        patcher.enable(&p)?;
        patcher.disable(&p)?;
        patcher.disable(&p)?;
        Ok(())
    }
}
