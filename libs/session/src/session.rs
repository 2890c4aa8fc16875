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
use crate::{
    arbiter::{CaptureArbiter, EquipmentKind, SystemTicks, TickSource},
    signatures::{
        ARMOR_CAPTURE, ARMOR_HOOK, SKILL_BYPASS_SITES, WEAPON_CAPTURE, WEAPON_HOOK,
    },
};
use anyhow::Result;
use aob::Pattern;
use inject::{BranchPatcher, CaptureHook, PatchSite};
use log::{debug, warn};
use remote::RemoteMemory;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not attached to any process")]
    NotAttached,
    #[error("already attached to a process")]
    AlreadyAttached,
    #[error("failed to open process {pid}")]
    OpenProcessFailed { pid: u32 },
    #[error("{0} pattern not found; game version may be incompatible")]
    PatternNotFound(&'static str),
    #[error("equipment base not captured yet")]
    NotCapturedYet,
    #[error("invalid affix slot {0}")]
    InvalidSlotIndex(usize),
}

/// An attached target process and everything installed into it. Owns the
/// two capture trampolines, the skill-gate patcher, and the arbiter; on
/// drop, everything is disabled and freed so the target is left pristine.
pub struct Session<P: RemoteMemory, T: TickSource = SystemTicks> {
    pub(crate) process: P,
    pub(crate) weapon: CaptureHook,
    pub(crate) armor: CaptureHook,
    pub(crate) bypass: Option<BranchPatcher>,
    pub(crate) arbiter: CaptureArbiter<T>,
}

impl<P: RemoteMemory> Session<P> {
    pub fn new(process: P) -> Self {
        Self::with_ticks(process, SystemTicks::default())
    }
}

impl<P: RemoteMemory, T: TickSource> Session<P, T> {
    pub fn with_ticks(process: P, ticks: T) -> Self {
        Self {
            process,
            weapon: CaptureHook::new(),
            armor: CaptureHook::new(),
            bypass: None,
            arbiter: CaptureArbiter::new(ticks),
        }
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    /// Find both capture sites and splice the trampolines in. The weapon
    /// hook is the minimum viable capture and any weapon failure is fatal;
    /// the armor pattern is missing from some game builds, so armor failure
    /// downgrades to a warning returned to the caller.
    pub fn enable_capture(&mut self) -> Result<Option<String>> {
        if self.weapon.is_enabled() && self.armor.is_enabled() {
            return Ok(None);
        }

        if !self.weapon.is_enabled() {
            let pattern: Pattern = WEAPON_CAPTURE.parse()?;
            let site = aob::scan_module(&self.process, &pattern)
                .ok_or(SessionError::PatternNotFound("weapon capture"))?;
            debug!("weapon capture site at {:#x}", site);
            if self.weapon.cave_addr().is_none() {
                self.weapon.initialize(&self.process, site, WEAPON_HOOK)?;
            }
            self.weapon.enable(&self.process)?;
        }

        let mut warning = None;
        if !self.armor.is_enabled() {
            if let Err(e) = self.enable_armor() {
                let message = format!("armor editing unavailable: {:#}", e);
                warn!("{}", message);
                warning = Some(message);
            }
        }
        Ok(warning)
    }

    fn enable_armor(&mut self) -> Result<()> {
        let pattern: Pattern = ARMOR_CAPTURE.parse()?;
        let site = aob::scan_module(&self.process, &pattern)
            .ok_or(SessionError::PatternNotFound("armor capture"))?;
        debug!("armor capture site at {:#x}", site);
        if self.armor.cave_addr().is_none() {
            self.armor.initialize(&self.process, site, ARMOR_HOOK)?;
        }
        self.armor.enable(&self.process)
    }

    /// Unsplice both trampolines, leaving their caves in place in case the
    /// target is executing inside one. The hooks are independent: both are
    /// attempted even when the first restore fails, and the first failure
    /// is reported afterward.
    pub fn disable_capture(&mut self) -> Result<()> {
        let weapon = self.weapon.disable(&self.process);
        let armor = self.armor.disable(&self.process);
        weapon.and(armor)
    }

    pub fn is_capture_enabled(&self) -> bool {
        // Weapon capture alone counts; armor is best-effort.
        self.weapon.is_enabled()
    }

    pub fn is_weapon_capture_enabled(&self) -> bool {
        self.weapon.is_enabled()
    }

    pub fn is_armor_capture_enabled(&self) -> bool {
        self.armor.is_enabled()
    }

    /// NOP out the skill-learning gates. Re-locates the sites on each fresh
    /// enable; one located site out of the known set is sufficient.
    pub fn enable_skill_bypass(&mut self) -> Result<()> {
        if self.bypass.as_ref().map_or(false, |b| b.is_enabled()) {
            return Ok(());
        }
        let mut sites = Vec::new();
        for site in &SKILL_BYPASS_SITES {
            let pattern: Pattern = site.pattern.parse()?;
            if let Some(address) = aob::scan_module(&self.process, &pattern) {
                debug!("skill gate at {:#x} ({} bytes)", address, site.patch_len);
                sites.push(PatchSite::nop_prefix(
                    &self.process,
                    address,
                    site.patch_len,
                    site.nop_len,
                )?);
            }
        }
        if sites.is_empty() {
            return Err(SessionError::PatternNotFound("skill gate").into());
        }
        let mut patcher = BranchPatcher::new(sites)?;
        patcher.enable(&self.process)?;
        self.bypass = Some(patcher);
        Ok(())
    }

    pub fn disable_skill_bypass(&mut self) -> Result<()> {
        match self.bypass.as_mut() {
            Some(b) => b.disable(&self.process),
            None => Ok(()),
        }
    }

    pub fn is_skill_bypass_enabled(&self) -> bool {
        self.bypass.as_ref().map_or(false, |b| b.is_enabled())
    }

    /// The equipment record the player is looking at right now, if either
    /// trampoline has published one.
    pub fn current_base(&mut self) -> Result<Option<u64>> {
        let weapon = self.weapon.read_slot(&self.process)?;
        let armor = self.armor.read_slot(&self.process)?;
        Ok(self.arbiter.select(weapon, armor))
    }

    pub fn current_kind(&mut self) -> Result<EquipmentKind> {
        let weapon = self.weapon.read_slot(&self.process)?;
        let armor = self.armor.read_slot(&self.process)?;
        Ok(self.arbiter.kind(weapon, armor))
    }

    /// Weapon-only fields are live unless the focused item is known to be
    /// armor.
    pub fn is_weapon_mode(&mut self) -> Result<bool> {
        Ok(matches!(
            self.current_kind()?,
            EquipmentKind::Weapon | EquipmentKind::Unknown
        ))
    }

    /// Latest raw weapon capture, zero if none.
    pub fn weapon_base(&self) -> Result<u64> {
        self.weapon.read_slot(&self.process)
    }

    /// Latest raw armor capture, zero if none.
    pub fn armor_base(&self) -> Result<u64> {
        self.armor.read_slot(&self.process)
    }

    /// Disable and free everything this session put into the target, in
    /// reverse order of installation.
    pub fn teardown(&mut self) -> Result<()> {
        let mut first_failure = None;
        if let Some(mut b) = self.bypass.take() {
            if let Err(e) = b.disable(&self.process) {
                first_failure.get_or_insert(e);
            }
        }
        if let Err(e) = self.armor.cleanup(&self.process) {
            first_failure.get_or_insert(e);
        }
        if let Err(e) = self.weapon.cleanup(&self.process) {
            first_failure.get_or_insert(e);
        }
        self.arbiter.reset();
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear down and release the process handle.
    pub fn detach(mut self) -> Result<()> {
        self.teardown()
    }
}

impl<P: RemoteMemory, T: TickSource> Drop for Session<P, T> {
    fn drop(&mut self) {
        // Leaving the target modified is a bug; errors here have no one
        // left to report to.
        let _ = self.teardown();
    }
}
