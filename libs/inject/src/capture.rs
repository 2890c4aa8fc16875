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

//! Register-capture trampolines. The installed cave stores one register into
//! a slot the controller can poll, replays the displaced original
//! instructions, and jumps back past the splice.
use crate::{
    alloc::allocate_near,
    emit::{jmp_rel32, CodeBlock, Register, JMP_REL32_LEN, NOP},
};
use anyhow::{bail, ensure, Context, Result};
use log::debug;
use remote::{Protection, RemoteMemory};

/// Size of the trampoline allocation.
pub const CAVE_SIZE: usize = 0x1000;

/// Offset of the 8-byte capture slot inside the cave. Far enough past the
/// code that they never collide; allocation-aligned, so the slot itself is
/// 8-byte aligned and single-store atomic on x86-64.
pub const SLOT_OFFSET: u64 = 0x100;

/// What distinguishes one capture site from another: the register holding
/// the pointer at the moment of interception, and how many original bytes
/// the 5-byte jump displaces there.
#[derive(Clone, Copy, Debug)]
pub struct HookSpec {
    pub captured: Register,
    pub displaced_len: usize,
}

struct Hooked {
    site: u64,
    captured: Register,
    original: Vec<u8>,
    cave: u64,
    slot: u64,
}

enum State {
    Idle,
    Prepared(Hooked),
    Enabled(Hooked),
}

/// One installable capture trampoline. Lifecycle is
/// idle → prepared (initialize) → enabled (enable) → prepared (disable);
/// cleanup releases the cave and returns to idle.
pub struct CaptureHook {
    state: State,
}

impl Default for CaptureHook {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureHook {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    /// Snapshot the displaced bytes at `site`, allocate the cave nearby, and
    /// zero the capture slot. Fails if already initialized.
    pub fn initialize(
        &mut self,
        process: &dyn RemoteMemory,
        site: u64,
        spec: HookSpec,
    ) -> Result<()> {
        ensure!(
            matches!(self.state, State::Idle),
            "capture hook already initialized"
        );
        ensure!(
            spec.displaced_len >= JMP_REL32_LEN,
            "displaced length {} cannot hold a near jump",
            spec.displaced_len
        );

        let mut original = vec![0u8; spec.displaced_len];
        process
            .read_exact(site, &mut original)
            .context("reading displaced bytes")?;

        let cave = allocate_near(process, site, CAVE_SIZE)?;
        let slot = cave + SLOT_OFFSET;
        process.write_u64(slot, 0).context("zeroing capture slot")?;

        debug!(
            "capture hook prepared: site {:#x}, cave {:#x}, slot {:#x}",
            site, cave, slot
        );
        self.state = State::Prepared(Hooked {
            site,
            captured: spec.captured,
            original,
            cave,
            slot,
        });
        Ok(())
    }

    /// Write the trampoline into the cave and splice the near jump over the
    /// site. Idempotent when already enabled.
    pub fn enable(&mut self, process: &dyn RemoteMemory) -> Result<()> {
        let hooked = match std::mem::replace(&mut self.state, State::Idle) {
            State::Enabled(h) => {
                self.state = State::Enabled(h);
                return Ok(());
            }
            State::Idle => bail!("capture hook not initialized"),
            State::Prepared(h) => h,
        };

        match Self::install(process, &hooked) {
            Ok(()) => {
                self.state = State::Enabled(hooked);
                Ok(())
            }
            Err(e) => {
                self.state = State::Prepared(hooked);
                Err(e)
            }
        }
    }

    fn install(process: &dyn RemoteMemory, h: &Hooked) -> Result<()> {
        let mut code = CodeBlock::new();
        code.mov_rax_imm64(h.slot)
            .store_at_rax(h.captured)
            .raw(&h.original)
            .mov_rax_imm64(h.site + h.original.len() as u64)
            .jmp_rax();
        process
            .write(h.cave, &code.finish())
            .context("writing trampoline code")?;

        let jmp = jmp_rel32(h.site, h.cave)?;
        let mut splice = jmp.to_vec();
        splice.resize(h.original.len(), NOP);

        let old = process
            .protect(h.site, splice.len(), Protection::RWX)
            .context("unprotecting injection site")?;
        let wrote = process.write(h.site, &splice);
        // Best effort either way; the write result is what matters.
        let _ = process.protect(h.site, splice.len(), old);
        wrote.context("splicing near jump")
    }

    /// Put the displaced bytes back. Idempotent when not enabled.
    pub fn disable(&mut self, process: &dyn RemoteMemory) -> Result<()> {
        let hooked = match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => return Ok(()),
            State::Prepared(h) => {
                self.state = State::Prepared(h);
                return Ok(());
            }
            State::Enabled(h) => h,
        };

        let restore = (|| -> Result<()> {
            let old = process
                .protect(hooked.site, hooked.original.len(), Protection::RWX)
                .context("unprotecting injection site")?;
            let wrote = process.write(hooked.site, &hooked.original);
            let _ = process.protect(hooked.site, hooked.original.len(), old);
            wrote.context("restoring displaced bytes")
        })();

        match restore {
            Ok(()) => {
                // The cave stays allocated: the target may be mid-trampoline.
                self.state = State::Prepared(hooked);
                Ok(())
            }
            Err(e) => {
                self.state = State::Enabled(hooked);
                Err(e)
            }
        }
    }

    /// Disable if needed and release the cave.
    pub fn cleanup(&mut self, process: &dyn RemoteMemory) -> Result<()> {
        self.disable(process)?;
        if let State::Prepared(h) = std::mem::replace(&mut self.state, State::Idle) {
            process.free(h.cave).context("releasing code cave")?;
        }
        Ok(())
    }

    /// Latest pointer published by the target, zero if none yet. Reads 0
    /// when the hook is not enabled.
    pub fn read_slot(&self, process: &dyn RemoteMemory) -> Result<u64> {
        match &self.state {
            State::Enabled(h) => process.read_u64(h.slot),
            _ => Ok(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, State::Enabled(_))
    }

    pub fn slot_addr(&self) -> Option<u64> {
        match &self.state {
            State::Prepared(h) | State::Enabled(h) => Some(h.slot),
            State::Idle => None,
        }
    }

    pub fn cave_addr(&self) -> Option<u64> {
        match &self.state {
            State::Prepared(h) | State::Enabled(h) => Some(h.cave),
            State::Idle => None,
        }
    }
}
