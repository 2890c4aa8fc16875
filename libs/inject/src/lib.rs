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

//! Jump-based instrumentation of a remote x86-64 process: a small typed
//! code emitter, a ±2 GiB code-cave allocator, register-capture trampolines,
//! and NOP patches over conditional branches.
mod alloc;
mod capture;
mod emit;
mod patch;

pub use alloc::{allocate_near, candidate_bases, reachable, NEAR_RANGE};
pub use capture::{CaptureHook, HookSpec, CAVE_SIZE, SLOT_OFFSET};
pub use emit::{jmp_rel32, CodeBlock, Register, JMP_REL32_LEN, NOP};
pub use patch::{BranchPatcher, PatchSite};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("no free code cave within near-jump range of {site:#x}")]
    AllocateNearFailed { site: u64 },
    #[error("code cave {cave:#x} is out of rel32 range of {site:#x}")]
    Unreachable { site: u64, cave: u64 },
}
