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

//! Signatures of the supported game build. Each capture pattern is anchored
//! so its first byte is the first displaced instruction byte.
use inject::{HookSpec, Register};

/// Equipment-view code path that holds the weapon record pointer in rbp.
/// Displaces `mov rdx, rbp; mov rcx, r10` (6 bytes).
pub const WEAPON_CAPTURE: &str =
    "48 8B D5 49 8B CA E8 ?? ?? ?? ?? 48 8B 86 ?? ?? ?? ?? 48 8D 8E ?? ?? ?? ??";

pub const WEAPON_HOOK: HookSpec = HookSpec {
    captured: Register::Rbp,
    displaced_len: 6,
};

/// Armor-view code path holding the record pointer in rbx. Displaces
/// `lea rcx, [r12+0x148]` (8 bytes). Absent in some game builds.
pub const ARMOR_CAPTURE: &str =
    "49 8D 8C 24 ?? ?? ?? ?? 48 8B D3 E8 ?? ?? ?? ?? 8A 45 6F 8A 4D 67";

pub const ARMOR_HOOK: HookSpec = HookSpec {
    captured: Register::Rbx,
    displaced_len: 8,
};

/// One skill-learning gate to neutralize.
pub struct BypassSite {
    pub pattern: &'static str,
    /// Bytes saved and re-written at the site.
    pub patch_len: usize,
    /// Leading bytes replaced with NOPs (the conditional branch itself).
    pub nop_len: usize,
}

/// The known skill-learning gates: a short `jne` ahead of a `movzx`, and a
/// near `jne` form elsewhere. Either alone is enough to unlock learning.
pub const SKILL_BYPASS_SITES: [BypassSite; 2] = [
    BypassSite {
        pattern: "75 43 0F B7 CF E8",
        patch_len: 5,
        nop_len: 2,
    },
    BypassSite {
        pattern: "0F 85 ?? ?? ?? ?? 48 8B 0D ?? ?? ?? ?? BA ?? ?? ?? ?? 41 C6 85 ?? ?? ?? ?? 01 48 8B 89",
        patch_len: 6,
        nop_len: 6,
    },
];
