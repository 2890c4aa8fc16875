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

//! Field offsets inside the captured equipment record. Opaque constants of
//! the supported game build, established by runtime diffing.

/// Basic equipment fields, relative to the captured base.
pub mod equipment {
    /// Item id (2 bytes).
    pub const ITEM_ID: u64 = 0x00;

    /// Transmog id (2 bytes).
    pub const TRANSMOG_ID: u64 = 0x02;

    /// Item level (2 bytes).
    pub const LEVEL: u64 = 0x06;

    /// Upgrade plus value (1 byte).
    pub const PLUS_VALUE: u64 = 0x0A;

    /// Underworld skill id (4 bytes, weapons only).
    pub const UNDERWORLD_SKILL_ID: u64 = 0x10;

    /// Familiarity (4 bytes, weapons only).
    pub const FAMILIARITY: u64 = 0x14;

    /// Underworld weapon flag: one bit in the byte at this offset.
    pub const UNDERWORLD_FLAG: u64 = 0x1A;
    pub const UNDERWORLD_FLAG_BIT: u8 = 4;

    /// Quality / rarity (4 bytes). Varies across item grades.
    pub const QUALITY: u64 = 0x30;
}

/// The affix array: fixed-stride slots after the basic fields.
pub mod affix {
    /// Offset of slot 0 from the captured base.
    pub const FIRST: u64 = 0x38;

    /// Distance between consecutive slots.
    pub const STRIDE: u64 = 0x18;

    /// Within a slot: affix id (4 bytes).
    pub const ID: u64 = 0x00;

    /// Within a slot: affix level (4 bytes).
    pub const LEVEL: u64 = 0x04;

    /// Within a slot: four single-byte prefix fields.
    pub const PREFIX: u64 = 0x08;
    pub const PREFIX_COUNT: usize = 4;

    /// Slots per item.
    pub const SLOT_COUNT: usize = 7;

    pub fn id_offset(slot: usize) -> u64 {
        FIRST + slot as u64 * STRIDE + ID
    }

    pub fn level_offset(slot: usize) -> u64 {
        FIRST + slot as u64 * STRIDE + LEVEL
    }

    pub fn prefix_offset(slot: usize, prefix: usize) -> u64 {
        FIRST + slot as u64 * STRIDE + PREFIX + prefix as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affix_offsets_step_by_stride() {
        assert_eq!(affix::id_offset(0), 0x38);
        assert_eq!(affix::level_offset(0), 0x3C);
        assert_eq!(affix::prefix_offset(0, 0), 0x40);
        assert_eq!(affix::prefix_offset(0, 3), 0x43);
        assert_eq!(affix::id_offset(1), 0x50);
        assert_eq!(affix::id_offset(6), 0x38 + 6 * 0x18);
    }
}
