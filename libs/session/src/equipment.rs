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

//! Typed access to the captured equipment record: the affix array and the
//! basic item fields, all addressed as captured base + fixed offset.
use crate::{
    arbiter::TickSource,
    layout::{affix, equipment},
    session::{Session, SessionError},
};
use anyhow::Result;
use bitflags::bitflags;
use remote::RemoteMemory;

bitflags! {
    /// Which parts of an affix slot a masked write touches.
    pub struct FieldMask: u32 {
        const ID = 1 << 0;
        const LEVEL = 1 << 1;
        const PREFIX1 = 1 << 2;
        const PREFIX2 = 1 << 3;
        const PREFIX3 = 1 << 4;
        const PREFIX4 = 1 << 5;
        const PREFIXES = Self::PREFIX1.bits
            | Self::PREFIX2.bits
            | Self::PREFIX3.bits
            | Self::PREFIX4.bits;
    }
}

impl FieldMask {
    pub fn prefix(index: usize) -> Self {
        Self::from_bits_truncate(Self::PREFIX1.bits << index)
    }
}

/// One affix slot: id, level, and the four prefix bytes that follow them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Affix {
    pub id: i32,
    pub level: i32,
    pub prefixes: [u8; affix::PREFIX_COUNT],
}

/// The basic item fields. The underworld skill, familiarity, and underworld
/// flag only exist on weapons.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EquipmentBasics {
    pub item_id: i16,
    pub transmog_id: i16,
    pub level: i16,
    pub plus_value: u8,
    pub quality: i32,
    pub underworld_skill_id: i32,
    pub familiarity: i32,
    pub is_underworld: bool,
}

impl<P: RemoteMemory, T: TickSource> Session<P, T> {
    /// The captured base, or NotCapturedYet.
    pub fn captured_base(&mut self) -> Result<u64> {
        Ok(self.current_base()?.ok_or(SessionError::NotCapturedYet)?)
    }

    fn affix_base(&mut self, slot: usize) -> Result<u64> {
        if slot >= affix::SLOT_COUNT {
            return Err(SessionError::InvalidSlotIndex(slot).into());
        }
        self.captured_base()
    }

    pub fn read_affix(&mut self, slot: usize) -> Result<Affix> {
        let base = self.affix_base(slot)?;
        let id = self.process.read_u32(base + affix::id_offset(slot))? as i32;
        let level = self.process.read_u32(base + affix::level_offset(slot))? as i32;
        let mut prefixes = [0u8; affix::PREFIX_COUNT];
        self.process
            .read_exact(base + affix::prefix_offset(slot, 0), &mut prefixes)?;
        Ok(Affix {
            id,
            level,
            prefixes,
        })
    }

    pub fn write_affix(&mut self, slot: usize, value: &Affix) -> Result<()> {
        self.write_affix_masked(slot, value, FieldMask::all())
    }

    /// Write only the parts of the slot selected by `mask`. An empty mask
    /// is a successful no-op.
    pub fn write_affix_masked(&mut self, slot: usize, value: &Affix, mask: FieldMask) -> Result<()> {
        if mask.is_empty() {
            return Ok(());
        }
        let base = self.affix_base(slot)?;
        if mask.contains(FieldMask::ID) {
            self.process
                .write_u32(base + affix::id_offset(slot), value.id as u32)?;
        }
        if mask.contains(FieldMask::LEVEL) {
            self.process
                .write_u32(base + affix::level_offset(slot), value.level as u32)?;
        }
        for i in 0..affix::PREFIX_COUNT {
            if mask.contains(FieldMask::prefix(i)) {
                self.process
                    .write_u8(base + affix::prefix_offset(slot, i), value.prefixes[i])?;
            }
        }
        Ok(())
    }

    pub fn read_basics(&mut self) -> Result<EquipmentBasics> {
        let base = self.captured_base()?;
        let weapon_mode = self.is_weapon_mode()?;

        let mut basics = EquipmentBasics {
            item_id: self.process.read_u16(base + equipment::ITEM_ID)? as i16,
            transmog_id: self.process.read_u16(base + equipment::TRANSMOG_ID)? as i16,
            level: self.process.read_u16(base + equipment::LEVEL)? as i16,
            plus_value: self.process.read_u8(base + equipment::PLUS_VALUE)?,
            quality: self.process.read_u32(base + equipment::QUALITY)? as i32,
            ..Default::default()
        };
        if weapon_mode {
            basics.underworld_skill_id =
                self.process.read_u32(base + equipment::UNDERWORLD_SKILL_ID)? as i32;
            basics.familiarity = self.process.read_u32(base + equipment::FAMILIARITY)? as i32;
            let flags = self.process.read_u8(base + equipment::UNDERWORLD_FLAG)?;
            basics.is_underworld = flags & (1 << equipment::UNDERWORLD_FLAG_BIT) != 0;
        }
        Ok(basics)
    }

    pub fn write_basics(&mut self, value: &EquipmentBasics) -> Result<()> {
        let base = self.captured_base()?;
        let weapon_mode = self.is_weapon_mode()?;

        self.process
            .write_u16(base + equipment::ITEM_ID, value.item_id as u16)?;
        self.process
            .write_u16(base + equipment::TRANSMOG_ID, value.transmog_id as u16)?;
        self.process
            .write_u16(base + equipment::LEVEL, value.level as u16)?;
        self.process
            .write_u8(base + equipment::PLUS_VALUE, value.plus_value)?;
        self.process
            .write_u32(base + equipment::QUALITY, value.quality as u32)?;

        if weapon_mode {
            self.process.write_u32(
                base + equipment::UNDERWORLD_SKILL_ID,
                value.underworld_skill_id as u32,
            )?;
            self.process
                .write_u32(base + equipment::FAMILIARITY, value.familiarity as u32)?;
            // Single-bit field: read-modify-write the containing byte.
            let addr = base + equipment::UNDERWORLD_FLAG;
            let mut flags = self.process.read_u8(addr)?;
            if value.is_underworld {
                flags |= 1 << equipment::UNDERWORLD_FLAG_BIT;
            } else {
                flags &= !(1 << equipment::UNDERWORLD_FLAG_BIT);
            }
            self.process.write_u8(addr, flags)?;
        }
        Ok(())
    }

    /// Untyped helpers over the captured record, for fields this crate has
    /// no name for yet.
    pub fn read_field_u8(&mut self, offset: u64) -> Result<u8> {
        let base = self.captured_base()?;
        self.process.read_u8(base + offset)
    }

    pub fn read_field_u16(&mut self, offset: u64) -> Result<u16> {
        let base = self.captured_base()?;
        self.process.read_u16(base + offset)
    }

    pub fn read_field_u32(&mut self, offset: u64) -> Result<u32> {
        let base = self.captured_base()?;
        self.process.read_u32(base + offset)
    }

    pub fn read_field_u64(&mut self, offset: u64) -> Result<u64> {
        let base = self.captured_base()?;
        self.process.read_u64(base + offset)
    }

    pub fn write_field_u8(&mut self, offset: u64, value: u8) -> Result<()> {
        let base = self.captured_base()?;
        self.process.write_u8(base + offset, value)
    }

    pub fn write_field_u16(&mut self, offset: u64, value: u16) -> Result<()> {
        let base = self.captured_base()?;
        self.process.write_u16(base + offset, value)
    }

    pub fn write_field_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        let base = self.captured_base()?;
        self.process.write_u32(base + offset, value)
    }

    pub fn write_field_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        let base = self.captured_base()?;
        self.process.write_u64(base + offset, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{EquipmentKind, ManualTicks};
    use remote::{FakeProcess, Protection};

    const MODULE_BASE: u64 = 0x1_4000_0000;
    const RECORD_BASE: u64 = 0x2_0000;
    const ARMOR_RECORD_BASE: u64 = 0x3_0000;

    const WEAPON_SITE_BYTES: [u8; 25] = [
        0x48, 0x8B, 0xD5, 0x49, 0x8B, 0xCA, 0xE8, 0x10, 0x20, 0x30, 0x40, 0x48, 0x8B, 0x86, 0x01,
        0x02, 0x03, 0x04, 0x48, 0x8D, 0x8E, 0x05, 0x06, 0x07, 0x08,
    ];
    const ARMOR_SITE_BYTES: [u8; 22] = [
        0x49, 0x8D, 0x8C, 0x24, 0x48, 0x01, 0x00, 0x00, 0x48, 0x8B, 0xD3, 0xE8, 0x11, 0x22, 0x33,
        0x44, 0x8A, 0x45, 0x6F, 0x8A, 0x4D, 0x67,
    ];

    fn weapon_record() -> Vec<u8> {
        let mut record = vec![0u8; 0x200];
        record[0x00..0x02].copy_from_slice(&500i16.to_le_bytes());
        record[0x02..0x04].copy_from_slice(&77i16.to_le_bytes());
        record[0x06..0x08].copy_from_slice(&120i16.to_le_bytes());
        record[0x0A] = 9;
        record[0x10..0x14].copy_from_slice(&3001i32.to_le_bytes());
        record[0x14..0x18].copy_from_slice(&450i32.to_le_bytes());
        record[0x1A] = 1 << 4;
        record[0x30..0x34].copy_from_slice(&4i32.to_le_bytes());
        // Slot 2: id 0x0101, level 7, prefixes 1..4.
        let slot2 = 0x38 + 2 * 0x18;
        record[slot2..slot2 + 4].copy_from_slice(&0x0101i32.to_le_bytes());
        record[slot2 + 4..slot2 + 8].copy_from_slice(&7i32.to_le_bytes());
        record[slot2 + 8..slot2 + 12].copy_from_slice(&[1, 2, 3, 4]);
        record
    }

    /// A game with both capture sites, hooks enabled, and the weapon
    /// trampoline having just published a record.
    fn captured_weapon() -> Session<FakeProcess, ManualTicks> {
        let p = FakeProcess::new();
        let mut image = vec![0u8; 0x1000];
        image[0x200..0x200 + WEAPON_SITE_BYTES.len()].copy_from_slice(&WEAPON_SITE_BYTES);
        image[0x900..0x900 + ARMOR_SITE_BYTES.len()].copy_from_slice(&ARMOR_SITE_BYTES);
        p.map_module(MODULE_BASE, image);
        p.map(RECORD_BASE, weapon_record(), Protection::RW);
        p.map(ARMOR_RECORD_BASE, vec![0u8; 0x200], Protection::RW);

        let mut s = Session::with_ticks(p, ManualTicks::default());
        s.enable_capture().unwrap();
        s.arbiter.ticks.now = 10;
        s.process
            .poke_u64(s.weapon.slot_addr().unwrap(), RECORD_BASE);
        s
    }

    /// Same, but the player has since focused an armor piece.
    fn captured_armor() -> Session<FakeProcess, ManualTicks> {
        let mut s = captured_weapon();
        let _ = s.current_base();
        s.arbiter.ticks.now = 20;
        s.process
            .poke_u64(s.armor.slot_addr().unwrap(), ARMOR_RECORD_BASE);
        s
    }

    #[test]
    fn read_basics_reads_weapon_fields() -> Result<()> {
        let mut s = captured_weapon();
        let basics = s.read_basics()?;
        assert_eq!(basics.item_id, 500);
        assert_eq!(basics.transmog_id, 77);
        assert_eq!(basics.level, 120);
        assert_eq!(basics.plus_value, 9);
        assert_eq!(basics.quality, 4);
        assert_eq!(basics.underworld_skill_id, 3001);
        assert_eq!(basics.familiarity, 450);
        assert!(basics.is_underworld);
        Ok(())
    }

    #[test]
    fn write_basics_round_trips() -> Result<()> {
        let mut s = captured_weapon();
        let mut basics = s.read_basics()?;
        basics.level = 200;
        basics.familiarity = 999;
        basics.is_underworld = false;
        s.write_basics(&basics)?;
        assert_eq!(s.read_basics()?, basics);
        // Clearing the flag must not disturb the rest of the byte.
        let flag_byte = s.process().snapshot(RECORD_BASE + equipment::UNDERWORLD_FLAG, 1)[0];
        assert_eq!(flag_byte & (1 << equipment::UNDERWORLD_FLAG_BIT), 0);
        Ok(())
    }

    #[test]
    fn armor_mode_defaults_weapon_only_fields() -> Result<()> {
        let mut s = captured_armor();
        assert_eq!(s.current_kind()?, EquipmentKind::Armor);
        let basics = s.read_basics()?;
        assert_eq!(basics.underworld_skill_id, 0);
        assert_eq!(basics.familiarity, 0);
        assert!(!basics.is_underworld);
        Ok(())
    }

    #[test]
    fn armor_mode_write_skips_weapon_only_fields() -> Result<()> {
        let mut s = captured_armor();
        let basics = EquipmentBasics {
            item_id: 42,
            familiarity: 12345,
            ..Default::default()
        };
        s.write_basics(&basics)?;
        assert_eq!(
            s.process().snapshot(ARMOR_RECORD_BASE + equipment::ITEM_ID, 2),
            42i16.to_le_bytes().to_vec()
        );
        // The weapon-only field was not written.
        assert_eq!(
            s.process().snapshot(ARMOR_RECORD_BASE + equipment::FAMILIARITY, 4),
            vec![0u8; 4]
        );
        Ok(())
    }

    #[test]
    fn read_affix_reads_a_populated_slot() -> Result<()> {
        let mut s = captured_weapon();
        let affix = s.read_affix(2)?;
        assert_eq!(
            affix,
            Affix {
                id: 0x0101,
                level: 7,
                prefixes: [1, 2, 3, 4],
            }
        );
        Ok(())
    }

    #[test]
    fn write_affix_round_trips() -> Result<()> {
        let mut s = captured_weapon();
        let affix = Affix {
            id: 0x0202,
            level: 9,
            prefixes: [5, 6, 7, 8],
        };
        s.write_affix(3, &affix)?;
        assert_eq!(s.read_affix(3)?, affix);
        Ok(())
    }

    #[test]
    fn masked_write_touches_only_selected_fields() -> Result<()> {
        let mut s = captured_weapon();
        let before = s.read_affix(2)?;
        let update = Affix {
            id: 0x7777,
            level: 55,
            prefixes: [9, 9, 9, 9],
        };
        s.write_affix_masked(2, &update, FieldMask::LEVEL | FieldMask::PREFIX2)?;
        let after = s.read_affix(2)?;
        assert_eq!(after.id, before.id);
        assert_eq!(after.level, 55);
        assert_eq!(after.prefixes, [before.prefixes[0], 9, before.prefixes[2], before.prefixes[3]]);
        Ok(())
    }

    #[test]
    fn empty_mask_is_a_no_op() -> Result<()> {
        let mut s = captured_weapon();
        let before = s.read_affix(2)?;
        s.write_affix_masked(2, &Affix::default(), FieldMask::empty())?;
        assert_eq!(s.read_affix(2)?, before);
        Ok(())
    }

    #[test]
    fn invalid_slot_is_rejected() {
        let mut s = captured_weapon();
        let err = s.read_affix(affix::SLOT_COUNT).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::InvalidSlotIndex(_))
        ));
    }

    #[test]
    fn uncaptured_base_reports_not_captured() {
        let p = FakeProcess::new();
        let mut s = Session::with_ticks(p, ManualTicks::default());
        let err = s.read_affix(0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::NotCapturedYet)
        ));
    }

    #[test]
    fn untyped_field_helpers_address_from_the_captured_base() -> Result<()> {
        let mut s = captured_weapon();
        assert_eq!(s.read_field_u16(equipment::ITEM_ID)?, 500);
        s.write_field_u32(0x100, 0xAABBCCDD)?;
        assert_eq!(s.read_field_u32(0x100)?, 0xAABBCCDD);
        Ok(())
    }
}
