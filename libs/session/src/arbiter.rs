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

//! Deciding which of the two capture slots points at the item the player is
//! actually looking at. The game gives no ordering guarantees; the most
//! recently changed non-zero slot wins, weapon preferred on ties.
use std::time::Instant;

/// Millisecond ticks for stamping slot changes. Tests drive this by hand.
pub trait TickSource {
    fn now_ms(&mut self) -> u64;
}

/// Wall-clock ticks since construction.
pub struct SystemTicks {
    epoch: Instant,
}

impl Default for SystemTicks {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl TickSource for SystemTicks {
    fn now_ms(&mut self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// A hand-cranked tick source.
#[derive(Default)]
pub struct ManualTicks {
    pub now: u64,
}

impl TickSource for ManualTicks {
    fn now_ms(&mut self) -> u64 {
        self.now
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EquipmentKind {
    Weapon,
    Armor,
    #[default]
    Unknown,
}

#[derive(Clone, Copy, Debug, Default)]
struct SlotRecord {
    last_value: u64,
    last_change: u64,
}

impl SlotRecord {
    /// Stamp the record when the slot settles on a new non-zero value.
    /// Reverting to zero is not a change: the game clears slots in passing
    /// and the stale pointer is still the best answer.
    fn observe(&mut self, value: u64, now: u64) {
        if value != 0 && value != self.last_value {
            self.last_value = value;
            self.last_change = now;
        }
    }
}

/// Change-stamps the two capture slots and selects the current one.
pub struct CaptureArbiter<T: TickSource> {
    weapon: SlotRecord,
    armor: SlotRecord,
    pub(crate) ticks: T,
}

impl<T: TickSource> CaptureArbiter<T> {
    pub fn new(ticks: T) -> Self {
        Self {
            weapon: SlotRecord::default(),
            armor: SlotRecord::default(),
            ticks,
        }
    }

    /// Feed the latest slot values; returns the current base, if any.
    /// Armor wins only when strictly more recent; an armor-only capture
    /// still answers when the weapon slot has never published.
    pub fn select(&mut self, weapon_value: u64, armor_value: u64) -> Option<u64> {
        let now = self.ticks.now_ms();
        self.weapon.observe(weapon_value, now);
        self.armor.observe(armor_value, now);

        if self.armor.last_change > self.weapon.last_change && armor_value != 0 {
            Some(armor_value)
        } else if weapon_value != 0 {
            Some(weapon_value)
        } else if armor_value != 0 {
            Some(armor_value)
        } else {
            None
        }
    }

    /// Same selection rule, reported as a kind.
    pub fn kind(&mut self, weapon_value: u64, armor_value: u64) -> EquipmentKind {
        let now = self.ticks.now_ms();
        self.weapon.observe(weapon_value, now);
        self.armor.observe(armor_value, now);

        if self.armor.last_change > self.weapon.last_change && armor_value != 0 {
            EquipmentKind::Armor
        } else if weapon_value != 0 {
            EquipmentKind::Weapon
        } else if armor_value != 0 {
            EquipmentKind::Armor
        } else {
            EquipmentKind::Unknown
        }
    }

    /// Forget everything; used at attach and detach.
    pub fn reset(&mut self) {
        self.weapon = SlotRecord::default();
        self.armor = SlotRecord::default();
    }
}
