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

//! The editor core: an attached process session owning two capture
//! trampolines, a skill-gate branch patcher, and the arbiter deciding which
//! capture is current; plus the typed equipment accessors layered on top and
//! a locked facade for multithreaded callers.
mod arbiter;
mod controller;
mod equipment;
pub mod layout;
mod session;
mod signatures;

pub use arbiter::{CaptureArbiter, EquipmentKind, ManualTicks, SystemTicks, TickSource};
pub use controller::Controller;
pub use equipment::{Affix, EquipmentBasics, FieldMask};
pub use session::{Session, SessionError};
pub use signatures::{BypassSite, ARMOR_CAPTURE, SKILL_BYPASS_SITES, WEAPON_CAPTURE};
