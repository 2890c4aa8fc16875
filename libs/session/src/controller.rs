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

//! The boolean-and-last-error facade over [Session], for callers that are
//! multithreaded or cannot consume Results. Every entry point serializes on
//! one re-entrant lock; failures land in a last-error slot that the next
//! failure overwrites.
use crate::{
    arbiter::EquipmentKind,
    session::{Session, SessionError},
};
use parking_lot::ReentrantMutex;
use remote::RemoteMemory;
use std::cell::RefCell;

struct State<P: RemoteMemory> {
    session: Option<Session<P>>,
    last_error: String,
}

pub struct Controller<P: RemoteMemory> {
    state: ReentrantMutex<RefCell<State<P>>>,
}

impl<P: RemoteMemory> Default for Controller<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: RemoteMemory> Controller<P> {
    pub fn new() -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(State {
                session: None,
                last_error: String::new(),
            })),
        }
    }

    /// Take ownership of an opened process. Fails if a session is live.
    pub fn attach_process(&self, process: P) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.session.is_some() {
            state.last_error = SessionError::AlreadyAttached.to_string();
            return false;
        }
        state.session = Some(Session::new(process));
        state.last_error.clear();
        true
    }

    /// Disable everything, release target allocations, close the handle.
    pub fn detach(&self) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if let Some(mut session) = state.session.take() {
            if let Err(e) = session.teardown() {
                state.last_error = format!("{:#}", e);
                return;
            }
        }
        state.last_error.clear();
    }

    pub fn is_attached(&self) -> bool {
        let guard = self.state.lock();
        let attached = guard.borrow().session.is_some();
        attached
    }

    /// Mutating operations: failures are recorded, success clears the slot.
    fn with_session<R: Default>(
        &self,
        f: impl FnOnce(&mut Session<P>) -> anyhow::Result<R>,
    ) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let result = match state.session.as_mut() {
            Some(session) => f(session),
            None => Err(SessionError::NotAttached.into()),
        };
        match result {
            Ok(value) => {
                state.last_error.clear();
                value
            }
            Err(e) => {
                state.last_error = format!("{:#}", e);
                R::default()
            }
        }
    }

    /// Pure queries: never touch last_error, answer a default when detached
    /// or when the remote read fails.
    fn query_session<R: Default>(&self, f: impl FnOnce(&mut Session<P>) -> anyhow::Result<R>) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        match state.session.as_mut() {
            Some(session) => f(session).unwrap_or_default(),
            None => R::default(),
        }
    }

    /// Install the capture trampolines. True when the weapon capture is
    /// live; an armor-side problem is reported through last_error only.
    pub fn enable_capture(&self) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let result = match state.session.as_mut() {
            Some(session) => session.enable_capture(),
            None => Err(SessionError::NotAttached.into()),
        };
        match result {
            Ok(None) => {
                state.last_error.clear();
                true
            }
            Ok(Some(warning)) => {
                state.last_error = warning;
                true
            }
            Err(e) => {
                state.last_error = format!("{:#}", e);
                false
            }
        }
    }

    pub fn disable_capture(&self) -> bool {
        self.with_session(|s| s.disable_capture().map(|_| true))
    }

    pub fn is_capture_enabled(&self) -> bool {
        self.query_session(|s| Ok(s.is_capture_enabled()))
    }

    pub fn is_weapon_capture_enabled(&self) -> bool {
        self.query_session(|s| Ok(s.is_weapon_capture_enabled()))
    }

    pub fn is_armor_capture_enabled(&self) -> bool {
        self.query_session(|s| Ok(s.is_armor_capture_enabled()))
    }

    pub fn enable_skill_bypass(&self) -> bool {
        self.with_session(|s| s.enable_skill_bypass().map(|_| true))
    }

    pub fn disable_skill_bypass(&self) -> bool {
        self.with_session(|s| s.disable_skill_bypass().map(|_| true))
    }

    pub fn is_skill_bypass_enabled(&self) -> bool {
        self.query_session(|s| Ok(s.is_skill_bypass_enabled()))
    }

    /// The current captured base, zero when nothing is captured.
    pub fn current_base(&self) -> u64 {
        self.query_session(|s| Ok(s.current_base()?.unwrap_or(0)))
    }

    pub fn current_kind(&self) -> EquipmentKind {
        self.query_session(|s| s.current_kind())
    }

    pub fn is_weapon_mode(&self) -> bool {
        matches!(
            self.current_kind(),
            EquipmentKind::Weapon | EquipmentKind::Unknown
        )
    }

    pub fn weapon_base(&self) -> u64 {
        self.query_session(|s| s.weapon_base())
    }

    pub fn armor_base(&self) -> u64 {
        self.query_session(|s| s.armor_base())
    }

    pub fn last_error(&self) -> String {
        let guard = self.state.lock();
        let message = guard.borrow().last_error.clone();
        message
    }
}

#[cfg(windows)]
impl Controller<remote::WindowsProcess> {
    /// Open `pid` and attach.
    pub fn attach(&self, pid: u32) -> bool {
        let process = {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            if state.session.is_some() {
                state.last_error = SessionError::AlreadyAttached.to_string();
                return false;
            }
            match remote::WindowsProcess::open(pid) {
                Ok(process) => process,
                Err(e) => {
                    state.last_error =
                        format!("{}: {:#}", SessionError::OpenProcessFailed { pid }, e);
                    return false;
                }
            }
        };
        self.attach_process(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote::FakeProcess;

    const WEAPON_SITE_BYTES: [u8; 25] = [
        0x48, 0x8B, 0xD5, 0x49, 0x8B, 0xCA, 0xE8, 0x10, 0x20, 0x30, 0x40, 0x48, 0x8B, 0x86, 0x01,
        0x02, 0x03, 0x04, 0x48, 0x8D, 0x8E, 0x05, 0x06, 0x07, 0x08,
    ];

    fn game_process() -> FakeProcess {
        let p = FakeProcess::new();
        let mut image = vec![0u8; 0x1000];
        image[0x200..0x200 + WEAPON_SITE_BYTES.len()].copy_from_slice(&WEAPON_SITE_BYTES);
        p.map_module(0x1_4000_0000, image);
        p
    }

    #[test]
    fn operations_require_attachment() {
        let c: Controller<FakeProcess> = Controller::new();
        assert!(!c.is_attached());
        assert!(!c.enable_capture());
        assert!(c.last_error().contains("not attached"));
        assert_eq!(c.current_base(), 0);
        assert_eq!(c.current_kind(), EquipmentKind::Unknown);
    }

    #[test]
    fn attach_twice_is_rejected() {
        let c = Controller::new();
        assert!(c.attach_process(FakeProcess::new()));
        assert!(!c.attach_process(FakeProcess::new()));
        assert!(c.last_error().contains("already attached"));
        c.detach();
        assert!(c.attach_process(FakeProcess::new()));
    }

    #[test]
    fn detach_clears_state() {
        let c = Controller::new();
        c.attach_process(FakeProcess::new());
        c.detach();
        assert!(!c.is_attached());
        assert_eq!(c.last_error(), "");
    }

    #[test]
    fn enable_capture_failure_records_the_reason() {
        let c = Controller::new();
        let p = FakeProcess::new();
        p.map_module(0x1_4000_0000, vec![0u8; 0x1000]);
        c.attach_process(p);
        assert!(!c.enable_capture());
        assert!(c.last_error().contains("weapon capture"));
    }

    #[test]
    fn armor_warning_does_not_fail_enable() {
        let c = Controller::new();
        c.attach_process(game_process());
        assert!(c.enable_capture());
        assert!(c.is_capture_enabled());
        assert!(!c.is_armor_capture_enabled());
        assert!(c.last_error().contains("armor"));
    }

    #[test]
    fn unknown_kind_defaults_to_weapon_mode() {
        let c = Controller::new();
        c.attach_process(game_process());
        c.enable_capture();
        assert_eq!(c.current_kind(), EquipmentKind::Unknown);
        assert!(c.is_weapon_mode());
    }
}
