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

//! Live-process backend over a Win32 handle. ReadProcessMemory of an aligned
//! 8-byte datum is a single 64-bit copy on x86-64, which is what the capture
//! slots rely on.
use crate::{ModuleInfo, Protection, RegionInfo, RemoteMemory};
use anyhow::{bail, ensure, Result};
use std::{ffi::c_void, mem, ptr};
use windows_sys::Win32::{
    Foundation::{CloseHandle, GetLastError, HANDLE},
    System::{
        Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory},
        Memory::{
            VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, VirtualQueryEx, MEMORY_BASIC_INFORMATION,
            MEM_COMMIT, MEM_FREE, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ,
            PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY,
            PAGE_READWRITE,
        },
        ProcessStatus::{K32EnumProcessModules, K32GetModuleInformation, MODULEINFO},
        Threading::{
            OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ,
            PROCESS_VM_WRITE,
        },
    },
};

fn to_page_flags(prot: Protection) -> PAGE_PROTECTION_FLAGS {
    match (
        prot.contains(Protection::READ),
        prot.contains(Protection::WRITE),
        prot.contains(Protection::EXECUTE),
    ) {
        (_, true, true) => PAGE_EXECUTE_READWRITE,
        (true, false, true) => PAGE_EXECUTE_READ,
        (false, false, true) => PAGE_EXECUTE,
        (_, true, false) => PAGE_READWRITE,
        (true, false, false) => PAGE_READONLY,
        (false, false, false) => PAGE_NOACCESS,
    }
}

fn from_page_flags(flags: PAGE_PROTECTION_FLAGS) -> Protection {
    match flags {
        PAGE_EXECUTE_READWRITE => Protection::RWX,
        PAGE_EXECUTE_READ => Protection::RX,
        PAGE_EXECUTE => Protection::EXECUTE,
        PAGE_READWRITE => Protection::RW,
        PAGE_READONLY => Protection::READ,
        _ => Protection::empty(),
    }
}

pub struct WindowsProcess {
    handle: HANDLE,
}

// The handle is only used for memory operations, which are safe to issue
// from any thread.
unsafe impl Send for WindowsProcess {}
unsafe impl Sync for WindowsProcess {}

impl WindowsProcess {
    /// Open `pid` with read/write/operation/query access.
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe {
            OpenProcess(
                PROCESS_VM_READ | PROCESS_VM_WRITE | PROCESS_VM_OPERATION | PROCESS_QUERY_INFORMATION,
                0,
                pid,
            )
        };
        ensure!(
            handle != 0,
            "OpenProcess({}) failed: {}",
            pid,
            unsafe { GetLastError() }
        );
        Ok(Self { handle })
    }
}

impl Drop for WindowsProcess {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

impl RemoteMemory for WindowsProcess {
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle,
                addr as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                &mut read,
            )
        };
        // A partial read at the end of a region reports failure but still
        // fills `read` bytes; surface those rather than erroring.
        if ok == 0 && read == 0 {
            bail!(
                "ReadProcessMemory({:#x}, {}) failed: {}",
                addr,
                buf.len(),
                unsafe { GetLastError() }
            );
        }
        Ok(read)
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut written = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                self.handle,
                addr as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                &mut written,
            )
        };
        ensure!(
            ok != 0 && written == data.len(),
            "WriteProcessMemory({:#x}, {}) failed: {}",
            addr,
            data.len(),
            unsafe { GetLastError() }
        );
        Ok(())
    }

    fn protect(&self, addr: u64, len: usize, prot: Protection) -> Result<Protection> {
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        let ok = unsafe {
            VirtualProtectEx(
                self.handle,
                addr as *const c_void,
                len,
                to_page_flags(prot),
                &mut old,
            )
        };
        ensure!(
            ok != 0,
            "VirtualProtectEx({:#x}, {}) failed: {}",
            addr,
            len,
            unsafe { GetLastError() }
        );
        Ok(from_page_flags(old))
    }

    fn query(&self, addr: u64) -> Result<RegionInfo> {
        let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
        let n = unsafe {
            VirtualQueryEx(
                self.handle,
                addr as *const c_void,
                &mut mbi,
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        ensure!(
            n == mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            "VirtualQueryEx({:#x}) failed: {}",
            addr,
            unsafe { GetLastError() }
        );
        Ok(RegionInfo {
            base: mbi.BaseAddress as u64,
            size: mbi.RegionSize as u64,
            free: mbi.State == MEM_FREE,
        })
    }

    fn alloc(&self, at: Option<u64>, size: usize, prot: Protection) -> Result<u64> {
        let wanted = at.map(|a| a as *const c_void).unwrap_or(ptr::null());
        let base = unsafe {
            VirtualAllocEx(
                self.handle,
                wanted,
                size,
                MEM_COMMIT | MEM_RESERVE,
                to_page_flags(prot),
            )
        };
        ensure!(
            !base.is_null(),
            "VirtualAllocEx({:?}, {}) failed: {}",
            at,
            size,
            unsafe { GetLastError() }
        );
        Ok(base as u64)
    }

    fn free(&self, base: u64) -> Result<()> {
        let ok = unsafe { VirtualFreeEx(self.handle, base as *mut c_void, 0, MEM_RELEASE) };
        ensure!(ok != 0, "VirtualFreeEx({:#x}) failed: {}", base, unsafe {
            GetLastError()
        });
        Ok(())
    }

    fn main_module(&self) -> Result<ModuleInfo> {
        let mut modules = [0isize; 1];
        let mut needed = 0u32;
        let ok = unsafe {
            K32EnumProcessModules(
                self.handle,
                modules.as_mut_ptr(),
                mem::size_of_val(&modules) as u32,
                &mut needed,
            )
        };
        ensure!(ok != 0 && needed > 0, "EnumProcessModules failed: {}", unsafe {
            GetLastError()
        });

        let mut info: MODULEINFO = unsafe { mem::zeroed() };
        let ok = unsafe {
            K32GetModuleInformation(
                self.handle,
                modules[0],
                &mut info,
                mem::size_of::<MODULEINFO>() as u32,
            )
        };
        ensure!(ok != 0, "GetModuleInformation failed: {}", unsafe {
            GetLastError()
        });
        Ok(ModuleInfo {
            base: info.lpBaseOfDll as u64,
            size: info.SizeOfImage as u64,
        })
    }
}
