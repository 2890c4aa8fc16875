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
use anyhow::{ensure, Result};
use bitflags::bitflags;
use std::ops::Range;
use thiserror::Error;

pub mod fake;
#[cfg(windows)]
pub mod win32;

pub use fake::FakeProcess;
#[cfg(windows)]
pub use win32::WindowsProcess;

/// Granularity of remote reads during scanning.
pub const PAGE_SIZE: usize = 4096;

/// Windows allocation granularity; placed allocations snap to this.
pub const ALLOC_GRANULARITY: u64 = 0x1_0000;

#[derive(Debug, Error)]
pub enum RemoteIoError {
    #[error("remote {op} of {len} bytes at {addr:#x} failed")]
    Io {
        op: &'static str,
        addr: u64,
        len: usize,
    },
    #[error("no module information for the target process")]
    NoMainModule,
}

bitflags! {
    /// The portable subset of page protection. WRITE implies a writable
    /// mapping, not copy-on-write specifics; those are the backend's problem.
    pub struct Protection: u8 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const EXECUTE = 0b0100;
        const RX = Self::READ.bits | Self::EXECUTE.bits;
        const RW = Self::READ.bits | Self::WRITE.bits;
        const RWX = Self::READ.bits | Self::WRITE.bits | Self::EXECUTE.bits;
    }
}

/// Base and image size of the target's primary executable module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    pub base: u64,
    pub size: u64,
}

impl ModuleInfo {
    pub fn range(&self) -> Range<u64> {
        self.base..self.base + self.size
    }
}

/// One region of the target's address space, as reported by a query.
#[derive(Clone, Copy, Debug)]
pub struct RegionInfo {
    pub base: u64,
    pub size: u64,
    pub free: bool,
}

impl RegionInfo {
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

/// Capability to read, write, query, protect, and allocate in another
/// process's virtual address space. The live implementation wraps a Win32
/// process handle; tests run against [fake::FakeProcess].
///
/// All operations are synchronous and uncancellable; short reads are
/// reported, not retried.
pub trait RemoteMemory {
    /// Read up to `buf.len()` bytes at `addr`. Returns the number of bytes
    /// actually read; fails if nothing at `addr` is readable.
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `data` at `addr`.
    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;

    /// Change protection on `[addr, addr+len)`, returning the prior
    /// protection so a caller can restore it.
    fn protect(&self, addr: u64, len: usize, prot: Protection) -> Result<Protection>;

    /// Describe the region containing `addr`.
    fn query(&self, addr: u64) -> Result<RegionInfo>;

    /// Commit and reserve `size` bytes, at `at` if given, anywhere otherwise.
    /// Returns the allocation base.
    fn alloc(&self, at: Option<u64>, size: usize, prot: Protection) -> Result<u64>;

    /// Release an allocation previously returned by `alloc`.
    fn free(&self, base: u64) -> Result<()>;

    /// Base and size of the primary executable module.
    fn main_module(&self) -> Result<ModuleInfo>;

    fn read_exact(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_into(addr, buf)?;
        ensure!(
            n == buf.len(),
            "short read at {:#x}: {} of {} bytes",
            addr,
            n,
            buf.len()
        );
        Ok(())
    }

    fn read_u8(&self, addr: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// The capture slots depend on this being a single aligned 8-byte load
    /// on the backend; see [win32].
    fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    fn write_u16(&self, addr: u64, value: u16) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_u32(&self, addr: u64, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_u64(&self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_composites() {
        assert_eq!(Protection::RWX.bits(), 0b0111);
        assert!(Protection::RWX.contains(Protection::READ));
        assert!(Protection::RX.contains(Protection::EXECUTE));
        assert!(!Protection::RX.contains(Protection::WRITE));
    }

    #[test]
    fn module_range_is_half_open() {
        let m = ModuleInfo {
            base: 0x1000,
            size: 0x2000,
        };
        assert_eq!(m.range(), 0x1000..0x3000);
        assert!(m.range().contains(&0x2FFF));
        assert!(!m.range().contains(&0x3000));
    }
}
