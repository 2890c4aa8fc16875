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

//! An in-memory stand-in for a live target process, so that scanning,
//! injection, and session logic can run on any host. Regions behave like
//! committed Windows regions: reads stop at region boundaries, writes
//! require WRITE protection, and placed allocation fails on overlap.
use crate::{ModuleInfo, Protection, RegionInfo, RemoteIoError, RemoteMemory};
use anyhow::{bail, ensure, Result};
use parking_lot::Mutex;

struct Region {
    base: u64,
    data: Vec<u8>,
    prot: Protection,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

#[derive(Default)]
struct Inner {
    // Sorted by base, non-overlapping.
    regions: Vec<Region>,
    module: Option<ModuleInfo>,
    deny_placed_alloc: bool,
    anywhere_alloc_base: u64,
}

#[derive(Default)]
pub struct FakeProcess {
    inner: Mutex<Inner>,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `data` at `base` with the given protection.
    pub fn map(&self, base: u64, data: Vec<u8>, prot: Protection) -> &Self {
        let mut inner = self.inner.lock();
        debug_assert!(!inner
            .regions
            .iter()
            .any(|r| base < r.end() && r.base < base + data.len() as u64));
        inner.regions.push(Region { base, data, prot });
        inner.regions.sort_by_key(|r| r.base);
        self
    }

    /// Map `data` at `base` and declare it the primary module.
    pub fn map_module(&self, base: u64, data: Vec<u8>) -> &Self {
        let size = data.len() as u64;
        self.map(base, data, Protection::RX);
        self.set_main_module(base, size)
    }

    /// Declare the primary module range without mapping anything; pair with
    /// `map` when the image should span several independent regions.
    pub fn set_main_module(&self, base: u64, size: u64) -> &Self {
        self.inner.lock().module = Some(ModuleInfo { base, size });
        self
    }

    /// Make every placed allocation fail, forcing the anywhere fallback.
    pub fn deny_placed_alloc(&self) -> &Self {
        self.inner.lock().deny_placed_alloc = true;
        self
    }

    /// Where the anywhere fallback hands out memory (default picks the
    /// first large-enough gap above 0x10000).
    pub fn set_anywhere_alloc_base(&self, base: u64) -> &Self {
        self.inner.lock().anywhere_alloc_base = base;
        self
    }

    /// Copy bytes out regardless of protection; test assertions only.
    pub fn snapshot(&self, addr: u64, len: usize) -> Vec<u8> {
        let inner = self.inner.lock();
        let r = inner
            .regions
            .iter()
            .find(|r| r.contains(addr))
            .expect("snapshot of unmapped address");
        let off = (addr - r.base) as usize;
        r.data[off..off + len].to_vec()
    }

    /// Store bytes regardless of protection; simulates the target's own
    /// threads (e.g. the game writing a capture slot).
    pub fn poke(&self, addr: u64, data: &[u8]) {
        let mut inner = self.inner.lock();
        let r = inner
            .regions
            .iter_mut()
            .find(|r| r.contains(addr))
            .expect("poke of unmapped address");
        let off = (addr - r.base) as usize;
        r.data[off..off + data.len()].copy_from_slice(data);
    }

    pub fn poke_u64(&self, addr: u64, value: u64) {
        self.poke(addr, &value.to_le_bytes());
    }

    pub fn protection_at(&self, addr: u64) -> Option<Protection> {
        let inner = self.inner.lock();
        inner
            .regions
            .iter()
            .find(|r| r.contains(addr))
            .map(|r| r.prot)
    }
}

impl RemoteMemory for FakeProcess {
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.lock();
        let r = match inner.regions.iter().find(|r| r.contains(addr)) {
            Some(r) => r,
            None => bail!(RemoteIoError::Io {
                op: "read",
                addr,
                len: buf.len(),
            }),
        };
        if !r.prot.contains(Protection::READ) {
            bail!(RemoteIoError::Io {
                op: "read",
                addr,
                len: buf.len(),
            });
        }
        let off = (addr - r.base) as usize;
        let n = buf.len().min(r.data.len() - off);
        buf[..n].copy_from_slice(&r.data[off..off + n]);
        Ok(n)
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let r = match inner.regions.iter_mut().find(|r| r.contains(addr)) {
            Some(r) => r,
            None => bail!(RemoteIoError::Io {
                op: "write",
                addr,
                len: data.len(),
            }),
        };
        let off = (addr - r.base) as usize;
        if !r.prot.contains(Protection::WRITE) || off + data.len() > r.data.len() {
            bail!(RemoteIoError::Io {
                op: "write",
                addr,
                len: data.len(),
            });
        }
        r.data[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn protect(&self, addr: u64, _len: usize, prot: Protection) -> Result<Protection> {
        let mut inner = self.inner.lock();
        let r = match inner.regions.iter_mut().find(|r| r.contains(addr)) {
            Some(r) => r,
            None => bail!(RemoteIoError::Io {
                op: "protect",
                addr,
                len: _len,
            }),
        };
        let old = r.prot;
        r.prot = prot;
        Ok(old)
    }

    fn query(&self, addr: u64) -> Result<RegionInfo> {
        let inner = self.inner.lock();
        if let Some(r) = inner.regions.iter().find(|r| r.contains(addr)) {
            return Ok(RegionInfo {
                base: r.base,
                size: r.data.len() as u64,
                free: false,
            });
        }
        // Free gap: runs from addr to the next mapped region.
        let next = inner
            .regions
            .iter()
            .map(|r| r.base)
            .filter(|&b| b > addr)
            .min()
            .unwrap_or(u64::MAX);
        Ok(RegionInfo {
            base: addr,
            size: next - addr,
            free: true,
        })
    }

    fn alloc(&self, at: Option<u64>, size: usize, prot: Protection) -> Result<u64> {
        ensure!(size > 0, "zero-size allocation");
        let mut inner = self.inner.lock();
        let base = match at {
            Some(addr) => {
                if inner.deny_placed_alloc {
                    bail!(RemoteIoError::Io {
                        op: "alloc",
                        addr,
                        len: size,
                    });
                }
                let end = addr + size as u64;
                if inner.regions.iter().any(|r| addr < r.end() && r.base < end) {
                    bail!(RemoteIoError::Io {
                        op: "alloc",
                        addr,
                        len: size,
                    });
                }
                addr
            }
            None => {
                let mut candidate = inner.anywhere_alloc_base.max(crate::ALLOC_GRANULARITY);
                loop {
                    let end = candidate + size as u64;
                    match inner
                        .regions
                        .iter()
                        .find(|r| candidate < r.end() && r.base < end)
                    {
                        Some(r) => {
                            let end = r.end();
                            candidate = (end + crate::ALLOC_GRANULARITY - 1)
                                / crate::ALLOC_GRANULARITY
                                * crate::ALLOC_GRANULARITY;
                        }
                        None => break,
                    }
                }
                candidate
            }
        };
        inner.regions.push(Region {
            base,
            data: vec![0u8; size],
            prot,
        });
        inner.regions.sort_by_key(|r| r.base);
        Ok(base)
    }

    fn free(&self, base: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let before = inner.regions.len();
        inner.regions.retain(|r| r.base != base);
        ensure!(inner.regions.len() < before, "free of unknown base {:#x}", base);
        Ok(())
    }

    fn main_module(&self) -> Result<ModuleInfo> {
        match self.inner.lock().module {
            Some(m) => Ok(m),
            None => bail!(RemoteIoError::NoMainModule),
        }
    }
}
