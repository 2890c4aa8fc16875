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

//! Just enough of an x86-64 emitter for the trampolines we build. Displaced
//! original instructions pass through as raw bytes; we never decode them.
use crate::InjectError;
use anyhow::Result;

/// One x86-64 NOP.
pub const NOP: u8 = 0x90;

/// Length of an `E9 rel32` near jump.
pub const JMP_REL32_LEN: usize = 5;

/// The classic low eight, by hardware encoding.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
}

/// An append-only machine-code buffer.
#[derive(Debug, Default)]
pub struct CodeBlock {
    buf: Vec<u8>,
}

impl CodeBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// `mov rax, imm64` (10 bytes).
    pub fn mov_rax_imm64(&mut self, imm: u64) -> &mut Self {
        self.buf.extend_from_slice(&[0x48, 0xB8]);
        self.buf.extend_from_slice(&imm.to_le_bytes());
        self
    }

    /// `mov [rax], src` (3 bytes). ModRM mod=00, rm=rax, reg=src.
    pub fn store_at_rax(&mut self, src: Register) -> &mut Self {
        self.buf.extend_from_slice(&[0x48, 0x89, (src as u8) << 3]);
        self
    }

    /// `jmp rax` (2 bytes).
    pub fn jmp_rax(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[0xFF, 0xE0]);
        self
    }

    /// Verbatim bytes, for displaced instructions.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Encode `jmp rel32` at `from` targeting `to`. Fails when the displacement
/// does not fit a signed 32-bit immediate.
pub fn jmp_rel32(from: u64, to: u64) -> Result<[u8; JMP_REL32_LEN]> {
    let disp = (to as i128) - (from as i128 + JMP_REL32_LEN as i128);
    let rel = i32::try_from(disp).map_err(|_| InjectError::Unreachable {
        site: from,
        cave: to,
    })?;
    let mut out = [NOP; JMP_REL32_LEN];
    out[0] = 0xE9;
    out[1..5].copy_from_slice(&rel.to_le_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_rax_imm64_encoding() {
        let mut code = CodeBlock::new();
        code.mov_rax_imm64(0x1234_5600);
        assert_eq!(
            code.finish(),
            vec![0x48, 0xB8, 0x00, 0x56, 0x34, 0x12, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn store_at_rax_encoding() {
        let mut code = CodeBlock::new();
        code.store_at_rax(Register::Rbp);
        code.store_at_rax(Register::Rbx);
        assert_eq!(code.finish(), vec![0x48, 0x89, 0x28, 0x48, 0x89, 0x18]);
    }

    #[test]
    fn jmp_rax_encoding() {
        let mut code = CodeBlock::new();
        code.jmp_rax();
        assert_eq!(code.finish(), vec![0xFF, 0xE0]);
    }

    #[test]
    fn jmp_rel32_forward() {
        // 0x7FF6_0000_1000 -> 0x7FF6_0000_8000 is 0x7000 - 5 = 0x6FFB.
        let jmp = jmp_rel32(0x7FF6_0000_1000, 0x7FF6_0000_8000).unwrap();
        assert_eq!(jmp, [0xE9, 0xFB, 0x6F, 0x00, 0x00]);
    }

    #[test]
    fn jmp_rel32_backward() {
        let jmp = jmp_rel32(0x1_0000, 0x8000).unwrap();
        let rel = i32::from_le_bytes(jmp[1..5].try_into().unwrap());
        assert_eq!(rel, 0x8000 - (0x1_0000 + 5));
        assert_eq!(jmp[0], 0xE9);
    }

    #[test]
    fn jmp_rel32_rejects_out_of_range() {
        assert!(jmp_rel32(0x1000, 0x1_0000_0000_0000).is_err());
        assert!(jmp_rel32(0x1_0000_0000_0000, 0x1000).is_err());
        // Exactly at the edge still encodes.
        let from = 0x2_0000_0000u64;
        assert!(jmp_rel32(from, from + 5 + i32::MAX as u64).is_ok());
        assert!(jmp_rel32(from, from + 6 + i32::MAX as u64).is_err());
    }
}
