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
use anyhow::{bail, Result};
use aob::Pattern;
use std::{fs, path::PathBuf};
use structopt::StructOpt;

/// Scan files or a live process for an AOB signature
#[derive(Debug, StructOpt)]
struct Opt {
    /// Signature to look for, e.g. "75 43 0F B7 CF ??"
    pattern: String,

    /// Files to scan
    inputs: Vec<PathBuf>,

    /// Scan a live process by pid instead (Windows only)
    #[structopt(short, long)]
    pid: Option<u32>,

    /// Bytes of context to show around each match
    #[structopt(short, long, default_value = "16")]
    context: usize,

    /// Report every match, not just the first
    #[structopt(short, long)]
    all: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();
    let pattern = opt.pattern.parse::<Pattern>()?;

    if let Some(pid) = opt.pid {
        return scan_process(pid, &pattern, opt.context);
    }
    if opt.inputs.is_empty() {
        bail!("nothing to scan; pass files or --pid");
    }
    for input in &opt.inputs {
        let data = fs::read(input)?;
        println!("{}:", input.display());
        let mut offset = 0usize;
        let mut found = false;
        while let Some(at) = pattern.find(&data[offset..]) {
            let at = offset + at;
            found = true;
            show_match(&data, at, at as u64, pattern.len(), opt.context);
            if !opt.all {
                break;
            }
            offset = at + 1;
        }
        if !found {
            println!("  no match");
        }
    }
    Ok(())
}

fn show_match(data: &[u8], at: usize, display_addr: u64, len: usize, context: usize) {
    let start = at.saturating_sub(context);
    let end = (at + len + context).min(data.len());
    print!("  {:#010x}: ", display_addr);
    for (i, b) in data[start..end].iter().enumerate() {
        let pos = start + i;
        if pos == at {
            print!("[");
        }
        print!("{:02X}", b);
        if pos + 1 == at + len {
            print!("]");
        }
        print!(" ");
    }
    println!();
}

#[cfg(windows)]
fn scan_process(pid: u32, pattern: &Pattern, context: usize) -> Result<()> {
    use remote::{RemoteMemory, WindowsProcess};

    let process = WindowsProcess::open(pid)?;
    let module = process.main_module()?;
    println!(
        "pid {}: module {:#x}..{:#x}",
        pid,
        module.base,
        module.base + module.size
    );
    match aob::scan_module(&process, pattern) {
        Some(addr) => {
            let start = addr.saturating_sub(context as u64);
            let mut buf = vec![0u8; pattern.len() + context * 2];
            let got = process.read_into(start, &mut buf)?;
            show_match(&buf[..got], (addr - start) as usize, addr, pattern.len(), context);
            Ok(())
        }
        None => bail!("no match in module range"),
    }
}

#[cfg(not(windows))]
fn scan_process(_pid: u32, _pattern: &Pattern, _context: usize) -> Result<()> {
    bail!("--pid scanning needs a Windows host");
}
