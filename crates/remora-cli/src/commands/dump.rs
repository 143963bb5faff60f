//! Dump command implementation.
//!
//! Reads a block of the target's memory and prints it in hexdump layout:
//!
//! ```text
//! 0x00000001400010A0: 48 89 5C 24 08 57 48 83  EC 20 8B FA 48 8B D9 E8  |H.\$.WH.. ...H...|
//! ```

use anyhow::{Result, bail};

use super::hex_utils::parse_hex_address;

/// Which process to read from.
pub enum Target {
    Pid(u32),
    Name(String),
}

impl Target {
    /// `--pid` wins over a process name.
    pub fn pick(pid: Option<u32>, process: Option<String>) -> Result<Self> {
        match (pid, process) {
            (Some(pid), _) => Ok(Target::Pid(pid)),
            (None, Some(name)) if !name.is_empty() => Ok(Target::Name(name)),
            _ => bail!("No target process given (use --pid or --process)"),
        }
    }
}

/// Run the dump command
pub fn run(target: Target, address: &str, size: usize, relative: bool) -> Result<()> {
    let address = parse_hex_address(address)?;
    if size == 0 {
        bail!("Nothing to dump: size is 0");
    }
    dump_live(target, address, size, relative)
}

/// An address given as an offset from the main module, made absolute.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn absolute(address: u64, base: u64, relative: bool) -> Result<u64> {
    if !relative {
        return Ok(address);
    }
    base.checked_add(address)
        .ok_or_else(|| anyhow::anyhow!("Offset 0x{address:X} overflows module base 0x{base:X}"))
}

#[cfg(target_os = "windows")]
fn dump_live(target: Target, address: u64, size: usize, relative: bool) -> Result<()> {
    use remora::{MemoryAccess, MemoryDump, ProcessHandle, RemoteProcess};

    let process = match target {
        Target::Pid(pid) => ProcessHandle::open(pid)?,
        Target::Name(name) => ProcessHandle::find_and_open(&name)?,
    };
    let address = absolute(address, process.info().base_address, relative)?;

    let memory = MemoryAccess::new(process);
    let dump = MemoryDump::read(&memory, address, size)?;

    println!("Dump of pid {} at 0x{:X} ({} bytes):", memory.pid(), address, size);
    println!();
    print!("{dump}");
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn dump_live(_target: Target, _address: u64, _size: usize, _relative: bool) -> Result<()> {
    bail!("dump needs a Windows host")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_wins_over_name() {
        assert!(matches!(
            Target::pick(Some(42), Some("target.exe".to_string())).unwrap(),
            Target::Pid(42)
        ));
        assert!(matches!(
            Target::pick(None, Some("target.exe".to_string())).unwrap(),
            Target::Name(name) if name == "target.exe"
        ));
    }

    #[test]
    fn test_missing_target_is_an_error() {
        assert!(Target::pick(None, None).is_err());
        assert!(Target::pick(None, Some(String::new())).is_err());
    }

    #[test]
    fn test_relative_address_adds_module_base() {
        assert_eq!(absolute(0x1040, 0x1_4000_0000, true).unwrap(), 0x1_4000_1040);
        assert_eq!(absolute(0x1040, 0x1_4000_0000, false).unwrap(), 0x1040);
        assert!(absolute(u64::MAX, 0x1000, true).is_err());
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let err = run(Target::Pid(1), "0x1000", 0, false).unwrap_err();
        assert!(err.to_string().contains("size is 0"));
    }
}
