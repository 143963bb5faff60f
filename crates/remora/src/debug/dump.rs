use std::fmt;

use crate::error::Result;
use crate::memory::ReadMemory;

const ROW: usize = 16;

/// Raw bytes read from an address, printed in hexdump layout:
///
/// ```text
/// 0x00000001400010A0: 48 89 5C 24 08 57 48 83  EC 20 8B FA 48 8B D9 E8  |H.\$.WH.. ...H...|
/// ```
#[derive(Debug, Clone)]
pub struct MemoryDump {
    pub address: u64,
    pub bytes: Vec<u8>,
}

impl MemoryDump {
    pub fn read<R: ReadMemory + ?Sized>(reader: &R, address: u64, len: usize) -> Result<Self> {
        Ok(Self {
            address,
            bytes: reader.read_bytes(address, len)?,
        })
    }

    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.bytes.chunks(ROW).enumerate().map(|(i, chunk)| {
            let mut line = format!("0x{:016X}: ", self.address + (i * ROW) as u64);
            for j in 0..ROW {
                if j == ROW / 2 {
                    line.push(' ');
                }
                match chunk.get(j) {
                    Some(byte) => line.push_str(&format!("{byte:02X} ")),
                    None => line.push_str("   "),
                }
            }
            line.push_str(" |");
            for j in 0..ROW {
                line.push(match chunk.get(j) {
                    Some(&b) if (0x20..0x7F).contains(&b) => b as char,
                    Some(_) => '.',
                    None => ' ',
                });
            }
            line.push('|');
            line
        })
    }
}

impl fmt::Display for MemoryDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
