//! Position-independent x64 stub that resolves and calls a module export.
//!
//! ```text
//!     push rbx
//!     sub  rsp, 32
//!     mov  rcx, <module>
//!     mov  rdx, <export name>
//!     mov  rax, <GetProcAddress>
//!     call rax
//!     test rax, rax
//!     jz   exit
//!     mov  rbx, rax
//!     call rbx
//!     mov  rax, 1
//! exit:
//!     add  rsp, 32
//!     pop  rbx
//!     ret
//! ```
//!
//! The thread exit code is 0 when the export is missing and 1 otherwise.

use crate::error::{Error, Result};

pub const STUB_LEN: usize = 60;

/// Offset of the code behind a NUL-terminated name of `name_len` bytes.
pub fn code_offset(name_len: usize) -> usize {
    (name_len + 15) & !15
}

/// ASCII export name with its terminator.
pub fn export_name_bytes(name: &str) -> Result<Vec<u8>> {
    let name = name.strip_suffix('\0').unwrap_or(name);
    if name.is_empty() || !name.is_ascii() || name.contains('\0') {
        return Err(Error::Injection(format!("Invalid export name '{name}'")));
    }
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    Ok(bytes)
}

pub fn assemble_call_export(module: u64, name_address: u64, get_proc_address: u64) -> Vec<u8> {
    let mut code = Vec::with_capacity(STUB_LEN);

    code.push(0x53); // push rbx
    code.extend_from_slice(&[0x48, 0x83, 0xEC, 0x20]); // sub rsp, 32

    code.extend_from_slice(&[0x48, 0xB9]); // mov rcx, imm64
    code.extend_from_slice(&module.to_le_bytes());
    code.extend_from_slice(&[0x48, 0xBA]); // mov rdx, imm64
    code.extend_from_slice(&name_address.to_le_bytes());
    code.extend_from_slice(&[0x48, 0xB8]); // mov rax, imm64
    code.extend_from_slice(&get_proc_address.to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xD0]); // call rax

    code.extend_from_slice(&[0x48, 0x85, 0xC0]); // test rax, rax
    let jz = code.len();
    code.extend_from_slice(&[0x74, 0x00]); // jz exit

    code.extend_from_slice(&[0x48, 0x89, 0xC3]); // mov rbx, rax
    code.extend_from_slice(&[0xFF, 0xD3]); // call rbx
    code.extend_from_slice(&[0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00]); // mov rax, 1

    let exit = code.len();
    code[jz + 1] = (exit - (jz + 2)) as u8;
    code.extend_from_slice(&[0x48, 0x83, 0xC4, 0x20]); // add rsp, 32
    code.push(0x5B); // pop rbx
    code.push(0xC3); // ret

    code
}
