//! Byte layout shared with the remote controller. Little-endian throughout.

use byteorder::{ByteOrder, LE};
use strum::{Display, FromRepr, IntoStaticStr};

use crate::error::{Error, Result};

use super::hooks::{HookBehavior, HookType};

/// Region header: write cursor, read cursor and closed flag
pub const REGION_HEADER_SIZE: usize = 128;
pub const WRITE_CURSOR_OFFSET: usize = 0;
pub const READ_CURSOR_OFFSET: usize = 64;
pub const CLOSED_OFFSET: usize = 72;

pub const MESSAGE_HEADER_SIZE: usize = 16;

pub const MAX_HOOK_ID: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum PayloadType {
    Request = 1,
    Ack = 2,
    NAck = 3,
    Blob = 4,
    Register = 5,
    Unregister = 6,
    Heartbeat = 7,
    Bye = 8,
}

/// Header in front of every message block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: u32,
    /// Raw type code; unknown codes survive decoding
    pub type_code: u8,
    pub length: u64,
}

impl MessageHeader {
    pub fn new(id: u32, payload_type: PayloadType, length: u64) -> Self {
        Self {
            id,
            type_code: payload_type as u8,
            length,
        }
    }

    pub fn payload_type(&self) -> Option<PayloadType> {
        PayloadType::from_repr(self.type_code)
    }

    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut raw = [0u8; MESSAGE_HEADER_SIZE];
        LE::write_u32(&mut raw[0..4], self.id);
        raw[4] = self.type_code;
        LE::write_u64(&mut raw[8..16], self.length);
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < MESSAGE_HEADER_SIZE {
            return Err(Error::Channel("truncated message header".to_string()));
        }
        Ok(Self {
            id: LE::read_u32(&raw[0..4]),
            type_code: raw[4],
            length: LE::read_u64(&raw[8..16]),
        })
    }
}

/// Ids of wrapper and interceptor traffic: `seq << 24 | hook_id`.
///
/// Sequence 0 marks calls that started in the target.
pub struct HookMessageId;

impl HookMessageId {
    pub const REMOTE_SEQUENCE: u8 = 0;

    pub fn pack(hook_id: u32, sequence: u8) -> u32 {
        ((sequence as u32) << 24) | (hook_id & MAX_HOOK_ID)
    }

    pub fn hook_id(id: u32) -> u32 {
        id & MAX_HOOK_ID
    }

    pub fn sequence(id: u32) -> u8 {
        (id >> 24) as u8
    }

    /// Host sequence after `current`; wraps 255 to 1 so 0 stays reserved.
    pub fn next_sequence(current: u8) -> u8 {
        if current == u8::MAX { 1 } else { current + 1 }
    }
}

/// Kind of control request an Ack/NAck answers, kept in the top id byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum ControlCategory {
    Register = 1,
    Unregister = 2,
    Bye = 3,
}

pub struct ControlId;

impl ControlId {
    pub fn pack(category: ControlCategory, counter: u32) -> u32 {
        ((category as u32) << 24) | (counter & 0x00FF_FFFF)
    }

    pub fn category(id: u32) -> Option<ControlCategory> {
        ControlCategory::from_repr((id >> 24) as u8)
    }
}

/// Register payload: address, type, behavior, key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub address: u64,
    pub hook_type: HookType,
    pub behavior: HookBehavior,
    pub key: String,
}

impl RegistrationRequest {
    const FIXED_SIZE: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut raw = vec![0u8; Self::FIXED_SIZE];
        LE::write_u64(&mut raw[0..8], self.address);
        raw[8] = self.hook_type as u8;
        raw[9] = self.behavior as u8;
        LE::write_u32(&mut raw[12..16], self.key.len() as u32);
        raw.extend_from_slice(self.key.as_bytes());
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let fixed = raw
            .get(..Self::FIXED_SIZE)
            .ok_or_else(|| Error::Channel("truncated registration payload".to_string()))?;
        let key_len = LE::read_u32(&fixed[12..16]) as usize;
        let key = raw
            .get(Self::FIXED_SIZE..Self::FIXED_SIZE + key_len)
            .ok_or_else(|| Error::Channel("truncated registration key".to_string()))?;

        Ok(Self {
            address: LE::read_u64(&fixed[0..8]),
            hook_type: HookType::from_repr(fixed[8])
                .ok_or_else(|| Error::Channel(format!("unknown hook type {}", fixed[8])))?,
            behavior: HookBehavior::from_repr(fixed[9])
                .ok_or_else(|| Error::Channel(format!("unknown hook behavior {}", fixed[9])))?,
            key: String::from_utf8(key.to_vec())
                .map_err(|_| Error::Channel("registration key is not UTF-8".to_string()))?,
        })
    }
}

pub fn encode_hook_id(hook_id: u32) -> Vec<u8> {
    hook_id.to_le_bytes().to_vec()
}

/// Hook id carried by a Register Ack or an Unregister request.
pub fn decode_hook_id(payload: &[u8]) -> Option<u32> {
    payload.get(..4).map(LE::read_u32)
}
