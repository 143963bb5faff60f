//! Packing of wrapper arguments and return values.
//!
//! Values are packed back to back in little-endian order with no padding, the
//! layout the controller's trampolines read.

use crate::error::{Error, Result};
use crate::memory::MemoryValue;

pub trait Marshal {
    fn marshal(&self, out: &mut Vec<u8>);

    fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.marshal(&mut out);
        out
    }
}

pub trait Unmarshal: Sized {
    /// Decode from the front of `input`, returning the bytes consumed.
    fn unmarshal(input: &[u8]) -> Result<(Self, usize)>;

    fn from_payload(input: &[u8]) -> Result<Self> {
        Self::unmarshal(input).map(|(value, _)| value)
    }
}

macro_rules! impl_marshal_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, out: &mut Vec<u8>) {
                    self.write_le(out);
                }
            }

            impl Unmarshal for $ty {
                fn unmarshal(input: &[u8]) -> Result<(Self, usize)> {
                    if input.len() < <$ty as MemoryValue>::SIZE {
                        return Err(short_payload(stringify!($ty), input.len()));
                    }
                    Ok((<$ty>::from_le_slice(input), <$ty as MemoryValue>::SIZE))
                }
            }
        )*
    };
}

impl_marshal_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64, bool);

impl Marshal for () {
    fn marshal(&self, _out: &mut Vec<u8>) {}
}

impl Unmarshal for () {
    fn unmarshal(_input: &[u8]) -> Result<(Self, usize)> {
        Ok(((), 0))
    }
}

impl Marshal for [u8] {
    fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl<T: Marshal + ?Sized> Marshal for &T {
    fn marshal(&self, out: &mut Vec<u8>) {
        (**self).marshal(out);
    }
}

macro_rules! impl_marshal_tuple {
    ($($name:ident),+) => {
        impl<$($name: Marshal),+> Marshal for ($($name,)+) {
            #[allow(non_snake_case)]
            fn marshal(&self, out: &mut Vec<u8>) {
                let ($($name,)+) = self;
                $($name.marshal(out);)+
            }
        }

        impl<$($name: Unmarshal),+> Unmarshal for ($($name,)+) {
            #[allow(non_snake_case)]
            fn unmarshal(input: &[u8]) -> Result<(Self, usize)> {
                let mut offset = 0;
                $(
                    let ($name, used) = $name::unmarshal(&input[offset..])?;
                    offset += used;
                )+
                Ok((($($name,)+), offset))
            }
        }
    };
}

impl_marshal_tuple!(A);
impl_marshal_tuple!(A, B);
impl_marshal_tuple!(A, B, C);
impl_marshal_tuple!(A, B, C, D);
impl_marshal_tuple!(A, B, C, D, E);
impl_marshal_tuple!(A, B, C, D, E, F);

fn short_payload(what: &str, len: usize) -> Error {
    Error::Channel(format!("Payload too short for {what}: {len} bytes left"))
}
