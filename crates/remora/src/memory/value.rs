/// Plain value that can be copied out of (or into) a remote address space.
///
/// Values are little-endian and packed, matching the x64 targets this crate
/// works against.
pub trait MemoryValue: Sized + Copy {
    const SIZE: usize;

    /// Reinterpret the first `SIZE` bytes. `bytes` must be at least `SIZE` long.
    fn from_le_slice(bytes: &[u8]) -> Self;

    fn write_le(&self, out: &mut Vec<u8>);
}

macro_rules! impl_memory_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl MemoryValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }

                fn write_le(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_memory_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl MemoryValue for bool {
    const SIZE: usize = 1;

    fn from_le_slice(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write_le(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }
}
