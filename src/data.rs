//! Traits and helpers to move values between rust types and the wire.
//!
//! Everything exchanged on an ethercat segment is little-endian and, at the
//! level of this module, byte-aligned. Packing inside a byte is the job of the
//! bitfield structs declared with `bilge` and bound to [PduData] through
//! [bilge_pdudata] and [bilge_pdudata_wide].

use core::fmt;
use core::marker::PhantomData;

/// error raised when packing or unpacking wire data
#[derive(Copy, Clone, Debug)]
pub enum PackingError {
    /// the given buffer does not have the size required by the value
    BadSize(usize, &'static str),
    /// the bytes do not form a valid bit pattern for the type
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;

/**
    trait for values that can be serialized to/from a datagram payload, a
    register image or a mailbox message
*/
pub trait PduData: Sized {
    /// byte size of the packed value
    const PACKED_SIZE: usize;

    /// dump the value at the start of `dst`
    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    /// extract a value from the start of `src`
    fn unpack(src: &[u8]) -> PackingResult<Self>;
}

macro_rules! int_pdudata {
    ($($t:ty),*) => {$(
        impl PduData for $t {
            const PACKED_SIZE: usize = core::mem::size_of::<$t>();

            fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
                if dst.len() < Self::PACKED_SIZE {
                    return Err(PackingError::BadSize(dst.len(), "buffer too short for integer"));
                }
                dst[.. Self::PACKED_SIZE].copy_from_slice(&self.to_le_bytes());
                Ok(())
            }
            fn unpack(src: &[u8]) -> PackingResult<Self> {
                let src = src.get(.. Self::PACKED_SIZE)
                    .ok_or(PackingError::BadSize(src.len(), "buffer too short for integer"))?;
                let mut bytes = [0; Self::PACKED_SIZE];
                bytes.copy_from_slice(src);
                Ok(<$t>::from_le_bytes(bytes))
            }
        }
    )*};
}
int_pdudata!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<const N: usize> PduData for [u8; N] {
    const PACKED_SIZE: usize = N;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < N {
            return Err(PackingError::BadSize(dst.len(), "buffer too short for byte array"));
        }
        dst[.. N].copy_from_slice(self);
        Ok(())
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        let src = src.get(.. N)
            .ok_or(PackingError::BadSize(src.len(), "buffer too short for byte array"))?;
        let mut value = [0; N];
        value.copy_from_slice(src);
        Ok(value)
    }
}

impl PduData for bool {
    const PACKED_SIZE: usize = 1;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        u8::from(*self).pack(dst)
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        Ok(u8::unpack(src)? != 0)
    }
}

/// implement [PduData] for a bilge bitfield whose bit size matches a primitive
/// integer (16, 32 or 64 bits)
macro_rules! bilge_pdudata {
    ($t:ty, $raw:ty) => {
        impl crate::data::PduData for $t {
            const PACKED_SIZE: usize = core::mem::size_of::<$raw>();

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
                crate::data::PduData::pack(&<$raw>::from(*self), dst)
            }
            fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
                let raw: $raw = crate::data::PduData::unpack(src)?;
                Self::try_from(raw)
                    .map_err(|_| crate::data::PackingError::InvalidValue("invalid bit pattern"))
            }
        }
    };
}
pub(crate) use bilge_pdudata;

/// implement [PduData] for a bilge bitfield backed by a non-primitive integer
/// (48, 80 bits ...): the arbitrary int type, its carrier and the packed byte
/// size must be spelled out
macro_rules! bilge_pdudata_wide {
    ($t:ty, $bits:ty, $carrier:ty, $bytes:expr) => {
        impl crate::data::PduData for $t {
            const PACKED_SIZE: usize = $bytes;

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
                if dst.len() < $bytes {
                    return Err(crate::data::PackingError::BadSize(dst.len(), "buffer too short for bitfield"));
                }
                let raw: $carrier = <$bits>::from(*self).value();
                dst[.. $bytes].copy_from_slice(&raw.to_le_bytes()[.. $bytes]);
                Ok(())
            }
            fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
                if src.len() < $bytes {
                    return Err(crate::data::PackingError::BadSize(src.len(), "buffer too short for bitfield"));
                }
                let mut raw = [0; core::mem::size_of::<$carrier>()];
                raw[.. $bytes].copy_from_slice(&src[.. $bytes]);
                Self::try_from(<$bits>::new(<$carrier>::from_le_bytes(raw)))
                    .map_err(|_| crate::data::PackingError::InvalidValue("invalid bit pattern"))
            }
        }
    };
}
pub(crate) use bilge_pdudata_wide;

/**
    locate a value in a register space or an EEPROM by its byte address

    This is a getter/setter of a value in a byte image: it does not point the
    data, it only carries its offset and length so memory bounds can be checked
    on access.
*/
pub struct Field<T> {
    extracted: PhantomData<T>,
    /// start byte of the value
    pub byte: usize,
    /// byte length of the value
    pub len: usize,
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self { *self }
}
impl<T> Copy for Field<T> {}

impl<T: PduData> Field<T> {
    /// build a field from its byte offset and an explicit length
    pub const fn new(byte: usize, len: usize) -> Self {
        Self { extracted: PhantomData, byte, len }
    }
    /// build a field whose length is the packed size of its type
    pub const fn simple(byte: usize) -> Self {
        Self { extracted: PhantomData, byte, len: T::PACKED_SIZE }
    }
    /// extract the value pointed by the field in the given byte image
    pub fn get(&self, data: &[u8]) -> PackingResult<T> {
        let data = data.get(self.byte ..)
            .ok_or(PackingError::BadSize(data.len(), "image smaller than field offset"))?;
        T::unpack(data)
    }
    /// dump the given value at the place pointed by the field in the byte image
    pub fn set(&self, data: &mut [u8], value: T) -> PackingResult<()> {
        let data = data.get_mut(self.byte ..)
            .ok_or(PackingError::BadSize(0, "image smaller than field offset"))?;
        value.pack(data)
    }
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field {{byte: {:#x}, len: {}}}", self.byte, self.len)
    }
}

/// sequential writer/reader over a byte slice
pub struct Cursor<'a> {
    data: &'a mut [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, position: 0 }
    }
    /// bytes written or read so far
    pub fn position(&self) -> usize {
        self.position
    }
    /// the part of the slice not yet visited
    pub fn remain(&mut self) -> &mut [u8] {
        &mut self.data[self.position ..]
    }
    /// pack a value at the current position and advance
    pub fn pack<T: PduData>(&mut self, value: &T) -> PackingResult<()> {
        value.pack(self.remain())?;
        self.position += T::PACKED_SIZE;
        Ok(())
    }
    /// unpack a value at the current position and advance
    pub fn unpack<T: PduData>(&mut self) -> PackingResult<T> {
        let value = T::unpack(self.remain())?;
        self.position += T::PACKED_SIZE;
        Ok(value)
    }
    /// copy raw bytes at the current position and advance
    pub fn write(&mut self, src: &[u8]) -> PackingResult<()> {
        if self.data.len() - self.position < src.len() {
            return Err(PackingError::BadSize(src.len(), "no room left in cursor"));
        }
        self.data[self.position ..][.. src.len()].copy_from_slice(src);
        self.position += src.len();
        Ok(())
    }
}
