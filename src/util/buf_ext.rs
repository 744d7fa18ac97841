use bytes::{Buf, BufMut};

use crate::error::BusError;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};


macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> Result<$ty, BusError> {
            if self.remaining() < size_of::<$ty>() {
                return Err(BusError::Framing(format!("buffer underflow reading {}", stringify!($ty))));
            }
            Ok(self.$getter())
        }
    }
}

/// Checked big-endian reads for parsing untrusted wire and log data. Every number on the wire and
///  on disk is in network byte order, so there are no `_le` variants.
pub trait BufExt: Buf {
    get_checked_impl!(checked_u32, u32, get_u32);
    get_checked_impl!(checked_i32, i32, get_i32);
    get_checked_impl!(checked_f32, f32, get_f32);

    /// Reads a string prefixed with its length as a `u32`. The length counts a terminating NUL,
    ///  which is stripped.
    fn checked_string(&mut self) -> Result<String, BusError> {
        let len: usize = self.checked_u32()?.safe_cast();
        if self.remaining() < len {
            return Err(BusError::Framing(format!("string of length {} exceeds remaining {} bytes", len, self.remaining())));
        }

        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        if raw.last() == Some(&0) {
            raw.pop();
        }
        String::from_utf8(raw)
            .map_err(|e| BusError::Framing(format!("string is not valid UTF-8: {}", e)))
    }
}

pub trait BufMutExt: BufMut {
    /// writes a string NUL terminated, prefixed with its length including the NUL
    fn put_string(&mut self, s: &str) {
        self.put_u32((s.len() + 1).prechecked_cast());
        self.put_slice(s.as_bytes());
        self.put_u8(0);
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
