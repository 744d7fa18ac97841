//! Integer conversions between wire-level fields (`u32` lengths, `i32` ids) and in-memory sizes.

/// Widening casts that cannot lose information on any supported platform
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// Narrowing casts for values whose range was checked before, e.g. table sizes bounded by a
///  configured capacity or frame lengths bounded by the buffer size.
///
/// NB: The implementations panic if that check was missed
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: the value range should have been checked before")
    }
}

impl PrecheckedCast<i32> for usize {
    fn prechecked_cast(self) -> i32 {
        self.try_into().expect("this is a bug: the value range should have been checked before")
    }
}
