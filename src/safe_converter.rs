
/// For widening or same-width casts that are valid on all supported targets.
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

/// Narrowing casts into the wire format's fixed-width fields: payload region and authorizer
///  lengths going into their `u32` envelope slots, and the configured socket buffer size
///  handed to the kernel.
///
/// Overflow panics, because a payload that does not fit its length field must have been
///  rejected before it got anywhere near serialization.
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("value exceeds its wire field; a length limit upstream did not hold")
    }
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("value exceeds its wire field; a length limit upstream did not hold")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(u32::MAX)]
    fn test_u32_to_usize(#[case] value: u32) {
        let cast: usize = value.safe_cast();
        assert_eq!(cast, value as usize);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(65535, 65535)]
    fn test_prechecked_usize_to_u16(#[case] value: usize, #[case] expected: u16) {
        let cast: u16 = value.prechecked_cast();
        assert_eq!(cast, expected);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: u16 = 65536usize.prechecked_cast();
    }
}
