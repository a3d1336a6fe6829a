//! Alignment and size helpers shared by storage and mapper.

/// Check that a granularity is a non-zero power of two
pub fn is_power_of_two(value: usize) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Align value up to boundary
///
/// `alignment` must be a power of two.
///
/// # Examples
/// ```
/// use regionmap::util::align_up;
/// assert_eq!(align_up(100, 8), 104);
/// assert_eq!(align_up(64, 8), 64);
/// ```
pub fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Align value down to boundary
pub fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Check if value is aligned
pub fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// System page size, from the OS
pub fn os_page_size() -> usize {
    page_size::get()
}

/// Size constants
pub mod constants {
    /// 1 Megabyte
    pub const MB: usize = 1024 * 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(4096));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(3000));
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(8193, 4096));
    }

    #[test]
    fn test_os_page_size() {
        assert!(is_power_of_two(os_page_size()));
    }
}
