/// Round up `n` to the nearest multiple of `to`. Returns `None` on overflow.
pub const fn round_up(n: usize, to: usize) -> Option<usize> {
    match n.checked_add(to - 1) {
        Some(m) => Some(to * (m / to)),
        None => None,
    }
}

/// Round up `n` to the nearest multiple of `align`, which must be a power of
/// two. Returns `None` on overflow.
pub const fn align_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match n.checked_add(align - 1) {
        Some(m) => Some(m & !(align - 1)),
        None => None,
    }
}
