/// Integer division rounding up.
pub fn div_ceil(a: u64, b: u64) -> u64 {
    assert!(b != 0, "division by zero");
    a / b + u64::from(a % b != 0)
}

/// floor(log2(v)) for v > 0
pub fn log2(v: u64) -> u32 {
    assert!(v != 0, "log2 of zero");
    63 - v.leading_zeros()
}

/// Smallest power of two >= v
pub fn next_pow2(v: u64) -> u64 {
    assert!(v != 0, "next_pow2 of zero");
    let floor = 1u64 << log2(v);
    if floor == v {
        v
    } else {
        floor << 1
    }
}

/// Joins name components with '.', skipping empty parts.
/// Used to build operation and tensor names like "layer0.qkv_gen".
pub fn name_concat(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn div_ceil_rounds_up() {
        assert_eq!(div_ceil(1, 2048), 1);
        assert_eq!(div_ceil(2048, 2048), 1);
        assert_eq!(div_ceil(2049, 2048), 2);
    }

    #[test]
    fn pow2_helpers() {
        assert_eq!(log2(64), 6);
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(32), 32);
        assert_eq!(next_pow2(33), 64);
    }
}
