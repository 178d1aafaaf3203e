//! Cache key derivation.

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Map a remote reference to a short, filesystem-safe cache key.
///
/// 32-bit rolling hash (`h * 31 + unit`) over the UTF-16 code units,
/// rendered as the base-36 absolute value. Distinct references can
/// collide; callers accept that.
pub fn derive_key(reference: &str) -> String {
    let hash = reference
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    to_base36(hash.unsigned_abs())
}

fn to_base36(mut n: u32) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(7);
    while n > 0 {
        digits.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}
