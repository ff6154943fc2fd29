//! Entropy sourced from the operating system RNG.

use rand::rngs::OsRng;
use rand::RngCore;

/// Hex-encoded string of `n` random bytes, suitable for the kernel command
/// line `ENTROPY=` parameter.
pub fn entropy_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_has_expected_length_and_alphabet() {
        let s = entropy_hex(32);
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn entropy_differs_between_calls() {
        assert_ne!(entropy_hex(32), entropy_hex(32));
    }
}
