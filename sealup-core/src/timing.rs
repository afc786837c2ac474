//! Constant-time comparisons for key material and fingerprints

use subtle::ConstantTimeEq;

/// Constant-time byte comparison
pub fn constant_time_sig_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Constant-time string comparison (fingerprints, tokens)
pub fn constant_time_str_compare(a: &str, b: &str) -> bool {
    constant_time_sig_compare(a.as_bytes(), b.as_bytes())
}
