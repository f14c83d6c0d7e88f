//! Size conversions between bytes and whole gigabytes.

const KIB: i64 = 1024;

/// Smallest whole number of GB holding `n` bytes. Each unit step
/// rounds up on its own, so the result never undershoots.
pub fn round_up_bytes_to_gb(n: i64) -> i64 {
  (((n + KIB - 1) / KIB + KIB - 1) / KIB + KIB - 1) / KIB
}

/// Exact conversion from whole GB to bytes.
pub fn gb_to_bytes(gb: i64) -> i64 {
  gb * KIB * KIB * KIB
}
