//! Secure randomness for `crypto.getRandomValues`.

use super::HostResult;
use rand::rngs::OsRng;
use rand::RngCore;

/// Largest request accepted, matching the Web Crypto quota
pub const MAX_RANDOM_BYTES: usize = 65_536;

/// Fill a fresh buffer from the operating system RNG
///
/// # Arguments
/// * `len` - Number of bytes, as a script number
///
/// # Returns
/// * `Ok(bytes)` - `len` random bytes
/// * `Err(_)` - `len` is negative, fractional or above [`MAX_RANDOM_BYTES`]
pub fn get_random_bytes(len: f64) -> HostResult<Vec<u8>> {
    if !(0.0..=MAX_RANDOM_BYTES as f64).contains(&len) || len.fract() != 0.0 {
        anyhow::bail!("invalid random byte count {len}: expected an integer in 0..={MAX_RANDOM_BYTES}");
    }
    let mut bytes = vec![0u8; len as usize];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(bytes)
}
