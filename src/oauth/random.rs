//! Opaque random tokens drawn from the operating system's secure source.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;

use crate::error::BrokerError;

const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz1234567890";

/// Largest multiple of the alphabet size that fits in a byte. Bytes at or
/// above it are rejected so that every symbol is equally likely.
const ACCEPT_BELOW: u8 = (256 / ALPHABET.len() * ALPHABET.len()) as u8;

/// Generate an `n`-character string over `[a-z0-9]`.
///
/// Fails with [`BrokerError::Generation`] when the OS source is unavailable.
/// There is no fallback to a weaker generator.
pub fn generate(n: usize) -> Result<String, BrokerError> {
    let mut out = String::with_capacity(n);
    let mut buf = [0u8; 64];

    while out.len() < n {
        OsRng.try_fill_bytes(&mut buf).map_err(|e| {
            tracing::error!("secure random source failed: {e}");
            BrokerError::Generation
        })?;

        for &b in buf.iter().filter(|&&b| b < ACCEPT_BELOW) {
            if out.len() == n {
                break;
            }
            out.push(ALPHABET[(b % ALPHABET.len() as u8) as usize] as char);
        }
    }

    Ok(out)
}
