//! Random per-process device identifier.

use std::fmt;

use rand::Rng;

/// Number of letters in a device identifier
pub const DEVICE_ID_LEN: usize = 5;

const ALPHABET: &[u8; 52] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Identifier tagging every document sent by this process.
///
/// Generated once and never changed; uniqueness between devices is the only
/// requirement, so a non-cryptographic RNG is sufficient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: String,
}

impl DeviceIdentity {
    /// Generate an identifier from the thread-local RNG.
    pub fn generate() -> Self {
        Self::from_rng(&mut rand::thread_rng())
    }

    /// Generate an identifier from the given RNG.
    pub fn from_rng<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let id = (0..DEVICE_ID_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self { id }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
