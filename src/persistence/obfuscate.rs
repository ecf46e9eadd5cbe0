//! Light obfuscation for stored envelopes.
//!
//! XOR with a fixed key, then base64. This keeps casual snooping in a storage
//! inspector from reading phone numbers at a glance. It is not encryption:
//! anyone with this source can reverse it. Confidentiality would need an
//! authenticated cipher and a different storage contract.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::StorageError;

/// Marks an obfuscated payload so plain JSON still decodes.
pub const PREFIX: &str = "obf1:";

const KEY: &[u8] = b"enrollment-flow/v1";

fn xor(bytes: &mut [u8]) {
    for (i, b) in bytes.iter_mut().enumerate() {
        *b ^= KEY[i % KEY.len()];
    }
}

/// Obfuscate `plain` into a prefixed base64 string.
pub fn obfuscate(plain: &str) -> String {
    let mut bytes = plain.as_bytes().to_vec();
    xor(&mut bytes);
    format!("{PREFIX}{}", STANDARD.encode(bytes))
}

/// Reverse [`obfuscate`]. Input without the prefix is returned unchanged.
pub fn deobfuscate(stored: &str) -> Result<String, StorageError> {
    let Some(encoded) = stored.strip_prefix(PREFIX) else {
        return Ok(stored.to_string());
    };
    let mut bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| StorageError::Obfuscation(e.to_string()))?;
    xor(&mut bytes);
    String::from_utf8(bytes).map_err(|e| StorageError::Obfuscation(e.to_string()))
}

/// Whether a stored value carries the obfuscation prefix.
pub fn is_obfuscated(stored: &str) -> bool {
    stored.starts_with(PREFIX)
}
