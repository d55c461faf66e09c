//! Write-key derivation for gateway commands.
//! AES-128-CBC over the session token, keyed by the gateway password.

use crate::error::{AqaraError, Result};
use aes::Aes128;
use cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};

/// Derive the one-time `key` field carried in every `write` payload.
///
/// The gateway hands out a fresh 16-character `token` with each heartbeat; the
/// proof of authorization is AES-128-CBC(`password`, `iv`) applied to that token,
/// lowercase-hex encoded. Token and password are exactly one AES block, so the
/// CBC run collapses to a single block: `AES(password, token XOR iv)`.
pub fn gateway_key(token: &str, password: &str, iv: &[u8; 16]) -> Result<String> {
    let token = token.as_bytes();
    let password = password.as_bytes();
    if token.len() != 16 {
        return Err(AqaraError::InvalidKeyMaterial(format!(
            "token must be 16 bytes, got {}",
            token.len()
        )));
    }
    if password.len() != 16 {
        return Err(AqaraError::InvalidKeyMaterial(format!(
            "password must be 16 bytes, got {}",
            password.len()
        )));
    }

    let cipher = Aes128::new(GenericArray::from_slice(password));
    let mut block = [0u8; 16];
    for (i, b) in block.iter_mut().enumerate() {
        *b = token[i] ^ iv[i];
    }
    let mut block = GenericArray::from(block);
    cipher.encrypt_block(&mut block);
    Ok(hex::encode(block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_IV;

    const TOKEN: &str = "1234567890abcdef";
    const PASSWORD: &str = "o8cwp5hsyfnsyqbe";

    #[test]
    fn key_is_32_lowercase_hex_chars() {
        let key = gateway_key(TOKEN, PASSWORD, &DEFAULT_IV).unwrap();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, key.to_lowercase());
    }

    #[test]
    fn key_is_deterministic() {
        let a = gateway_key(TOKEN, PASSWORD, &DEFAULT_IV).unwrap();
        let b = gateway_key(TOKEN, PASSWORD, &DEFAULT_IV).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn key_changes_with_token() {
        let a = gateway_key(TOKEN, PASSWORD, &DEFAULT_IV).unwrap();
        let b = gateway_key("fedcba0987654321", PASSWORD, &DEFAULT_IV).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn key_changes_with_iv() {
        let a = gateway_key(TOKEN, PASSWORD, &DEFAULT_IV).unwrap();
        let b = gateway_key(TOKEN, PASSWORD, &[0u8; 16]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_short_token() {
        assert!(gateway_key("short", PASSWORD, &DEFAULT_IV).is_err());
    }

    #[test]
    fn rejects_short_password() {
        assert!(gateway_key(TOKEN, "short", &DEFAULT_IV).is_err());
    }
}
