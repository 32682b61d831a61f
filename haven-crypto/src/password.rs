//! Password-sealed blobs: Argon2id key derivation + ChaCha20-Poly1305.
//!
//! The salt and KDF parameters travel with the ciphertext, so the password is
//! the only input needed to open the blob and no raw key has to be kept around.

use crate::cipher::{decrypt, encrypt, EncryptedData, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{derive_key, KdfParams, Salt, SALT_SIZE};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSealed {
    pub salt: String,
    pub iv: String,
    pub ciphertext: String,
    pub kdf: KdfParams,
}

/// Seals `plaintext` under a key derived from `password` and a fresh salt.
pub fn seal_with_password(
    password: &str,
    plaintext: &[u8],
    params: &KdfParams,
) -> CryptoResult<PasswordSealed> {
    let salt = Salt::random();
    let key = derive_key(password, &salt, params)?;
    let sealed = encrypt(&key, plaintext)?;

    Ok(PasswordSealed {
        salt: STANDARD.encode(salt.as_bytes()),
        iv: STANDARD.encode(sealed.nonce),
        ciphertext: STANDARD.encode(&sealed.ciphertext),
        kdf: *params,
    })
}

/// Opens a blob produced by [`seal_with_password`].
pub fn open_with_password(password: &str, sealed: &PasswordSealed) -> CryptoResult<Vec<u8>> {
    let salt_bytes = decode_fixed::<SALT_SIZE>("salt", &sealed.salt)?;
    let nonce = decode_fixed::<NONCE_SIZE>("iv", &sealed.iv)?;
    let ciphertext = STANDARD
        .decode(&sealed.ciphertext)
        .map_err(|e| CryptoError::Encoding(format!("ciphertext: {e}")))?;

    let key = derive_key(password, &Salt::from_bytes(salt_bytes), &sealed.kdf)?;
    decrypt(&key, &EncryptedData { nonce, ciphertext })
}

fn decode_fixed<const N: usize>(field: &str, encoded: &str) -> CryptoResult<[u8; N]> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::Encoding(format!("{field}: {e}")))?;
    if bytes.len() != N {
        return Err(CryptoError::Encoding(format!(
            "{field}: expected {N} bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}
