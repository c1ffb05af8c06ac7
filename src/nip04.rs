use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose, Engine as _};
use secp256k1::rand::{self, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{keys, PubKey, SecretKey};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Error, Debug, PartialEq)]
pub enum DecryptError {
    #[error("missing '?iv=' separator")]
    MissingIv,

    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("invalid iv length: expected 16 bytes, got {0}")]
    InvalidIvLength(usize),

    #[error("invalid padding")]
    InvalidPadding,
}

fn cipher_key(sk: &SecretKey, peer: &PubKey) -> [u8; 32] {
    Sha256::digest(keys::shared_secret(sk, peer)).into()
}

/// legacy scheme: AES-256-CBC over a hashed ECDH secret, payload is
/// `base64(ciphertext) + "?iv=" + base64(iv)`
pub fn encrypt(plaintext: &str, sk: &SecretKey, peer: &PubKey) -> String {
    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);
    encrypt_with_iv(plaintext, sk, peer, iv)
}

pub fn encrypt_with_iv(plaintext: &str, sk: &SecretKey, peer: &PubKey, iv: [u8; 16]) -> String {
    let key = cipher_key(sk, peer);

    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    format!(
        "{}?iv={}",
        general_purpose::STANDARD.encode(&ciphertext),
        general_purpose::STANDARD.encode(iv)
    )
}

pub fn decrypt(payload: &str, sk: &SecretKey, peer: &PubKey) -> Result<String, DecryptError> {
    let (ct_b64, iv_b64) = payload.split_once("?iv=").ok_or(DecryptError::MissingIv)?;

    let ciphertext = general_purpose::STANDARD.decode(ct_b64)?;
    let iv_bytes = general_purpose::STANDARD.decode(iv_b64)?;
    let iv: [u8; 16] = iv_bytes
        .try_into()
        .map_err(|v: Vec<u8>| DecryptError::InvalidIvLength(v.len()))?;

    let key = cipher_key(sk, peer);

    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| DecryptError::InvalidPadding)?;

    Ok(String::from_utf8_lossy(&plaintext).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypairs() -> (SecretKey, PubKey, SecretKey, PubKey) {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        let apk = a.pubkey();
        let bpk = b.pubkey();
        (a, apk, b, bpk)
    }

    #[test]
    fn test_round_trip() {
        let (a, apk, b, bpk) = keypairs();

        for plaintext in ["x", "hello world", "üñïçødé ✓", &"long ".repeat(500)] {
            let payload = encrypt(plaintext, &a, &bpk);
            assert!(payload.contains("?iv="));

            let decrypted = decrypt(&payload, &b, &apk).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_deterministic_with_fixed_iv() {
        let (a, _, _, bpk) = keypairs();
        let iv = [7u8; 16];

        assert_eq!(
            encrypt_with_iv("same", &a, &bpk, iv),
            encrypt_with_iv("same", &a, &bpk, iv)
        );
    }

    #[test]
    fn test_missing_separator() {
        let (a, apk, ..) = keypairs();
        assert_eq!(
            decrypt("bm90aGluZyB0byBzZWU=", &a, &apk),
            Err(DecryptError::MissingIv)
        );
    }

    #[test]
    fn test_bad_iv_length() {
        let (a, apk, ..) = keypairs();
        let payload = format!(
            "{}?iv={}",
            general_purpose::STANDARD.encode([0u8; 32]),
            general_purpose::STANDARD.encode([0u8; 8])
        );
        assert_eq!(
            decrypt(&payload, &a, &apk),
            Err(DecryptError::InvalidIvLength(8))
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let (a, _, b, bpk) = keypairs();
        let payload = encrypt("secret", &a, &bpk);

        // decrypting against an unrelated key either unpads garbage or fails;
        // it must never return the plaintext
        let eve = SecretKey::generate();
        match decrypt(&payload, &eve, &b.pubkey()) {
            Ok(garbage) => assert_ne!(garbage, "secret"),
            Err(err) => assert_eq!(err, DecryptError::InvalidPadding),
        }
    }
}
