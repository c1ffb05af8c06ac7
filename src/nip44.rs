use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::{keys, PubKey, SecretKey};

const VERSION: u8 = 2;
const MAX_PLAINTEXT_SIZE: usize = 65535;

// smallest decoded payload we could ever accept: version + nonce + length prefix
const MIN_PAYLOAD_SIZE: usize = 1 + 32 + 2;

#[derive(Error, Debug, PartialEq)]
pub enum EncryptError {
    #[error("plaintext must be between 1 and 65535 bytes")]
    PlaintextSize,
}

#[derive(Error, Debug, PartialEq)]
pub enum DecryptError {
    #[error("invalid payload length")]
    InvalidPayloadLength,

    #[error("unsupported version")]
    UnsupportedVersion,

    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("ciphertext authentication failed")]
    AuthenticationFailed,

    #[error("invalid padding")]
    InvalidPadding,
}

/// the long-lived key for a pair of keys: HKDF-Extract over the ECDH
/// x coordinate with a fixed protocol salt
pub fn conversation_key(peer: &PubKey, sk: &SecretKey) -> [u8; 32] {
    hkdf_extract(b"nip44-v2", &keys::shared_secret(sk, peer))
}

/// encrypt a message; a fresh random nonce is drawn unless one is supplied
/// (tests only)
pub fn encrypt(
    plaintext: &str,
    conversation_key: &[u8; 32],
    custom_nonce: Option<[u8; 32]>,
) -> Result<String, EncryptError> {
    let plain = plaintext.as_bytes();
    if plain.is_empty() || plain.len() > MAX_PLAINTEXT_SIZE {
        return Err(EncryptError::PlaintextSize);
    }

    let nonce = custom_nonce.unwrap_or_else(|| SecretKey::generate().0);
    let (cipher_key, cipher_nonce) = message_keys(conversation_key, nonce);

    // length prefix plus zero padding up to the bucket size
    let mut padded = Vec::with_capacity(padded_len(plain.len()));
    padded.extend_from_slice(&(plain.len() as u16).to_be_bytes());
    padded.extend_from_slice(plain);
    padded.resize(padded_len(plain.len()), 0);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&cipher_key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&cipher_nonce), padded.as_slice())
        .expect("chacha20poly1305 encryption is infallible for in-range inputs");

    let mut concat = Vec::with_capacity(1 + 32 + ciphertext.len());
    concat.push(VERSION);
    concat.extend_from_slice(&nonce);
    concat.extend_from_slice(&ciphertext);

    Ok(general_purpose::STANDARD.encode(&concat))
}

pub fn decrypt(payload: &str, conversation_key: &[u8; 32]) -> Result<String, DecryptError> {
    let decoded = general_purpose::STANDARD.decode(payload)?;

    if decoded.len() < MIN_PAYLOAD_SIZE {
        return Err(DecryptError::InvalidPayloadLength);
    }
    if decoded[0] != VERSION {
        return Err(DecryptError::UnsupportedVersion);
    }

    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&decoded[1..33]);
    let ciphertext = &decoded[33..];

    let (cipher_key, cipher_nonce) = message_keys(conversation_key, nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&cipher_key));
    let padded = cipher
        .decrypt(Nonce::from_slice(&cipher_nonce), ciphertext)
        .map_err(|_| DecryptError::AuthenticationFailed)?;

    if padded.len() < 2 {
        return Err(DecryptError::InvalidPadding);
    }

    let unpadded_len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if unpadded_len == 0 || 2 + unpadded_len > padded.len() {
        return Err(DecryptError::InvalidPadding);
    }

    Ok(String::from_utf8_lossy(&padded[2..2 + unpadded_len]).to_string())
}

/// per-message keys: HKDF-Expand(conversation key, info = nonce) yielding a
/// 32-byte cipher key and a 12-byte cipher nonce (the trailing 32 bytes of
/// the 76-byte expansion are reserved and unused)
fn message_keys(conversation_key: &[u8; 32], nonce: [u8; 32]) -> ([u8; 32], [u8; 12]) {
    let output = hkdf_expand(conversation_key, &nonce, 76);

    let mut cipher_key = [0u8; 32];
    let mut cipher_nonce = [0u8; 12];
    cipher_key.copy_from_slice(&output[0..32]);
    cipher_nonce.copy_from_slice(&output[32..44]);

    (cipher_key, cipher_nonce)
}

/// the padded buffer size for an unpadded plaintext of `len` bytes: the
/// smallest power-of-two bucket (minimum 32) that fits `len` plus the
/// 2-byte length prefix
fn padded_len(len: usize) -> usize {
    let needed = len + 2;
    let mut bucket = 32;
    while bucket < needed {
        bucket *= 2;
    }
    bucket
}

#[inline]
fn hkdf_extract(salt: &[u8], input_key: &[u8]) -> [u8; 32] {
    let mut hmac = <Hmac<Sha256> as Mac>::new_from_slice(salt)
        .expect("hmac can take keys of any size so this never fails");
    hmac.update(input_key);
    hmac.finalize()
        .into_bytes()
        .try_into()
        .expect("hmac sha256 output is always 32 bytes")
}

fn hkdf_expand(pseudorandom_key: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    let mut output = Vec::with_capacity(length.next_multiple_of(32));
    let mut previous: Vec<u8> = Vec::new();
    let mut counter = 1u8;

    while output.len() < length {
        let mut hmac = <Hmac<Sha256> as Mac>::new_from_slice(pseudorandom_key)
            .expect("hmac can take keys of any size so this never fails");
        hmac.update(&previous);
        hmac.update(info);
        hmac.update(&[counter]);

        let block = hmac.finalize().into_bytes();
        output.extend_from_slice(&block);
        previous = block.to_vec();
        counter += 1;
    }

    output.truncate(length);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_conversation_key() -> [u8; 32] {
        let mut ck = [0u8; 32];
        lowercase_hex::decode_to_slice(
            "a1a3d60f3470a8612633924e91febf96dc5366ce130f658b1f0fc652c20b3b54",
            &mut ck,
        )
        .unwrap();
        ck
    }

    fn assert_round_trip(plaintext: &str) {
        let ck = fixed_conversation_key();
        let payload = encrypt(plaintext, &ck, None).unwrap();
        let decrypted = decrypt(&payload, &ck).unwrap();
        assert_eq!(decrypted, plaintext, "round trip failed");
    }

    #[test]
    fn test_round_trip_sizes() {
        assert_round_trip("a");
        assert_round_trip("hello world");
        assert_round_trip(&"x".repeat(30));
        assert_round_trip(&"x".repeat(31));
        assert_round_trip(&"x".repeat(32));
        assert_round_trip(&"x".repeat(1000));
        assert_round_trip(&"x".repeat(MAX_PLAINTEXT_SIZE));
        assert_round_trip("üçïü´É ( ͡° ͜ʖ ͡°) 🦄");
    }

    #[test]
    fn test_round_trip_across_derived_keys() {
        let a = SecretKey::generate();
        let b = SecretKey::generate();

        // both sides derive the same conversation key
        let ck_a = conversation_key(&b.pubkey(), &a);
        let ck_b = conversation_key(&a.pubkey(), &b);
        assert_eq!(ck_a, ck_b);

        let payload = encrypt("signed rpc request", &ck_a, None).unwrap();
        assert_eq!(decrypt(&payload, &ck_b).unwrap(), "signed rpc request");
    }

    #[test]
    fn test_plaintext_size_limits() {
        let ck = fixed_conversation_key();
        assert_eq!(encrypt("", &ck, None), Err(EncryptError::PlaintextSize));
        assert_eq!(
            encrypt(&"x".repeat(MAX_PLAINTEXT_SIZE + 1), &ck, None),
            Err(EncryptError::PlaintextSize)
        );
    }

    #[test]
    fn test_padding_minimality() {
        let cases = vec![
            (1, 32),
            (5, 32),
            (30, 32),
            (31, 64),
            (62, 64),
            (63, 128),
            (126, 128),
            (127, 256),
            (1000, 1024),
            (16000, 16384),
            (65535, 65536),
        ];
        for (len, expected) in cases {
            assert_eq!(padded_len(len), expected, "wrong bucket for len {}", len);
        }
    }

    #[test]
    fn test_payload_size_visible_in_buckets() {
        // plaintexts in the same bucket produce equal-size payloads
        let ck = fixed_conversation_key();
        let short = encrypt("a", &ck, None).unwrap();
        let longer = encrypt(&"a".repeat(30), &ck, None).unwrap();
        assert_eq!(short.len(), longer.len());

        let over = encrypt(&"a".repeat(31), &ck, None).unwrap();
        assert!(over.len() > short.len());
    }

    #[test]
    fn test_deterministic_with_fixed_nonce() {
        let ck = fixed_conversation_key();
        let nonce = [9u8; 32];
        assert_eq!(
            encrypt("same", &ck, Some(nonce)).unwrap(),
            encrypt("same", &ck, Some(nonce)).unwrap()
        );
    }

    #[test]
    fn test_decrypt_rejects_short_payload() {
        let ck = fixed_conversation_key();
        assert_eq!(decrypt("", &ck), Err(DecryptError::InvalidPayloadLength));
        assert_eq!(
            decrypt(&general_purpose::STANDARD.encode([VERSION; 10]), &ck),
            Err(DecryptError::InvalidPayloadLength)
        );
    }

    #[test]
    fn test_decrypt_rejects_unknown_version() {
        let ck = fixed_conversation_key();
        let mut raw = vec![1u8]; // version 1
        raw.extend_from_slice(&[0u8; 80]);
        assert_eq!(
            decrypt(&general_purpose::STANDARD.encode(&raw), &ck),
            Err(DecryptError::UnsupportedVersion)
        );
    }

    #[test]
    fn test_decrypt_rejects_bad_base64() {
        let ck = fixed_conversation_key();
        assert!(matches!(
            decrypt("not!!valid@@base64##at all", &ck),
            Err(DecryptError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let ck = fixed_conversation_key();
        let payload = encrypt("authentic", &ck, None).unwrap();

        let mut raw = general_purpose::STANDARD.decode(&payload).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        assert_eq!(
            decrypt(&general_purpose::STANDARD.encode(&raw), &ck),
            Err(DecryptError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_wrong_conversation_key_fails() {
        let ck = fixed_conversation_key();
        let payload = encrypt("for someone else", &ck, None).unwrap();

        let other = [0x42u8; 32];
        assert_eq!(
            decrypt(&payload, &other),
            Err(DecryptError::AuthenticationFailed)
        );
    }
}
