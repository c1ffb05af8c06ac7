use secp256k1::{
    global::SECP256K1, rand, Keypair, SecretKey as Secp256k1SecretKey, XOnlyPublicKey,
};
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretKeyError {
    #[error("secret key should be 64-char hex, got '{0}' chars")]
    InvalidLength(usize),

    #[error("invalid hex encoding")]
    InvalidHex(#[from] lowercase_hex::FromHexError),

    #[error("secret key scalar not in range")]
    OutOfRange,
}

#[derive(Error, Debug)]
pub enum PubKeyError {
    #[error("invalid hex encoding")]
    InvalidHex(#[from] lowercase_hex::FromHexError),

    #[error("invalid public key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("public key not in curve")]
    NotInCurve,
}

/// a 32-byte secret key, always a valid secp256k1 scalar
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SecretKey(pub [u8; 32]);

impl SecretKey {
    /// draw a fresh random secret key; out-of-range scalars are redrawn
    /// internally so the result is always valid
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let keypair = Keypair::new(SECP256K1, &mut rng);
        SecretKey(keypair.secret_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, SecretKeyError> {
        let _ = Secp256k1SecretKey::from_byte_array(bytes)
            .map_err(|_| SecretKeyError::OutOfRange)?;

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, SecretKeyError> {
        if hex_str.len() != 64 {
            return Err(SecretKeyError::InvalidLength(hex_str.len()));
        }

        let mut bytes = [0u8; 32];
        lowercase_hex::decode_to_slice(hex_str, &mut bytes)?;

        Self::from_bytes(bytes)
    }

    pub fn to_hex(&self) -> String {
        lowercase_hex::encode(self.0)
    }

    /// the x-only public key for this secret key
    pub fn pubkey(&self) -> PubKey {
        let secret_key = Secp256k1SecretKey::from_byte_array(self.0)
            .expect("secret keys are validated on construction");
        let keypair = Keypair::from_secret_key(SECP256K1, &secret_key);
        let (xonly_pk, _) = XOnlyPublicKey::from_keypair(&keypair);
        PubKey(xonly_pk.serialize())
    }

    pub(crate) fn to_ecdh_key(&self) -> Secp256k1SecretKey {
        Secp256k1SecretKey::from_byte_array(self.0)
            .expect("secret keys are validated on construction")
    }
}

impl Serialize for SecretKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SecretKey::from_hex(&s).map_err(Error::custom)
    }
}

// no Display and a redacted Debug: secret keys must never end up in logs
impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<sk:redacted>")
    }
}

/// a 32-byte x-only public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubKey(pub [u8; 32]);

impl PubKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, PubKeyError> {
        let _ = XOnlyPublicKey::from_byte_array(bytes).map_err(|_| PubKeyError::NotInCurve)?;

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, PubKeyError> {
        if hex_str.len() != 64 {
            return Err(PubKeyError::InvalidLength(hex_str.len() / 2));
        }
        let mut bytes = [0u8; 32];
        lowercase_hex::decode_to_slice(hex_str, &mut bytes)?;

        Self::from_bytes(bytes)
    }

    pub fn to_hex(&self) -> String {
        lowercase_hex::encode(self.0)
    }

    pub(crate) fn to_ecdh_key(&self) -> secp256k1::PublicKey {
        // x-only keys are lifted to full points with the even-y prefix
        let mut buf = [0u8; 33];
        buf[0] = 2;
        buf[1..].copy_from_slice(&self.0);

        secp256k1::PublicKey::from_byte_array_compressed(buf)
            .expect("pubkeys are validated on construction")
    }
}

/// ECDH: the x coordinate of the peer point multiplied by our scalar
pub fn shared_secret(sk: &SecretKey, peer: &PubKey) -> [u8; 32] {
    let point = secp256k1::ecdh::shared_secret_point(&peer.to_ecdh_key(), &sk.to_ecdh_key());

    let mut x = [0u8; 32];
    x.copy_from_slice(&point[0..32]);
    x
}

impl Serialize for PubKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PubKey::from_hex(&s).map_err(Error::custom)
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<pk:{}>", self.to_hex())
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<pk={}>", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_always_valid() {
        for _ in 0..16 {
            let sk = SecretKey::generate();
            assert!(SecretKey::from_bytes(sk.0).is_ok());
            assert_eq!(sk.pubkey().to_hex().len(), 64);
        }
    }

    #[test]
    fn test_hex_round_trip() {
        let sk = SecretKey::generate();
        let back = SecretKey::from_hex(&sk.to_hex()).unwrap();
        assert_eq!(sk, back);

        let pk = sk.pubkey();
        let back = PubKey::from_hex(&pk.to_hex()).unwrap();
        assert_eq!(pk, back);
    }

    #[test]
    fn test_reject_invalid_scalars() {
        assert!(SecretKey::from_bytes([0u8; 32]).is_err());
        assert!(SecretKey::from_bytes([0xff; 32]).is_err());
        assert!(SecretKey::from_hex("0f").is_err());
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let a = SecretKey::generate();
        let b = SecretKey::generate();

        assert_eq!(
            shared_secret(&a, &b.pubkey()),
            shared_secret(&b, &a.pubkey())
        );
    }
}
