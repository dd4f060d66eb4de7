//! CGS Crypto - the confidentiality and authenticity primitives of the
//! disclosure protocol.
//!
//! Secrets, tokens and accepted documents leave the ledger only wrapped under
//! the requester's ephemeral RSA public key: a fresh 256-bit AES key is
//! encapsulated with RSA-OAEP (SHA-256) and the payload is wrapped with AES
//! key-wrap-with-padding; the output is the concatenation of the two blocks.
//! Workload-submitted payloads are authenticated with RSA-PSS (SHA-256,
//! 32-byte salt) signatures.

#![deny(unsafe_code)]

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Attestation report_data is 64 bytes; the key binding occupies the first 32.
pub const REPORT_DATA_LEN: usize = 64;

const AES_KEY_LEN: usize = 32;
const PSS_SALT_LEN: usize = 32;
const SIGNING_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("wrapping the response failed: {0}")]
    WrapFailed(String),

    #[error("unwrapping the response failed: {0}")]
    UnwrapFailed(String),

    #[error("Signature verification was not successful.")]
    SignatureMismatch,

    #[error("signing failed: {0}")]
    SignFailed(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}

/// Wrap `payload` for the holder of `recipient_public_key_pem`.
///
/// Output layout: `rsa_oaep(aes_key) || aes_kwp(payload)`, where the RSA block
/// length equals the recipient modulus size.
pub fn wrap_rsa_oaep_aes_kwp(
    payload: &[u8],
    recipient_public_key_pem: &str,
) -> Result<Vec<u8>, CryptoError> {
    let recipient = RsaPublicKey::from_public_key_pem(recipient_public_key_pem)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

    let mut aes_key = Zeroizing::new([0u8; AES_KEY_LEN]);
    rand::thread_rng().fill_bytes(aes_key.as_mut());

    let mut wrapped = recipient
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), aes_key.as_ref())
        .map_err(|e| CryptoError::WrapFailed(e.to_string()))?;

    let kek = aes_kw::KekAes256::from(*aes_key);
    let bulk = kek
        .wrap_with_padding_vec(payload)
        .map_err(|e| CryptoError::WrapFailed(e.to_string()))?;

    wrapped.extend_from_slice(&bulk);
    Ok(wrapped)
}

/// Reverse of [`wrap_rsa_oaep_aes_kwp`]; the client-side (and test) path.
pub fn unwrap_rsa_oaep_aes_kwp(
    blob: &[u8],
    recipient_key: &RsaPrivateKey,
) -> Result<Vec<u8>, CryptoError> {
    let rsa_len = recipient_key.size();
    if blob.len() <= rsa_len {
        return Err(CryptoError::UnwrapFailed(format!(
            "wrapped blob of {} bytes is too short for a {}-byte RSA block",
            blob.len(),
            rsa_len
        )));
    }
    let (encapsulated, bulk) = blob.split_at(rsa_len);

    let aes_key = Zeroizing::new(
        recipient_key
            .decrypt(Oaep::new::<Sha256>(), encapsulated)
            .map_err(|e| CryptoError::UnwrapFailed(e.to_string()))?,
    );
    let key: [u8; AES_KEY_LEN] = aes_key
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::UnwrapFailed("encapsulated key has wrong length".into()))?;

    aes_kw::KekAes256::from(key)
        .unwrap_with_padding_vec(bulk)
        .map_err(|e| CryptoError::UnwrapFailed(e.to_string()))
}

/// Verify an RSA-PSS (SHA-256, 32-byte salt) signature over `data`.
///
/// The public key travels as base64-wrapped PEM, the way workloads submit it
/// alongside their attestation evidence.
pub fn verify_signature(
    public_key_b64: &str,
    signature_b64: &str,
    data: &[u8],
) -> Result<(), CryptoError> {
    let pem = decode_b64_string(public_key_b64)?;
    let public_key = RsaPublicKey::from_public_key_pem(&pem)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let signature = B64
        .decode(signature_b64)
        .map_err(|e| CryptoError::InvalidBase64(e.to_string()))?;

    let digest = Sha256::digest(data);
    public_key
        .verify(Pss::new_with_salt::<Sha256>(PSS_SALT_LEN), &digest, &signature)
        .map_err(|_| CryptoError::SignatureMismatch)
}

/// Produce an RSA-PSS signature over `data`. The ledger itself only verifies;
/// this is the workload/client side used in tests and tooling.
pub fn sign(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(data);
    key.sign_with_rng(
        &mut rand::thread_rng(),
        Pss::new_with_salt::<Sha256>(PSS_SALT_LEN),
        &digest,
    )
    .map_err(|e| CryptoError::SignFailed(e.to_string()))
}

/// The report-data binding for a caller-supplied public key: SHA-256 of the
/// base64 string itself, zero-padded to the 64-byte report_data width.
pub fn report_data_for_key(public_key_b64: &str) -> [u8; REPORT_DATA_LEN] {
    let mut out = [0u8; REPORT_DATA_LEN];
    let digest = Sha256::digest(public_key_b64.as_bytes());
    out[..digest.len()].copy_from_slice(&digest);
    out
}

/// Decode a base64 string into UTF-8 text (base64-wrapped PEM keys).
pub fn decode_b64_string(b64: &str) -> Result<String, CryptoError> {
    let bytes = B64
        .decode(b64)
        .map_err(|e| CryptoError::InvalidBase64(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| CryptoError::InvalidBase64(e.to_string()))
}

/// Asymmetric signing key for the token issuer.
pub struct SigningKey {
    kid: String,
    public_key_pem: String,
    private_key_pem: Zeroizing<String>,
}

impl SigningKey {
    /// Generate a fresh 2048-bit RSA signing key. The key id is derived from
    /// the public key digest so re-provisioning rotates the `kid`.
    pub fn generate() -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), SIGNING_KEY_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Self::from_private_key(&private)
    }

    pub fn from_private_key(private: &RsaPrivateKey) -> Result<Self, CryptoError> {
        let public_key_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let private_key_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let kid = hex::encode(&Sha256::digest(public_key_pem.as_bytes())[..16]);
        Ok(Self {
            kid,
            public_key_pem,
            private_key_pem: Zeroizing::new(private_key_pem.to_string()),
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").field("kid", &self.kid).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_recipient() -> (RsaPrivateKey, String) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (private, pem)
    }

    #[test]
    fn wrap_roundtrip() {
        let (private, pem) = test_recipient();
        let payload = b"the quick confidential fox";

        let blob = wrap_rsa_oaep_aes_kwp(payload, &pem).unwrap();
        // RSA block (2048-bit modulus) plus the KWP block with its padding.
        assert!(blob.len() > 256 + payload.len());

        let unwrapped = unwrap_rsa_oaep_aes_kwp(&blob, &private).unwrap();
        assert_eq!(unwrapped, payload);
    }

    #[test]
    fn unwrap_with_wrong_key_fails() {
        let (_, pem) = test_recipient();
        let (other, _) = test_recipient();
        let blob = wrap_rsa_oaep_aes_kwp(b"payload", &pem).unwrap();
        assert!(unwrap_rsa_oaep_aes_kwp(&blob, &other).is_err());
    }

    #[test]
    fn signature_roundtrip_and_tamper() {
        let (private, pem) = test_recipient();
        let key_b64 = B64.encode(&pem);
        let data = b"signed payload";

        let signature = sign(&private, data).unwrap();
        let sig_b64 = B64.encode(&signature);
        verify_signature(&key_b64, &sig_b64, data).unwrap();

        let err = verify_signature(&key_b64, &sig_b64, b"tampered payload").unwrap_err();
        assert!(matches!(err, CryptoError::SignatureMismatch));
    }

    #[test]
    fn report_data_is_sha256_zero_padded() {
        let rd = report_data_for_key("some-base64-key");
        assert_eq!(rd.len(), REPORT_DATA_LEN);
        assert_eq!(&rd[..32], Sha256::digest(b"some-base64-key").as_slice());
        assert!(rd[32..].iter().all(|&b| b == 0));
        assert_ne!(rd, report_data_for_key("another-key"));
    }

    #[test]
    fn signing_key_kid_tracks_public_key() {
        let (private, _) = test_recipient();
        let a = SigningKey::from_private_key(&private).unwrap();
        let b = SigningKey::from_private_key(&private).unwrap();
        assert_eq!(a.kid(), b.kid());
        assert!(a.public_key_pem().starts_with("-----BEGIN PUBLIC KEY-----"));
    }
}
