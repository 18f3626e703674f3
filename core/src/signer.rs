// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signer Facade (component D, `spec.md` §4.D/§6.3).
//!
//! The core treats signing as an opaque external operation; this module is
//! the one place in the crate allowed to touch a private key. Two key
//! families are supported, both unencrypted PKCS8: RSA (PKCS#1 v1.5 over
//! SHA-256) and EC P-256 (ECDSA over SHA-256) — the same family
//! `ed25519-dalek` comes from in the corpus's other crypto-touching crate.

use crate::error::{RepoError, Result};
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::pkcs1v15;
use rsa::pkcs8::{DecodePrivateKey as RsaDecodePrivateKey, DecodePublicKey as RsaDecodePublicKey};
use rsa::signature::{Signer as RsaSigner, Verifier as RsaVerifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::Path;

/// A loaded private key, ready to sign.
pub enum PrivateKey {
    Rsa(RsaPrivateKey),
    EcP256(p256::ecdsa::SigningKey),
}

/// A loaded public key, ready to verify.
pub enum PublicKey {
    Rsa(RsaPublicKey),
    EcP256(p256::ecdsa::VerifyingKey),
}

impl PrivateKey {
    /// Parses an unencrypted PKCS8 PEM, trying RSA first and then EC P-256.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self> {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
            return Ok(Self::Rsa(key));
        }
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            return Ok(Self::EcP256(key));
        }
        Err(RepoError::Key(
            "not a recognized unencrypted PKCS8 RSA or EC P-256 private key".to_string(),
        ))
    }

    pub fn from_pkcs8_pem_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pkcs8_pem(&pem)
    }

    /// Derives this key's public counterpart, PEM-encoded (`spec.md`
    /// §6.3's `derivePublicKey`).
    pub fn derive_public_key_pem(&self) -> Result<String> {
        use p256::pkcs8::EncodePublicKey;
        use rsa::pkcs8::EncodePublicKey as RsaEncodePublicKey;
        match self {
            Self::Rsa(key) => key
                .to_public_key()
                .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
                .map_err(|e| RepoError::Key(e.to_string())),
            Self::EcP256(key) => key
                .verifying_key()
                .to_public_key_pem(p256::pkcs8::LineEnding::LF)
                .map_err(|e| RepoError::Key(e.to_string())),
        }
    }

    fn sign_bytes(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Rsa(key) => {
                let signing_key = pkcs1v15::SigningKey::<Sha256>::new(key.clone());
                signing_key.sign(data).to_vec()
            }
            Self::EcP256(key) => {
                let sig: p256::ecdsa::Signature = key.sign(data);
                sig.to_der().as_bytes().to_vec()
            }
        }
    }
}

impl PublicKey {
    pub fn from_pem(pem: &str) -> Result<Self> {
        if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
            return Ok(Self::Rsa(key));
        }
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_pem(pem) {
            return Ok(Self::EcP256(key));
        }
        Err(RepoError::Key(
            "not a recognized PEM RSA or EC P-256 public key".to_string(),
        ))
    }

    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pem(&pem)
    }

    fn verify_bytes(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            Self::Rsa(key) => {
                let verifying_key = pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
                let sig = pkcs1v15::Signature::try_from(signature)
                    .map_err(|e| RepoError::Signing(e.to_string()))?;
                verifying_key
                    .verify(data, &sig)
                    .map_err(|e| RepoError::Signing(e.to_string()))
            }
            Self::EcP256(key) => {
                let sig = p256::ecdsa::Signature::from_der(signature)
                    .map_err(|e| RepoError::Signing(e.to_string()))?;
                key.verify(data, &sig)
                    .map_err(|e| RepoError::Signing(e.to_string()))
            }
        }
    }
}

/// Signs `file`'s current bytes and prepends the Base64 signature as a new
/// first line, per `spec.md` §4.D's invariant: "first line is the signature
/// line; body starts at byte following that newline."
pub fn sign(key: &PrivateKey, file: &Path) -> Result<()> {
    use base64::Engine;
    let body = std::fs::read(file)?;
    let signature = key.sign_bytes(&body);
    let encoded = base64::engine::general_purpose::STANDARD.encode(signature);

    let mut out = Vec::with_capacity(encoded.len() + 1 + body.len());
    out.extend_from_slice(encoded.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(&body);
    std::fs::write(file, out)?;
    Ok(())
}

/// Verifies a file signed by [`sign`]: reads the first line as the
/// signature, validates it against the remaining bytes.
pub fn verify(key: &PublicKey, file: &Path) -> Result<()> {
    let contents = std::fs::read(file)?;
    let newline = contents
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| RepoError::Signing(format!("{}: no signature line", file.display())))?;
    let (sig_line, rest) = contents.split_at(newline);
    let body = &rest[1..];

    use base64::Engine;
    let signature = base64::engine::general_purpose::STANDARD
        .decode(sig_line)
        .map_err(|e| RepoError::Signing(format!("malformed signature line: {e}")))?;

    key.verify_bytes(body, &signature)
}

/// Signs `body` in memory, returning the same `<signature>\n<body>` framing
/// [`sign`] writes to disk, for callers (the publisher) that hold bytes
/// before they're ever written to their final path.
pub fn sign_bytes_framed(key: &PrivateKey, body: &[u8]) -> Vec<u8> {
    use base64::Engine;
    let signature = key.sign_bytes(body);
    let encoded = base64::engine::general_purpose::STANDARD.encode(signature);
    let mut out = Vec::with_capacity(encoded.len() + 1 + body.len());
    out.extend_from_slice(encoded.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;

    fn rsa_test_key() -> PrivateKey {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        PrivateKey::Rsa(key)
    }

    fn ec_test_key() -> PrivateKey {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        PrivateKey::EcP256(key)
    }

    #[test]
    fn rsa_round_trip_sign_verify() {
        let key = rsa_test_key();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.txt");
        std::fs::write(&path, b"com.example.app:1\n1700000000000\n").unwrap();

        sign(&key, &path).unwrap();
        let pub_pem = key.derive_public_key_pem().unwrap();
        let public_key = PublicKey::from_pem(&pub_pem).unwrap();
        verify(&public_key, &path).unwrap();
    }

    #[test]
    fn ec_round_trip_sign_verify() {
        let key = ec_test_key();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bulk-metadata.json");
        std::fs::write(&path, b"{\"packages\":[]}").unwrap();

        sign(&key, &path).unwrap();
        let pub_pem = key.derive_public_key_pem().unwrap();
        let public_key = PublicKey::from_pem(&pub_pem).unwrap();
        verify(&public_key, &path).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let key = rsa_test_key();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.txt");
        std::fs::write(&path, b"com.example.app:1\n").unwrap();
        sign(&key, &path).unwrap();

        let mut contents = std::fs::read(&path).unwrap();
        *contents.last_mut().unwrap() ^= 0xff;
        std::fs::write(&path, contents).unwrap();

        let pub_pem = key.derive_public_key_pem().unwrap();
        let public_key = PublicKey::from_pem(&pub_pem).unwrap();
        assert!(verify(&public_key, &path).is_err());
    }

    #[test]
    fn rsa_key_encodes_and_reparses_as_pkcs8() {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pem = key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        assert!(PrivateKey::from_pkcs8_pem(&pem).is_ok());
    }
}
