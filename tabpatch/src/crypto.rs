// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    env::{self, VarError},
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey, pkcs1::DecodeRsaPrivateKey,
    traits::PublicKeyParts,
};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tracing::debug;

use crate::format::avb;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Signature algorithm not supported: {0:?}")]
    UnsupportedAlgorithm(SignatureAlgorithm),
    #[error("RSA key size ({}) not supported", .0 * 8)]
    UnsupportedKeySize(usize),
    #[error("Invalid digest length ({0} bytes) for {1:?}")]
    InvalidDigestLength(usize, SignatureAlgorithm),
    #[error("Failed to read environment variable: {0:?}")]
    InvalidEnvVar(OsString, #[source] VarError),
    #[error("Failed to load encrypted RSA private key")]
    LoadKeyEncrypted(#[source] pkcs8::Error),
    #[error("Failed to load PKCS8 RSA private key")]
    LoadKeyPkcs8(#[source] pkcs8::Error),
    #[error("Failed to load PKCS1 RSA private key")]
    LoadKeyPkcs1(#[source] rsa::pkcs1::Error),
    #[error("Failed to load RSA public key")]
    LoadPubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to encode AVB public key")]
    EncodeAvbKey(#[source] Box<avb::Error>),
    #[error("Key {path:?} has fingerprint {actual}, but is configured as {expected}")]
    FingerprintMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] Box<rsa::Error>),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] Box<rsa::Error>),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum SignatureAlgorithm {
    Sha1WithRsa,
    Sha256WithRsa,
    Sha512WithRsa,
}

impl SignatureAlgorithm {
    /// Length of digest required by the signing algorithm.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1WithRsa => Sha1::output_size(),
            Self::Sha256WithRsa => Sha256::output_size(),
            Self::Sha512WithRsa => Sha512::output_size(),
        }
    }

    /// Compute the digest of the specified data.
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1WithRsa => Sha1::digest(data).to_vec(),
            Self::Sha256WithRsa => Sha256::digest(data).to_vec(),
            Self::Sha512WithRsa => Sha512::digest(data).to_vec(),
        }
    }
}

/// Where to get the passphrase for an encrypted private key.
#[derive(Clone, Debug, Default)]
pub enum PassphraseSource {
    /// The key is expected to be unencrypted.
    #[default]
    None,
    EnvVar(OsString),
    File(PathBuf),
}

impl PassphraseSource {
    pub fn acquire(&self) -> Result<String> {
        let passphrase = match self {
            Self::None => String::new(),
            Self::EnvVar(v) => env::var(v).map_err(|e| Error::InvalidEnvVar(v.clone(), e))?,
            Self::File(p) => fs::read_to_string(p)
                .map_err(|e| Error::ReadFile(p.clone(), e))?
                .trim_end_matches(['\r', '\n'])
                .to_owned(),
        };

        Ok(passphrase)
    }
}

fn check_key_size(size: usize) -> Result<()> {
    // RustCrypto does not support 8192-bit keys.
    if size > 4096 / 8 {
        return Err(Error::UnsupportedKeySize(size));
    }

    Ok(())
}

/// An RSA private key usable for AVB signing.
#[derive(Clone, Debug)]
pub struct RsaSigningKey(RsaPrivateKey);

impl RsaSigningKey {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self(key)
    }

    /// Size of key in bytes.
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Get the public key portion of the signing key.
    pub fn to_public_key(&self) -> RsaPublicKey {
        self.0.to_public_key()
    }

    /// SHA-1 of the key's AVB public key blob, as used in key mappings.
    pub fn fingerprint(&self) -> Result<String> {
        let blob = avb::encode_public_key(&self.to_public_key())
            .map_err(|e| Error::EncodeAvbKey(Box::new(e)))?;

        Ok(avb_key_fingerprint(&blob))
    }

    /// Sign the digest with the specified signature algorithm.
    pub fn sign(&self, algo: SignatureAlgorithm, digest: &[u8]) -> Result<Vec<u8>> {
        if digest.len() != algo.digest_len() {
            return Err(Error::InvalidDigestLength(digest.len(), algo));
        }

        check_key_size(self.size())?;

        let scheme = match algo {
            // We don't support signing with insecure algorithms.
            SignatureAlgorithm::Sha1WithRsa => return Err(Error::UnsupportedAlgorithm(algo)),
            SignatureAlgorithm::Sha256WithRsa => Pkcs1v15Sign::new::<Sha256>(),
            SignatureAlgorithm::Sha512WithRsa => Pkcs1v15Sign::new::<Sha512>(),
        };

        self.0
            .sign(scheme, digest)
            .map_err(|e| Error::RsaSign(Box::new(e)))
    }
}

pub trait RsaPublicKeyExt {
    fn verify_sig(&self, algo: SignatureAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()>;
}

impl RsaPublicKeyExt for RsaPublicKey {
    /// Verify the signature against the specified key.
    fn verify_sig(&self, algo: SignatureAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()> {
        // Check this explicitly so we can provide a better error message.
        if digest.len() != algo.digest_len() {
            return Err(Error::InvalidDigestLength(digest.len(), algo));
        }

        check_key_size(self.size())?;

        let scheme = match algo {
            SignatureAlgorithm::Sha1WithRsa => Pkcs1v15Sign::new::<Sha1>(),
            SignatureAlgorithm::Sha256WithRsa => Pkcs1v15Sign::new::<Sha256>(),
            SignatureAlgorithm::Sha512WithRsa => Pkcs1v15Sign::new::<Sha512>(),
        };

        self.verify(scheme, digest, signature)
            .map_err(|e| Error::RsaVerify(Box::new(e)))
    }
}

/// Hex SHA-1 of an AVB public key blob.
pub fn avb_key_fingerprint(blob: &[u8]) -> String {
    hex::encode(Sha1::digest(blob))
}

/// Parse a PEM-encoded RSA private key. PKCS8 (optionally encrypted) and the
/// legacy PKCS1 `RSA PRIVATE KEY` format used by the AOSP test keys are both
/// accepted.
pub fn parse_pem_key(data: &str, source: &PassphraseSource) -> Result<RsaSigningKey> {
    let key = if data.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(data).map_err(Error::LoadKeyPkcs1)?
    } else if data.contains("ENCRYPTED") {
        let passphrase = source.acquire()?;

        RsaPrivateKey::from_pkcs8_encrypted_pem(data, passphrase)
            .map_err(Error::LoadKeyEncrypted)?
    } else {
        RsaPrivateKey::from_pkcs8_pem(data).map_err(Error::LoadKeyPkcs8)?
    };

    Ok(RsaSigningKey::new(key))
}

/// Read a PEM-encoded RSA private key from a file.
pub fn read_pem_key_file(path: &Path, source: &PassphraseSource) -> Result<RsaSigningKey> {
    let data = fs::read_to_string(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    parse_pem_key(&data, source)
}

/// Read a PEM-encoded PKCS8 public key from a file.
pub fn read_pem_public_key_file(path: &Path) -> Result<RsaPublicKey> {
    let data = fs::read_to_string(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    RsaPublicKey::from_public_key_pem(&data).map_err(Error::LoadPubKey)
}

/// Private keys indexed by the SHA-1 fingerprint of their AVB public key blob.
/// An image's embedded public key selects the key that re-signs it.
#[derive(Clone, Default)]
pub struct KeyRing {
    keys: BTreeMap<String, RsaSigningKey>,
    fallback: Option<String>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every key in `mapping`. Relative paths are resolved against
    /// `base_dir`. Keys whose files do not exist are skipped, but a key whose
    /// actual fingerprint differs from the configured one is an error.
    pub fn load(
        mapping: &BTreeMap<String, PathBuf>,
        fallback: Option<&str>,
        base_dir: &Path,
    ) -> Result<Self> {
        let mut ring = Self::new();

        for (expected, path) in mapping {
            let path = base_dir.join(path);
            if !path.exists() {
                debug!("Skipping missing key: {path:?}");
                continue;
            }

            let key = read_pem_key_file(&path, &PassphraseSource::None)?;
            let actual = key.fingerprint()?;

            if !actual.eq_ignore_ascii_case(expected) {
                return Err(Error::FingerprintMismatch {
                    path,
                    expected: expected.clone(),
                    actual,
                });
            }

            debug!("Loaded key {actual} from {path:?}");
            ring.keys.insert(actual, key);
        }

        ring.fallback = fallback.map(|f| f.to_ascii_lowercase());

        Ok(ring)
    }

    /// Add a key and return its fingerprint.
    pub fn insert(&mut self, key: RsaSigningKey) -> Result<String> {
        let fingerprint = key.fingerprint()?;
        self.keys.insert(fingerprint.clone(), key);
        Ok(fingerprint)
    }

    pub fn set_fallback(&mut self, fingerprint: Option<String>) {
        self.fallback = fingerprint;
    }

    pub fn get(&self, fingerprint: &str) -> Option<&RsaSigningKey> {
        self.keys.get(&fingerprint.to_ascii_lowercase())
    }

    /// Find the private key matching an AVB public key blob.
    pub fn for_avb_key(&self, blob: &[u8]) -> Option<&RsaSigningKey> {
        self.get(&avb_key_fingerprint(blob))
    }

    /// Like [`Self::for_avb_key`], but falls back to the configured default
    /// key when the blob is empty or unknown.
    pub fn for_avb_key_or_fallback(&self, blob: &[u8]) -> Option<&RsaSigningKey> {
        if !blob.is_empty() {
            if let Some(key) = self.for_avb_key(blob) {
                return Some(key);
            }
        }

        self.fallback.as_deref().and_then(|f| self.get(f))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
