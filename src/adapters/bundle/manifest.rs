//! Signed bundle manifest.
//!
//! `manifest.json` binds every bundle file by SHA-256; `bundle.sig` is an
//! Ed25519 signature over the exact manifest bytes. Verification fails closed:
//! a missing, unreadable or mismatching file rejects the whole bundle.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::BundleError;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SIGNATURE_FILE: &str = "bundle.sig";

const MANIFEST_VERSION: u32 = 1;
const NONCE_LEN: usize = 16;
/// Allowed clock skew for `created_at`, in seconds.
const MAX_FUTURE_SKEW_SECS: i64 = 300;

/// Signed content binding the bundle files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedManifest {
    pub version: u32,
    /// Release counter; must match `bundle.json`.
    pub serial: u64,
    /// Unix seconds.
    pub created_at: i64,
    pub nonce_b64: String,
    /// Relative path -> lowercase hex SHA-256.
    pub files: BTreeMap<String, String>,
}

impl SignedManifest {
    /// Hash `files` (relative to `dir`) into a fresh manifest.
    ///
    /// # Errors
    /// Fails if a path is not a plain relative path or a file cannot be read.
    pub fn for_files(dir: &Path, files: &[String], serial: u64) -> Result<Self, BundleError> {
        let mut map = BTreeMap::new();
        for rel in files {
            check_relative(rel)?;
            let path = dir.join(rel);
            let bytes = fs::read(&path).map_err(|source| BundleError::Io { path, source })?;
            map.insert(rel.clone(), sha256_hex(&bytes));
        }

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        Ok(Self {
            version: MANIFEST_VERSION,
            serial,
            created_at: unix_now(),
            nonce_b64: base64::engine::general_purpose::STANDARD.encode(nonce),
            files: map,
        })
    }

    /// Hash recorded for `rel`, if bound.
    #[must_use]
    pub fn digest_of(&self, rel: &str) -> Option<&str> {
        self.files.get(rel).map(String::as_str)
    }
}

/// Lowercase hex SHA-256.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// Constant-time compare for ASCII strings (used for SHA-256 hex digests).
pub(crate) fn constant_time_eq_str(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Reject absolute paths and `..` components.
pub(crate) fn check_relative(rel: &str) -> Result<(), BundleError> {
    let path = Path::new(rel);
    let plain = !rel.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(BundleError::Manifest(format!("illegal bundle path '{rel}'")))
    }
}

fn validate_nonce_b64(nonce_b64: &str) -> Result<(), BundleError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(nonce_b64.trim())
        .map_err(|e| BundleError::Manifest(format!("Invalid nonce base64: {e}")))?;
    if raw.len() != NONCE_LEN {
        return Err(BundleError::Manifest(format!(
            "nonce must decode to exactly {NONCE_LEN} bytes"
        )));
    }
    Ok(())
}

/// Decode a base64 Ed25519 public key.
///
/// # Errors
/// `BundleError::Key` on bad encoding or length.
pub fn verifying_key_from_b64(b64: &str) -> Result<VerifyingKey, BundleError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|_| BundleError::Key("Invalid public key base64".into()))?;
    let pubkey: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| BundleError::Key("Invalid public key length (expected 32 bytes)".into()))?;
    VerifyingKey::from_bytes(&pubkey).map_err(|_| BundleError::Key("Invalid verifying key".into()))
}

/// Write `manifest.json` and `bundle.sig` into `dir`.
///
/// # Errors
/// I/O and serialization failures.
pub fn write_signed_manifest(
    dir: &Path,
    manifest: &SignedManifest,
    signing_key: &SigningKey,
) -> Result<(), BundleError> {
    let manifest_bytes = serde_json::to_vec_pretty(manifest).map_err(|source| BundleError::Json {
        file: MANIFEST_FILE.into(),
        source,
    })?;
    let manifest_path = dir.join(MANIFEST_FILE);
    fs::write(&manifest_path, &manifest_bytes).map_err(|source| BundleError::Io {
        path: manifest_path,
        source,
    })?;

    let signature: Signature = signing_key.sign(&manifest_bytes);
    let sig_path = dir.join(SIGNATURE_FILE);
    fs::write(&sig_path, signature.to_bytes()).map_err(|source| BundleError::Io {
        path: sig_path,
        source,
    })?;
    Ok(())
}

/// Whether `dir` carries both manifest and signature.
#[must_use]
pub fn is_signed(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).exists() && dir.join(SIGNATURE_FILE).exists()
}

/// Verify signature, manifest structure and every bound file hash.
///
/// # Errors
/// `BundleError::Signature` for a bad signature, `BundleError::Manifest` for
/// structural problems and `BundleError::HashMismatch` for altered files.
pub fn verify_manifest(dir: &Path, key: &VerifyingKey) -> Result<SignedManifest, BundleError> {
    let sig_path = dir.join(SIGNATURE_FILE);
    let sig_bytes = fs::read(&sig_path).map_err(|source| BundleError::Io {
        path: sig_path,
        source,
    })?;
    let sig_array: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| {
            BundleError::Signature("Invalid signature length (expected 64 bytes)".into())
        })?;
    let signature = Signature::from_bytes(&sig_array);

    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest_content = fs::read(&manifest_path).map_err(|source| BundleError::Io {
        path: manifest_path,
        source,
    })?;

    key.verify(&manifest_content, &signature)
        .map_err(|_| BundleError::Signature("Invalid bundle signature".into()))?;

    let manifest: SignedManifest =
        serde_json::from_slice(&manifest_content).map_err(|source| BundleError::Json {
            file: MANIFEST_FILE.into(),
            source,
        })?;
    if manifest.version != MANIFEST_VERSION {
        return Err(BundleError::Manifest(format!(
            "Unsupported manifest version: {}",
            manifest.version
        )));
    }
    validate_nonce_b64(&manifest.nonce_b64)?;
    if manifest.created_at > unix_now() + MAX_FUTURE_SKEW_SECS {
        return Err(BundleError::Manifest("manifest created_at is in the future".into()));
    }
    if manifest.files.is_empty() {
        return Err(BundleError::Manifest("manifest.json contains no files".into()));
    }

    for (rel, expected_hex) in &manifest.files {
        check_relative(rel)?;
        let path = dir.join(rel);
        let bytes = fs::read(&path).map_err(|source| BundleError::Io { path, source })?;
        if !constant_time_eq_str(&sha256_hex(&bytes), expected_hex) {
            return Err(BundleError::HashMismatch(rel.clone()));
        }
    }

    tracing::info!(
        "Bundle signature verified (serial={}, {} files)",
        manifest.serial,
        manifest.files.len()
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn signing_key() -> SigningKey {
        let mut sk = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut sk);
        SigningKey::from_bytes(&sk)
    }

    #[test]
    fn test_sign_and_verify() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path();
        fs::write(dir.join("a.json"), b"{}").expect("write");

        let key = signing_key();
        let manifest = SignedManifest::for_files(dir, &["a.json".into()], 7).expect("manifest");
        write_signed_manifest(dir, &manifest, &key).expect("sign");

        assert!(is_signed(dir));
        let verified = verify_manifest(dir, &key.verifying_key()).expect("verify");
        assert_eq!(verified, manifest);
        assert_eq!(verified.digest_of("a.json"), Some(sha256_hex(b"{}").as_str()));
    }

    #[test]
    fn test_tampered_file_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path();
        fs::write(dir.join("a.json"), b"{}").expect("write");

        let key = signing_key();
        let manifest = SignedManifest::for_files(dir, &["a.json".into()], 1).expect("manifest");
        write_signed_manifest(dir, &manifest, &key).expect("sign");
        fs::write(dir.join("a.json"), b"{\"x\":1}").expect("tamper");

        assert!(matches!(
            verify_manifest(dir, &key.verifying_key()),
            Err(BundleError::HashMismatch(f)) if f == "a.json"
        ));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path();
        fs::write(dir.join("a.json"), b"{}").expect("write");

        let manifest = SignedManifest::for_files(dir, &["a.json".into()], 1).expect("manifest");
        write_signed_manifest(dir, &manifest, &signing_key()).expect("sign");

        assert!(matches!(
            verify_manifest(dir, &signing_key().verifying_key()),
            Err(BundleError::Signature(_))
        ));
    }

    #[test]
    fn test_path_checks() {
        assert!(check_relative("members/lgb-0.json").is_ok());
        assert!(check_relative("../secret").is_err());
        assert!(check_relative("/etc/passwd").is_err());
        assert!(check_relative("").is_err());
    }

    #[test]
    fn test_pubkey_decoding() {
        let key = signing_key();
        let b64 = base64::engine::general_purpose::STANDARD.encode(key.verifying_key().to_bytes());
        assert_eq!(
            verifying_key_from_b64(&format!("{b64}\n")).expect("decode"),
            key.verifying_key()
        );
        assert!(verifying_key_from_b64("AAAA").is_err());
    }
}
