//! Bundle adapter: filesystem implementation of `BundleStore`.
//!
//! # Layout
//!
//! ```text
//! bundle.json           metadata + member list
//! transformer.json      frozen TransformerState
//! calibration.json      CalibrationMap
//! members/<id>.json     serialized tree models
//! manifest.json         SHA-256 of every file above, serial, created_at, nonce
//! bundle.sig            Ed25519 signature over manifest.json
//! ```
//!
//! # Security
//!
//! - Release builds only load signed bundles.
//! - Debug builds may load unsigned bundles with `KAIROS_ALLOW_UNSIGNED_BUNDLES=true`.
//! - Every file the loader reads is re-hashed and compared against the
//!   manifest, so a file swapped after verification is still rejected.

pub mod manifest;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::adapters::trees::{TreeModel, TreeModelError};
use crate::domain::{
    Architecture, BundleMetadata, CalibrationMap, DomainTag, Ensemble, EnsembleError, ModelArtifact,
    ModelSnapshot, SnapshotError, TransformerState,
};
use crate::ports::BundleStore;

use manifest::{
    check_relative, constant_time_eq_str, is_signed, sha256_hex, verify_manifest,
    verifying_key_from_b64, write_signed_manifest, SignedManifest,
};

pub const BUNDLE_FILE: &str = "bundle.json";
pub const TRANSFORMER_FILE: &str = "transformer.json";
pub const CALIBRATION_FILE: &str = "calibration.json";

/// Current `bundle.json` format.
pub const FORMAT_VERSION: u32 = 1;

/// Environment variable to allow loading unsigned bundles.
///
/// SECURITY: Honoured only in debug builds.
pub const ALLOW_UNSIGNED_ENV: &str = "KAIROS_ALLOW_UNSIGNED_BUNDLES";
/// Base64 Ed25519 public key used to verify bundles.
pub const PUBKEY_ENV: &str = "KAIROS_BUNDLE_PUBKEY_B64";
/// File holding the base64 public key (takes precedence over `PUBKEY_ENV`).
pub const PUBKEY_FILE_ENV: &str = "KAIROS_BUNDLE_PUBKEY_B64_FILE";

/// Bundle loading errors. All of them are startup / reload failures.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {file}: {source}")]
    Json {
        file: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Bundle signature required: {0}")]
    SignatureMissing(String),

    #[error("Signature verification failed: {0}")]
    Signature(String),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("File hash mismatch for {0}")]
    HashMismatch(String),

    #[error("File {0} is not bound by the signed manifest")]
    Unbound(String),

    #[error("Verifying key error: {0}")]
    Key(String),

    #[error("Unsupported bundle format version {0}")]
    UnsupportedFormat(u32),

    #[error("Manifest serial {manifest} does not match bundle serial {bundle}")]
    SerialMismatch { manifest: u64, bundle: u64 },

    #[error("Member '{artifact}': {reason}")]
    Member { artifact: String, reason: String },

    #[error("Member '{artifact}' model is invalid: {source}")]
    Tree {
        artifact: String,
        #[source]
        source: TreeModelError,
    },

    #[error("Ensemble is invalid: {0}")]
    Ensemble(#[from] EnsembleError),

    #[error("Bundle is inconsistent: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// One ensemble member as listed in `bundle.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberEntry {
    pub id: String,
    pub architecture: Architecture,
    pub fold: u32,
    pub weight: f64,
    /// Path relative to the bundle root.
    pub file: String,
}

/// Contents of `bundle.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleDescriptor {
    pub format_version: u32,
    pub bundle_version: String,
    pub domain: DomainTag,
    pub schema_hash: String,
    pub serial: u64,
    pub created_at: i64,
    pub members: Vec<MemberEntry>,
}

impl BundleDescriptor {
    /// Every file the bundle consists of, relative to its root.
    #[must_use]
    pub fn files(&self) -> Vec<String> {
        let mut files = vec![
            BUNDLE_FILE.to_string(),
            TRANSFORMER_FILE.to_string(),
            CALIBRATION_FILE.to_string(),
        ];
        files.extend(self.members.iter().map(|m| m.file.clone()));
        files
    }

    fn metadata(&self) -> BundleMetadata {
        BundleMetadata {
            bundle_version: self.bundle_version.clone(),
            domain: self.domain,
            schema_hash: self.schema_hash.clone(),
            serial: self.serial,
            created_at: self.created_at,
        }
    }
}

/// How bundles are authenticated.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub verifying_key: Option<VerifyingKey>,
    /// Accept unsigned bundles. Ignored in release builds.
    pub allow_unsigned: bool,
}

impl LoadOptions {
    /// Read the verifying key and unsigned bypass from the environment.
    ///
    /// # Errors
    /// Fails if a configured key cannot be read or decoded.
    pub fn from_env() -> Result<Self, BundleError> {
        let verifying_key = if let Ok(path) = std::env::var(PUBKEY_FILE_ENV) {
            let path = PathBuf::from(path.trim());
            let b64 = fs::read_to_string(&path).map_err(|source| BundleError::Io { path, source })?;
            Some(verifying_key_from_b64(&b64)?)
        } else if let Ok(b64) = std::env::var(PUBKEY_ENV) {
            Some(verifying_key_from_b64(&b64)?)
        } else {
            None
        };

        let allow_unsigned = std::env::var(ALLOW_UNSIGNED_ENV)
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "YES"))
            .unwrap_or(false);

        Ok(Self {
            verifying_key,
            allow_unsigned,
        })
    }

    fn unsigned_permitted(&self) -> bool {
        cfg!(debug_assertions) && self.allow_unsigned
    }
}

/// Filesystem bundle store.
#[derive(Debug, Clone)]
pub struct FsBundleStore {
    dir: PathBuf,
    options: LoadOptions,
}

impl FsBundleStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, options: LoadOptions) -> Self {
        Self {
            dir: dir.into(),
            options,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn authenticate(&self) -> Result<Option<SignedManifest>, BundleError> {
        if !is_signed(&self.dir) {
            if self.options.unsigned_permitted() {
                tracing::warn!(
                    "Loading UNSIGNED bundle from {:?} ({ALLOW_UNSIGNED_ENV}=true). \
                     This is only allowed in debug builds.",
                    self.dir
                );
                return Ok(None);
            }
            tracing::error!("Bundle signature not found in {:?}", self.dir);
            return Err(BundleError::SignatureMissing(format!(
                "{:?} has no {} / {}",
                self.dir,
                manifest::MANIFEST_FILE,
                manifest::SIGNATURE_FILE
            )));
        }

        let key = self.options.verifying_key.as_ref().ok_or_else(|| {
            BundleError::Key(format!(
                "no verifying key configured (set {PUBKEY_ENV} or {PUBKEY_FILE_ENV})"
            ))
        })?;
        verify_manifest(&self.dir, key).map(Some)
    }

    /// Read a bundle file, re-checking its hash against the manifest.
    fn read_bound(
        &self,
        manifest: Option<&SignedManifest>,
        rel: &str,
    ) -> Result<Vec<u8>, BundleError> {
        check_relative(rel)?;
        let path = self.dir.join(rel);
        let bytes = fs::read(&path).map_err(|source| BundleError::Io { path, source })?;
        if let Some(manifest) = manifest {
            let expected = manifest
                .digest_of(rel)
                .ok_or_else(|| BundleError::Unbound(rel.to_string()))?;
            if !constant_time_eq_str(&sha256_hex(&bytes), expected) {
                return Err(BundleError::HashMismatch(rel.to_string()));
            }
        }
        Ok(bytes)
    }

    fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        manifest: Option<&SignedManifest>,
        rel: &str,
    ) -> Result<T, BundleError> {
        let bytes = self.read_bound(manifest, rel)?;
        serde_json::from_slice(&bytes).map_err(|source| BundleError::Json {
            file: rel.to_string(),
            source,
        })
    }

    fn load_member(
        &self,
        manifest: Option<&SignedManifest>,
        entry: &MemberEntry,
    ) -> Result<ModelArtifact, BundleError> {
        let bytes = self.read_bound(manifest, &entry.file)?;
        let model = TreeModel::from_json(&bytes).map_err(|source| BundleError::Tree {
            artifact: entry.id.clone(),
            source,
        })?;
        if model.architecture() != entry.architecture {
            return Err(BundleError::Member {
                artifact: entry.id.clone(),
                reason: format!(
                    "declared {} but model file is {}",
                    entry.architecture,
                    model.architecture()
                ),
            });
        }
        tracing::debug!(
            "Loaded member {} ({}, fold {}, {} trees)",
            entry.id,
            entry.architecture,
            entry.fold,
            model.n_trees()
        );
        Ok(ModelArtifact::new(
            entry.id.clone(),
            entry.architecture,
            entry.fold,
            entry.weight,
            Arc::new(model),
        ))
    }
}

impl BundleStore for FsBundleStore {
    type Error = BundleError;

    fn load_snapshot(&self) -> Result<ModelSnapshot, BundleError> {
        let manifest = self.authenticate()?;
        let manifest = manifest.as_ref();

        let descriptor: BundleDescriptor = self.read_json(manifest, BUNDLE_FILE)?;
        if descriptor.format_version != FORMAT_VERSION {
            return Err(BundleError::UnsupportedFormat(descriptor.format_version));
        }
        if let Some(m) = manifest {
            if m.serial != descriptor.serial {
                return Err(BundleError::SerialMismatch {
                    manifest: m.serial,
                    bundle: descriptor.serial,
                });
            }
        }

        let transformer: TransformerState = self.read_json(manifest, TRANSFORMER_FILE)?;
        let calibration: CalibrationMap = self.read_json(manifest, CALIBRATION_FILE)?;
        let members = descriptor
            .members
            .iter()
            .map(|entry| self.load_member(manifest, entry))
            .collect::<Result<Vec<_>, _>>()?;
        let ensemble = Ensemble::new(members)?;

        let snapshot =
            ModelSnapshot::new(descriptor.metadata(), transformer, ensemble, calibration)?;
        tracing::info!(
            "Loaded bundle {} (domain={}, serial={}, members={}, signed={})",
            descriptor.bundle_version,
            descriptor.domain,
            descriptor.serial,
            descriptor.members.len(),
            manifest.is_some()
        );
        Ok(snapshot)
    }
}

/// A member ready to be exported.
#[derive(Debug, Clone)]
pub struct ExportMember {
    pub id: String,
    pub fold: u32,
    pub weight: f64,
    pub model: TreeModel,
}

/// Writes bundle directories from training output.
#[derive(Debug, Clone)]
pub struct BundleWriter {
    dir: PathBuf,
}

impl BundleWriter {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write_file(&self, rel: &str, bytes: &[u8]) -> Result<(), BundleError> {
        let path = self.dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| BundleError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&path, bytes).map_err(|source| BundleError::Io { path, source })
    }

    fn write_json<T: Serialize>(&self, rel: &str, value: &T) -> Result<(), BundleError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| BundleError::Json {
            file: rel.to_string(),
            source,
        })?;
        self.write_file(rel, &bytes)
    }

    /// Write every bundle file except manifest and signature.
    ///
    /// # Errors
    /// I/O and serialization failures, or an invalid member id.
    pub fn write(
        &self,
        metadata: &BundleMetadata,
        transformer: &TransformerState,
        calibration: &CalibrationMap,
        members: &[ExportMember],
    ) -> Result<BundleDescriptor, BundleError> {
        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            let file = format!("members/{}.json", member.id);
            check_relative(&file)?;
            if member.id.contains('/') || member.id.contains('\\') {
                return Err(BundleError::Member {
                    artifact: member.id.clone(),
                    reason: "artifact id must not contain path separators".into(),
                });
            }
            self.write_json(&file, &member.model)?;
            entries.push(MemberEntry {
                id: member.id.clone(),
                architecture: member.model.architecture(),
                fold: member.fold,
                weight: member.weight,
                file,
            });
        }

        let descriptor = BundleDescriptor {
            format_version: FORMAT_VERSION,
            bundle_version: metadata.bundle_version.clone(),
            domain: metadata.domain,
            schema_hash: metadata.schema_hash.clone(),
            serial: metadata.serial,
            created_at: metadata.created_at,
            members: entries,
        };
        self.write_json(TRANSFORMER_FILE, transformer)?;
        self.write_json(CALIBRATION_FILE, calibration)?;
        self.write_json(BUNDLE_FILE, &descriptor)?;
        tracing::info!(
            "Wrote bundle {} to {:?} ({} members)",
            descriptor.bundle_version,
            self.dir,
            descriptor.members.len()
        );
        Ok(descriptor)
    }
}

/// Bind every file listed by `bundle.json` into a signed manifest.
///
/// # Errors
/// Fails if `bundle.json` is unreadable or a listed file is missing.
pub fn sign_bundle(dir: &Path, signing_key: &SigningKey) -> Result<SignedManifest, BundleError> {
    let path = dir.join(BUNDLE_FILE);
    let bytes = fs::read(&path).map_err(|source| BundleError::Io { path, source })?;
    let descriptor: BundleDescriptor =
        serde_json::from_slice(&bytes).map_err(|source| BundleError::Json {
            file: BUNDLE_FILE.into(),
            source,
        })?;
    let manifest = SignedManifest::for_files(dir, &descriptor.files(), descriptor.serial)?;
    write_signed_manifest(dir, &manifest, signing_key)?;
    tracing::info!(
        "Signed bundle {} ({} files, serial {})",
        descriptor.bundle_version,
        manifest.files.len(),
        manifest.serial
    );
    Ok(manifest)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adapters::trees::tests::{oblivious, stump};
    use crate::domain::snapshot::tests::{census_metadata, census_training, identity_calibration};
    use crate::domain::{FeatureTransformer, RawInstance, Scorer};
    use rand::RngCore;
    use tempfile::tempdir;

    pub(crate) fn signing_key() -> SigningKey {
        let mut sk = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut sk);
        SigningKey::from_bytes(&sk)
    }

    /// Write a census bundle with one LightGBM and one CatBoost member.
    pub(crate) fn write_census_bundle(
        dir: &Path,
        serial: u64,
        key: Option<&SigningKey>,
    ) -> TransformerState {
        let transformer =
            FeatureTransformer::fit(&DomainTag::Census.profile().schema(), &census_training())
                .expect("fit");
        let width = transformer.len();
        let mut metadata = census_metadata(&transformer);
        metadata.serial = serial;
        metadata.bundle_version = format!("census-{serial}");

        let members = vec![
            ExportMember {
                id: "lgb-0".into(),
                fold: 0,
                weight: 1.0,
                model: stump(width, 0.0),
            },
            ExportMember {
                id: "cat-0".into(),
                fold: 0,
                weight: 2.0,
                model: oblivious(width),
            },
        ];
        BundleWriter::new(dir)
            .write(&metadata, &transformer, &identity_calibration(), &members)
            .expect("write bundle");
        if let Some(key) = key {
            sign_bundle(dir, key).expect("sign bundle");
        }
        transformer
    }

    pub(crate) fn signed_options(key: &SigningKey) -> LoadOptions {
        LoadOptions {
            verifying_key: Some(key.verifying_key()),
            allow_unsigned: false,
        }
    }

    #[test]
    fn test_signed_bundle_loads() {
        let temp = tempdir().expect("tempdir");
        let key = signing_key();
        let fitted = write_census_bundle(temp.path(), 3, Some(&key));

        let store = FsBundleStore::new(temp.path(), signed_options(&key));
        let snapshot = store.load_snapshot().expect("load");

        assert_eq!(snapshot.metadata().serial, 3);
        assert_eq!(snapshot.transformer(), &fitted);
        assert_eq!(snapshot.ensemble().members().len(), 2);
        assert_eq!(snapshot.ensemble().members()[1].architecture(), Architecture::CatBoost);
    }

    #[test]
    fn test_train_serve_parity() {
        let temp = tempdir().expect("tempdir");
        let key = signing_key();
        let fitted = write_census_bundle(temp.path(), 1, Some(&key));
        let loaded = FsBundleStore::new(temp.path(), signed_options(&key))
            .load_snapshot()
            .expect("load");

        let raw = RawInstance::new()
            .with("age", 44.5)
            .with("education_num", 10.0)
            .with("hours_per_week", 38.25)
            .with("occupation", "Tech-support");
        let engineered = DomainTag::Census.profile().engineer(&raw).expect("engineer");
        let a = fitted.transform(&engineered).expect("transform");
        let b = loaded.transformer().transform(&engineered).expect("transform");
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(a.as_slice()), bits(b.as_slice()));

        let member = &loaded.ensemble().members()[0];
        assert_eq!(member.n_features(), fitted.len());
        let p = stump(fitted.len(), 0.0).predict(a.as_slice()).expect("predict");
        let scored = loaded.score(&raw).expect("score");
        assert_eq!(scored.ensemble.members[0].prediction.to_bits(), p.to_bits());
    }

    #[test]
    fn test_unsigned_bundle_requires_opt_in() {
        let temp = tempdir().expect("tempdir");
        write_census_bundle(temp.path(), 1, None);

        let strict = FsBundleStore::new(temp.path(), LoadOptions::default());
        assert!(matches!(
            strict.load_snapshot(),
            Err(BundleError::SignatureMissing(_))
        ));

        let relaxed = FsBundleStore::new(
            temp.path(),
            LoadOptions {
                verifying_key: None,
                allow_unsigned: true,
            },
        );
        if cfg!(debug_assertions) {
            relaxed.load_snapshot().expect("debug builds accept unsigned bundles");
        } else {
            assert!(relaxed.load_snapshot().is_err());
        }
    }

    #[test]
    fn test_tampered_transformer_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let key = signing_key();
        write_census_bundle(temp.path(), 1, Some(&key));

        let path = temp.path().join(TRANSFORMER_FILE);
        let mut content = fs::read_to_string(&path).expect("read");
        content.push('\n');
        fs::write(&path, content).expect("write");

        let err = FsBundleStore::new(temp.path(), signed_options(&key))
            .load_snapshot()
            .expect_err("tampered bundle");
        assert!(matches!(err, BundleError::HashMismatch(f) if f == TRANSFORMER_FILE));
    }

    #[test]
    fn test_missing_key_fails_closed() {
        let temp = tempdir().expect("tempdir");
        write_census_bundle(temp.path(), 1, Some(&signing_key()));
        assert!(matches!(
            FsBundleStore::new(temp.path(), LoadOptions::default()).load_snapshot(),
            Err(BundleError::Key(_))
        ));
    }

    #[test]
    fn test_architecture_mismatch_is_rejected() {
        let temp = tempdir().expect("tempdir");
        write_census_bundle(temp.path(), 1, None);

        let path = temp.path().join(BUNDLE_FILE);
        let mut descriptor: BundleDescriptor =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse");
        descriptor.members[0].architecture = Architecture::CatBoost;
        fs::write(&path, serde_json::to_vec(&descriptor).expect("ser")).expect("write");

        let key = signing_key();
        sign_bundle(temp.path(), &key).expect("sign");
        assert!(matches!(
            FsBundleStore::new(temp.path(), signed_options(&key)).load_snapshot(),
            Err(BundleError::Member { .. })
        ));
    }
}
