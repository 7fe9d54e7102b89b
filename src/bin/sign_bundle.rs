//! Bundle signing utility.
//!
//! Hashes every file listed by `bundle.json` into `manifest.json` and writes
//! an Ed25519 signature over the manifest bytes to `bundle.sig`. The manifest
//! serial is taken from `bundle.json`.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin sign_bundle -- <bundle_dir>
//! ```
//!
//! The signing seed (base64, 32 bytes) is read from the file named by
//! `KAIROS_BUNDLE_SIGNING_KEY_B64_FILE`, then
//! `/run/secrets/kairos_bundle_signing_key_b64`, and in debug builds only from
//! `KAIROS_BUNDLE_SIGNING_KEY_B64`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose;
use base64::Engine;
use ed25519_dalek::SigningKey;
use tracing_subscriber::EnvFilter;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use kairos::adapters::bundle::manifest::{MANIFEST_FILE, SIGNATURE_FILE};
use kairos::adapters::bundle::sign_bundle;

const KEY_FILE_ENV: &str = "KAIROS_BUNDLE_SIGNING_KEY_B64_FILE";
const KEY_ENV: &str = "KAIROS_BUNDLE_SIGNING_KEY_B64";
const DOCKER_SECRET_PATH: &str = "/run/secrets/kairos_bundle_signing_key_b64";

#[derive(Zeroize, ZeroizeOnDrop)]
struct Seed([u8; 32]);

fn read_secret(path: &Path) -> Result<Zeroizing<String>> {
    let content = Zeroizing::new(
        fs::read_to_string(path).with_context(|| format!("Failed reading signing key {path:?}"))?,
    );
    let secret = Zeroizing::new(content.trim_end_matches(['\n', '\r']).to_string());
    if secret.is_empty() {
        bail!("Empty signing key in {path:?}");
    }
    Ok(secret)
}

fn read_signing_seed_b64() -> Result<Zeroizing<String>> {
    if let Ok(path) = env::var(KEY_FILE_ENV) {
        return read_secret(Path::new(path.trim()));
    }

    if Path::new(DOCKER_SECRET_PATH).exists() {
        return read_secret(Path::new(DOCKER_SECRET_PATH));
    }

    if cfg!(debug_assertions) {
        if let Ok(v) = env::var(KEY_ENV) {
            let secret = Zeroizing::new(v.trim().to_string());
            if secret.is_empty() {
                bail!("Empty signing key in {KEY_ENV}");
            }
            return Ok(secret);
        }
    }

    bail!(
        "Missing signing key. Provide {KEY_FILE_ENV} or {DOCKER_SECRET_PATH} \
         ({KEY_ENV} is accepted in debug builds only)"
    )
}

fn read_signing_seed() -> Result<Seed> {
    let b64 = read_signing_seed_b64()?;
    let raw = Zeroizing::new(
        general_purpose::STANDARD
            .decode(b64.trim())
            .context("Invalid base64 in signing key")?,
    );
    if raw.len() != 32 {
        bail!(
            "Signing key seed must be 32 bytes after base64 decode (got {})",
            raw.len()
        );
    }
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&raw);
    Ok(Seed(seed))
}

fn parse_args() -> Result<PathBuf> {
    const USAGE: &str = "Usage: sign_bundle <bundle_dir>";
    let mut args = env::args().skip(1);
    let dir = match args.next().as_deref() {
        None | Some("-h" | "--help") => bail!(USAGE),
        Some(dir) => PathBuf::from(dir),
    };
    if args.next().is_some() {
        bail!(USAGE);
    }
    Ok(dir)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let dir = parse_args()?;
    if !dir.is_dir() {
        bail!("{dir:?} is not a bundle directory");
    }

    let seed = read_signing_seed()?;
    let signing_key = SigningKey::from_bytes(&seed.0);
    drop(seed);

    let manifest =
        sign_bundle(&dir, &signing_key).with_context(|| format!("Failed to sign {dir:?}"))?;

    println!("Signed manifest: {:?}", dir.join(MANIFEST_FILE));
    println!("Wrote signature: {:?}", dir.join(SIGNATURE_FILE));
    println!("Serial: {}", manifest.serial);
    println!(
        "Public key (base64): {}",
        general_purpose::STANDARD.encode(signing_key.verifying_key().as_bytes())
    );
    Ok(())
}
