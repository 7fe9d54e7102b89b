//! Ed25519 keypair generation for bundle signing.
//!
//! Writes the base64 signing seed with 0600 permissions and optionally the
//! base64 public key, in the formats `sign_bundle` and
//! `KAIROS_BUNDLE_PUBKEY_B64_FILE` expect.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin generate_keypair -- --out-seed <path> [--out-pub <path>] [--force]
//! ```

use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose;
use base64::Engine;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

const USAGE: &str = "Usage: generate_keypair --out-seed <path> [--out-pub <path>] [--force]";

struct Args {
    out_seed: PathBuf,
    out_pub: Option<PathBuf>,
    force: bool,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = std::env::args().skip(1);
    let mut out_seed = None;
    let mut out_pub = None;
    let mut force = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--out-seed" => out_seed = Some(PathBuf::from(args.next().context(USAGE)?)),
            "--out-pub" => out_pub = Some(PathBuf::from(args.next().context(USAGE)?)),
            "--force" => force = true,
            "-h" | "--help" => {
                println!(
                    "{USAGE}\n\nWrites the base64 Ed25519 seed to <path> with 0600 permissions. \
                     Optionally writes the base64 public key to --out-pub. \
                     Prints only non-secret material."
                );
                return Ok(None);
            }
            _ => bail!("Unknown arg: {arg}\n{USAGE}"),
        }
    }

    Ok(Some(Args {
        out_seed: out_seed.context(USAGE)?,
        out_pub,
        force,
    }))
}

fn write_line(path: &Path, contents: &str, mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {parent:?}"))?;
    }
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = opts.open(path).with_context(|| format!("Failed to open {path:?}"))?;
    file.write_all(contents.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

fn main() -> Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    for path in std::iter::once(&args.out_seed).chain(args.out_pub.as_ref()) {
        if path.exists() && !args.force {
            bail!("Refusing to overwrite existing file {path:?}. Use --force.");
        }
    }

    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let signing_key = SigningKey::from_bytes(&seed);
    let seed_b64 = Zeroizing::new(general_purpose::STANDARD.encode(seed));
    seed.zeroize();

    let pub_b64 = general_purpose::STANDARD.encode(signing_key.verifying_key().as_bytes());

    write_line(&args.out_seed, &seed_b64, 0o600)?;
    if let Some(pub_path) = &args.out_pub {
        write_line(pub_path, &pub_b64, 0o644)?;
    }

    println!("Wrote signing seed (base64) to {:?}", args.out_seed);
    if let Some(pub_path) = &args.out_pub {
        println!("Wrote public key (base64) to {pub_path:?}");
    }
    println!("KAIROS_BUNDLE_PUBKEY_B64={pub_b64}");
    Ok(())
}
