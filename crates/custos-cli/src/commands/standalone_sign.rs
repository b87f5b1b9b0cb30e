//! The `custos standalone-sign` subcommand.

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::{Result, WrapErr as _};
use custos_signature::mechanism::{SequoiaMechanism, SigningMechanism as _};
use custos_signature::simple::sign_docker_manifest;

use super::read_file;

/// Arguments for `custos standalone-sign`.
#[derive(Args)]
pub struct StandaloneSignArgs {
    /// Path to the manifest to sign.
    pub manifest: PathBuf,

    /// Docker reference to bind the signature to.
    pub reference: String,

    /// Fingerprint of the signing key.
    pub fingerprint: String,

    /// Where to write the signature.
    #[arg(short, long, value_name = "PATH")]
    pub output: PathBuf,

    /// OpenPGP secret key file (armored or binary).
    #[arg(long, value_name = "PATH")]
    pub key: PathBuf,
}

/// Execute the standalone-sign command.
pub fn execute(args: &StandaloneSignArgs) -> Result<()> {
    let manifest = read_file("manifest", &args.manifest)?;
    let key = read_file("key", &args.key)?;

    let (mech, _) = SequoiaMechanism::new_ephemeral(&[key])?;
    mech.supports_signing()?;
    let signature = sign_docker_manifest(&manifest, &args.reference, &mech, &args.fingerprint);
    mech.close()?;
    let signature = signature?;

    std::fs::write(&args.output, &signature)
        .wrap_err_with(|| format!("failed to write signature {}", args.output.display()))?;
    tracing::info!(
        output = %args.output.display(),
        reference = %args.reference,
        bytes = signature.len(),
        "wrote signature"
    );
    Ok(())
}
