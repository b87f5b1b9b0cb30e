//! The `custos standalone-verify` subcommand.

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::Result;
use custos_signature::mechanism::SequoiaMechanism;
use custos_signature::simple::verify_docker_manifest_signature;

use super::read_file;

/// Arguments for `custos standalone-verify`.
#[derive(Args)]
pub struct StandaloneVerifyArgs {
    /// Path to the manifest the signature should cover.
    pub manifest: PathBuf,

    /// Expected docker reference.
    pub reference: String,

    /// Expected signer fingerprint.
    pub fingerprint: String,

    /// Path to the signature.
    pub signature: PathBuf,

    /// OpenPGP public key file of the expected signer.
    #[arg(long, value_name = "PATH")]
    pub key: PathBuf,
}

/// Execute the standalone-verify command.
pub fn execute(args: &StandaloneVerifyArgs) -> Result<()> {
    let manifest = read_file("manifest", &args.manifest)?;
    let signature = read_file("signature", &args.signature)?;
    let key = read_file("key", &args.key)?;

    let (mech, _) = SequoiaMechanism::new_ephemeral(&[key])?;
    let verified = verify_docker_manifest_signature(
        &signature,
        &manifest,
        &args.reference,
        &mech,
        &args.fingerprint,
    );
    if let Err(e) = mech.close() {
        tracing::warn!(error = %e, "failed to remove ephemeral keyring");
    }
    let verified = verified?;

    println!(
        "Signature verified, digest {}",
        verified.docker_manifest_digest
    );
    Ok(())
}
