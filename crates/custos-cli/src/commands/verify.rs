//! The `custos verify` subcommand.
//!
//! Evaluates a local image (a manifest plus signature files) against a
//! policy: which signatures have an accepted author, and whether the image
//! may run.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::Result;
use custos_policy::{LocalImage, PolicyContext, PolicyError};
use custos_signature::{ImageReference, SigstoreSignature, UntrustedSignature};

use super::{PolicySource, read_file};

/// Arguments for `custos verify`.
#[derive(Args)]
pub struct VerifyArgs {
    /// Docker reference the image was pulled by.
    #[arg(long)]
    pub reference: String,

    /// Path to the image manifest.
    #[arg(long, value_name = "PATH")]
    pub manifest: PathBuf,

    /// Simple signing signature file (repeatable).
    #[arg(long = "signature", value_name = "PATH")]
    pub signatures: Vec<PathBuf>,

    /// Sigstore signature JSON file (repeatable).
    #[arg(long = "sigstore-signature", value_name = "PATH")]
    pub sigstore_signatures: Vec<PathBuf>,

    #[command(flatten)]
    pub source: PolicySource,

    /// Output results as JSON.
    #[arg(long)]
    pub json: bool,
}

fn load_image(args: &VerifyArgs) -> Result<LocalImage> {
    let reference = ImageReference::parse_normalized(&args.reference)?;
    let mut image = LocalImage::new(Some(reference), read_file("manifest", &args.manifest)?);
    for path in &args.signatures {
        image = image.with_signature(UntrustedSignature::SimpleSigning(read_file("signature", path)?));
    }
    for path in &args.sigstore_signatures {
        let signature = SigstoreSignature::from_json(&read_file("sigstore signature", path)?)?;
        image = image.with_signature(UntrustedSignature::Sigstore(signature));
    }
    Ok(image)
}

/// Execute the verify command.
pub fn execute(args: &VerifyArgs) -> Result<()> {
    let (policy_path, policy) = args.source.load()?;
    let image = load_image(args)?;
    tracing::info!(
        policy = %policy_path.display(),
        reference = %args.reference,
        "evaluating image"
    );

    let context = PolicyContext::new(Arc::new(policy));
    let accepted = context.get_signatures_with_accepted_author(&image)?;
    let verdict = context.is_running_image_allowed(&image);
    context.destroy()?;

    let allowed = verdict.is_ok();
    if args.json {
        let report = serde_json::json!({
            "allowed": allowed,
            "reason": verdict.as_ref().err().map(ToString::to_string),
            "denied_by_policy": verdict.as_ref().err().is_some_and(PolicyError::is_denial),
            "accepted_signatures": accepted,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for signature in &accepted {
            println!(
                "[PASS] signature accepted for {} ({})",
                signature.docker_reference, signature.docker_manifest_digest
            );
        }
        match &verdict {
            Ok(()) => println!("[PASS] running {} is allowed", args.reference),
            Err(e) if e.is_denial() => println!("[FAIL] running {} is denied: {e}", args.reference),
            Err(e) => println!("[FAIL] evaluating {} failed: {e}", args.reference),
        }

        println!();
        if allowed {
            println!("Verification PASSED");
        } else {
            println!("Verification FAILED");
        }
    }

    if !allowed {
        process::exit(1);
    }

    Ok(())
}
