//! The `custos check-policy` subcommand.
//!
//! Decodes a policy with the strict codec and summarizes its scopes.

use clap::Args;
use color_eyre::eyre::Result;
use custos_policy::PolicyRequirement;
use custos_policy::codec::DOCKER_TRANSPORT;

use super::PolicySource;

/// Arguments for `custos check-policy`.
#[derive(Args)]
pub struct CheckPolicyArgs {
    #[command(flatten)]
    pub source: PolicySource,

    /// Print the normalized policy as JSON instead of a summary.
    #[arg(long)]
    pub json: bool,
}

fn describe(requirements: &[PolicyRequirement]) -> String {
    requirements
        .iter()
        .map(PolicyRequirement::type_name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Execute the check-policy command.
pub fn execute(args: &CheckPolicyArgs) -> Result<()> {
    let (path, policy) = args.source.load()?;

    if args.json {
        println!("{}", policy.to_json()?);
        return Ok(());
    }

    println!("Policy {} is valid", path.display());
    println!("  default: {}", describe(&policy.default));
    for (scope, requirements) in &policy.specific {
        let scope = if scope.is_empty() { "(all docker images)" } else { scope.as_str() };
        println!("  {DOCKER_TRANSPORT} {scope}: {}", describe(requirements));
    }
    for (transport, scopes) in &policy.other_transports {
        println!("  {transport}: {} scope(s), not evaluated", scopes.len());
    }
    Ok(())
}
