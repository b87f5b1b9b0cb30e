//! Container image trust policies.
//!
//! `custos-policy` decides which container images may run, based on a
//! policy document and the signatures attached to an image:
//! 1. **Model**: [`Policy`] maps docker scopes to ordered lists of
//!    [`PolicyRequirement`]s, decoded by a strict JSON codec
//! 2. **Requirements**: `reject`, `insecureAcceptAnything`, `signedBy`
//!    (OpenPGP simple signing) and `sigstoreSigned` (public keys, Fulcio
//!    or a private PKI, optionally backed by Rekor)
//! 3. **Evaluation**: a [`PolicyContext`] lists the signatures whose
//!    author a policy accepts, and decides whether an image may run
//!
//! Every evaluation reads key and certificate material afresh; nothing is
//! cached between calls.

// ── Model ───────────────────────────────────────────────────────────
pub mod codec;
pub mod config;
pub mod error;
mod reference_match;
mod scope;
pub mod types;

// ── Trust material ──────────────────────────────────────────────────
pub mod certs;
mod fulcio;
mod pki;
pub mod rekor;
pub mod trust_root;

// ── Evaluation ──────────────────────────────────────────────────────
pub mod context;
pub mod evaluate;
pub mod image;

pub use config::PolicyConfig;
pub use context::{ContextState, PolicyContext};
pub use error::{PolicyError, PolicyFormatError, PolicyRequirementError};
pub use evaluate::SignatureAcceptance;
pub use image::{LocalImage, UnparsedImage};
pub use types::{
    KeySource, Policy, PolicyReferenceMatch, PolicyRequirement, SignedBy, SignedByKeyType,
    SigstoreSigned, SigstoreTrust,
};
