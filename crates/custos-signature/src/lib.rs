//! Container signature formats and primitives.
//!
//! `custos-signature` parses docker references and digests, digests image
//! manifests, and creates and verifies the two signature formats a trust
//! policy can accept:
//! 1. **Simple signing**: OpenPGP-signed JSON payloads, verified through a
//!    [`mechanism::SigningMechanism`] over an ephemeral keyring
//! 2. **Sigstore**: payload attachments with a base64 signature annotation,
//!    verified against public keys with `aws-lc-rs`
//!
//! All JSON that influences a trust decision goes through the strict,
//! duplicate-key-rejecting codec in [`json`].

pub mod digest;
pub mod error;
pub mod json;
pub mod keys;
pub mod manifest;
pub mod mechanism;
pub mod payload;
pub mod reference;
pub mod sigstore;
pub mod simple;

// Re-export primary types for convenience.
pub use digest::Digest;
pub use error::SignatureError;
pub use keys::PublicKey;
pub use payload::{AcceptanceRules, Signature};
pub use reference::ImageReference;
pub use sigstore::{SigstoreSignature, UntrustedSignature};
