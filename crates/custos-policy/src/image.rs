//! The image being evaluated.

use custos_signature::{ImageReference, UntrustedSignature};

use crate::error::PolicyError;

/// An image whose manifest and signatures have not been verified.
///
/// Implementations fetch lazily; evaluation may ask for the manifest
/// several times and must get the same bytes each time.
pub trait UnparsedImage {
    /// The reference the image was pulled by, if it has one.
    fn reference(&self) -> Option<&ImageReference>;

    /// The raw manifest.
    ///
    /// # Errors
    ///
    /// Fails if the manifest cannot be obtained.
    fn manifest(&self) -> Result<Vec<u8>, PolicyError>;

    /// All signatures attached to the image, in storage order.
    ///
    /// # Errors
    ///
    /// Fails if the signatures cannot be obtained.
    fn untrusted_signatures(&self) -> Result<Vec<UntrustedSignature>, PolicyError>;
}

/// An image held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct LocalImage {
    reference: Option<ImageReference>,
    manifest: Vec<u8>,
    signatures: Vec<UntrustedSignature>,
}

impl LocalImage {
    /// An unsigned image.
    #[must_use]
    pub fn new(reference: Option<ImageReference>, manifest: Vec<u8>) -> Self {
        Self {
            reference,
            manifest,
            signatures: Vec::new(),
        }
    }

    /// Attach a signature.
    #[must_use]
    pub fn with_signature(mut self, signature: UntrustedSignature) -> Self {
        self.signatures.push(signature);
        self
    }

    /// Attach a stored signature blob.
    ///
    /// # Errors
    ///
    /// Fails if the blob is not a recognized signature format.
    pub fn with_signature_blob(self, blob: &[u8]) -> Result<Self, PolicyError> {
        Ok(self.with_signature(UntrustedSignature::from_blob(blob)?))
    }
}

impl UnparsedImage for LocalImage {
    fn reference(&self) -> Option<&ImageReference> {
        self.reference.as_ref()
    }

    fn manifest(&self) -> Result<Vec<u8>, PolicyError> {
        Ok(self.manifest.clone())
    }

    fn untrusted_signatures(&self) -> Result<Vec<UntrustedSignature>, PolicyError> {
        Ok(self.signatures.clone())
    }
}
