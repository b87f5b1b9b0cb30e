//! `signedBaseLayer`: a placeholder that denies every image.

use custos_signature::UntrustedSignature;

use super::SignatureAcceptance;
use crate::error::PolicyError;
use crate::image::UnparsedImage;
use crate::types::SignedBaseLayer;

const NOT_IMPLEMENTED: &str = "signedBaseLayer not implemented yet!";

impl SignedBaseLayer {
    #[expect(clippy::unused_self, reason = "same shape as the other requirements")]
    pub(crate) fn is_signature_author_accepted(
        &self,
        _image: &dyn UnparsedImage,
        _signature: &UntrustedSignature,
    ) -> SignatureAcceptance {
        SignatureAcceptance::Unknown
    }

    pub(crate) fn is_running_image_allowed(&self, _image: &dyn UnparsedImage) -> Result<(), PolicyError> {
        tracing::error!(base_layer_identity = ?self.base_layer_identity, "{NOT_IMPLEMENTED}");
        Err(PolicyError::denied(NOT_IMPLEMENTED))
    }
}
