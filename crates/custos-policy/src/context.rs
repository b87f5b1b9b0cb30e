//! A policy evaluation session.
//!
//! A [`PolicyContext`] guards its entry points with a small state machine.
//! The guard is not a lock: a context must only be used from one thread at
//! a time (the type is `!Sync`), and the state only catches reentrant use,
//! such as an image implementation calling back into the context, and use
//! after [`PolicyContext::destroy`].

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use custos_signature::Signature;

use crate::codec::EMPTY_REQUIREMENTS;
use crate::error::PolicyError;
use crate::evaluate::SignatureAcceptance;
use crate::image::UnparsedImage;
use crate::types::Policy;

/// Lifecycle of a [`PolicyContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Being constructed.
    Initializing,
    /// Idle and usable.
    Ready,
    /// An evaluation is running.
    InUse,
    /// Being torn down.
    Destroying,
    /// Torn down; every call fails.
    Destroyed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::InUse => "In use",
            Self::Destroying => "Destroying",
            Self::Destroyed => "Destroyed",
        })
    }
}

/// Evaluates one [`Policy`] against images.
#[derive(Debug)]
pub struct PolicyContext {
    policy: Arc<Policy>,
    state: Cell<ContextState>,
}

impl PolicyContext {
    /// Create a ready context. The policy is shared, never modified.
    #[must_use]
    pub fn new(policy: Arc<Policy>) -> Self {
        let context = Self {
            policy,
            state: Cell::new(ContextState::Initializing),
        };
        context.state.set(ContextState::Ready);
        context
    }

    /// The policy being enforced.
    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContextState {
        self.state.get()
    }

    /// End the session. Later calls on this context fail.
    ///
    /// # Errors
    ///
    /// Fails if the context is in use or already destroyed.
    pub fn destroy(&self) -> Result<(), PolicyError> {
        self.change_state(ContextState::Ready, ContextState::Destroying)?;
        self.change_state(ContextState::Destroying, ContextState::Destroyed)
    }

    fn change_state(&self, expected: ContextState, new: ContextState) -> Result<(), PolicyError> {
        let found = self.state.get();
        if found != expected {
            return Err(PolicyError::Context(format!(
                "Invalid PolicyContext state, expected \"{expected}\", found \"{found}\""
            )));
        }
        self.state.set(new);
        Ok(())
    }

    /// Run `f` in the `InUse` state. A failure to return to `Ready` is
    /// reported only if `f` itself succeeded.
    fn in_use<T>(&self, f: impl FnOnce() -> Result<T, PolicyError>) -> Result<T, PolicyError> {
        self.change_state(ContextState::Ready, ContextState::InUse)?;
        let result = f();
        match (self.change_state(ContextState::InUse, ContextState::Ready), result) {
            (Err(e), Ok(_)) => Err(e),
            (_, result) => result,
        }
    }

    /// The verified contents of every signature on `image` that the
    /// applicable requirements accept, in the image's signature order.
    ///
    /// This establishes who signed what; it does not decide whether the
    /// image may run (see [`PolicyContext::is_running_image_allowed`]).
    /// Reasons for dropping a signature are only logged.
    ///
    /// # Errors
    ///
    /// Fails on invalid context state, an unsupported image reference, or
    /// if the image cannot supply its signatures.
    pub fn get_signatures_with_accepted_author(
        &self,
        image: &dyn UnparsedImage,
    ) -> Result<Vec<Signature>, PolicyError> {
        self.in_use(|| {
            let requirements = self.policy.requirements_for_image(image.reference())?;
            let signatures = image.untrusted_signatures()?;
            let mut accepted = Vec::with_capacity(signatures.len());

            for (index, signature) in signatures.iter().enumerate() {
                tracing::debug!(index, kind = signature.kind(), "evaluating signature");
                let mut accepted_contents: Option<Signature> = None;
                let mut rejected = false;
                for (requirement, req) in requirements.iter().enumerate() {
                    match req.is_signature_author_accepted(image, signature) {
                        SignatureAcceptance::Accepted(contents) => match &accepted_contents {
                            None => {
                                tracing::debug!(index, requirement, "signature accepted");
                                accepted_contents = Some(contents);
                            }
                            Some(previous) if *previous != contents => {
                                tracing::debug!(
                                    index,
                                    requirement,
                                    "internal inconsistency: signature accepted with different contents"
                                );
                                rejected = true;
                                break;
                            }
                            Some(_) => tracing::debug!(index, requirement, "signature accepted"),
                        },
                        SignatureAcceptance::Rejected(e) => {
                            tracing::debug!(index, requirement, reason = %e, "signature rejected");
                            rejected = true;
                            break;
                        }
                        SignatureAcceptance::Unknown => {
                            tracing::debug!(index, requirement, "signature state unknown, continuing");
                        }
                    }
                }
                match accepted_contents {
                    Some(contents) if !rejected => {
                        tracing::debug!(index, "signature accepted overall");
                        accepted.push(contents);
                    }
                    _ => tracing::debug!(index, "signature not accepted"),
                }
            }
            Ok(accepted)
        })
    }

    /// Decide whether `image` may run: every applicable requirement must
    /// allow it, and the first denial is returned.
    ///
    /// # Errors
    ///
    /// A [`PolicyError::Requirement`] explains a denial. Any other error
    /// means the image could not be evaluated and must not run either.
    pub fn is_running_image_allowed(&self, image: &dyn UnparsedImage) -> Result<(), PolicyError> {
        self.in_use(|| {
            let requirements = self.policy.requirements_for_image(image.reference())?;
            if requirements.is_empty() {
                return Err(PolicyError::denied(EMPTY_REQUIREMENTS));
            }
            for (requirement, req) in requirements.iter().enumerate() {
                if let Err(e) = req.is_running_image_allowed(image) {
                    tracing::debug!(requirement, kind = req.type_name(), reason = %e, "image denied");
                    return Err(e);
                }
                tracing::debug!(requirement, kind = req.type_name(), "requirement allows image");
            }
            tracing::debug!("image allowed");
            Ok(())
        })
    }
}
