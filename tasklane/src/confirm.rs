//! Re-authentication gesture required before every delegated write.
//!
//! [`ConfirmationGate`] wraps an [`IdentityConfirmer`] with a timeout and
//! publishes its progress as a [`ConfirmationState`] on a `watch` channel,
//! so a UI can show a prompt while the gesture is pending.
//!
//! State machine: `Idle -> Awaiting -> (Success | Error)`. If the awaiting
//! future is dropped before it settles, the state returns to `Idle`.

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::watch;

use crate::identity::{IdentityError, IdentityProvider};

/// Default time allowed for the gesture.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

/// Progress of the confirmation gesture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmationState {
    /// No gesture in progress.
    #[default]
    Idle,
    /// Waiting for the user.
    Awaiting,
    /// The last gesture succeeded.
    Success,
    /// The last gesture failed or timed out.
    Error,
}

/// Why a confirmation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfirmError {
    /// The gesture was not completed in time.
    #[error("identity confirmation timed out after {0:?}")]
    TimedOut(Duration),

    /// The user cancelled the gesture.
    #[error("identity confirmation cancelled")]
    Cancelled,

    /// The gesture completed but did not prove the identity.
    #[error("identity confirmation rejected: {0}")]
    Rejected(String),

    /// Another gesture is already pending on this gate.
    #[error("an identity confirmation is already in progress")]
    Busy,
}

/// Performs the gesture for `identity_id`.
pub trait IdentityConfirmer: Send + Sync {
    /// Completes when the user has proven control of `identity_id`.
    fn confirm(
        &self,
        identity_id: &str,
    ) -> impl std::future::Future<Output = Result<(), ConfirmError>> + Send;
}

/// Resets the state to `Idle` unless the gesture settled.
struct AwaitingGuard<'a> {
    state: &'a watch::Sender<ConfirmationState>,
    settled: bool,
}

impl AwaitingGuard<'_> {
    fn settle(mut self, outcome: ConfirmationState) {
        self.settled = true;
        self.state.send_replace(outcome);
    }
}

impl Drop for AwaitingGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.state.send_replace(ConfirmationState::Idle);
        }
    }
}

/// Serializes confirmation gestures and reports their progress.
pub struct ConfirmationGate<C> {
    confirmer: C,
    timeout: Duration,
    state: watch::Sender<ConfirmationState>,
}

impl<C: IdentityConfirmer> ConfirmationGate<C> {
    /// Creates a gate around `confirmer`.
    #[must_use]
    pub fn new(confirmer: C, timeout: Duration) -> Self {
        Self {
            confirmer,
            timeout,
            state: watch::Sender::new(ConfirmationState::Idle),
        }
    }

    /// Time allowed for each gesture.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConfirmationState> {
        self.state.subscribe()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConfirmationState {
        *self.state.borrow()
    }

    /// Returns a settled gate to `Idle`. Has no effect while awaiting.
    pub fn reset(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, ConfirmationState::Success | ConfirmationState::Error) {
                *state = ConfirmationState::Idle;
                true
            } else {
                false
            }
        });
    }

    /// Runs the gesture for `identity_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfirmError::Busy`] if a gesture is already pending,
    /// [`ConfirmError::TimedOut`] if the confirmer does not finish in time,
    /// or the confirmer's own error.
    pub async fn confirm(&self, identity_id: &str) -> Result<(), ConfirmError> {
        let entered = self.state.send_if_modified(|state| {
            if *state == ConfirmationState::Awaiting {
                false
            } else {
                *state = ConfirmationState::Awaiting;
                true
            }
        });
        if !entered {
            return Err(ConfirmError::Busy);
        }
        let guard = AwaitingGuard {
            state: &self.state,
            settled: false,
        };

        let outcome =
            match tokio::time::timeout(self.timeout, self.confirmer.confirm(identity_id)).await {
                Ok(result) => result,
                Err(_) => Err(ConfirmError::TimedOut(self.timeout)),
            };

        match &outcome {
            Ok(()) => guard.settle(ConfirmationState::Success),
            Err(e) => {
                tracing::warn!(target: "tasklane::security", identity = %identity_id, error = %e, "identity confirmation failed");
                guard.settle(ConfirmationState::Error);
            }
        }
        outcome
    }
}

/// Proves control of an identity by signing a fresh challenge and
/// verifying the signature.
pub struct SignatureConfirmer<P> {
    provider: Arc<P>,
}

impl<P: IdentityProvider> SignatureConfirmer<P> {
    /// Creates a confirmer backed by `provider`.
    #[must_use]
    pub const fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

fn fresh_challenge(identity_id: &str) -> Vec<u8> {
    let mut nonce = [0u8; 32];
    rand::rng().fill_bytes(&mut nonce);
    let mut challenge = format!(
        "tasklane-confirm:{identity_id}:{}:",
        chrono::Utc::now().timestamp_millis()
    )
    .into_bytes();
    challenge.extend_from_slice(&nonce);
    challenge
}

impl From<IdentityError> for ConfirmError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Cancelled => Self::Cancelled,
            other => Self::Rejected(other.to_string()),
        }
    }
}

impl<P: IdentityProvider> IdentityConfirmer for SignatureConfirmer<P> {
    async fn confirm(&self, identity_id: &str) -> Result<(), ConfirmError> {
        let current = self
            .provider
            .current_identity()
            .ok_or_else(|| ConfirmError::Rejected("identity not initialized".to_string()))?;
        if current.id != identity_id {
            return Err(ConfirmError::Rejected(format!(
                "active identity is {}, not {identity_id}",
                current.id
            )));
        }

        let challenge = fresh_challenge(identity_id);
        let signature = self.provider.sign(&challenge).await?;
        if self.provider.verify(&signature, &challenge).await? {
            Ok(())
        } else {
            Err(ConfirmError::Rejected("signature did not verify".to_string()))
        }
    }
}
