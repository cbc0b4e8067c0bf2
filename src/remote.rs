//! Collaborator contracts for the remote commit endpoint.
//!
//! The outbox never talks HTTP itself. Hosts plug in a [`CommitClient`] that
//! delivers a [`CommitRequest`] and an [`AccessTokenProvider`] that supplies
//! the session token. Both are object-safe and shared across threads.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::OutboxError;
use crate::event::ActionObject;
use crate::retry::CancellationToken;

/// Session token attached to every commit.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wraps a raw token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for the transport only.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens end up in log fields through `?request`; never print the secret.
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(<{} chars>)", self.0.len())
    }
}

/// The access token is unavailable or was refused.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AuthError {
    /// Human-readable reason.
    pub message: String,
}

impl AuthError {
    /// Creates an auth error with a reason.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<AuthError> for OutboxError {
    fn from(err: AuthError) -> Self {
        Self::Auth {
            message: err.message,
        }
    }
}

/// Supplies the current session token.
pub trait AccessTokenProvider: Send + Sync {
    /// # Errors
    /// `AuthError` if the user is not logged in or the token cannot be refreshed.
    fn current_access_token(&self) -> Result<AccessToken, AuthError>;
}

/// Provider returning a fixed token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(AccessToken);

impl StaticTokenProvider {
    /// Provider that always returns `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(AccessToken::new(token))
    }
}

impl AccessTokenProvider for StaticTokenProvider {
    fn current_access_token(&self) -> Result<AccessToken, AuthError> {
        Ok(self.0.clone())
    }
}

/// Immutable batch sent to the remote in one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    access_token: AccessToken,
    actions: Vec<ActionObject>,
}

impl CommitRequest {
    /// Builds a request over a snapshot of actions.
    #[must_use]
    pub fn new(access_token: AccessToken, actions: Vec<ActionObject>) -> Self {
        Self {
            access_token,
            actions,
        }
    }

    /// Token sent with the batch.
    #[must_use]
    pub fn access_token(&self) -> &AccessToken {
        &self.access_token
    }

    /// Actions in insertion order.
    #[must_use]
    pub fn actions(&self) -> &[ActionObject] {
        &self.actions
    }

    /// Number of actions in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// True if the batch carries no actions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Serialises the request body.
    ///
    /// # Errors
    /// Only if an action holds a value JSON cannot represent (a non-finite coordinate).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Remote acknowledgement of a committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
    /// Server-side checkpoint after applying the batch.
    pub last_action_time: i64,
}

impl CommitResponse {
    /// Parses a response body.
    ///
    /// # Errors
    /// If the body is not a JSON object carrying `lastActionTime`.
    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }
}

/// Failure classes reported by a [`CommitClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    /// Timeout, connectivity loss, 5xx. Retried.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// The server refused the batch. Not retried.
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The token was refused. Not retried.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// The call observed the cancellation token.
    #[error("cancelled")]
    Cancelled,
}

impl CommitError {
    /// A failure worth retrying.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// True for failures worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Maps the final failure of a commit to the outbox taxonomy.
    #[must_use]
    pub fn into_outbox_error(self, attempts: u32) -> OutboxError {
        match self {
            Self::Transient { message } => OutboxError::TransientNetwork { attempts, message },
            Self::Rejected { status, message } => OutboxError::FatalApi { status, message },
            Self::Unauthorized { message } => OutboxError::Auth { message },
            Self::Cancelled => OutboxError::Cancelled,
        }
    }
}

/// Delivers batches to the remote service.
///
/// Implementations should abandon the call and return `CommitError::Cancelled`
/// once `cancel` fires.
pub trait CommitClient: Send + Sync {
    /// # Errors
    /// See [`CommitError`] for the classes the outbox distinguishes.
    fn commit_batch(
        &self,
        request: &CommitRequest,
        cancel: &CancellationToken,
    ) -> Result<CommitResponse, CommitError>;
}
