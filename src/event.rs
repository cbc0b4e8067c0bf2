//! Action events buffered by the outbox.
//!
//! An [`ActionObject`] is the immutable description of one user action. The
//! shared envelope ([`ActionTarget`]) and the per-type payload ([`ActionKind`])
//! are flattened into a single JSON object on the wire, keyed by `actionType`.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::strategy::TriggerStrategy;

/// Identifier assigned by the queue store at append time.
///
/// Identifiers are strictly increasing within one store, so ordering by id is
/// insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    /// Wraps a raw sequence value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the id that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Discriminator of an action.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Like,
    Unlike,
    Block,
    View,
    ViewChat,
    Message,
    OpenChat,
    Location,
    PushToken,
}

impl ActionType {
    /// Wire name of the action type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Like => "LIKE",
            Self::Unlike => "UNLIKE",
            Self::Block => "BLOCK",
            Self::View => "VIEW",
            Self::ViewChat => "VIEW_CHAT",
            Self::Message => "MESSAGE",
            Self::OpenChat => "OPEN_CHAT",
            Self::Location => "LOCATION",
            Self::PushToken => "PUSH_TOKEN",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope shared by actions aimed at another user's profile.
///
/// Actions without a target (location, push token) carry an empty envelope,
/// which is omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionTarget {
    /// Feed or screen the action originated from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_feed: String,
    /// Image the action refers to; `targetPhotoId` on the wire.
    #[serde(rename = "targetPhotoId", default, skip_serializing_if = "String::is_empty")]
    pub target_image_id: String,
    /// User the action refers to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_user_id: String,
}

impl ActionTarget {
    /// Creates a target envelope.
    #[must_use]
    pub fn new(
        source_feed: impl Into<String>,
        target_image_id: impl Into<String>,
        target_user_id: impl Into<String>,
    ) -> Self {
        Self {
            source_feed: source_feed.into(),
            target_image_id: target_image_id.into(),
            target_user_id: target_user_id.into(),
        }
    }

    /// Returns true if the envelope carries no target.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.source_feed.is_empty() && self.target_image_id.is_empty() && self.target_user_id.is_empty()
    }
}

/// Per-type payload of an action.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "actionType", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ActionKind {
    Like { like_count: u32 },
    Unlike,
    Block { block_reason_num: u32 },
    View { view_count: u32, view_time_millis: i64 },
    ViewChat { view_chat_time_millis: i64 },
    Message { text: String },
    OpenChat { open_chat_count: u32, open_chat_time_millis: i64 },
    Location { lat: f64, lon: f64 },
    PushToken { push_token: String },
}

impl ActionKind {
    /// Returns the discriminator of this payload.
    #[must_use]
    pub const fn action_type(&self) -> ActionType {
        match self {
            Self::Like { .. } => ActionType::Like,
            Self::Unlike => ActionType::Unlike,
            Self::Block { .. } => ActionType::Block,
            Self::View { .. } => ActionType::View,
            Self::ViewChat { .. } => ActionType::ViewChat,
            Self::Message { .. } => ActionType::Message,
            Self::OpenChat { .. } => ActionType::OpenChat,
            Self::Location { .. } => ActionType::Location,
            Self::PushToken { .. } => ActionType::PushToken,
        }
    }

    /// Strategies attached to a freshly constructed action of this kind.
    #[must_use]
    pub fn default_strategies(&self) -> Vec<TriggerStrategy> {
        match self {
            Self::Like { .. } | Self::Unlike => vec![
                TriggerStrategy::count_from_last_default(),
                TriggerStrategy::delay_from_last_default(),
            ],
            Self::Message { .. } | Self::OpenChat { .. } => vec![TriggerStrategy::immediate()],
            Self::Block { .. }
            | Self::View { .. }
            | Self::ViewChat { .. }
            | Self::Location { .. }
            | Self::PushToken { .. } => Vec::new(),
        }
    }
}

/// One user action awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionObject {
    /// Client timestamp in epoch milliseconds.
    pub action_time: i64,
    /// Who and where the action targets.
    #[serde(flatten)]
    pub target: ActionTarget,
    /// Type-specific payload.
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Flush policies evaluated when this action is enqueued. Local only.
    #[serde(skip)]
    pub trigger_strategies: Vec<TriggerStrategy>,
}

impl ActionObject {
    /// Creates an action stamped with the current time and the default strategies of its kind.
    #[must_use]
    pub fn new(target: ActionTarget, kind: ActionKind) -> Self {
        let trigger_strategies = kind.default_strategies();
        Self {
            action_time: Utc::now().timestamp_millis(),
            target,
            kind,
            trigger_strategies,
        }
    }

    /// A like of the target image.
    #[must_use]
    pub fn like(target: ActionTarget, like_count: u32) -> Self {
        Self::new(target, ActionKind::Like { like_count })
    }

    /// Withdraws an earlier like.
    #[must_use]
    pub fn unlike(target: ActionTarget) -> Self {
        Self::new(target, ActionKind::Unlike)
    }

    /// Blocks the target user; `block_reason_num` is the server reason code.
    #[must_use]
    pub fn block(target: ActionTarget, block_reason_num: u32) -> Self {
        Self::new(target, ActionKind::Block { block_reason_num })
    }

    /// A view of the target image.
    #[must_use]
    pub fn view(target: ActionTarget, view_count: u32, view_time_millis: i64) -> Self {
        Self::new(target, ActionKind::View { view_count, view_time_millis })
    }

    /// Time spent in a chat.
    #[must_use]
    pub fn view_chat(target: ActionTarget, view_chat_time_millis: i64) -> Self {
        Self::new(target, ActionKind::ViewChat { view_chat_time_millis })
    }

    /// A chat message; committed eagerly.
    #[must_use]
    pub fn message(target: ActionTarget, text: impl Into<String>) -> Self {
        Self::new(target, ActionKind::Message { text: text.into() })
    }

    /// A chat was opened; committed eagerly.
    #[must_use]
    pub fn open_chat(target: ActionTarget, open_chat_count: u32, open_chat_time_millis: i64) -> Self {
        Self::new(target, ActionKind::OpenChat { open_chat_count, open_chat_time_millis })
    }

    /// Device location; carries no target.
    #[must_use]
    pub fn location(lat: f64, lon: f64) -> Self {
        Self::new(ActionTarget::default(), ActionKind::Location { lat, lon })
    }

    /// Registers a push token; carries no target.
    #[must_use]
    pub fn push_token(push_token: impl Into<String>) -> Self {
        Self::new(
            ActionTarget::default(),
            ActionKind::PushToken {
                push_token: push_token.into(),
            },
        )
    }

    /// Overrides the action timestamp.
    #[must_use]
    pub const fn with_action_time(mut self, action_time: i64) -> Self {
        self.action_time = action_time;
        self
    }

    /// Replaces the attached flush policies.
    #[must_use]
    pub fn with_strategies(mut self, strategies: Vec<TriggerStrategy>) -> Self {
        self.trigger_strategies = strategies;
        self
    }

    /// Returns the discriminator of this action.
    #[must_use]
    pub const fn action_type(&self) -> ActionType {
        self.kind.action_type()
    }
}

/// Delivery state of a stored action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    /// Eligible for the next snapshot.
    Pending,
    /// Part of a batch currently being committed.
    InFlight,
}

/// An action as held by a queue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Id assigned at append.
    pub id: EventId,
    /// Pending or InFlight.
    pub state: EventState,
    /// The queued action.
    pub action: ActionObject,
}

impl StoredEvent {
    /// Wraps a freshly appended action.
    #[must_use]
    pub const fn pending(id: EventId, action: ActionObject) -> Self {
        Self {
            id,
            state: EventState::Pending,
            action,
        }
    }

    /// Returns true if the event is eligible for the next snapshot.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == EventState::Pending
    }
}
