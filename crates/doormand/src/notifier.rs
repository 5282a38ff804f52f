//! Operator notification channel: alert delivery and decision payloads.

use crate::pending::PendingId;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Delivery failure, split by whether a retry can help.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("delivery failed: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A delivered message that can be edited later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// An inline action offered with an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionButton {
    pub label: String,
    pub payload: String,
}

/// An operator action received from the transport's listener.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Decision {
        payload: DecisionPayload,
        origin: MessageRef,
    },
    /// Button data that failed validation.
    Malformed { raw: String, origin: MessageRef },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a photo with a caption and action buttons to the operator.
    async fn send_photo(
        &self,
        image: Vec<u8>,
        caption: &str,
        actions: &[ActionButton],
    ) -> Result<MessageRef, TransportError>;

    /// Replace the caption of a previously sent photo.
    async fn edit_caption(&self, message: &MessageRef, text: &str) -> Result<(), TransportError>;

    /// Send a plain text message to the operator.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;
}

/// Operator decision on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    AllowAlways,
    AllowOnce,
    Deny,
}

impl DecisionAction {
    pub const ALL: [DecisionAction; 3] = [Self::AllowAlways, Self::AllowOnce, Self::Deny];

    fn tag(self) -> &'static str {
        match self {
            Self::AllowAlways => "always",
            Self::AllowOnce => "once",
            Self::Deny => "deny",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.tag() == tag)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::AllowAlways => "Allow always",
            Self::AllowOnce => "Allow once",
            Self::Deny => "Deny",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("missing ':' separator")]
    MissingSeparator,
    #[error("unknown action tag '{0}'")]
    UnknownAction(String),
    #[error("invalid pending id '{0}'")]
    InvalidId(String),
}

/// Button payload carried back by the operator's callback: `<tag>:<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionPayload {
    pub action: DecisionAction,
    pub id: PendingId,
}

impl DecisionPayload {
    pub fn new(action: DecisionAction, id: PendingId) -> Self {
        Self { action, id }
    }

    /// The three buttons offered for `id`, in display order.
    pub fn buttons(id: PendingId) -> Vec<ActionButton> {
        DecisionAction::ALL
            .into_iter()
            .map(|action| ActionButton {
                label: action.label().to_string(),
                payload: Self::new(action, id).to_string(),
            })
            .collect()
    }
}

impl fmt::Display for DecisionPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action.tag(), self.id)
    }
}

impl FromStr for DecisionPayload {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, id) = s.split_once(':').ok_or(PayloadError::MissingSeparator)?;
        let action =
            DecisionAction::from_tag(tag).ok_or_else(|| PayloadError::UnknownAction(tag.into()))?;
        let id = id
            .parse::<PendingId>()
            .map_err(|_| PayloadError::InvalidId(id.into()))?;
        Ok(Self { action, id })
    }
}
