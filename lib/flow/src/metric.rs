//! Funnel metric names.
//!
//! A funnel metric counts how many conversations of a flow reached a given
//! milestone. Nodes and buttons may be tagged with the metric they represent;
//! the engine increments each metric at most once per conversation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named funnel milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FunnelMetric {
    /// A conversation was created by a trigger match.
    TotalTriggered,
    /// The conversation was started by a follow event.
    FollowConfirmed,
    /// The opening message was delivered.
    OpeningMsgSent,
    /// The message carrying the link was delivered.
    LinkMsgSent,
    /// The user tapped the link button.
    LinkClicked,
    /// The user was asked for their email address.
    EmailRequested,
    /// The user replied with their email address.
    EmailProvided,
    /// A public reply was posted under the triggering comment.
    CommentReplied,
}

impl FunnelMetric {
    /// Every metric, in funnel order.
    pub const ALL: [FunnelMetric; 8] = [
        Self::TotalTriggered,
        Self::FollowConfirmed,
        Self::OpeningMsgSent,
        Self::LinkMsgSent,
        Self::LinkClicked,
        Self::EmailRequested,
        Self::EmailProvided,
        Self::CommentReplied,
    ];

    /// Returns the wire name of this metric.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TotalTriggered => "totalTriggered",
            Self::FollowConfirmed => "followConfirmed",
            Self::OpeningMsgSent => "openingMsgSent",
            Self::LinkMsgSent => "linkMsgSent",
            Self::LinkClicked => "linkClicked",
            Self::EmailRequested => "emailRequested",
            Self::EmailProvided => "emailProvided",
            Self::CommentReplied => "commentReplied",
        }
    }

    /// Parses a wire name back into a metric.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for FunnelMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
