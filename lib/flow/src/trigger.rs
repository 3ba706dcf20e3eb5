//! Trigger rules and flow selection.
//!
//! Every flow declares one trigger rule: the platform event type it reacts to,
//! an optional post it is scoped to, and a keyword rule over the event text.
//! When several active flows accept the same event, exactly one wins.

use crate::definition::{Flow, PublishedFlow};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use tracing::info;

/// The kind of platform event a flow reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    /// A public comment on a post.
    Comment,
    /// A direct message.
    Dm,
    /// A new follower.
    Follow,
}

impl TriggerType {
    /// Returns the wire name of this event type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Comment => "COMMENT",
            Self::Dm => "DM",
            Self::Follow => "FOLLOW",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "COMMENT" => Some(Self::Comment),
            "DM" => Some(Self::Dm),
            "FOLLOW" => Some(Self::Follow),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the event text is matched against the flow's keywords.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeywordType {
    /// Any text matches, including none.
    #[default]
    Any,
    /// At least one keyword must appear in the text.
    Specific,
}

/// The entry condition of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRule {
    /// Event type this flow reacts to.
    pub trigger_type: TriggerType,
    /// Keyword rule.
    #[serde(default)]
    pub keyword_type: KeywordType,
    /// Keywords, in declaration order.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Post the flow is scoped to; `None` reacts to every post.
    #[serde(default)]
    pub media_id: Option<String>,
}

impl TriggerRule {
    /// A rule reacting to every event of the given type.
    #[must_use]
    pub fn any(trigger_type: TriggerType) -> Self {
        Self {
            trigger_type,
            keyword_type: KeywordType::Any,
            keywords: Vec::new(),
            media_id: None,
        }
    }

    /// A rule requiring one of `keywords` in the event text.
    #[must_use]
    pub fn specific<I, S>(trigger_type: TriggerType, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trigger_type,
            keyword_type: KeywordType::Specific,
            keywords: keywords.into_iter().map(Into::into).collect(),
            media_id: None,
        }
    }

    /// Scopes the rule to a single post.
    #[must_use]
    pub fn for_media(mut self, media_id: impl Into<String>) -> Self {
        self.media_id = Some(media_id.into());
        self
    }

    /// Returns whether this rule accepts the event.
    ///
    /// Activation is checked by the matcher, not here.
    #[must_use]
    pub fn accepts(&self, event: &InboundEvent) -> bool {
        if self.trigger_type != event.event_type {
            return false;
        }
        if let Some(media_id) = &self.media_id
            && event.media_id.as_deref() != Some(media_id.as_str())
        {
            return false;
        }
        match self.keyword_type {
            KeywordType::Any => true,
            KeywordType::Specific => event
                .text
                .as_deref()
                .is_some_and(|text| keywords_match(&self.keywords, text)),
        }
    }
}

/// Returns whether any keyword occurs in `text`, ignoring case.
///
/// Keywords are matched as written, surrounding whitespace included. The
/// empty keyword never matches.
#[must_use]
pub fn keywords_match(keywords: &[String], text: &str) -> bool {
    let text = text.to_lowercase();
    keywords
        .iter()
        .any(|keyword| !keyword.is_empty() && text.contains(&keyword.to_lowercase()))
}

/// A normalized platform event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// What happened.
    pub event_type: TriggerType,
    /// Channel (connected account) the event arrived on.
    pub channel_id: String,
    /// Platform ID of the end user.
    pub external_user_id: String,
    /// Comment or message text.
    #[serde(default)]
    pub text: Option<String>,
    /// Post the comment was made on.
    #[serde(default)]
    pub media_id: Option<String>,
    /// Platform ID of the comment, for public replies.
    #[serde(default)]
    pub comment_id: Option<String>,
    /// Platform delivery ID, unique per delivery attempt of one event.
    pub delivery_id: String,
}

/// Selects at most one flow for an inbound event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerMatcher;

impl TriggerMatcher {
    /// Picks the flow that should handle `event`.
    ///
    /// Among active flows whose trigger accepts the event, the most recently
    /// updated wins; equal timestamps go to the smallest flow ID.
    pub fn select<F, I>(event: &InboundEvent, candidates: I) -> Option<F>
    where
        F: Borrow<PublishedFlow>,
        I: IntoIterator<Item = F>,
    {
        let mut matched: Vec<F> = candidates
            .into_iter()
            .filter(|candidate| {
                let flow = flow_of(candidate);
                flow.is_active
                    && flow.channel_id == event.channel_id
                    && flow.trigger.accepts(event)
            })
            .collect();

        if matched.len() > 1 {
            info!(
                channel_id = %event.channel_id,
                delivery_id = %event.delivery_id,
                candidates = matched.len(),
                "multiple flows matched event, selecting most recently updated"
            );
        }

        matched.sort_by(|a, b| {
            let (a, b) = (flow_of(a), flow_of(b));
            b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id))
        });
        matched.into_iter().next()
    }
}

fn flow_of<F: Borrow<PublishedFlow>>(candidate: &F) -> &Flow {
    <F as Borrow<PublishedFlow>>::borrow(candidate).flow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use replyflow_core::{FlowId, WorkspaceId};

    fn comment(text: &str) -> InboundEvent {
        InboundEvent {
            event_type: TriggerType::Comment,
            channel_id: "chan".to_string(),
            external_user_id: "user-1".to_string(),
            text: Some(text.to_string()),
            media_id: Some("post-1".to_string()),
            comment_id: Some("c-1".to_string()),
            delivery_id: "d-1".to_string(),
        }
    }

    fn published(trigger: TriggerRule) -> PublishedFlow {
        Flow::single_message(WorkspaceId::new(), "chan", trigger, "hello")
            .publish()
            .expect("valid flow")
    }

    #[test]
    fn specific_matches_case_insensitive_substring() {
        let rule = TriggerRule::specific(TriggerType::Comment, ["Bootcamp"]);
        assert!(rule.accepts(&comment("love this BOOTCAMP!")));
        assert!(!rule.accepts(&comment("love this course")));
    }

    #[test]
    fn specific_without_keywords_never_matches() {
        let rule = TriggerRule::specific(TriggerType::Comment, Vec::<String>::new());
        assert!(!rule.accepts(&comment("anything")));

        let rule = TriggerRule::specific(TriggerType::Comment, [""]);
        assert!(!rule.accepts(&comment("anything")));
    }

    #[test]
    fn keywords_are_not_trimmed() {
        let rule = TriggerRule::specific(TriggerType::Comment, [" link "]);
        assert!(rule.accepts(&comment("send the LINK please")));
        assert!(!rule.accepts(&comment("link")));
        assert!(!rule.accepts(&comment("unlinked")));
    }

    #[test]
    fn specific_without_text_never_matches() {
        let rule = TriggerRule::specific(TriggerType::Comment, ["link"]);
        let mut event = comment("");
        event.text = None;
        assert!(!rule.accepts(&event));
    }

    #[test]
    fn any_matches_without_text() {
        let rule = TriggerRule::any(TriggerType::Comment);
        let mut event = comment("");
        event.text = None;
        assert!(rule.accepts(&event));
    }

    #[test]
    fn event_type_must_match() {
        let rule = TriggerRule::any(TriggerType::Dm);
        assert!(!rule.accepts(&comment("hi")));
    }

    #[test]
    fn media_scope() {
        let scoped = TriggerRule::any(TriggerType::Comment).for_media("post-1");
        assert!(scoped.accepts(&comment("hi")));

        let other = TriggerRule::any(TriggerType::Comment).for_media("post-2");
        assert!(!other.accepts(&comment("hi")));

        let mut no_media = comment("hi");
        no_media.media_id = None;
        assert!(!scoped.accepts(&no_media));
        assert!(TriggerRule::any(TriggerType::Comment).accepts(&no_media));
    }

    #[test]
    fn select_skips_inactive_flows() {
        let mut flow = published(TriggerRule::any(TriggerType::Comment));
        flow.set_active(false);
        assert!(TriggerMatcher::select(&comment("hi"), vec![flow]).is_none());
    }

    #[test]
    fn select_prefers_most_recent_update() {
        let now = Utc::now();
        let mut older = published(TriggerRule::any(TriggerType::Comment));
        older.touch(now - Duration::minutes(5));
        let mut newer = published(TriggerRule::specific(TriggerType::Comment, ["hi"]));
        newer.touch(now);
        let newer_id = newer.id();

        let winner = TriggerMatcher::select(&comment("hi"), vec![older, newer]).expect("match");
        assert_eq!(winner.id(), newer_id);
    }

    #[test]
    fn select_breaks_ties_by_smallest_id() {
        let now = Utc::now();
        let mut a = published(TriggerRule::any(TriggerType::Comment));
        let mut b = published(TriggerRule::any(TriggerType::Comment));
        a.touch(now);
        b.touch(now);
        let smallest: FlowId = std::cmp::min(a.id(), b.id());

        let winner = TriggerMatcher::select(&comment("hi"), [&b, &a]).expect("match");
        assert_eq!(winner.id(), smallest);
    }

    #[test]
    fn select_requires_same_channel() {
        let flow = published(TriggerRule::any(TriggerType::Comment));
        let mut event = comment("hi");
        event.channel_id = "other".to_string();
        assert!(TriggerMatcher::select(&event, [&flow]).is_none());
    }
}
