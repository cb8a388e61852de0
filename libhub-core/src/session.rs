//! One chat's conversation state.
//!
//! ```text
//! Empty --push_user--> AwaitingReply --finish_reply--> Active --push_user--> AwaitingReply ...
//! ```
//!
//! Replies are accumulated in an `AssistantDraft` outside the session and only
//! land in the history through `finish_reply`, so an abandoned draft never
//! leaves a half-written turn behind.

use chrono::{DateTime, Utc};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{ConversationTurn, RetrievalResult, Role};

/// Request phrases that signal a new search rather than a follow-up.
const NEW_QUERY_PHRASES: &[&str] = &[
    "do you have",
    "looking for",
    "find me",
    "search for",
    "recommend",
    "suggest",
    "show me",
    "any books about",
    "what books",
    "which books",
    "tell me about",
];

/// Mentions of catalog fields that always warrant a new search.
const FILTER_WORDS: &[&str] = &["page", "year", "genre", "category", "author"];

/// Below this much earlier conversation, every message triggers retrieval.
const SHORT_HISTORY_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    Active,
    AwaitingReply,
}

/// What happens to a reply that did not finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartialReplyPolicy {
    #[default]
    Discard,
    MarkIncomplete,
}

impl FromStr for PartialReplyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(PartialReplyPolicy::Discard),
            "mark_incomplete" => Ok(PartialReplyPolicy::MarkIncomplete),
            other => Err(format!(
                "unknown partial reply policy '{other}' (expected discard or mark_incomplete)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    Appended,
    MarkedIncomplete,
    Discarded,
}

/// Assistant reply under construction.
#[derive(Debug, Clone, Default)]
pub struct AssistantDraft {
    text: String,
    complete: bool,
}

impl AssistantDraft {
    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
    }

    /// The generator reported a normal end of stream.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

#[derive(Debug, Clone)]
pub struct ConversationSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    turns: Vec<ConversationTurn>,
    max_turns: usize,
    policy: PartialReplyPolicy,
    awaiting_reply: bool,
    cached_retrieval: Option<RetrievalResult>,
}

impl ConversationSession {
    pub fn new(max_turns: usize, policy: PartialReplyPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            turns: Vec::new(),
            max_turns: max_turns.max(1),
            policy,
            awaiting_reply: false,
            cached_retrieval: None,
        }
    }

    /// Rebuild a session from a client-supplied transcript.
    pub fn from_turns(
        turns: Vec<ConversationTurn>,
        max_turns: usize,
        policy: PartialReplyPolicy,
    ) -> Self {
        let mut session = Self::new(max_turns, policy);
        session.awaiting_reply = turns.last().is_some_and(ConversationTurn::is_user);
        session.turns = turns;
        session.enforce_bound();
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn policy(&self) -> PartialReplyPolicy {
        self.policy
    }

    pub fn state(&self) -> SessionState {
        if self.awaiting_reply {
            SessionState::AwaitingReply
        } else if self.turns.is_empty() {
            SessionState::Empty
        } else {
            SessionState::Active
        }
    }

    /// Append a user message. Consecutive user messages are allowed.
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(ConversationTurn::user(content));
        self.awaiting_reply = true;
        self.enforce_bound();
    }

    pub fn begin_reply(&self) -> AssistantDraft {
        AssistantDraft::default()
    }

    /// Settle a reply into the history according to its completeness and the policy.
    pub fn finish_reply(&mut self, draft: AssistantDraft) -> ReplyDisposition {
        self.awaiting_reply = false;

        if draft.complete {
            self.turns.push(ConversationTurn::assistant(draft.text));
            self.enforce_bound();
            return ReplyDisposition::Appended;
        }

        match self.policy {
            PartialReplyPolicy::Discard => {
                tracing::debug!(session = %self.id, chars = draft.text.len(), "Discarding partial reply");
                ReplyDisposition::Discarded
            }
            PartialReplyPolicy::MarkIncomplete => {
                self.turns.push(ConversationTurn {
                    role: Role::Assistant,
                    content: draft.text,
                    complete: false,
                });
                self.enforce_bound();
                ReplyDisposition::MarkedIncomplete
            }
        }
    }

    pub fn latest_user_message(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.is_user())
            .map(|t| t.content.as_str())
    }

    pub fn cached_retrieval(&self) -> Option<&RetrievalResult> {
        self.cached_retrieval.as_ref()
    }

    pub fn cache_retrieval(&mut self, retrieval: RetrievalResult) {
        self.cached_retrieval = Some(retrieval);
    }

    /// Whether the latest message needs a fresh search or can reuse the cached one.
    pub fn needs_fresh_retrieval(&self) -> bool {
        if self.cached_retrieval.is_none() {
            return true;
        }
        let Some(query) = self.latest_user_message() else {
            return true;
        };
        is_new_query(query, self.earlier_history_chars())
    }

    /// Length of the transcript before the latest user turn, as `Role: text` lines.
    fn earlier_history_chars(&self) -> usize {
        let latest = self.turns.iter().rposition(ConversationTurn::is_user);
        self.turns
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != latest)
            .map(|(_, t)| t.role.as_str().len() + 2 + t.content.len() + 1)
            .sum()
    }

    fn enforce_bound(&mut self) {
        if self.turns.len() > self.max_turns {
            let excess = self.turns.len() - self.max_turns;
            self.turns.drain(..excess);
        }
    }
}

/// Follow-up detection for a query given the size of the earlier conversation.
pub fn is_new_query(query: &str, history_chars: usize) -> bool {
    if history_chars < SHORT_HISTORY_CHARS {
        return true;
    }
    let lowered = query.to_lowercase();
    NEW_QUERY_PHRASES.iter().any(|p| lowered.contains(p))
        || FILTER_WORDS.iter().any(|w| lowered.contains(w))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::TokenStream;
    use futures::StreamExt;

    #[test]
    fn test_state_transitions() {
        let mut session = ConversationSession::new(10, PartialReplyPolicy::Discard);
        assert_eq!(session.state(), SessionState::Empty);

        session.push_user("hi");
        assert_eq!(session.state(), SessionState::AwaitingReply);

        let mut draft = session.begin_reply();
        draft.push("hello");
        draft.mark_complete();
        assert_eq!(session.finish_reply(draft), ReplyDisposition::Appended);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.turns().len(), 2);
    }

    #[test]
    fn test_consecutive_user_turns_allowed() {
        let mut session = ConversationSession::new(10, PartialReplyPolicy::Discard);
        session.push_user("one");
        session.push_user("two");
        assert_eq!(session.turns().len(), 2);
        assert_eq!(session.latest_user_message(), Some("two"));
    }

    #[test]
    fn test_oldest_turns_dropped_past_bound() {
        let mut session = ConversationSession::new(3, PartialReplyPolicy::Discard);
        for i in 0..5 {
            session.push_user(format!("m{i}"));
        }
        let contents: Vec<&str> = session.turns().iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_dropped_draft_leaves_session_unchanged() {
        let mut session = ConversationSession::new(10, PartialReplyPolicy::MarkIncomplete);
        session.push_user("hi");
        {
            let mut draft = session.begin_reply();
            draft.push("partial");
        }
        assert_eq!(session.turns().len(), 1);
        assert_eq!(session.state(), SessionState::AwaitingReply);
    }

    async fn cancel_after_two(policy: PartialReplyPolicy) -> ConversationSession {
        let mut session = ConversationSession::new(10, policy);
        session.push_user("ten things please");

        let mut stream = TokenStream::from_chunks((0..10).map(|i| format!("c{i} ")));
        let mut draft = session.begin_reply();
        for _ in 0..2 {
            let chunk = stream.next().await.unwrap().unwrap();
            draft.push(&chunk);
        }
        stream.cancel();
        assert!(stream.next().await.is_none());

        session.finish_reply(draft);
        session
    }

    #[tokio::test]
    async fn test_cancelled_reply_is_discarded() {
        let session = cancel_after_two(PartialReplyPolicy::Discard).await;
        assert_eq!(session.turns().len(), 1);
        assert!(session.turns()[0].is_user());
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_cancelled_reply_is_marked_incomplete() {
        let session = cancel_after_two(PartialReplyPolicy::MarkIncomplete).await;
        assert_eq!(session.turns().len(), 2);
        let last = &session.turns()[1];
        assert_eq!(last.role, Role::Assistant);
        assert!(!last.complete);
        assert_eq!(last.content, "c0 c1 ");
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "discard".parse::<PartialReplyPolicy>(),
            Ok(PartialReplyPolicy::Discard)
        );
        assert_eq!(
            " Mark_Incomplete ".parse::<PartialReplyPolicy>(),
            Ok(PartialReplyPolicy::MarkIncomplete)
        );
        assert!("keep".parse::<PartialReplyPolicy>().is_err());
    }

    #[test]
    fn test_from_turns_awaits_reply_when_last_is_user() {
        let session = ConversationSession::from_turns(
            vec![ConversationTurn::assistant("welcome"), ConversationTurn::user("hi")],
            10,
            PartialReplyPolicy::Discard,
        );
        assert_eq!(session.state(), SessionState::AwaitingReply);
    }

    #[test]
    fn test_follow_up_detection() {
        assert!(is_new_query("and the second one?", 10));
        assert!(!is_new_query("and the second one?", 200));
        assert!(is_new_query("Can you RECOMMEND a thriller", 200));
        assert!(is_new_query("something under 300 pages", 200));
        assert!(is_new_query("more by that author", 200));
    }

    #[test]
    fn test_cache_reused_for_follow_ups() {
        let mut session = ConversationSession::from_turns(
            vec![
                ConversationTurn::user("I am looking for a cozy mystery set in a village"),
                ConversationTurn::assistant("Try BID[3], a gentle whodunit with tea and gossip."),
                ConversationTurn::user("is it long?"),
            ],
            10,
            PartialReplyPolicy::Discard,
        );
        assert!(session.needs_fresh_retrieval(), "nothing cached yet");
        session.cache_retrieval(RetrievalResult::default());
        assert!(!session.needs_fresh_retrieval());

        session.push_user("show me sci-fi instead");
        assert!(session.needs_fresh_retrieval());
    }
}
