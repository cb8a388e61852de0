//! Chat orchestration
//!
//! One request carries the whole transcript. The service rebuilds a
//! `ConversationSession` from it, decides whether the latest message needs a
//! fresh search, assembles the prompt and starts generation. The returned
//! `ChatReply` yields text with citation markers removed, then one `Books`
//! event with a card per cited book.
//!
//! Retrievals are remembered per session id so that short follow-ups
//! ("is it long?") answer from the same books instead of searching again.

use chrono::{DateTime, Utc};
use futures::Stream;
use libhub_core::config::LibhubConfig;
use libhub_core::context::{ContextAssembler, ContextError};
use libhub_core::embeddings::EmbeddingError;
use libhub_core::generation::{GenerationBackend, GenerationError, TokenStream};
use libhub_core::models::{BookCard, BookId, ConversationTurn, RetrievalResult};
use libhub_core::retriever::{requested_limit, RetrievalError, Retriever, SearchFilters};
use libhub_core::session::{AssistantDraft, ConversationSession, PartialReplyPolicy, SessionState};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use super::catalog::{BookCatalog, CatalogError};
use super::citations::CitationFilter;

/// Upper bound on remembered session retrievals; the oldest is evicted first.
const MAX_CACHED_SESSIONS: usize = 1024;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Conversation must end with a user message")]
    NoUserMessage,

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl ChatError {
    /// Errors caused by the request itself rather than a failing dependency.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ChatError::NoUserMessage
                | ChatError::Context(
                    ContextError::MissingUserTurn | ContextError::BudgetTooSmall { .. }
                )
                | ChatError::Retrieval(RetrievalError::Embedding(
                    EmbeddingError::EmptyInput | EmbeddingError::InputTooLong { .. }
                ))
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Text(String),
    Books(Vec<BookCard>),
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub default_k: usize,
    pub max_k: usize,
    pub max_context_tokens: usize,
    pub max_turns: usize,
    pub partial_replies: PartialReplyPolicy,
    pub extract_filters: bool,
}

impl ChatSettings {
    pub fn from_config(config: &LibhubConfig) -> Self {
        let partial_replies = config
            .session
            .partial_replies
            .parse::<PartialReplyPolicy>()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to discarding partial replies");
                PartialReplyPolicy::default()
            });

        Self {
            default_k: config.retrieval.default_k,
            max_k: config.retrieval.max_k,
            max_context_tokens: config.context.max_context_tokens,
            max_turns: config.session.max_turns,
            partial_replies,
            extract_filters: config.generation.extract_filters,
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            default_k: libhub_core::retriever::DEFAULT_LIMIT,
            max_k: libhub_core::retriever::MAX_LIMIT,
            max_context_tokens: 1500,
            max_turns: 40,
            partial_replies: PartialReplyPolicy::Discard,
            extract_filters: false,
        }
    }
}

struct CachedRetrieval {
    result: RetrievalResult,
    stored_at: DateTime<Utc>,
}

pub struct ChatService {
    retriever: Arc<Retriever>,
    generator: Arc<dyn GenerationBackend>,
    catalog: Arc<dyn BookCatalog>,
    assembler: ContextAssembler,
    settings: ChatSettings,
    retrievals: Mutex<HashMap<Uuid, CachedRetrieval>>,
}

impl ChatService {
    pub fn new(
        retriever: Arc<Retriever>,
        generator: Arc<dyn GenerationBackend>,
        catalog: Arc<dyn BookCatalog>,
        assembler: ContextAssembler,
        settings: ChatSettings,
    ) -> Self {
        Self {
            retriever,
            generator,
            catalog,
            assembler,
            settings,
            retrievals: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn generator(&self) -> &Arc<dyn GenerationBackend> {
        &self.generator
    }

    /// Start answering the last user turn of `turns`.
    ///
    /// Everything that can fail before the first chunk fails here.
    pub async fn start(
        self: &Arc<Self>,
        turns: Vec<ConversationTurn>,
        session_id: Option<Uuid>,
    ) -> Result<ChatReply, ChatError> {
        let mut session = ConversationSession::from_turns(
            turns,
            self.settings.max_turns,
            self.settings.partial_replies,
        );
        if session.state() != SessionState::AwaitingReply {
            return Err(ChatError::NoUserMessage);
        }
        let query = session
            .latest_user_message()
            .ok_or(ChatError::NoUserMessage)?
            .to_string();
        let session_id = session_id.unwrap_or_else(|| session.id());

        if let Some(previous) = self.recall(session_id) {
            session.cache_retrieval(previous);
        }
        if session.needs_fresh_retrieval() {
            let retrieval = self.search(&query).await?;
            session.cache_retrieval(retrieval);
        } else {
            tracing::debug!(session = %session_id, "Reusing previous retrieval for follow-up");
        }
        let retrieval = session.cached_retrieval().cloned().unwrap_or_default();
        self.remember(session_id, retrieval.clone());

        let prompt = self.assembler.build_prompt(
            session.turns(),
            &retrieval,
            self.settings.max_context_tokens,
        )?;
        let tokens = self.generator.generate(&prompt).await?;

        tracing::info!(
            session = %session_id,
            books = retrieval.len(),
            turns = session.turns().len(),
            "Chat reply started"
        );

        Ok(ChatReply {
            service: Arc::clone(self),
            session_id,
            draft: session.begin_reply(),
            session,
            retrieval,
            tokens,
            citations: CitationFilter::new(),
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Retrieval for one chat query: optional filter extraction, "N books" limit.
    async fn search(&self, query: &str) -> Result<RetrievalResult, ChatError> {
        let k = requested_limit(query, self.settings.default_k, self.settings.max_k);

        let filters = if self.settings.extract_filters {
            match self.generator.extract_filters(query).await {
                Ok(filters) => filters,
                Err(e) => {
                    tracing::warn!(error = %e, "Filter extraction failed, searching without filters");
                    SearchFilters::default()
                }
            }
        } else {
            SearchFilters::default()
        };

        tracing::debug!(k = k, filters = ?filters, "Searching catalog for chat");
        Ok(self.retriever.retrieve_filtered(query, k, &filters).await?)
    }

    fn recall(&self, session_id: Uuid) -> Option<RetrievalResult> {
        let cache = self.retrievals.lock().ok()?;
        cache.get(&session_id).map(|c| c.result.clone())
    }

    fn remember(&self, session_id: Uuid, result: RetrievalResult) {
        let Ok(mut cache) = self.retrievals.lock() else {
            return;
        };
        cache.insert(
            session_id,
            CachedRetrieval {
                result,
                stored_at: Utc::now(),
            },
        );
        if cache.len() > MAX_CACHED_SESSIONS {
            let oldest = cache
                .iter()
                .min_by_key(|(_, c)| c.stored_at)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                cache.remove(&id);
            }
        }
    }

    async fn book_cards(&self, cited: &[BookId], retrieval: &RetrievalResult) -> Vec<BookCard> {
        let missing: Vec<BookId> = cited
            .iter()
            .copied()
            .filter(|id| retrieval.get(*id).is_none())
            .collect();
        let fetched = if missing.is_empty() {
            Vec::new()
        } else {
            self.catalog.get_books(&missing).await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load cited books from catalog");
                Vec::new()
            })
        };

        let mut cards = Vec::with_capacity(cited.len());
        for &id in cited {
            let (title, author, cover) = if let Some(doc) = retrieval.get(id) {
                (
                    doc.metadata.title.clone(),
                    doc.metadata.author.clone(),
                    doc.metadata.cover_url.clone(),
                )
            } else if let Some(book) = fetched.iter().find(|b| b.id == id) {
                (book.title.clone(), book.author.clone(), book.cover_image_url.clone())
            } else {
                tracing::debug!(id = id, "Model cited an unknown book");
                continue;
            };

            let availability = match self.catalog.availability(id).await {
                Ok(a) => a.label(),
                Err(e) => {
                    tracing::warn!(id = id, error = %e, "Failed to load availability");
                    "availability unknown".to_string()
                }
            };

            cards.push(BookCard {
                id,
                title,
                author,
                cover: cover.unwrap_or_default(),
                availability,
            });
        }
        cards
    }
}

/// A reply in progress. Dropping it cancels generation.
pub struct ChatReply {
    service: Arc<ChatService>,
    session_id: Uuid,
    session: ConversationSession,
    retrieval: RetrievalResult,
    tokens: TokenStream,
    citations: CitationFilter,
    draft: AssistantDraft,
    pending: VecDeque<ChatEvent>,
    done: bool,
}

impl ChatReply {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn retrieval(&self) -> &RetrievalResult {
        &self.retrieval
    }

    /// Next event, or `None` once the reply is over. An `Err` is terminal.
    pub async fn next_event(&mut self) -> Option<Result<ChatEvent, ChatError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }

            match self.tokens.next_chunk().await {
                Some(Ok(chunk)) => {
                    let text = self.citations.push(&chunk);
                    if !text.is_empty() {
                        self.draft.push(&text);
                        return Some(Ok(ChatEvent::Text(text)));
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    tracing::warn!(session = %self.session_id, error = %e, "Generation stream failed");
                    self.settle();
                    return Some(Err(e.into()));
                }
                None => {
                    self.done = true;
                    let tail = self.citations.finish();
                    if !tail.is_empty() {
                        self.draft.push(&tail);
                        self.pending.push_back(ChatEvent::Text(tail));
                    }
                    self.draft.mark_complete();
                    self.settle();

                    let cited = self.citations.cited().to_vec();
                    if !cited.is_empty() {
                        let cards = self.service.book_cards(&cited, &self.retrieval).await;
                        if !cards.is_empty() {
                            self.pending.push_back(ChatEvent::Books(cards));
                        }
                    }
                }
            }
        }
    }

    fn settle(&mut self) {
        let draft = std::mem::take(&mut self.draft);
        let disposition = self.session.finish_reply(draft);
        tracing::debug!(session = %self.session_id, disposition = ?disposition, "Reply settled");
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ChatEvent, ChatError>> + Send + 'static {
        futures::stream::unfold(self, |mut reply| async move {
            reply.next_event().await.map(|event| (event, reply))
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::catalog::InMemoryCatalog;
    use crate::subsystems::indexer::{index_catalog, IndexMode};
    use async_trait::async_trait;
    use futures::StreamExt;
    use libhub_core::embeddings::HashingEmbedder;
    use libhub_core::index::InMemoryVectorIndex;
    use libhub_core::models::{Book, Role};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted chunks and records every prompt it receives.
    struct ScriptedGenerator {
        chunks: Vec<String>,
        fail_after: Option<usize>,
        prompts: Mutex<Vec<String>>,
        extract_calls: AtomicUsize,
        extract_fails: bool,
    }

    impl ScriptedGenerator {
        fn new(chunks: &[&str]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
                fail_after: None,
                prompts: Mutex::new(Vec::new()),
                extract_calls: AtomicUsize::new(0),
                extract_fails: false,
            }
        }

        fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedGenerator {
        async fn generate(&self, prompt: &str) -> Result<TokenStream, GenerationError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let Some(fail_after) = self.fail_after else {
                return Ok(TokenStream::from_chunks(self.chunks.clone()));
            };

            let (tx, stream) = TokenStream::channel(self.chunks.len() + 1);
            let chunks: Vec<String> = self.chunks.iter().take(fail_after).cloned().collect();
            tokio::spawn(async move {
                for chunk in chunks {
                    tx.send(Ok(chunk)).await;
                }
                tx.send(Err(GenerationError::Incomplete)).await;
            });
            Ok(stream)
        }

        async fn extract_filters(&self, query: &str) -> Result<SearchFilters, GenerationError> {
            self.extract_calls.fetch_add(1, Ordering::SeqCst);
            if self.extract_fails {
                return Err(GenerationError::Malformed("not json".to_string()));
            }
            Ok(SearchFilters {
                search_query: Some(query.to_string()),
                ..Default::default()
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn book(id: BookId, title: &str, synopsis: &str) -> Book {
        Book {
            id,
            title: title.to_string(),
            author: "Test Author".to_string(),
            synopsis: Some(synopsis.to_string()),
            cover_image_url: Some(format!("https://covers.example/{id}.jpg")),
            ..Default::default()
        }
    }

    async fn service(generator: Arc<ScriptedGenerator>, settings: ChatSettings) -> Arc<ChatService> {
        let catalog = Arc::new(InMemoryCatalog::from_books(
            vec![
                book(1, "The Remains", "a story about memory and loss"),
                book(2, "Vault", "a thriller about a heist"),
                book(3, "Quiet Garden", "gardening through the seasons"),
            ],
            3,
        ));
        let backend = Arc::new(HashingEmbedder::new(256, 256));
        let index = Arc::new(InMemoryVectorIndex::new(256));
        index_catalog(catalog.as_ref(), backend.as_ref(), index.as_ref(), IndexMode::Full, 0)
            .await
            .unwrap();

        let retriever = Arc::new(Retriever::new(backend, index));
        Arc::new(ChatService::new(
            retriever,
            generator,
            catalog,
            ContextAssembler::default(),
            settings,
        ))
    }

    async fn collect(reply: ChatReply) -> Vec<Result<ChatEvent, ChatError>> {
        reply.into_stream().collect().await
    }

    fn text_of(events: &[Result<ChatEvent, ChatError>]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                Ok(ChatEvent::Text(t)) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reply_strips_markers_and_ends_with_cards() {
        let generator = Arc::new(ScriptedGenerator::new(&[
            "Try **The Remains** BI",
            "D[1], it is about memory.",
        ]));
        let chat = service(generator.clone(), ChatSettings::default()).await;

        let reply = chat
            .start(vec![ConversationTurn::user("something about memory")], None)
            .await
            .unwrap();
        let events = collect(reply).await;

        assert_eq!(text_of(&events), "Try **The Remains** , it is about memory.");
        let Some(Ok(ChatEvent::Books(cards))) = events.last() else {
            panic!("last event should carry book cards: {events:?}");
        };
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].id, 1);
        assert_eq!(cards[0].title, "The Remains");
        assert_eq!(cards[0].cover, "https://covers.example/1.jpg");
        assert_eq!(cards[0].availability, "3/3 available");

        assert!(generator.last_prompt().contains("The Remains"));
    }

    #[tokio::test]
    async fn test_no_cards_without_citations() {
        let generator = Arc::new(ScriptedGenerator::new(&["Nothing fits, sorry."]));
        let chat = service(generator, ChatSettings::default()).await;

        let reply = chat
            .start(vec![ConversationTurn::user("books about volcanoes")], None)
            .await
            .unwrap();
        let events = collect(reply).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(ChatEvent::Text(_))));
    }

    #[tokio::test]
    async fn test_cited_book_outside_results_is_loaded_from_catalog() {
        let generator = Arc::new(ScriptedGenerator::new(&["Also see BID[3]."]));
        let settings = ChatSettings {
            default_k: 1,
            ..Default::default()
        };
        let chat = service(generator, settings).await;

        let reply = chat
            .start(vec![ConversationTurn::user("a heist thriller")], None)
            .await
            .unwrap();
        assert!(reply.retrieval().get(3).is_none());
        let events = collect(reply).await;

        let Some(Ok(ChatEvent::Books(cards))) = events.last() else {
            panic!("expected cards");
        };
        assert_eq!(cards[0].title, "Quiet Garden");
    }

    #[tokio::test]
    async fn test_unknown_cited_id_gets_no_card() {
        let generator = Arc::new(ScriptedGenerator::new(&["Maybe BID[404]."]));
        let chat = service(generator, ChatSettings::default()).await;

        let reply = chat
            .start(vec![ConversationTurn::user("anything")], None)
            .await
            .unwrap();
        let events = collect(reply).await;

        assert_eq!(text_of(&events), "Maybe .");
        assert!(!events.iter().any(|e| matches!(e, Ok(ChatEvent::Books(_)))));
    }

    #[tokio::test]
    async fn test_transcript_must_end_with_user_turn() {
        let chat = service(Arc::new(ScriptedGenerator::new(&[])), ChatSettings::default()).await;

        let err = chat
            .start(vec![ConversationTurn::assistant("Hello!")], None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::NoUserMessage));
        assert!(err.is_client_error());

        let err = chat.start(Vec::new(), None).await.err().unwrap();
        assert!(matches!(err, ChatError::NoUserMessage));
    }

    #[tokio::test]
    async fn test_blank_message_is_client_error() {
        let chat = service(Arc::new(ScriptedGenerator::new(&[])), ChatSettings::default()).await;

        let err = chat
            .start(vec![ConversationTurn::user("   ")], None)
            .await
            .err()
            .unwrap();
        assert!(err.is_client_error(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_message_too_long_for_context_is_client_error() {
        let generator = Arc::new(ScriptedGenerator::new(&["ok"]));
        let settings = ChatSettings {
            max_context_tokens: 120,
            ..Default::default()
        };
        let chat = service(generator.clone(), settings).await;

        let long_message = format!("something about memory {}", "and more ".repeat(60));
        let err = chat
            .start(vec![ConversationTurn::user(long_message)], None)
            .await
            .err()
            .unwrap();

        assert!(
            matches!(err, ChatError::Context(ContextError::BudgetTooSmall { .. })),
            "got {err:?}"
        );
        assert!(err.is_client_error());
        assert!(generator.last_prompt().is_empty(), "nothing should reach the model");
    }

    #[tokio::test]
    async fn test_follow_up_reuses_session_retrieval() {
        let generator = Arc::new(ScriptedGenerator::new(&["ok"]));
        let settings = ChatSettings {
            extract_filters: true,
            ..Default::default()
        };
        let chat = service(generator.clone(), settings).await;
        let session = Uuid::new_v4();

        let mut turns = vec![ConversationTurn::user(
            "I am looking for a story about memory and loss",
        )];
        let first = chat.start(turns.clone(), Some(session)).await.unwrap();
        let first_ids = first.retrieval().ids();
        collect(first).await;
        assert_eq!(generator.extract_calls.load(Ordering::SeqCst), 1);

        turns.push(ConversationTurn::assistant(
            "The Remains is a quiet, moving novel about memory.",
        ));
        turns.push(ConversationTurn::user("is it long?"));
        let second = chat.start(turns, Some(session)).await.unwrap();

        assert_eq!(generator.extract_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.retrieval().ids(), first_ids);
    }

    #[tokio::test]
    async fn test_failed_filter_extraction_falls_back() {
        let mut generator = ScriptedGenerator::new(&["ok"]);
        generator.extract_fails = true;
        let generator = Arc::new(generator);
        let settings = ChatSettings {
            extract_filters: true,
            ..Default::default()
        };
        let chat = service(generator.clone(), settings).await;

        let reply = chat
            .start(vec![ConversationTurn::user("something about memory")], None)
            .await
            .unwrap();

        assert_eq!(generator.extract_calls.load(Ordering::SeqCst), 1);
        assert_eq!(reply.retrieval().documents[0].id, 1);
    }

    #[tokio::test]
    async fn test_requested_book_count_limits_results() {
        let chat = service(Arc::new(ScriptedGenerator::new(&["ok"])), ChatSettings::default()).await;

        let reply = chat
            .start(vec![ConversationTurn::user("recommend 2 books about memory")], None)
            .await
            .unwrap();
        assert!(reply.retrieval().len() <= 2);
    }

    #[tokio::test]
    async fn test_stream_failure_marks_reply_incomplete() {
        let mut generator = ScriptedGenerator::new(&["one ", "two ", "three "]);
        generator.fail_after = Some(2);
        let settings = ChatSettings {
            partial_replies: PartialReplyPolicy::MarkIncomplete,
            ..Default::default()
        };
        let chat = service(Arc::new(generator), settings).await;

        let mut reply = chat
            .start(vec![ConversationTurn::user("something about memory")], None)
            .await
            .unwrap();
        let mut texts = Vec::new();
        let mut failed = false;
        while let Some(event) = reply.next_event().await {
            match event {
                Ok(ChatEvent::Text(t)) => texts.push(t),
                Ok(ChatEvent::Books(_)) => panic!("no cards after a failure"),
                Err(e) => {
                    assert!(matches!(e, ChatError::Generation(GenerationError::Incomplete)));
                    failed = true;
                }
            }
        }

        assert!(failed);
        assert_eq!(texts.concat(), "one two ");
        let last = reply.session().turns().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(!last.complete);
        assert_eq!(last.content, "one two ");
    }

    #[tokio::test]
    async fn test_completed_reply_lands_in_session() {
        let chat = service(Arc::new(ScriptedGenerator::new(&["Hello there."])), ChatSettings::default()).await;

        let mut reply = chat
            .start(vec![ConversationTurn::user("hi")], None)
            .await
            .unwrap();
        while reply.next_event().await.is_some() {}

        let last = reply.session().turns().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.complete);
        assert_eq!(last.content, "Hello there.");
    }

    #[test]
    fn test_settings_fall_back_on_unknown_policy() {
        let config = LibhubConfig::from_toml_str(
            r#"
            [database]
            url = "postgresql://localhost/library"
            max_connections = 1

            [embedding]
            backend = "hashing"
            dimensions = 64
            max_input_tokens = 256

            [generation]
            base_url = "http://localhost:11434"
            model = "test"

            [session]
            max_turns = 8
            partial_replies = "keep_everything"
            "#,
        )
        .unwrap();

        let settings = ChatSettings::from_config(&config);
        assert_eq!(settings.partial_replies, PartialReplyPolicy::Discard);
        assert_eq!(settings.max_turns, 8);
    }
}
