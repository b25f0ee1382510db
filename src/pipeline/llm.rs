//! Conversation client: the multi-turn chat with the model.
//!
//! Chunks are appended to a single conversation, one user turn each, and the
//! model only acknowledges them. The last turn ([`ConversationClient::finalize`])
//! asks for the whole book as markup. All prompt text lives in
//! [`crate::prompts`].
//!
//! The external service sits behind the [`ChatBackend`] trait. Production code
//! uses [`LlmBackend`] over an `edgequake_llm` provider; tests script replies.
//!
//! ## Retry Strategy
//!
//! Every call is classified by its error text:
//!
//! | Class | Examples | Behaviour |
//! |-------|----------|-----------|
//! | quota | "daily quota exceeded", `insufficient_quota` | fail at once with `QuotaExceeded` |
//! | rate limit | 429, "resource exhausted" | retry, `RateLimited` when exhausted |
//! | transient | 5xx, timeouts, network errors | retry, `TransientServer` when exhausted |
//! | other | 400, auth errors | fail at once with `Unclassified` |
//!
//! The first retry waits `initial_backoff_ms` (3 s); each further wait is
//! `previous * 2 + random(0..=jitter)`. With 7 attempts the worst case is a
//! little over three minutes of waiting, long enough for per-minute request
//! windows to reset.

use crate::config::ConversionConfig;
use crate::error::Pdf2EpubError;
use crate::pipeline::chunk::Chunk;
use crate::pipeline::encode::ExtractedImage;
use crate::pipeline::postprocess::parse_html_payload;
use crate::prompts::{DEFAULT_SYSTEM_INSTRUCTION, FINALIZE_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

// ── Conversation state ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One piece of a turn: text or an inline binary attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: ExtractedImage,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn image(image: ExtractedImage) -> Self {
        Part::InlineData { inline_data: image }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::text(text)],
        }
    }

    /// All text parts joined with newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                Part::InlineData { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn images(&self) -> impl Iterator<Item = &ExtractedImage> {
        self.parts.iter().filter_map(|p| match p {
            Part::InlineData { inline_data } => Some(inline_data),
            Part::Text { .. } => None,
        })
    }
}

/// Ordered history of a conversation, replayed verbatim on resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationState(Vec<Turn>);

impl ConversationState {
    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self(turns)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A live conversation. Only [`ConversationClient`] appends to it.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    state: ConversationState,
}

impl Conversation {
    pub fn state(&self) -> &ConversationState {
        &self.state
    }
}

// ── Backend seam ──────────────────────────────────────────────────────────

/// Everything one call to the service needs.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub system_instruction: &'a str,
    pub history: &'a [Turn],
    pub message: &'a Turn,
    /// The reply must be a JSON object.
    pub expect_json: bool,
}

/// Error reported by a backend. Only its text is used, for classification.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct BackendError(pub String);

/// The external chat service.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send `request.message` after `request.history` and return the reply text.
    async fn send(&self, request: ChatRequest<'_>) -> Result<String, BackendError>;
}

/// [`ChatBackend`] over an `edgequake_llm` provider.
pub struct LlmBackend {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ConversionConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
        }
    }
}

#[async_trait]
impl ChatBackend for LlmBackend {
    async fn send(&self, request: ChatRequest<'_>) -> Result<String, BackendError> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(ChatMessage::system(request.system_instruction));
        for turn in request.history.iter().chain(std::iter::once(request.message)) {
            messages.push(to_chat_message(turn));
        }

        let options = request_options(&self.options, request.expect_json);
        let start = Instant::now();
        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| BackendError(e.to_string()))?;
        debug!(
            "{} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

fn to_chat_message(turn: &Turn) -> ChatMessage {
    let text = turn.text();
    match turn.role {
        Role::Model => ChatMessage::assistant(text),
        Role::User => {
            let images: Vec<ImageData> = turn
                .images()
                .map(|img| ImageData::new(img.data.clone(), img.mime_type.as_str()))
                .collect();
            if images.is_empty() {
                ChatMessage::user(text)
            } else {
                ChatMessage::user_with_images(text, images)
            }
        }
    }
}

fn build_options(config: &ConversionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Per-call options: `base`, switched to JSON-object output when asked.
fn request_options(base: &CompletionOptions, expect_json: bool) -> CompletionOptions {
    let mut options = base.clone();
    if expect_json {
        options.response_format = Some("json_object".to_string());
    }
    options
}

// ── Error classification ──────────────────────────────────────────────────

/// How a failed call should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Quota,
    RateLimit,
    Transient,
    Other,
}

static RE_SERVER_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b5\d\d\b").unwrap());

/// Classify an error message, case-insensitively.
pub fn classify_error(message: &str) -> ErrorClass {
    let m = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

    if has(&["insufficient_quota", "exceeded your current quota"])
        || (m.contains("quota") && has(&["daily", "per day", "perday", "total"]))
    {
        ErrorClass::Quota
    } else if has(&["429", "rate limit", "ratelimit", "rate_limit", "resource exhausted", "resource_exhausted", "too many requests"]) {
        ErrorClass::RateLimit
    } else if RE_SERVER_STATUS.is_match(&m)
        || has(&[
            "internal",
            "unavailable",
            "overloaded",
            "timeout",
            "timed out",
            "network",
            "connection",
            "unknown",
        ])
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Other
    }
}

// ── Retry policy ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Upper bound of the random amount added to each grown delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            jitter: Duration::from_millis(config.backoff_jitter_ms),
        }
    }

    /// `previous * 2 + random(0..=jitter)`.
    pub fn next_delay(&self, previous: Duration) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        previous.saturating_mul(2) + Duration::from_millis(extra)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConversionConfig::default())
    }
}

// ── Client ────────────────────────────────────────────────────────────────

/// Sends chunks and the finalize turn, with retry and classification.
pub struct ConversationClient {
    backend: Arc<dyn ChatBackend>,
    policy: RetryPolicy,
    system_instruction: String,
    api_timeout: Duration,
}

impl ConversationClient {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        policy: RetryPolicy,
        system_instruction: impl Into<String>,
        api_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            policy,
            system_instruction: system_instruction.into(),
            api_timeout,
        }
    }

    /// Client driven by `config`'s retry, timeout and prompt settings.
    pub fn from_config(backend: Arc<dyn ChatBackend>, config: &ConversionConfig) -> Self {
        let instruction = config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_INSTRUCTION);
        Self::new(
            backend,
            RetryPolicy::from_config(config),
            instruction,
            config.api_timeout(),
        )
    }

    /// Begin a conversation, continuing `prior` verbatim when given.
    pub fn start(&self, prior: Option<ConversationState>) -> Conversation {
        Conversation {
            state: prior.unwrap_or_default(),
        }
    }

    /// Submit one chunk as a user turn with its images attached.
    ///
    /// On success the user turn and the model's acknowledgement are appended
    /// to `conversation`; on failure it is left untouched.
    pub async fn submit_chunk(
        &self,
        conversation: &mut Conversation,
        text: &str,
        images: &[ExtractedImage],
        chunk: &Chunk,
    ) -> Result<(), Pdf2EpubError> {
        let mut parts = Vec::with_capacity(images.len() + 1);
        parts.push(Part::text(text));
        parts.extend(images.iter().cloned().map(Part::image));
        let turn = Turn::user(parts);

        let request = ChatRequest {
            system_instruction: &self.system_instruction,
            history: conversation.state.turns(),
            message: &turn,
            expect_json: false,
        };
        let label = format!("Chunk {} (pages {}-{})", chunk.index + 1, chunk.start_page, chunk.end_page);
        let reply = self.send_with_retry(&label, request).await?;
        debug!("{}: acknowledged with {:?}", label, truncate(&reply, 40));

        conversation.state.0.push(turn);
        conversation.state.0.push(Turn::model(reply.trim()));
        Ok(())
    }

    /// Ask for the complete book as markup.
    ///
    /// The conversation is not modified, so calling this again on the same
    /// state sends the same request.
    pub async fn finalize(&self, conversation: &Conversation) -> Result<String, Pdf2EpubError> {
        let turn = Turn::user(vec![Part::text(FINALIZE_PROMPT)]);
        let request = ChatRequest {
            system_instruction: &self.system_instruction,
            history: conversation.state.turns(),
            message: &turn,
            expect_json: true,
        };
        let reply = self.send_with_retry("Finalize", request).await?;
        let markup = parse_html_payload(&reply)?;
        info!("Received {} bytes of markup", markup.len());
        Ok(markup)
    }

    async fn send_with_retry(
        &self,
        label: &str,
        request: ChatRequest<'_>,
    ) -> Result<String, Pdf2EpubError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut delay = self.policy.initial_delay;

        for attempt in 1..=max_attempts {
            let message = match timeout(self.api_timeout, self.backend.send(request)).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) => e.0,
                Err(_) => format!("request timed out after {}s", self.api_timeout.as_secs()),
            };

            let class = classify_error(&message);
            match class {
                ErrorClass::Quota => {
                    warn!("{}: quota exhausted: {}", label, message);
                    return Err(Pdf2EpubError::QuotaExceeded { message });
                }
                ErrorClass::Other => {
                    warn!("{}: failed: {}", label, message);
                    return Err(Pdf2EpubError::Unclassified { message });
                }
                ErrorClass::RateLimit | ErrorClass::Transient if attempt == max_attempts => {
                    warn!("{}: giving up after {} attempts: {}", label, attempt, message);
                    return Err(if class == ErrorClass::RateLimit {
                        Pdf2EpubError::RateLimited {
                            attempts: attempt,
                            message,
                        }
                    } else {
                        Pdf2EpubError::TransientServer {
                            attempts: attempt,
                            message,
                        }
                    });
                }
                ErrorClass::RateLimit | ErrorClass::Transient => {
                    warn!(
                        "{}: attempt {}/{} failed ({:?}), retrying in {}ms: {}",
                        label,
                        attempt,
                        max_attempts,
                        class,
                        delay.as_millis(),
                        message
                    );
                    sleep(delay).await;
                    delay = self.policy.next_delay(delay);
                }
            }
        }

        Err(Pdf2EpubError::Internal(format!(
            "{}: retry loop ended without a result",
            label
        )))
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ── Provider resolution ───────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Pdf2EpubError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Pdf2EpubError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`).
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI key present** (`OPENAI_API_KEY`).
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &ConversionConfig) -> Result<Arc<dyn LLMProvider>, Pdf2EpubError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Pdf2EpubError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, GEMINI_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies from a script, recording how much history each call carried.
    struct Scripted {
        replies: Mutex<VecDeque<Result<String, String>>>,
        calls: Mutex<Vec<(usize, bool)>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<&str, &str>>) -> Arc<Self> {
            Self::owned(
                replies
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            )
        }

        fn owned(replies: Vec<Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatBackend for Scripted {
        async fn send(&self, request: ChatRequest<'_>) -> Result<String, BackendError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.history.len(), request.expect_json));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".to_string()))
                .map_err(BackendError)
        }
    }

    struct Slow;

    #[async_trait]
    impl ChatBackend for Slow {
        async fn send(&self, _request: ChatRequest<'_>) -> Result<String, BackendError> {
            sleep(Duration::from_secs(10)).await;
            Ok("OK".into())
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(3000),
            jitter: Duration::ZERO,
        }
    }

    fn client(backend: Arc<dyn ChatBackend>, max_attempts: u32) -> ConversationClient {
        ConversationClient::new(backend, policy(max_attempts), "sys", Duration::from_secs(60))
    }

    fn chunk() -> Chunk {
        Chunk {
            index: 0,
            start_page: 1,
            end_page: 5,
        }
    }

    #[test]
    fn classification() {
        assert_eq!(
            classify_error("Quota exceeded for metric 'generate requests per day'"),
            ErrorClass::Quota
        );
        assert_eq!(classify_error("You exceeded your DAILY quota"), ErrorClass::Quota);
        assert_eq!(
            classify_error(
                "429 RESOURCE_EXHAUSTED: quotaId GenerateRequestsPerDayPerProjectPerModel-FreeTier"
            ),
            ErrorClass::Quota
        );
        assert_eq!(
            classify_error("Error code: 429 - {'error': {'code': 'insufficient_quota'}}"),
            ErrorClass::Quota
        );
        assert_eq!(
            classify_error("You exceeded your current quota, please check your plan and billing details"),
            ErrorClass::Quota
        );
        assert_eq!(
            classify_error("quotaId GenerateRequestsPerMinutePerProjectPerModel (429)"),
            ErrorClass::RateLimit
        );
        assert_eq!(classify_error("HTTP 429 Too Many Requests"), ErrorClass::RateLimit);
        assert_eq!(classify_error("RESOURCE_EXHAUSTED"), ErrorClass::RateLimit);
        assert_eq!(classify_error("quota exceeded per minute (429)"), ErrorClass::RateLimit);
        assert_eq!(classify_error("503 Service Unavailable"), ErrorClass::Transient);
        assert_eq!(classify_error("upstream returned 502"), ErrorClass::Transient);
        assert_eq!(classify_error("connection reset by peer"), ErrorClass::Transient);
        assert_eq!(classify_error("An unknown error occurred"), ErrorClass::Transient);
        assert_eq!(classify_error("400 invalid argument"), ErrorClass::Other);
        assert_eq!(classify_error("API key not valid"), ErrorClass::Other);
    }

    #[test]
    fn delay_doubles_plus_bounded_jitter() {
        let p = RetryPolicy {
            max_attempts: 7,
            initial_delay: Duration::from_millis(3000),
            jitter: Duration::from_millis(1000),
        };
        for _ in 0..50 {
            let next = p.next_delay(Duration::from_millis(3000));
            assert!(next >= Duration::from_millis(6000));
            assert!(next <= Duration::from_millis(7000));
        }
        assert_eq!(policy(7).next_delay(Duration::from_millis(6000)), Duration::from_millis(12000));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_with_growing_backoff() {
        let backend = Scripted::new(vec![
            Err("503 unavailable"),
            Err("503 unavailable"),
            Err("429 rate limit"),
            Ok("OK"),
        ]);
        let c = client(backend.clone(), 7);
        let mut conv = c.start(None);

        let started = tokio::time::Instant::now();
        c.submit_chunk(&mut conv, "--- PAGE 1 ---", &[], &chunk()).await.unwrap();
        let waited = started.elapsed();

        // 3s + 6s + 12s
        assert!(waited >= Duration::from_secs(21), "waited {waited:?}");
        assert!(waited < Duration::from_secs(22), "waited {waited:?}");
        assert_eq!(backend.call_count(), 4);
        assert_eq!(conv.state().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_the_last_error() {
        let script = (1..=7)
            .map(|i| Err(format!("429 too many requests #{i}")))
            .collect();
        let backend = Scripted::owned(script);
        let c = client(backend.clone(), 7);
        let mut conv = c.start(None);

        let err = c.submit_chunk(&mut conv, "x", &[], &chunk()).await.unwrap_err();
        match err {
            Pdf2EpubError::RateLimited { attempts, message } => {
                assert_eq!(attempts, 7);
                assert!(message.ends_with("#7"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(backend.call_count(), 7);
        assert!(conv.state().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_exhaustion_is_transient_server() {
        let backend = Scripted::new(vec![Err("500 internal"), Err("500 internal"), Err("500 internal")]);
        let c = client(backend.clone(), 3);
        let mut conv = c.start(None);
        let err = c.submit_chunk(&mut conv, "x", &[], &chunk()).await.unwrap_err();
        assert!(matches!(err, Pdf2EpubError::TransientServer { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn quota_is_not_retried() {
        let backend = Scripted::new(vec![Err("daily quota exceeded"), Ok("OK")]);
        let c = client(backend.clone(), 7);
        let mut conv = c.start(None);
        let err = c.submit_chunk(&mut conv, "x", &[], &chunk()).await.unwrap_err();
        assert!(matches!(err, Pdf2EpubError::QuotaExceeded { .. }));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unclassified_is_not_retried() {
        let backend = Scripted::new(vec![Err("400 invalid argument"), Ok("OK")]);
        let c = client(backend.clone(), 7);
        let mut conv = c.start(None);
        let err = c.submit_chunk(&mut conv, "x", &[], &chunk()).await.unwrap_err();
        assert_eq!(err.to_string(), "400 invalid argument");
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_transient() {
        let c = ConversationClient::new(Arc::new(Slow), policy(2), "sys", Duration::from_secs(1));
        let mut conv = c.start(None);
        let err = c.submit_chunk(&mut conv, "x", &[], &chunk()).await.unwrap_err();
        match err {
            Pdf2EpubError::TransientServer { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn submitted_chunks_grow_the_history_sent_next() {
        let backend = Scripted::new(vec![Ok("OK"), Ok(" OK \n")]);
        let c = client(backend.clone(), 1);
        let image = ExtractedImage {
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        };
        let mut conv = c.start(None);
        c.submit_chunk(&mut conv, "first", &[image.clone()], &chunk()).await.unwrap();
        c.submit_chunk(&mut conv, "second", &[], &chunk()).await.unwrap();

        assert_eq!(*backend.calls.lock().unwrap(), vec![(0, false), (2, false)]);
        let turns = conv.state().turns();
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].images().collect::<Vec<_>>(), vec![&image]);
        assert_eq!(turns[3], Turn::model("OK"));
    }

    #[tokio::test]
    async fn prior_history_is_used_verbatim() {
        let prior = ConversationState::from_turns(vec![
            Turn::user(vec![Part::text("a")]),
            Turn::model("OK"),
        ]);
        let backend = Scripted::new(vec![Ok("OK")]);
        let c = client(backend.clone(), 1);
        let mut conv = c.start(Some(prior.clone()));
        assert_eq!(conv.state(), &prior);
        c.submit_chunk(&mut conv, "b", &[], &chunk()).await.unwrap();
        assert_eq!(*backend.calls.lock().unwrap(), vec![(2, false)]);
    }

    #[tokio::test]
    async fn finalize_is_idempotent_and_leaves_history_alone() {
        let reply = r#"{"html": "<html><body><h1 id=\"c1\">One</h1></body></html>"}"#;
        let backend = Scripted::new(vec![Ok(reply), Ok(reply)]);
        let c = client(backend.clone(), 1);
        let conv = c.start(Some(ConversationState::from_turns(vec![
            Turn::user(vec![Part::text("a")]),
            Turn::model("OK"),
        ])));

        let first = c.finalize(&conv).await.unwrap();
        let second = c.finalize(&conv).await.unwrap();
        assert_eq!(first, second);
        assert!(first.contains("<h1"));
        assert_eq!(conv.state().len(), 2);
        assert_eq!(*backend.calls.lock().unwrap(), vec![(2, true), (2, true)]);
    }

    #[tokio::test]
    async fn finalize_without_html_field_is_malformed_and_not_retried() {
        let backend = Scripted::new(vec![Ok(r#"{"text": "nope"}"#), Ok(r#"{"html": "<p/>"}"#)]);
        let c = client(backend.clone(), 7);
        let err = c.finalize(&c.start(None)).await.unwrap_err();
        assert!(matches!(err, Pdf2EpubError::MalformedResponse { .. }));
        assert_eq!(backend.call_count(), 1);
    }

    #[test]
    fn turn_wire_shape() {
        let turn = Turn::user(vec![
            Part::text("hello"),
            Part::image(ExtractedImage {
                mime_type: "image/png".into(),
                data: "AAAA".into(),
            }),
        ]);
        let json = serde_json::to_string(&turn).unwrap();
        assert_eq!(
            json,
            r#"{"role":"user","parts":[{"text":"hello"},{"inlineData":{"mimeType":"image/png","data":"AAAA"}}]}"#
        );
        let back: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, turn);
    }

    #[test]
    fn model_turn_deserialises_from_model_role() {
        let t: Turn = serde_json::from_str(r#"{"role":"model","parts":[{"text":"OK"}]}"#).unwrap();
        assert_eq!(t.role, Role::Model);
        assert_eq!(t.text(), "OK");
    }

    #[test]
    fn build_options_from_config() {
        let opts = build_options(&ConversionConfig::default());
        assert_eq!(opts.temperature, Some(0.2));
        assert_eq!(opts.max_tokens, Some(65536));
        assert_eq!(opts.response_format, None);
    }

    /// Provider recording the message count and options of every chat call.
    #[derive(Default)]
    struct Capture {
        calls: Mutex<Vec<(usize, CompletionOptions)>>,
    }

    #[async_trait]
    impl LLMProvider for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        fn model(&self) -> &str {
            "capture-model"
        }

        fn max_context_length(&self) -> usize {
            1_000_000
        }

        async fn complete(&self, _prompt: &str) -> edgequake_llm::Result<edgequake_llm::LLMResponse> {
            Ok(edgequake_llm::LLMResponse::new("OK", "capture-model"))
        }

        async fn complete_with_options(
            &self,
            prompt: &str,
            _options: &CompletionOptions,
        ) -> edgequake_llm::Result<edgequake_llm::LLMResponse> {
            self.complete(prompt).await
        }

        async fn chat(
            &self,
            messages: &[ChatMessage],
            options: Option<&CompletionOptions>,
        ) -> edgequake_llm::Result<edgequake_llm::LLMResponse> {
            self.calls
                .lock()
                .unwrap()
                .push((messages.len(), options.cloned().unwrap_or_default()));
            self.complete("").await
        }
    }

    #[tokio::test]
    async fn llm_backend_requests_json_only_for_finalize() {
        let provider = Arc::new(Capture::default());
        let backend = LlmBackend::new(provider.clone(), &ConversionConfig::default());
        let history = vec![Turn::user(vec![Part::text("pages")]), Turn::model("OK")];
        let message = Turn::user(vec![Part::text("finish")]);

        for expect_json in [false, true] {
            let reply = backend
                .send(ChatRequest {
                    system_instruction: "sys",
                    history: &history,
                    message: &message,
                    expect_json,
                })
                .await
                .unwrap();
            assert_eq!(reply, "OK");
        }

        let calls = provider.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, 4);
        assert_eq!(calls[0].1.response_format, None);
        assert_eq!(calls[1].1.response_format.as_deref(), Some("json_object"));
        assert_eq!(calls[1].1.temperature, Some(0.2));
        assert_eq!(calls[1].1.max_tokens, Some(65536));
    }
}
