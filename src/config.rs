//! Configuration types for PDF-to-EPUB conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. Every knob lives in one struct so the
//! CLI, library callers and tests configure the pipeline the same way.

use crate::error::Pdf2EpubError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Number of pages sent to the model in one conversational turn.
pub const DEFAULT_CHUNK_SIZE: usize = 5;

/// Pause between two chunk submissions.
pub const DEFAULT_THROTTLE_MS: u64 = 1500;

/// Total attempts per service call, first try included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 7;

/// Delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 3000;

/// Upper bound of the random jitter added to each grown delay.
pub const DEFAULT_BACKOFF_JITTER_MS: u64 = 1000;

/// Configuration for a PDF-to-EPUB conversion.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdf2epub::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .chunk_size(5)
///     .throttle_ms(1500)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Pages per chunk. Default: 5.
    ///
    /// Each chunk is one conversational turn. Five pages keep a turn well
    /// under typical request-size limits even with a few embedded images.
    pub chunk_size: usize,

    /// Delay between chunk submissions in milliseconds. Default: 1500.
    pub throttle_ms: u64,

    /// Attempts per service call, including the first. Default: 7.
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds. Default: 3000.
    ///
    /// Each further retriable failure doubles the previous delay and adds
    /// up to `backoff_jitter_ms` of random jitter.
    pub initial_backoff_ms: u64,

    /// Maximum random jitter added per retry in milliseconds. Default: 1000.
    pub backoff_jitter_ms: u64,

    /// Per-call timeout in seconds. Default: 300.
    ///
    /// The finalize turn regenerates the whole book and can take minutes on
    /// long documents. A timed-out call counts as a transient failure.
    pub api_timeout_secs: u64,

    /// LLM model identifier, e.g. "gpt-4.1-mini", "gemini-2.5-flash".
    /// If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "gemini").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.2.
    pub temperature: f32,

    /// Maximum tokens the model may generate per turn. Default: 65536.
    ///
    /// Chunk acknowledgements are a single word; the limit only matters for
    /// the finalize turn, which returns the whole book as markup.
    pub max_tokens: usize,

    /// Custom system instruction. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Title used when the generated markup declares none.
    pub default_title: Option<String>,

    /// Language code written to the EPUB package. Default: "en".
    pub language: String,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Directory holding session snapshots. If None, uses
    /// `<data_local_dir>/pdf2epub/sessions`.
    pub session_dir: Option<PathBuf>,

    /// Receives progress events. Default: none.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            throttle_ms: DEFAULT_THROTTLE_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            backoff_jitter_ms: DEFAULT_BACKOFF_JITTER_MS,
            api_timeout_secs: 300,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.2,
            max_tokens: 65536,
            system_prompt: None,
            default_title: None,
            language: "en".to_string(),
            password: None,
            session_dir: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("chunk_size", &self.chunk_size)
            .field("throttle_ms", &self.throttle_ms)
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff_ms", &self.initial_backoff_ms)
            .field("backoff_jitter_ms", &self.backoff_jitter_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("default_title", &self.default_title)
            .field("language", &self.language)
            .field("session_dir", &self.session_dir)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

/// Builder for [`ConversionConfig`].
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl fmt::Debug for ConversionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ConversionConfigBuilder {
    pub fn chunk_size(mut self, pages: usize) -> Self {
        self.config.chunk_size = pages;
        self
    }

    pub fn throttle_ms(mut self, ms: u64) -> Self {
        self.config.throttle_ms = ms;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn initial_backoff_ms(mut self, ms: u64) -> Self {
        self.config.initial_backoff_ms = ms;
        self
    }

    pub fn backoff_jitter_ms(mut self, ms: u64) -> Self {
        self.config.backoff_jitter_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn default_title(mut self, title: impl Into<String>) -> Self {
        self.config.default_title = Some(title.into());
        self
    }

    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.config.language = lang.into();
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.session_dir = Some(dir.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Pdf2EpubError> {
        let c = &self.config;
        if c.chunk_size == 0 {
            return Err(Pdf2EpubError::InvalidConfig(
                "Chunk size must be ≥ 1 page".into(),
            ));
        }
        if c.max_attempts == 0 {
            return Err(Pdf2EpubError::InvalidConfig(
                "Max attempts must be ≥ 1".into(),
            ));
        }
        if c.language.trim().is_empty() {
            return Err(Pdf2EpubError::InvalidConfig(
                "Language must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_constants() {
        let c = ConversionConfig::default();
        assert_eq!(c.chunk_size, 5);
        assert_eq!(c.throttle(), Duration::from_millis(1500));
        assert_eq!(c.max_attempts, 7);
        assert_eq!(c.initial_backoff_ms, 3000);
        assert_eq!(c.backoff_jitter_ms, 1000);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let err = ConversionConfig::builder().chunk_size(0).build().unwrap_err();
        assert!(matches!(err, Pdf2EpubError::InvalidConfig(_)));
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = ConversionConfig::builder().max_attempts(0).build().unwrap_err();
        assert!(err.to_string().contains("attempts"));
    }

    #[test]
    fn temperature_is_clamped() {
        let c = ConversionConfig::builder().temperature(5.0).build().unwrap();
        assert_eq!(c.temperature, 2.0);
    }
}
