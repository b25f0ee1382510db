//! CLI binary for edgequake-pdf2epub.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig`, asks the library whether a saved session can be
//! resumed, and writes the EPUB.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2epub::pipeline::chunk::Chunk;
use edgequake_pdf2epub::{
    load_document, reset_session, stored_session, write_output, ConversionConfig,
    ConversionProgressCallback, Converter, Pdf2EpubError, Progress, ProgressCallback,
    ResumeDecision,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar driven by the percent estimate, with a
/// log line per acknowledged chunk printed above it.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(100);

        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self { bar })
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_pages: usize, total_chunks: usize, resume_from_chunk: usize) {
        self.bar.set_prefix("Converting");
        let line = if resume_from_chunk > 0 {
            format!(
                "Resuming at chunk {}/{} ({total_pages} pages)…",
                resume_from_chunk + 1,
                total_chunks
            )
        } else {
            format!("Starting conversion of {total_pages} pages in {total_chunks} chunks…")
        };
        self.bar.println(format!("{} {}", cyan("◆"), bold(&line)));
    }

    fn on_progress(&self, progress: &Progress) {
        self.bar.set_position(progress.percent.round() as u64);
        self.bar.set_message(format!(
            "ETA {}  {}",
            progress.eta_text,
            dim(&format!("⏱ {}", progress.elapsed_text))
        ));
    }

    fn on_chunk_acknowledged(&self, chunk: &Chunk, total_chunks: usize) {
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {}",
            green("✓"),
            chunk.index + 1,
            total_chunks,
            dim(&format!("pages {}-{}", chunk.start_page, chunk.end_page)),
        ));
    }

    fn on_finalize_start(&self) {
        self.bar.set_prefix("Finalizing");
    }

    fn on_conversion_complete(&self, _epub_bytes: usize) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert, writing book.epub next to the PDF
  pdf2epub book.pdf

  # Choose the output path and model
  pdf2epub book.pdf -o out/book.epub --model gpt-4.1

  # Larger chunks, slower pace for strict rate limits
  pdf2epub --chunk-size 10 --throttle-ms 5000 book.pdf

  # Ignore a saved session and start over
  pdf2epub --fresh book.pdf

  # Delete the saved session for a file
  pdf2epub --reset book.pdf

RESUMING:
  After every chunk the conversation is saved under the session directory
  (default: ~/.local/share/pdf2epub/sessions). If a run stops (quota,
  rate limit, network), rerun the same command: it continues from the last
  acknowledged chunk. A session belongs to a file name and byte size.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium, skips auto-download
  PDFIUM_AUTO_CACHE_DIR   Override the default pdfium cache directory
"#;

/// Convert PDF files to EPUB through a resumable LLM conversation.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2epub",
    version,
    about = "Convert PDF files to reflowable EPUB books using an LLM",
    long_about = "Convert PDF documents to reflowable EPUB books. The document's text and images \
are sent to a language model a few pages at a time in one conversation, and the model writes \
the finished book as XHTML. Progress is saved after every chunk, so interrupted conversions \
resume where they stopped.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path.
    input: PathBuf,

    /// Write the EPUB to this file. Default: the input path with `.epub`.
    #[arg(short, long, env = "PDF2EPUB_OUTPUT")]
    output: Option<PathBuf>,

    /// LLM model ID (e.g. gpt-4.1-mini, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(
        long,
        env = "EDGEQUAKE_PROVIDER",
        long_help = "LLM provider. Auto-detected from API key env vars if not set.\n\
          Supported: openai, anthropic, gemini, azure, ollama, or any OpenAI-compatible URL."
    )]
    provider: Option<String>,

    /// Pages per conversational turn.
    #[arg(long, env = "PDF2EPUB_CHUNK_SIZE", default_value_t = 5,
          value_parser = clap::value_parser!(u64).range(1..))]
    chunk_size: u64,

    /// Pause between chunk submissions in milliseconds.
    #[arg(long, env = "PDF2EPUB_THROTTLE_MS", default_value_t = 1500)]
    throttle_ms: u64,

    /// Attempts per LLM call, first try included.
    #[arg(long, env = "PDF2EPUB_MAX_ATTEMPTS", default_value_t = 7,
          value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: u32,

    /// Book title used when the generated document has none.
    #[arg(long, env = "PDF2EPUB_TITLE")]
    title: Option<String>,

    /// Language tag written into the package metadata.
    #[arg(long, env = "PDF2EPUB_LANGUAGE", default_value = "en")]
    language: String,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2EPUB_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom system instruction.
    #[arg(long, env = "PDF2EPUB_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Directory holding saved sessions.
    #[arg(long, env = "PDF2EPUB_SESSION_DIR")]
    session_dir: Option<PathBuf>,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "PDF2EPUB_API_TIMEOUT", default_value_t = 300)]
    api_timeout: u64,

    /// Ignore a saved session and start from the first page.
    #[arg(long)]
    fresh: bool,

    /// Delete the saved session for the input file and exit.
    #[arg(long, conflicts_with = "fresh")]
    reset: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2EPUB_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2EPUB_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2EPUB_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress && !cli.reset {
        Some(CliProgressCallback::new() as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb.clone()).await?;

    // ── Reset mode ───────────────────────────────────────────────────────
    if cli.reset {
        let existed = stored_session(&cli.input, &config)
            .context("Failed to read saved session")?
            .is_some();
        reset_session(&cli.input, &config).context("Failed to delete saved session")?;
        if !cli.quiet {
            if existed {
                eprintln!("{} Saved session for {} deleted", green("✔"), bold(&cli.input.display().to_string()));
            } else {
                eprintln!("{} No saved session for {}", dim("·"), cli.input.display());
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    ensure_pdfium(cli.quiet)?;

    let output_path = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.input.with_extension("epub"));

    match run(&cli, &config, &output_path).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            if let Some(cb) = progress_cb {
                // Clear the bar before printing the error.
                cb.on_conversion_complete(0);
            }
            report_failure(&cli, &config, &e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(cli: &Cli, config: &ConversionConfig, output_path: &Path) -> Result<(), Pdf2EpubError> {
    let document = load_document(&cli.input)?;
    let converter = Converter::from_config(&document, config)?;

    let decision = if cli.fresh {
        ResumeDecision::StartOver
    } else {
        match converter.check_resume(&document).await? {
            Some(session) => ResumeDecision::Resume(session),
            None => ResumeDecision::StartOver,
        }
    };

    let output = converter.convert(&document, decision).await?;
    write_output(output_path, &output.epub).await?;

    if !cli.quiet {
        let stats = &output.stats;
        eprintln!(
            "{}  {}  {} pages  {} chunks  {} images  {}ms  →  {}",
            green("✔"),
            bold(&output.title),
            stats.total_pages,
            stats.total_chunks,
            stats.images_packaged,
            stats.duration_ms,
            bold(&output_path.display().to_string()),
        );
        if stats.resumed() {
            eprintln!(
                "   {}",
                dim(&format!("resumed at chunk {}", stats.resumed_from_chunk + 1))
            );
        }
    }
    Ok(())
}

/// Print the error, its category hint and whether a rerun resumes.
fn report_failure(cli: &Cli, config: &ConversionConfig, error: &Pdf2EpubError) {
    eprintln!("{} {}", red("✘"), error);
    if let Some(hint) = error.user_hint() {
        eprintln!("  {}", yellow(hint));
    }
    if error.is_retriable() {
        eprintln!("  {}", dim("This failure is usually temporary; running again right away may succeed."));
    }
    if !error.is_resumable() {
        return;
    }
    match stored_session(&cli.input, config) {
        Ok(Some(session)) if session.next_chunk_index > 0 => eprintln!(
            "  Progress saved: {} chunks done. Rerun the same command to resume.",
            session.next_chunk_index
        ),
        Ok(_) => eprintln!("  No chunk was completed; a rerun starts from the beginning."),
        Err(e) => eprintln!("  {}", dim(&format!("Could not read saved session: {e}"))),
    }
}

/// Make sure a pdfium library is available, downloading it on first run.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }

    if quiet {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.set_message("Connecting…");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    // block_in_place keeps the callback borrow valid without a 'static bound.
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

/// Map CLI args to `ConversionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let system_prompt = if let Some(ref path) = cli.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let mut builder = ConversionConfig::builder()
        .chunk_size(cli.chunk_size as usize)
        .throttle_ms(cli.throttle_ms)
        .max_attempts(cli.max_attempts)
        .api_timeout_secs(cli.api_timeout)
        .language(cli.language.clone());

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref title) = cli.title {
        builder = builder.default_title(title.clone());
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password.clone());
    }
    if let Some(prompt) = system_prompt {
        builder = builder.system_prompt(prompt);
    }
    if let Some(ref dir) = cli.session_dir {
        builder = builder.session_dir(dir.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
