use anyhow::Context;
use chrono::Utc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_digest::channels::{FileSink, ImapConfig, ImapMailbox, SmtpConfig, SmtpSink};
use inbox_digest::config::DigestConfig;
use inbox_digest::llm::{LlmConfig, create_provider};
use inbox_digest::pipeline::types::DeliverySink;
use inbox_digest::pipeline::{DigestPipeline, RunOutcome};
use inbox_digest::report::render_console_report;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let Setup {
        pipeline,
        model,
        mailbox,
        sink,
    } = setup().context("Startup failed")?;
    let config = pipeline.config();

    eprintln!("📬 Inbox Digest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", model);
    eprintln!("   Mailbox: {} ({})", mailbox.config().host, mailbox.config().mailbox);
    eprintln!(
        "   Window: last {} days, up to {} emails",
        config.lookback_days, config.max_results
    );
    match &config.html_out {
        Some(path) => eprintln!("   Delivery: file {}", path.display()),
        None => eprintln!("   Delivery: smtp to {}", config.recipient()),
    }
    eprintln!();

    let outcome = pipeline
        .run_from(&mailbox, Utc::now())
        .await
        .context("Mailbox fetch failed")?;

    match &outcome {
        RunOutcome::Digest { digest, html, .. } => {
            sink.deliver(&digest.subject(), html)
                .await
                .with_context(|| format!("Delivery via {} failed", sink.name()))?;
            eprintln!(
                "✅ Delivered \"{}\": {} sections, {} bullets\n",
                digest.subject(),
                digest.sections.len(),
                digest.bullet_count()
            );
        }
        RunOutcome::NoNewsletters { .. } => {
            eprintln!("📭 No newsletters found in the window. Nothing delivered.\n");
        }
        RunOutcome::NoSummaries { .. } => {
            eprintln!("⚠️  Newsletters were found but none could be summarized. Nothing delivered.\n");
        }
    }

    eprint!("{}", render_console_report(outcome.report()));
    Ok(())
}

/// Everything a run needs, built from the environment.
struct Setup {
    pipeline: DigestPipeline,
    model: String,
    mailbox: ImapMailbox,
    sink: Box<dyn DeliverySink>,
}

fn setup() -> inbox_digest::error::Result<Setup> {
    let config = DigestConfig::from_env()?;
    let llm_config = LlmConfig::from_env()?;
    let llm = create_provider(&llm_config)?;
    let mailbox = ImapMailbox::new(ImapConfig::from_env()?);

    let sink: Box<dyn DeliverySink> = match &config.html_out {
        Some(path) => Box::new(FileSink::new(path.clone())),
        None => Box::new(SmtpSink::new(SmtpConfig::from_env()?, config.recipient())),
    };

    Ok(Setup {
        pipeline: DigestPipeline::new(config, llm)?,
        model: llm_config.model,
        mailbox,
        sink,
    })
}

/// Stderr logging, plus a daily rolling file when `DIGEST_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("DIGEST_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-digest.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .init();
            None
        }
    }
}
