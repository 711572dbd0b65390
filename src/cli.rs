use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio_util::sync::CancellationToken;

use quill_ai::app::AppState;
use quill_ai::error::Result;
use quill_ai::generation::{CallContext, ChunkSink, SseSink};
use quill_ai::models::{GenerationRequest, Message, StreamChunk};

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Resilient multi-provider text generation")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate text from a prompt
    Generate {
        /// Prompt text
        prompt: String,

        /// Model to use
        #[arg(short, long)]
        model: String,

        /// Use a specific provider instead of model lookup
        #[arg(short, long)]
        provider: Option<String>,

        /// System instruction
        #[arg(short, long)]
        system: Option<String>,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long)]
        temperature: Option<f32>,

        /// Stream the output as it is produced
        #[arg(long)]
        stream: bool,

        /// Emit server-sent-event frames instead of plain text (implies --stream)
        #[arg(long)]
        sse: bool,

        /// User id charged for the request
        #[arg(long, default_value = "local")]
        user: String,
    },

    /// Probe every enabled provider
    Health,

    /// List providers and their models
    Models {
        /// Show only enabled providers
        #[arg(short, long)]
        enabled: bool,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Plain-text stream output.
struct TerminalSink {
    out: Stdout,
}

#[async_trait]
impl ChunkSink for TerminalSink {
    async fn send_chunk(&mut self, chunk: &StreamChunk) -> Result<()> {
        if chunk.is_complete {
            self.out.write_all(b"\n").await?;
        } else {
            self.out.write_all(chunk.delta.as_bytes()).await?;
        }
        self.out.flush().await?;
        Ok(())
    }
}

/// Cancel `token` on Ctrl-C.
pub fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

#[allow(clippy::too_many_arguments)]
pub async fn generate(
    state: &AppState,
    prompt: String,
    model: String,
    provider: Option<String>,
    system: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    stream: bool,
    sse: bool,
    user: String,
) -> anyhow::Result<()> {
    let mut request = GenerationRequest::new(model).with_prompt(prompt);
    if let Some(system) = system {
        request = request.with_messages(vec![Message::system(system)]);
    }
    if let Some(provider) = provider {
        request = request.with_provider(provider);
    }
    if let Some(max_tokens) = max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    if let Some(temperature) = temperature {
        request = request.with_temperature(temperature);
    }

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    let context = CallContext::new(user);
    let service = state.service();

    if stream || sse {
        let request = request.with_streaming();
        let outcome = if sse {
            let mut sink = SseSink::new(tokio::io::stdout());
            service.stream_to_sink(&context, &request, &mut sink, &cancel).await?
        } else {
            let mut sink = TerminalSink { out: tokio::io::stdout() };
            service.stream_to_sink(&context, &request, &mut sink, &cancel).await?
        };
        eprintln!(
            "[{} tokens, finish: {}]",
            outcome.billable_tokens(),
            outcome.finish_reason.as_deref().unwrap_or("unknown")
        );
    } else {
        let response = service.generate_text(&context, &request, &cancel).await?;
        println!("{}", response.text);
        eprintln!(
            "[{}: {} prompt + {} completion tokens, finish: {}]",
            response.model,
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
            response.finish_reason
        );
    }

    Ok(())
}

pub async fn health(state: &AppState) -> anyhow::Result<()> {
    let mut results: Vec<_> = state.service().health_check().await.into_iter().collect();
    if results.is_empty() {
        println!("No enabled providers");
        return Ok(());
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, result) in results {
        match result {
            Ok(()) => println!("{:<16} healthy", name),
            Err(e) => println!("{:<16} unhealthy ({}: {})", name, e.kind, e.message),
        }
    }

    for stats in state.manager().circuit_stats() {
        println!(
            "circuit {:<8} {:?} ({}/{} failures)",
            stats.name, stats.state, stats.failure_count, stats.max_failures
        );
    }
    Ok(())
}

pub fn models(state: &AppState, enabled_only: bool) {
    let default = state.manager().default_provider();

    for provider in state.manager().providers() {
        if enabled_only && !provider.enabled {
            continue;
        }
        let marker = if default.as_deref() == Some(provider.name.as_str()) { "*" } else { " " };
        println!(
            "{} {} [{}] priority={} enabled={} streaming={}",
            marker, provider.name, provider.kind, provider.priority, provider.enabled, provider.streaming
        );
        for model in provider.models {
            println!("    {}", model);
        }
    }
}
