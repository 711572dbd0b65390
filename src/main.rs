mod cli;

use anyhow::{bail, Context};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use cli::{Cli, Commands};
use quill_ai::app::{init_logging, AppConfig, AppState};
use quill_ai::platform::AppPaths;
use quill_ai::quota::InMemoryQuotaLedger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match &cli.config {
        Some(path) => AppPaths::from_root(path.parent().map(|p| p.to_path_buf()).unwrap_or_default()),
        None => AppPaths::new()?,
    };
    let config_file = cli.config.clone().unwrap_or_else(|| paths.config_file());

    if let Commands::InitConfig { force } = cli.command {
        if config_file.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", config_file.display());
        }
        AppConfig::default().save_to(&config_file).await?;
        println!("Wrote {}", config_file.display());
        return Ok(());
    }

    let config = if cli.config.is_some() {
        AppConfig::load_from(&config_file)
    } else {
        AppConfig::load(&paths).await
    }
    .with_context(|| format!("loading {}", config_file.display()))?;

    let _log_guard = init_logging(&config.logging, &paths.logs_dir(), cli.debug)?;
    info!("Starting quill");

    let state = AppState::new(config, paths, Arc::new(InMemoryQuotaLedger::new()))?;

    match cli.command {
        Commands::Generate {
            prompt,
            model,
            provider,
            system,
            max_tokens,
            temperature,
            stream,
            sse,
            user,
        } => {
            cli::generate(
                &state, prompt, model, provider, system, max_tokens, temperature, stream, sse, user,
            )
            .await?
        }
        Commands::Health => cli::health(&state).await?,
        Commands::Models { enabled } => cli::models(&state, enabled),
        Commands::InitConfig { .. } => {}
    }

    state.manager().close();
    Ok(())
}
