//! Main entry point for the assistant CLI.

use anyhow::Result;
use assistant_core::{
    batch,
    cli::{self, Commands},
    orchestrator::Orchestrator,
    settings::Settings,
    telemetry,
};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let settings = Settings::load_from(args.settings.as_deref())?;

    telemetry::init(&settings.logging, settings.observability.otlp_endpoint.as_deref())?;

    match args.command {
        Commands::Run { config } => batch::run(config, settings).await,
        Commands::Chat { user } => {
            let user = user.unwrap_or_else(|| settings.agent.default_user.clone());
            let orchestrator = start(settings).await?;
            let result = chat(&orchestrator, &user).await;
            orchestrator.shutdown().await?;
            result
        }
        Commands::Ask { user, text } => {
            let user = user.unwrap_or_else(|| settings.agent.default_user.clone());
            let orchestrator = start(settings).await?;
            let response = orchestrator.handle_request(&user, &text.join(" ")).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            orchestrator.shutdown().await
        }
        Commands::Plugins => {
            let orchestrator = start(settings).await?;
            for info in orchestrator.plugin_info().await {
                println!("{} v{} [{}] {}", info.name, info.version, info.status, info.description);
                if let Some(err) = &info.last_error {
                    println!("    error: {err}");
                }
                if let Some(descriptor) = orchestrator.registry().descriptor(&info.name) {
                    for spec in &descriptor.handlers {
                        println!(
                            "    {} -> {}.{} (priority {})",
                            spec.intent, info.name, spec.name, spec.priority
                        );
                    }
                }
            }
            orchestrator.shutdown().await
        }
    }
}

async fn start(settings: Settings) -> Result<Arc<Orchestrator>> {
    let autoload = settings.plugins.autoload;
    let hot_reload = settings.plugins.enable_hot_reload;
    let orchestrator = Arc::new(Orchestrator::builder(settings).build().await?);
    if autoload {
        orchestrator.autoload_plugins().await?;
    }
    if hot_reload {
        orchestrator.start_hot_reload();
    }
    Ok(orchestrator)
}

async fn chat(orchestrator: &Orchestrator, user: &str) -> Result<()> {
    let name = orchestrator.settings().agent.name.clone();
    info!("Starting chat session for '{}'", user);

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    stdout
        .write_all(format!("{name}: Hi! Type 'quit' to leave.\n> ").as_bytes())
        .await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if matches!(text, "quit" | "exit") {
            break;
        }
        if !text.is_empty() {
            let response = orchestrator.handle_request(user, text).await;
            stdout
                .write_all(format!("{name}: {}\n", response.message).as_bytes())
                .await?;
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }
    Ok(())
}
