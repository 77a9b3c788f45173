use std::sync::Arc;

use taskrelay::channels::{Notifier, TelegramChannel};
use taskrelay::config::Config;
use taskrelay::engine::{Engine, JobStore};
use taskrelay::llm::AnthropicClient;
use taskrelay::providers::{LocalAgentProvider, ProviderRegistry, ToolLoopProvider};
use taskrelay::router::Router;
use taskrelay::tools::builtin::{FetchTool, ShellTool};
use taskrelay::tools::ToolRegistry;
use taskrelay::workspace::WorkspaceManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    // Diagnostics go to stderr and a rolling daemon log; per-job output has
    // its own files under the data dir.
    std::fs::create_dir_all(&config.data_dir)?;
    let file_appender = tracing_appender::rolling::daily(&config.data_dir, "taskrelay.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(file_writer)
        .with_ansi(false)
        .init();

    eprintln!("🛰  taskrelay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Agent: {}", config.agent.command);
    eprintln!("   Data: {}", config.data_dir.display());
    eprintln!("   Workspaces: {}", config.workspaces_root.display());

    tokio::fs::create_dir_all(&config.workspaces_root).await?;

    let channel = Arc::new(TelegramChannel::new(
        config.telegram_token.clone(),
        config.allowed_users.clone(),
    ));
    let notifier: Arc<dyn Notifier> = channel.clone();

    let store = Arc::new(JobStore::new(config.data_dir.join("jobs.json")));
    let workspaces = Arc::new(WorkspaceManager::new(config.workspaces_root.clone()));

    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(ShellTool::new())).await;
    tools.register(Arc::new(FetchTool::new())).await;

    let llm = Arc::new(AnthropicClient::new(
        config.anthropic_api_key.clone(),
        config.model.clone(),
    ));

    let mut providers = ProviderRegistry::new(config.engine.default_provider.clone());
    providers.register(Arc::new(LocalAgentProvider::new(config.agent.clone())));
    providers.register(Arc::new(ToolLoopProvider::new(
        llm,
        tools,
        config.tool_loop.clone(),
    )));
    let providers = Arc::new(providers);

    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        providers,
        workspaces,
        Arc::clone(&notifier),
        config.engine.clone(),
        config.data_dir.join("logs"),
        config.agent.tail_limit,
    ));

    let router = Arc::new(Router::new(
        engine,
        notifier,
        config.data_dir.join("exports"),
    ));

    tracing::info!("taskrelay started, polling for updates");

    // Long-poll loop; each message is handled on its own task so one slow
    // reply cannot stall the poll.
    let mut offset = 0i64;
    loop {
        tokio::select! {
            result = channel.next_updates(offset) => match result {
                Ok((messages, next_offset)) => {
                    offset = next_offset;
                    for msg in messages {
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            router.handle(msg).await;
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Update poll failed, backing off");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
