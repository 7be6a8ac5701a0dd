use anyhow::Context;
use clap::{Parser, Subcommand};
use qna::channels::{ChannelHandle, TelegramChannel};
use qna::questions::{Manager, ManagerOptions};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod flows;

#[derive(Parser)]
#[command(name = "qna-bot")]
#[command(about = "Telegram bot host for the qna question manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the bot: long-poll Telegram, intercept answers to pending questions, route the rest to commands.
    Run {
        /// Config file path (default: QNA_CONFIG_PATH or ~/.qna/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Max questions running at once (default from config or 64)
        #[arg(long, value_name = "N")]
        max_concurrent: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("qna-bot {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Run {
            config,
            max_concurrent,
        }) => {
            if let Err(e) = run_bot(config, max_concurrent).await {
                log::error!("bot failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_bot(
    config_path: Option<std::path::PathBuf>,
    max_concurrent: Option<usize>,
) -> anyhow::Result<()> {
    let (mut config, path) = qna::config::load_config(config_path)?;
    if let Some(n) = max_concurrent {
        config.questions.max_concurrent = n;
    }
    let token = qna::config::resolve_telegram_token(&config).with_context(|| {
        format!(
            "telegram bot token not configured (set TELEGRAM_BOT_TOKEN or channels.telegram.botToken in {})",
            path.display()
        )
    })?;

    let root = CancellationToken::new();
    let manager = Manager::new(root.clone(), ManagerOptions::from(&config.questions));
    log::info!(
        "question manager ready: maxConcurrent={} admission={:?} shards={}",
        config.questions.max_concurrent,
        config.questions.admission,
        config.questions.registry_shards
    );

    let telegram = Arc::new(TelegramChannel::new(Some(token)));
    let (updates_tx, updates_rx) = mpsc::channel(64);
    let poll_handle = telegram.clone().start_inbound(updates_tx);

    let router = flows::Router::new(
        manager.clone(),
        telegram.clone(),
        config.questions.answer_timeout(),
    );
    let dispatch = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .run_dispatch(updates_rx, move |update| {
                    let router = router.clone();
                    async move { router.route(update).await }
                })
                .await
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    log::info!("shutdown signal received, closing questions");

    telegram.stop();
    manager.shutdown().await;
    if let Err(e) = dispatch.await {
        log::debug!("dispatch task ended abnormally: {}", e);
    }
    // A long poll may still be in flight; nothing it returns would be handled.
    poll_handle.abort();
    log::info!("bot stopped");
    Ok(())
}
