use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;
use herald_core::app::AppBuilder;
use herald_core::config::HeraldConfig;
use herald_core::domain::NewMessage;
use herald_core::impls::LogTransport;
use herald_core::logging;
use tracing::{error, info};

/// Herald - scheduled message delivery daemon
#[derive(Parser)]
#[command(name = "herald", version, about = "Deliver scheduled messages until Ctrl-C")]
struct Args {
    /// Path to a TOML config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed three demo messages before starting
    #[arg(long)]
    demo: bool,
}

/// デモ用: 即時 / 数秒後 / 匿名 の 3 通を登録
async fn seed_demo(app: &herald_core::app::App) -> Result<(), Box<dyn std::error::Error>> {
    let now = Utc::now();
    let submissions = [
        NewMessage::new("bob@example.com", "Welcome", "<p>Hello Bob</p>").from_sender("alice"),
        NewMessage::new("carol@example.com", "Reminder", "<p>Meeting soon</p>")
            .from_sender("alice")
            .at(now + Duration::seconds(8)),
        NewMessage::new("dave@example.com", "Digest", "<p>Weekly digest</p>"),
    ];
    for new in submissions {
        let message = app.submission().schedule(new).await?;
        info!(message_id = %message.id, scheduled_at = %message.scheduled_at, "demo message scheduled");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // (A) 設定と logging
    let config = match &args.config {
        Some(path) => HeraldConfig::from_file(path)?,
        None => HeraldConfig::default(),
    };
    logging::init(config.log_level.as_deref());
    info!(config = ?args.config, store = ?config.store.kind, "starting herald");

    // (B) ワイヤリング（transport は起動時に 1 つだけ作って注入）
    let app = AppBuilder::new(config)
        .transport(Arc::new(LogTransport::with_from("herald@localhost")))
        .build()
        .await?;

    if args.demo {
        seed_demo(&app).await?;
    }

    // (C) Scheduler + Workers を起動し、Ctrl-C まで動かす
    let running = app.start();
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }

    info!("shutting down");
    running.shutdown_and_join().await;

    match app.status().await {
        Ok(status) => println!("{}", serde_json::to_string_pretty(&status)?),
        Err(e) => error!(error = %e, "could not read final status"),
    }
    Ok(())
}
