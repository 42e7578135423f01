mod app;
mod channel;
mod cli;
mod config;
mod control;
mod dispatcher;
mod mailbox;
mod notice;
mod watcher;
mod workspace;


use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::App;
use crate::config::Settings;
use crate::control::ControlReader;
use crate::notice::ConsoleNotifier;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize tracing with RUST_LOG support; stdout carries control output
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = cli::Cli::parse();

    let settings = match Settings::resolve(&cli) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("scriptsync: error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        workspace = ?settings.workspace,
        port = settings.port,
        mailbox = ?settings.mailbox_dir,
        "scriptsync starting"
    );

    // Single writer for every stdout line
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let notifier = Arc::new(ConsoleNotifier::new(out_tx.clone()));
    let app = match App::start(&settings, notifier).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("scriptsync: error: failed to watch scripts: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = tokio_util::sync::CancellationToken::new();
    tokio::spawn(ControlReader::new(BufReader::new(tokio::io::stdin())).run_recv_loop(
        app.control_context(),
        out_tx.clone(),
        shutdown.clone(),
    ));

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    app.shutdown().await;
    drop(out_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    info!("scriptsync stopped");

    // A pending blocking stdin read would keep the runtime alive
    std::process::exit(0);
}
