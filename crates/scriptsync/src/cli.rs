use clap::Parser;
use std::path::PathBuf;

/// scriptsync: push user-script edits to a browser script manager
#[derive(Parser, Debug)]
#[command(name = "scriptsync")]
#[command(version)]
#[command(
    about = "Watch user scripts and push every save to a browser script manager",
    long_about = "scriptsync watches user scripts in a workspace and pushes every save to a\nbrowser script manager.\n\nThe first instance to bind the sync port serves a WebSocket channel and\nbroadcasts changes to connected clients. Later instances detect the port is\ntaken and drop changes into a shared mailbox directory instead.\n\nUsage:\n  scriptsync                          Watch **/*.user.js under the current dir\n  scriptsync --dir /path/to/scripts   Watch a specific workspace\n  scriptsync --target dev.user.js     Pin a single script\n\nControl commands are read from stdin as JSON lines."
)]
pub struct Cli {
    /// Port of the shared sync channel [default: 8642]
    #[arg(long)]
    pub port: Option<u16>,

    /// Workspace root to watch
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// TOML config file (defaults to <dir>/scriptsync.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Shared mailbox directory used when another process owns the port
    #[arg(long)]
    pub mailbox_dir: Option<PathBuf>,

    /// Lifetime of an unconsumed mailbox entry in milliseconds
    #[arg(long)]
    pub mailbox_ttl_ms: Option<u64>,

    /// Pin an explicit target script at startup
    #[arg(long)]
    pub target: Option<PathBuf>,

    /// Workspace state file (overrides the per-workspace default)
    #[arg(long)]
    pub state_file: Option<PathBuf>,
}

impl Cli {
    /// Parse CLI arguments from the environment
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
