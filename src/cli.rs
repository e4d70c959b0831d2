use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "unitai",
    version,
    about = "Multi-backend AI orchestration server (MCP over stdio)"
)]
pub struct Cli {
    /// Path to the user config file. Default: ~/.unitai/config.json
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory for the persistent stores. Default: ./data (or UNITAI_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Log filter (tracing EnvFilter syntax). Default: info
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
