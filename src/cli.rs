use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "stashproxy",
    about = "Caching reverse proxy that records upstream responses and replays them"
)]
pub struct Cli {
    /// Upstream base URL every cache miss is forwarded to.
    #[arg(long = "url", value_name = "URL")]
    pub url: Option<String>,

    /// Directory holding captured responses.
    #[arg(long = "data", value_name = "DIR")]
    pub data: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:6005.
    #[arg(long = "host", value_name = "ADDR")]
    pub host: Option<String>,

    /// Shell command that reads a request on stdin and prints its cache key.
    #[arg(long = "hasher", value_name = "COMMAND")]
    pub hasher: Option<String>,

    /// Keep captured responses in memory only.
    #[arg(long)]
    pub memory: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Optional TOML settings file (defaults to ./stashproxy.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}
