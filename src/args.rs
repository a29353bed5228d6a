use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "remoteassist-core")]
#[command(version)]
#[command(about = "Remote assistance session core", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/remoteassist-core.toml")]
    pub config: PathBuf,

    /// Signaling relay URL override
    #[arg(short, long)]
    pub url: Option<String>,

    /// Device name announced to peers
    #[arg(long)]
    pub device_name: Option<String>,

    /// Remote device id to connect to on startup (controller role)
    #[arg(long)]
    pub connect_to: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }
}
