use clap::Parser;
use std::path::PathBuf;

use crate::agent::config::DEFAULT_CONFIG_PATH;
use crate::identity::DEFAULT_SIMILARITY_THRESHOLD;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)] // Read from `Cargo.toml`
pub struct Cli {
    #[arg(long, default_value_t = String::from(DEFAULT_CONFIG_PATH))]
    config: String,

    /// Register this instance and persist the registration record.
    #[arg(long)]
    pub register: bool,

    /// Activation code for registration.
    #[arg(long)]
    pub code: Option<String>,

    /// Instance id to register as.
    #[arg(long)]
    pub id: Option<String>,

    /// Region the instance lives in.
    #[arg(long)]
    pub region: Option<String>,

    /// Skip the registration confirmation prompt.
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,

    /// Clear a previously stored registration first.
    #[arg(long)]
    pub clear: bool,

    /// Set the hardware-fingerprint similarity threshold.
    #[arg(long)]
    pub fingerprint: bool,

    /// Similarity threshold in percent.
    #[arg(long, default_value_t = DEFAULT_SIMILARITY_THRESHOLD)]
    pub similarity_threshold: u8,

    /// Run as the inner worker process rather than the OS service.
    #[arg(long)]
    pub worker: bool,
}

impl Cli {
    pub fn init() -> Self {
        Self::parse()
    }

    pub fn config_path(&self) -> PathBuf {
        PathBuf::from(&self.config)
    }
}
