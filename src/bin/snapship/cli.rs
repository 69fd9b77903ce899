use clap::Parser;
use std::path::PathBuf;

use snapship::config::DEFAULT_CONFIG_PATH;

/// Replicate btrfs subvolume snapshots to a remote host over ssh.
#[derive(Parser, Debug)]
#[command(name = "snapship", version, about = "btrfs snapshot replication")]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SNAPSHIP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Check the local toolchain and remote connectivity, then exit
    #[arg(short = 't', long)]
    pub test: bool,
}
