use anyhow::Result;
use clap::Parser;

use snapship::cancel;
use snapship::logging;
use snapship::BackupConfig;

mod cli;
mod cmd_backup;
mod cmd_test;
mod util;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = cli::Cli::parse();
    let cfg = BackupConfig::load(&cli.config)?;
    logging::init(cfg.log_file.as_deref());
    cancel::install_signal_handlers();

    if cli.test {
        cmd_test::exec(&cfg)
    } else {
        cmd_backup::exec(&cfg)
    }
}
