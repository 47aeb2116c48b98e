use std::path::PathBuf;

use clap::Parser;

use crate::config::DEFAULT_CONFIG_FILE;

/// Host inventory agent: runs collectors and pushes their JSON output to
/// a central server.
#[derive(Parser, Debug)]
#[command(name = "hostcollect", version, about)]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Run a single cycle and exit
    #[arg(short = 's', long = "one-shot")]
    pub one_shot: bool,

    /// Print the output of one collector instead of pushing
    #[arg(short = 'k', long = "test-key", value_name = "KEY", requires = "one_shot")]
    pub test_key: Option<String>,

    /// Allow running as an unprivileged user
    #[arg(long = "without-root")]
    pub without_root: bool,
}
