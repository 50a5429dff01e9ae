use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "tunefs",
    version,
    about = "Change on-disk features of a clustered shared-disk filesystem"
)]
pub struct Cli {
    /// Ask before changing anything
    #[arg(short, long)]
    pub interactive: bool,

    /// More output; repeat for more
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Less output; repeat for less
    #[arg(short, long, action = ArgAction::Count)]
    pub quiet: u8,

    /// Configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(value_name = "DEVICE")]
    pub device: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Enable or disable inline data using ./tunefs DEVICE inline-data enable
    InlineData {
        #[arg(value_name = "ACTION", allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Resize every journal using ./tunefs DEVICE journal-size 64M
    JournalSize {
        #[arg(value_name = "SIZE", allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Try every open mode on a device and report the outcome
    Probe,
}
