use std::process::ExitCode;

use clap::Parser;
use tunefs::cli::Cli;
use tunefs::logging::init_tracing;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tunefs::run(&cli)
}
