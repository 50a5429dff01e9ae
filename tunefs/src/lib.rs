pub mod cli;
pub mod config;
pub mod logging;

use std::process::ExitCode;
use std::sync::Arc;

use libtunefs::cluster::FlockStack;
use libtunefs::feature::FeatureOp;
use libtunefs::features::{INLINE_DATA, JournalSizeOp};
use libtunefs::ondisk::image::ImageIo;
use libtunefs::probe::probe;
use libtunefs::signals;
use libtunefs::{LockEnv, Runner, Session};
use tracing::error;

use crate::cli::{Cli, Commands};
use crate::config::{TuneConfig, load_config};

/// `-i` on the command line forces interactive mode on.
pub fn build_session(config: &TuneConfig, interactive: bool) -> Session {
    Session::builder(Arc::new(ImageIo))
        .cluster_stack(Arc::new(FlockStack::new(
            config.lock_dir.clone(),
            config.cluster_stack.clone(),
        )))
        .lock_env(LockEnv::new(config.lock_env.clone()))
        .interactive(interactive || config.interactive)
        .build()
}

pub fn run(cli: &Cli) -> ExitCode {
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let session = build_session(&config, cli.interactive);
    if let Err(e) = session.install_signal_handlers() {
        error!("Unable to install signal handlers: {e}");
        return ExitCode::FAILURE;
    }
    let runner = Runner::new(session);

    let code = match &cli.command {
        Commands::InlineData { args } => {
            let mut op = FeatureOp::new(&INLINE_DATA);
            runner.main(&cli.device, args, &mut op)
        }
        Commands::JournalSize { args } => {
            let mut op = JournalSizeOp::new();
            runner.main(&cli.device, args, &mut op)
        }
        Commands::Probe => {
            let report = probe(runner.session(), &cli.device);
            print!("{report}");
            if report.all_opened() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    };
    signals::uninstall();
    code
}
