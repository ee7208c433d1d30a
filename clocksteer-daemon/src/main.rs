use clap::Parser;
use tracing_subscriber::EnvFilter;

use clocksteer_daemon::config::{Cli, Command};
use clocksteer_daemon::{client, poll_server, selftest, sim_client};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Command::PollServer(args)) => poll_server::run(args),
        Some(Command::SimClient(args)) => sim_client::run(args),
        Some(Command::RunTests) => selftest::run(),
        None => client::run(cli.client),
    };

    match result {
        Ok(()) => std::process::exit(exitcode::OK),
        Err(err) => {
            tracing::error!("Failure: {err}");
            std::process::exit(1);
        }
    }
}
