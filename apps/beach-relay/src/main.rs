use anyhow::Result;
use beach_relay::{
    cli::{self, Cli, Commands},
    config::{RelayConfig, ServeArgs},
    server,
    telemetry::Telemetry,
};
use clap::Parser;
use tracing::info;

#[derive(Parser)]
struct ServeDefaults {
    #[command(flatten)]
    args: ServeArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Call {
            url,
            peer,
            method,
            data,
            call_id,
        }) => {
            let _telemetry = Telemetry::init(false)?;
            cli::run_call(url, peer, method, data, call_id).await
        }
        Some(Commands::Echo { url, peer }) => {
            let _telemetry = Telemetry::init(false)?;
            cli::run_echo(url, peer).await
        }
        Some(Commands::Serve(args)) => run_server(RelayConfig::try_from(args)?).await,
        // Bare invocation serves with flags taken from the environment.
        None => {
            let defaults = ServeDefaults::parse_from(["beach-relay"]);
            run_server(RelayConfig::try_from(defaults.args)?).await
        }
    }
}

async fn run_server(config: RelayConfig) -> Result<()> {
    let telemetry = Telemetry::init(true)?;
    info!(
        listen_addr = %config.listen_addr,
        call_timeout_secs = config.call_timeout.as_secs(),
        allowlist = config.allowlist.enabled,
        "starting beach-relay"
    );
    server::serve(config, telemetry.metrics_handle()).await
}
