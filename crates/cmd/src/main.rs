// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand};
use hubstream_server::{
    http::{RestServerConfig, start_rest_server},
    routes::{AppState, router},
    settings::Settings,
};
use snafu::{ResultExt, Whatever};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod build_info;

#[derive(Debug, Parser)]
#[clap(
name = "hubstream",
about= "hubstream artifact mirror",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Serve(ServeArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Start the caching mirror.
Examples:

hubstream serve --config config.yaml
")]
struct ServeArgs {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

impl ServeArgs {
    fn run(&self) -> Result<(), Whatever> {
        let settings = Settings::load(&self.config)
            .whatever_context("failed to load configuration")?;
        let _log_guards = hubstream_telemetry::init_global_logging("hubstream", &settings.log);
        hubstream_telemetry::set_panic_hook();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .whatever_context("failed to build tokio runtime")?;
        runtime.block_on(serve(Arc::new(settings)))
    }
}

async fn serve(settings: Arc<Settings>) -> Result<(), Whatever> {
    let cancel = CancellationToken::new();
    let state = AppState::new(Arc::clone(&settings), cancel.clone())
        .whatever_context("failed to initialize cache engine")?;

    let config = RestServerConfig {
        bind_address: settings.bind_address(),
        enable_cors:  settings.server.enable_cors,
    };
    let mut handler = start_rest_server(config, router(state))
        .await
        .whatever_context("failed to start HTTP server")?;
    handler
        .wait_for_start()
        .await
        .whatever_context("server failed to start")?;
    info!("hubstream listening on {}", settings.bind_address());

    tokio::signal::ctrl_c()
        .await
        .whatever_context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining in-flight downloads");

    // Cancelling the root token aborts every in-flight download before
    // the listener stops accepting connections.
    cancel.cancel();
    handler.shutdown();
    handler
        .wait_for_stop()
        .await
        .whatever_context("server failed to stop cleanly")?;
    Ok(())
}

fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    match cli.commands {
        Commands::Serve(args) => args.run(),
    }
}
