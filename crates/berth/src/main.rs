//! Berth CLI entry point.

use std::io::IsTerminal;

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use berth::bootstrap::sysinit;
use berth::cli::{Cli, Commands};

/// Message for `berth init` without a program.
const MANUAL_INIT: &str = "You should not invoke berth init manually";

fn init_tracing(directive: &str) -> Result<()> {
    let ansi = std::io::stderr().is_terminal();
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(ansi)
                .with_writer(std::io::stderr),
        )
        .with(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The bootstrap replaces this process: no runtime threads may exist yet.
    if let Commands::Init(args) = &cli.command {
        init_tracing("berth=warn")?;
        let Some((options, argv)) = args.clone().into_bootstrap() else {
            eprintln!("{MANUAL_INIT}");
            std::process::exit(1);
        };
        sysinit(options, &argv);
    }

    color_eyre::install()?;
    init_tracing(if cli.debug { "berth=debug" } else { "berth=info" })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let code = runtime.block_on(cli.execute())?;

    // Blocking stdin reads would otherwise hold up runtime shutdown.
    runtime.shutdown_background();
    std::process::exit(code);
}
