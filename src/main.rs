//! idswap - journaled, reversible identifier mutation.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use idswap::app::AppContext;
use idswap::cli::output::{emit_robot, robot_error_structured};
use idswap::cli::Cli;
use idswap::Result;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.robot {
                // Robot mode: structured error on stdout
                if emit_robot(&robot_error_structured(&e)).is_err() {
                    let fallback = serde_json::json!({ "status": "error", "message": e.to_string() });
                    println!("{fallback}");
                }
            } else {
                let structured = e.to_structured();
                eprintln!("Error: {e}");
                eprintln!("Hint: {}", structured.suggestion);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut ctx = AppContext::from_cli(cli)?;
    let result = idswap::cli::commands::run(&mut ctx, &cli.command);
    let shutdown = ctx.shutdown();
    result.and(shutdown)
}

fn init_tracing(cli: &Cli) {
    if cli.quiet {
        return;
    }

    let filter = match cli.verbose {
        0 => "warn,idswap=info",
        1 => "info,idswap=debug",
        2 => "debug,idswap=trace",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if cli.robot {
        // JSON logging for robot mode
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
