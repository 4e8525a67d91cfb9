//! Multikernel host control-plane CLI.
//!
//! Dispatch: parse arguments, resolve configuration, run one `cmd_xxx`
//! function per subcommand, translate the result into the documented exit
//! code (spec.md §6): 0 success, 1 validation/resource/runtime error,
//! 2 argument error (from `clap` itself), 3 kernel-interface error,
//! 4 parse error, 130 interrupted.

mod cli;
mod cliparse;
mod commands;
mod config;
mod console;

use clap::Parser;
use kerf_model::KerfError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    let cli = cli::Cli::parse();
    init_logging(cli.verbose);

    let config = match config::KerfConfig::resolve(cli.config.as_deref(), cli.mount_point.as_deref())
    {
        Ok(config) => config,
        Err(err) => {
            eprintln!("kerf: {err:#}");
            std::process::exit(1);
        }
    };

    let result = dispatch(&config, &cli.command);
    std::process::exit(exit_code(result));
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();
}

fn dispatch(config: &config::KerfConfig, command: &cli::Command) -> anyhow::Result<()> {
    match command {
        cli::Command::Init(args) => commands::cmd_init(config, args),
        cli::Command::Create(args) => commands::cmd_create(config, args),
        cli::Command::Update(args) => commands::cmd_update(config, args),
        cli::Command::Delete(args) => commands::cmd_delete(config, args),
        cli::Command::Load(args) => commands::cmd_load(config, args),
        cli::Command::Exec(args) => commands::cmd_exec(config, args),
        cli::Command::Kill(args) => commands::cmd_kill(config, args),
        cli::Command::Unload(args) => commands::cmd_unload(config, args),
        cli::Command::Show(args) => commands::cmd_show(config, args),
        cli::Command::Console(args) => commands::cmd_console(config, args),
        cli::Command::Rollback(args) => commands::cmd_rollback(config, args),
    }
}

/// Maps a top-level command result to the documented process exit code.
///
/// Argument errors (exit 2) never reach this function: `clap` exits the
/// process itself when `Cli::parse()` fails. `KerfError` variants carry
/// their own exit code; anything else (I/O errors surfaced through
/// `anyhow::Context`, reads/writes outside the runtime's own error type)
/// maps to 1.
fn exit_code(result: anyhow::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("kerf: {err:#}");
            err.downcast_ref::<KerfError>().map_or(1, KerfError::exit_code)
        }
    }
}
