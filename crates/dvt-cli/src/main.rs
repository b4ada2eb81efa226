use clap::Parser;
use clap::error::ErrorKind;

use dvt_cancel::CancellationTokenSource;
use std::io::{self, Write};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod cli;
mod connections;
mod run;

use cli::Cli;

const DVT_DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Maximum number of threads used for running blocking operations (based on
/// the tokio runtime default). These threads mostly sit in blocking file I/O,
/// so a generous cap is affordable.
const DVT_DEFAULT_MAX_BLOCKING_THREADS: usize = 512;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            if e.kind() == ErrorKind::UnknownArgument {
                // Only show the actual error message
                print_trimmed_error(e); // prints to stderr
                return ExitCode::from(2);
            }
            // For other errors, show full help as usual
            e.exit();
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DVT_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    // Setup tokio runtime and set stack-size to 8MB
    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(DVT_DEFAULT_MAX_BLOCKING_THREADS)
        .thread_stack_size(DVT_DEFAULT_STACK_SIZE)
        .build()
        .expect("failed to initialize tokio runtime");

    let cst = CancellationTokenSource::new();
    let token = cst.token();

    tokio_rt.block_on(async move {
        // first Ctrl-C cancels cooperatively; in-flight requests drain and
        // the summary still gets written
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cancellation requested, draining in-flight work...");
                cst.cancel();
            }
        });

        match run::execute(cli, token).await {
            Ok(code) => ExitCode::from(code as u8),
            Err(error) => {
                eprintln!("{}", error.pretty());
                ExitCode::from(run::exit_code_for(&error) as u8)
            }
        }
    })
}

fn print_trimmed_error(e: clap::Error) {
    let message = e.to_string();
    let first_line = message.lines().next().unwrap_or("invalid arguments");
    let mut stderr = io::stderr();
    let _ = writeln!(stderr, "{first_line}");
    let _ = writeln!(stderr, "Run with --help for usage.");
}
