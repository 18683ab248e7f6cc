//! The `ringneck` command — prefix any command to memoize it.
//!
//! ```text
//! ringneck [flags] [--] <cmd> [args...]
//! ```
//!
//! The first run spawns the command through the supervisor, mirrors its
//! output live and records it; identical invocations replay the
//! recording bit for bit without running the command again.

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use ringneck_core::{Channel, Request, RingneckError, StreamSelection, client, ipc};

/// Shell snippet emitted by `--init`; defines `+` (cached run) and
/// `++` (forced re-run) for fish-style shells.
const INIT_SNIPPET: &str = "\
function + --wraps ringneck
    ringneck $argv
end

function ++ --wraps ringneck
    ringneck --force $argv
end
";

#[derive(Debug, Parser)]
#[command(
    name = "ringneck",
    about = "Memoizing command runner: cache a command's output and replay it",
    disable_help_subcommand = true
)]
struct Cli {
    /// Run the command even if a cached result exists, replacing it.
    #[arg(long)]
    force: bool,

    /// Show only the stdout stream.
    #[arg(long)]
    stdout: bool,

    /// Show only the stderr stream.
    #[arg(long)]
    stderr: bool,

    /// Record stdin with the run and mirror it on replay.
    #[arg(long)]
    stdin: bool,

    /// List the cached runs in the order they were recorded.
    #[arg(long)]
    history: bool,

    /// Drop every cached run and clear the history.
    #[arg(long)]
    forget: bool,

    /// Replay the run stored under the given hex key.
    #[arg(long, value_name = "HEX")]
    key: Option<String>,

    /// Stop the supervisor after in-flight runs finish.
    #[arg(long)]
    shutdown: bool,

    /// Print a shell snippet defining the + and ++ aliases.
    #[arg(long)]
    init: bool,

    /// The command to run and its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "CMD")]
    command: Vec<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("RINGNECK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let status = match run().await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("ringneck: {e}");
            1
        }
    };
    std::process::exit(i32::from(status));
}

async fn run() -> Result<u8, RingneckError> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let benign = matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion);
            let _ = e.print();
            return Ok(if benign { 0 } else { 1 });
        }
    };
    init_logging();

    if cli.init {
        print!("{INIT_SNIPPET}");
        return Ok(0);
    }

    let selection = StreamSelection::from_flags(cli.stdout, cli.stderr, cli.stdin);
    let request = if cli.shutdown {
        Request::Shutdown
    } else if cli.forget {
        Request::Forget
    } else if cli.history {
        Request::History
    } else if let Some(key) = cli.key {
        Request::Replay { key }
    } else if !cli.command.is_empty() {
        Request::Run {
            argv: cli.command,
            force: cli.force,
            record_stdin: cli.stdin,
        }
    } else {
        eprintln!("ringneck: no command given");
        return Ok(1);
    };
    debug!(?request, "parsed invocation");

    let socket = ipc::socket_path();

    // Nothing listening means nothing to shut down.
    if matches!(request, Request::Shutdown) {
        return match Channel::connect(&socket).await {
            Ok(chan) => drive(chan, request, selection).await,
            Err(_) => Ok(0),
        };
    }

    let chan = client::connect_or_autostart(&socket).await?;
    drive(chan, request, selection).await
}

async fn drive(
    chan: Channel,
    request: Request,
    selection: StreamSelection,
) -> Result<u8, RingneckError> {
    let forward_stdin = matches!(request, Request::Run { .. } | Request::Replay { .. });
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    tokio::select! {
        status = client::run_session(
            chan,
            request,
            selection,
            forward_stdin,
            tokio::io::stdin(),
            &mut stdout,
            &mut stderr,
        ) => status,
        _ = shutdown_signal() => {
            // Dropping the connection tells the supervisor to kill the
            // child and discard the capture.
            Ok(1)
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_dash_passes_flags_to_the_child() {
        let cli = Cli::try_parse_from(["ringneck", "--", "echo", "-n", "--history"]).unwrap();
        assert!(!cli.history);
        assert_eq!(cli.command, ["echo", "-n", "--history"]);
    }

    #[test]
    fn child_flags_after_the_command_are_not_ours() {
        let cli = Cli::try_parse_from(["ringneck", "seq", "-w", "1", "10"]).unwrap();
        assert!(!cli.force);
        assert_eq!(cli.command, ["seq", "-w", "1", "10"]);
    }

    #[test]
    fn our_flags_parse_before_the_command() {
        let cli = Cli::try_parse_from(["ringneck", "--force", "--stdin", "cat"]).unwrap();
        assert!(cli.force);
        assert!(cli.stdin);
        assert_eq!(cli.command, ["cat"]);
    }

    #[test]
    fn key_takes_a_value() {
        let cli = Cli::try_parse_from(["ringneck", "--key", "666"]).unwrap();
        assert_eq!(cli.key.as_deref(), Some("666"));
        assert!(cli.command.is_empty());
    }

    #[test]
    fn bare_invocation_has_no_command() {
        let cli = Cli::try_parse_from(["ringneck"]).unwrap();
        assert!(cli.command.is_empty());
        assert!(!cli.shutdown && !cli.forget && !cli.history && !cli.init);
    }
}
