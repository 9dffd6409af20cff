//! vf: terminal front-end for VibeFlow work sessions.
//!
//! Each invocation opens the shared store, runs one catch-up tick so sessions
//! idle past the auto-end threshold are closed, runs the command and flushes.
//! Sessions are keyed by repository, so `vf start` in any directory of a
//! checkout resumes the same session.
//!
//! ## Subcommands
//!
//! - `start`, `ping`, `end`: session lifecycle (`ping` is for shell prompt hooks)
//! - `intent`, `park`, `echo`: notes for this session and the next one
//! - `status`, `resume`, `history`, `receipt`: reads
//! - `thoughts`, `echoes`, `delete`, `forget`, `trace`: repo context
//! - `serve`: JSON-lines protocol on stdin/stdout for long-running hosts

mod commands;
mod error;
mod logging;
mod protocol;
mod render;
mod serve;

use clap::{Args, Parser, Subcommand};
use chrono::Duration;
use std::path::PathBuf;
use vibeflow_core::{EngineConfig, IdleTimeout, StorageConfig, Surface};

use crate::error::CliError;

#[derive(Parser)]
#[command(name = "vf")]
#[command(about = "Work sessions, flow state and notes for your future self")]
#[command(version)]
struct Cli {
    /// Store data here instead of the platform default
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Auto-end idle sessions after this long (`90m`, `4h`, `off`)
    #[arg(long, global = true, value_name = "DURATION")]
    idle_timeout: Option<IdleTimeout>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PathArg {
    /// Directory inside the repository (defaults to the current directory)
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,
}

#[derive(Args)]
struct TextArg {
    #[arg(required = true, trailing_var_arg = true, value_name = "TEXT")]
    text: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session for this repository (or show the active one)
    Start(PathArg),

    /// Record activity for the active session (for shell prompt hooks)
    Ping(PathArg),

    /// Set what you are working on
    Intent(TextArg),

    /// Park a thought for later
    Park(TextArg),

    /// Leave a note for the next session on this repository
    Echo {
        /// Hold the note until at least this long from now (`30m`, `2h`)
        #[arg(long, value_name = "DURATION", value_parser = commands::parse_delay)]
        after: Option<Duration>,

        #[command(flatten)]
        text: TextArg,
    },

    /// Show the active session, or the last one
    Status {
        /// Keep redrawing until the session ends
        #[arg(long)]
        watch: bool,
    },

    /// Show where you left off
    Resume(PathArg),

    /// List recent sessions for this repository
    History {
        #[command(flatten)]
        path: PathArg,

        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Print a receipt for a session (defaults to the newest one here)
    Receipt {
        #[arg(value_name = "SESSION_ID")]
        id: Option<String>,
    },

    /// End the active session
    End,

    /// List parked thoughts for this repository
    #[command(args_conflicts_with_subcommands = true)]
    Thoughts {
        #[command(subcommand)]
        action: Option<ThoughtAction>,

        #[command(flatten)]
        path: PathArg,
    },

    /// List delivered time echoes for this repository
    #[command(args_conflicts_with_subcommands = true)]
    Echoes {
        #[command(subcommand)]
        action: Option<EchoAction>,

        #[command(flatten)]
        path: PathArg,
    },

    /// Delete one session
    Delete {
        #[arg(value_name = "SESSION_ID")]
        id: String,
    },

    /// Delete every session, thought and echo for this repository
    Forget(PathArg),

    /// Control the `.vibeflow/trace.json` artifact
    Trace {
        #[command(subcommand)]
        action: TraceAction,
    },

    /// Speak the JSON-lines protocol on stdin/stdout
    Serve,
}

#[derive(Subcommand)]
enum ThoughtAction {
    /// Delete a parked thought
    Delete { id: String },
}

#[derive(Subcommand)]
enum EchoAction {
    /// Keep a delivered echo as a parked thought
    Park { id: String },
    /// Dismiss a delivered echo
    Discard { id: String },
}

#[derive(Subcommand)]
enum TraceAction {
    On(PathArg),
    Off(PathArg),
    Show(PathArg),
}

fn main() {
    let cli = Cli::parse();

    let surface = match cli.command {
        Commands::Serve => Surface::App,
        _ => Surface::Cli,
    };
    let storage = match &cli.data_dir {
        Some(dir) => StorageConfig::with_root_for(dir.clone(), surface),
        None => match StorageConfig::for_surface(surface) {
            Ok(storage) => storage,
            Err(e) => {
                eprintln!("vf: {}", e);
                std::process::exit(1);
            }
        },
    };

    let _logging_guard = logging::init(&storage.logs_dir());

    if let Err(e) = run(cli, &storage) {
        tracing::error!(error = %e, "vf command failed");
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli, storage: &StorageConfig) -> Result<(), CliError> {
    let preset = match cli.command {
        Commands::Serve => EngineConfig::app(),
        _ => EngineConfig::cli(),
    };
    let config = commands::engine_config(storage, preset, cli.idle_timeout);
    let here = || commands::target_dir(None);

    match cli.command {
        Commands::Serve => serve::run(commands::open_engine(storage, config)?),
        Commands::Status { watch: true } => commands::watch(storage, config, &here()?),

        Commands::Start(arg) => {
            let dir = commands::target_dir(arg.path.as_deref())?;
            commands::with_engine(storage, config, |e, out| commands::start(e, &dir, out))
        }
        Commands::Ping(arg) => {
            let dir = commands::target_dir(arg.path.as_deref())?;
            commands::with_engine(storage, config, |e, _| commands::ping(e, &dir))
        }
        Commands::Intent(arg) => {
            let dir = here()?;
            commands::with_engine(storage, config, |e, out| {
                commands::intent(e, &dir, &arg.text, out)
            })
        }
        Commands::Park(arg) => {
            let dir = here()?;
            commands::with_engine(storage, config, |e, out| commands::park(e, &dir, &arg.text, out))
        }
        Commands::Echo { after, text } => {
            let dir = here()?;
            commands::with_engine(storage, config, |e, out| {
                commands::echo(e, &dir, &text.text, after, out)
            })
        }
        Commands::Status { watch: false } => {
            let dir = here()?;
            commands::with_engine(storage, config, |e, out| commands::status(e, &dir, out))
        }
        Commands::Resume(arg) => {
            let dir = commands::target_dir(arg.path.as_deref())?;
            commands::with_engine(storage, config, |e, out| commands::resume(e, &dir, out))
        }
        Commands::History { path, limit } => {
            let dir = commands::target_dir(path.path.as_deref())?;
            commands::with_engine(storage, config, |e, out| {
                commands::history(e, &dir, limit, out)
            })
        }
        Commands::Receipt { id } => {
            let dir = here()?;
            commands::with_engine(storage, config, |e, out| {
                commands::receipt(e, &dir, id.as_deref(), out)
            })
        }
        Commands::End => {
            let dir = here()?;
            commands::with_engine(storage, config, |e, out| commands::end(e, &dir, out))
        }
        Commands::Thoughts { action, path } => {
            let dir = commands::target_dir(path.path.as_deref())?;
            commands::with_engine(storage, config, |e, out| match action {
                None => commands::list_thoughts(e, &dir, out),
                Some(ThoughtAction::Delete { id }) => commands::delete_thought(e, &dir, &id, out),
            })
        }
        Commands::Echoes { action, path } => {
            let dir = commands::target_dir(path.path.as_deref())?;
            commands::with_engine(storage, config, |e, out| match action {
                None => commands::list_echoes(e, &dir, out),
                Some(EchoAction::Park { id }) => commands::park_echo(e, &dir, &id, out),
                Some(EchoAction::Discard { id }) => commands::discard_echo(e, &dir, &id, out),
            })
        }
        Commands::Delete { id } => {
            commands::with_engine(storage, config, |e, out| commands::delete_session(e, &id, out))
        }
        Commands::Forget(arg) => {
            let dir = commands::target_dir(arg.path.as_deref())?;
            commands::with_engine(storage, config, |e, out| commands::forget(e, &dir, out))
        }
        Commands::Trace { action } => {
            let (arg, include) = match action {
                TraceAction::On(arg) => (arg, Some(true)),
                TraceAction::Off(arg) => (arg, Some(false)),
                TraceAction::Show(arg) => (arg, None),
            };
            let dir = commands::target_dir(arg.path.as_deref())?;
            commands::with_engine(storage, config, |e, out| match include {
                Some(include) => commands::set_trace(e, &dir, include, out),
                None => commands::show_trace(e, &dir, out),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_with_spaces() {
        let cli = Cli::try_parse_from(["vf", "intent", "fix", "the", "parser"]).unwrap();
        match cli.command {
            Commands::Intent(arg) => assert_eq!(arg.text, ["fix", "the", "parser"]),
            _ => panic!("expected intent"),
        }
    }

    #[test]
    fn echo_after_is_parsed_as_duration() {
        let cli = Cli::try_parse_from(["vf", "echo", "--after", "2h", "check", "CI"]).unwrap();
        match cli.command {
            Commands::Echo { after, text } => {
                assert_eq!(after, Some(Duration::hours(2)));
                assert_eq!(text.text, ["check", "CI"]);
            }
            _ => panic!("expected echo"),
        }
        assert!(Cli::try_parse_from(["vf", "echo", "--after", "soon", "x"]).is_err());
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from(["vf", "status", "--idle-timeout", "off", "--data-dir", "/tmp/vf"])
            .unwrap();
        assert_eq!(cli.idle_timeout, Some(IdleTimeout::Off));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/vf")));
        assert!(matches!(cli.command, Commands::Status { watch: false }));
    }

    #[test]
    fn thoughts_accepts_path_or_action() {
        let cli = Cli::try_parse_from(["vf", "thoughts", "../other"]).unwrap();
        match cli.command {
            Commands::Thoughts { action: None, path } => {
                assert_eq!(path.path, Some(PathBuf::from("../other")));
            }
            _ => panic!("expected thoughts listing"),
        }

        let cli = Cli::try_parse_from(["vf", "thoughts", "delete", "01ABC"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Thoughts {
                action: Some(ThoughtAction::Delete { .. }),
                ..
            }
        ));
    }

    #[test]
    fn echoes_actions_parse() {
        let cli = Cli::try_parse_from(["vf", "echoes", "discard", "01XYZ"]).unwrap();
        match cli.command {
            Commands::Echoes {
                action: Some(EchoAction::Discard { id }),
                ..
            } => assert_eq!(id, "01XYZ"),
            _ => panic!("expected echoes discard"),
        }
    }

    #[test]
    fn history_limit_defaults_to_five() {
        let cli = Cli::try_parse_from(["vf", "history"]).unwrap();
        assert!(matches!(cli.command, Commands::History { limit: 5, .. }));
    }

    #[test]
    fn intent_requires_text() {
        assert!(Cli::try_parse_from(["vf", "intent"]).is_err());
    }
}
