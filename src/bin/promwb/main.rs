//! # PromQL Workbench CLI
//!
//! Interactive prompt over an in-memory metric snapshot. Lines starting with
//! `.` are commands, anything else is evaluated as PromQL. With `-c` the given
//! commands run in order and the process exits.

use std::io::{self, IsTerminal, Write};
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use promql_workbench::error::Result;
use promql_workbench::rules::AlertNotification;
use promql_workbench::session::{LoadOptions, Session};

mod cli;
mod commands;

use cli::Cli;
use commands::Flow;

/// Build the session from the command-line settings.
fn startup(cli: &Cli) -> Result<Session> {
    let mut session = Session::builder()
        .with_lookback(cli.lookback)
        .with_query_timeout(cli.query_timeout)
        .with_sink(|alert: &AlertNotification| println!("{alert}"))
        .build()?;

    if let Some(at) = &cli.at {
        let at = session.parse_instant(at)?;
        session.pin(at);
    }
    Ok(session)
}

/// Activate `--rules` and load every `--load` file.
fn preload(session: &mut Session, cli: &Cli) -> Result<()> {
    if let Some(spec) = &cli.rules {
        session.activate_rules(spec)?;
    }
    for path in &cli.load {
        let report = session.load_file(path, &LoadOptions::default())?;
        if let Some(Err(err)) = report.eval {
            tracing::warn!(%err, "rule pass failed during startup load");
        }
    }
    Ok(())
}

/// Print a failed command as one line; the session carries on.
fn report_error(err: &promql_workbench::Error) {
    tracing::warn!(%err, "command failed");
    eprintln!("error: {err}");
}

async fn run_line(session: &mut Session, line: &str) -> Flow {
    let mut out = Vec::new();
    let result = match commands::parse(line) {
        Ok(Some(command)) => commands::execute(session, command, &mut out).await,
        Ok(None) => Ok(Flow::Continue),
        Err(err) => Err(err),
    };
    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(&out).and_then(|()| stdout.flush());
    result.unwrap_or_else(|err| {
        report_error(&err);
        Flow::Continue
    })
}

async fn repl(session: &mut Session) -> io::Result<()> {
    let interactive = io::stdin().is_terminal();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if interactive {
            print!("promwb> ");
            io::stdout().flush()?;
        }
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        if run_line(session, &line).await == Flow::Quit {
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so query output on stdout stays clean.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(env_filter).with_writer(io::stderr).init();

    let cli = Cli::parse();
    let one_shot = !cli.commands.is_empty();

    let mut session = match startup(&cli) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = preload(&mut session, &cli) {
        if one_shot {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
        report_error(&err);
    }

    if one_shot {
        for line in &cli.commands {
            if run_line(&mut session, line).await == Flow::Quit {
                break;
            }
        }
        return ExitCode::SUCCESS;
    }

    match repl(&mut session).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
