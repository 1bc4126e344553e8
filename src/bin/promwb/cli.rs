//! Command-line interface definitions for the workbench.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Command-line arguments for the workbench.
#[derive(Debug, Parser)]
#[command(name = "promwb")]
#[command(author, version, about = "Explore Prometheus metric snapshots with PromQL and rule files")]
pub struct Cli {
    /// Exposition text file to load at startup (repeatable)
    #[arg(long = "load", value_name = "FILE")]
    pub load: Vec<PathBuf>,

    /// Rule file, directory or glob to activate at startup
    #[arg(long, value_name = "SPEC")]
    pub rules: Option<String>,

    /// Pin the evaluation time (RFC3339, unix seconds, now or now-<dur>)
    #[arg(long, value_name = "INSTANT")]
    pub at: Option<String>,

    /// Staleness window for instant selectors (e.g. 5m, 30s)
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub lookback: Duration,

    /// Deadline for each query
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    pub query_timeout: Duration,

    /// Run a command and exit instead of starting the prompt (repeatable)
    #[arg(short = 'c', long = "command", value_name = "CMD")]
    pub commands: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let cli = Cli::parse_from([
            "promwb",
            "--load",
            "a.prom",
            "--load",
            "b.prom",
            "--lookback",
            "1m",
            "-c",
            "up",
            "--command",
            ".metrics",
        ]);
        assert_eq!(cli.load.len(), 2);
        assert_eq!(cli.lookback, Duration::from_secs(60));
        assert_eq!(cli.query_timeout, Duration::from_secs(30));
        assert_eq!(cli.commands, vec!["up", ".metrics"]);
        assert!(cli.rules.is_none());
    }
}
