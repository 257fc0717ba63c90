// src/main.rs
//! discovery-dump
//!
//! Decodes a test discovery trace and prints one JSON object per test on
//! stdout. With `--touches`, prints one `[suite, test, class, method]` row
//! per touched method instead.
//!
//! The trace path defaults to `trace.path` from the discovery configuration.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use test_discovery::observability::init_tracing;
use test_discovery::recording::Trace;
use test_discovery::utils::config::DiscoveryConfig;
use tracing::{debug, info};

/// Dump a test discovery trace as JSON lines
#[derive(Parser, Debug)]
#[command(name = "discovery-dump")]
#[command(version, about, long_about = None)]
struct Args {
    /// Print one row per touched method instead of one object per test
    #[arg(long)]
    touches: bool,

    /// Trace file (defaults to `trace.path` from the configuration)
    trace: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;

    let path = match args.trace {
        Some(path) => path,
        None => match DiscoveryConfig::load()?.trace.path {
            Some(path) => path,
            None => bail!("no trace file given and trace.path is not configured"),
        },
    };

    let trace = Trace::from_file(&path)
        .with_context(|| format!("Failed to read trace {}", path.display()))?;
    info!(
        "Loaded {:?} trace {}: {} names, {} tests",
        trace.version,
        path.display(),
        trace.names.len(),
        trace.records.len()
    );

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    if args.touches {
        for touch in trace.touches() {
            serde_json::to_writer(&mut out, &touch)?;
            writeln!(out)?;
        }
    } else {
        for test in trace.resolve() {
            debug!("{}.{}: {} classes", test.suite, test.test, test.classes.len());
            serde_json::to_writer(&mut out, &test)?;
            writeln!(out)?;
        }
    }
    out.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_touches_and_path() {
        let args = Args::try_parse_from(["discovery-dump", "--touches", "session.tr"]).unwrap();
        assert!(args.touches);
        assert_eq!(args.trace, Some(PathBuf::from("session.tr")));
    }

    #[test]
    fn test_path_is_optional() {
        let args = Args::try_parse_from(["discovery-dump"]).unwrap();
        assert!(!args.touches);
        assert!(args.trace.is_none());
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(Args::try_parse_from(["discovery-dump", "--bogus"]).is_err());
        assert!(Args::try_parse_from(["discovery-dump", "a.tr", "b.tr"]).is_err());
    }
}
