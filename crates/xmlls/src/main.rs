//
// main.rs
//
// Copyright (C) 2022-2025 Posit Software, PBC. All rights reserved.
// Modifications copyright (C) 2026 Jonathan Marc Bearak
//

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::Context;
use log::LevelFilter;

const DEFAULT_LOG_FILE: &str = "/tmp/xmlls.log";

fn print_usage() {
    println!(
        "xmlls {}, a schema-aware XML Language Server.",
        env!("CARGO_PKG_VERSION")
    );
    print!(
        r#"
Usage: xmlls [OPTIONS]

Available options:

--stdio                      Start the LSP server using stdio transport
--log-file <FILE>            Write logs to FILE (default {DEFAULT_LOG_FILE})
--log-level <LEVEL>          One of error, warn, info, debug, trace (default info)
--version                    Print the version
--help                       Print this help message

Without --log-file or --log-level, logs go to stderr and follow RUST_LOG.

"#
    );
}

fn parse_level(value: &str) -> anyhow::Result<LevelFilter> {
    match value.to_ascii_lowercase().as_str() {
        "error" => Ok(LevelFilter::Error),
        "warn" | "warning" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        other => Err(anyhow::anyhow!("Unknown log level: '{other}'")),
    }
}

fn init_logging(log_file: Option<PathBuf>, log_level: Option<LevelFilter>) -> anyhow::Result<()> {
    if log_file.is_none() && log_level.is_none() {
        env_logger::init();
        return Ok(());
    }

    let path = log_file.unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Could not open log file {}", path.display()))?;

    env_logger::Builder::new()
        .filter_level(log_level.unwrap_or(LevelFilter::Info))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut argv = env::args();
    argv.next(); // skip executable name

    let mut use_stdio = false;
    let mut log_file = None;
    let mut log_level = None;

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--stdio" => use_stdio = true,
            "--log-file" => {
                let value = argv.next().context("--log-file requires a path")?;
                log_file = Some(PathBuf::from(value));
            }
            "--log-level" => {
                let value = argv.next().context("--log-level requires a level")?;
                log_level = Some(parse_level(&value)?);
            }
            "--version" => {
                println!("xmlls {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_usage();
                return Ok(());
            }
            other => {
                return Err(anyhow::anyhow!("Unknown argument: '{other}'"));
            }
        }
    }

    if !use_stdio {
        print_usage();
        return Ok(());
    }

    init_logging(log_file, log_level)?;

    xmlls::backend::start_lsp().await
}
