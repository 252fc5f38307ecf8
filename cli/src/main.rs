//! procvar CLI - offline inspection and encoding of variable blobs.
//!
//! ```text
//! procvar inspect <blob>          decode a blob, print JSON and its SHA-256
//! procvar encode <json> <blob>    encode a JSON value into a blob
//! procvar types                   list the types known to the codec
//! ```
//!
//! Types come from the config file (`$PROCVAR_CONFIG` or
//! `~/.procvar/config.toml`).

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use procvar_codec::{ByteCodec, TypeRegistry, fingerprint};
use procvar_config::ProcvarConfig;
use procvar_types::{from_json, to_json};

#[derive(Debug, Parser)]
#[command(name = "procvar")]
#[command(about = "Inspect and produce procvar variable blobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Decode a variable blob and print it as JSON
    Inspect {
        /// Encoded variable blob
        blob: PathBuf,
    },
    /// Encode a JSON value into a variable blob
    Encode {
        /// JSON input; objects carry "$type", byte strings are {"$bytes": base64}
        json: PathBuf,
        /// Output blob
        blob: PathBuf,
    },
    /// List registered types
    Types,
}

fn init_tracing(config: Option<&ProcvarConfig>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            config
                .and_then(ProcvarConfig::log_filter)
                .map_or_else(|| EnvFilter::try_new("warn"), EnvFilter::try_new)
        })
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // stdout carries command output; logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

fn main() -> ExitCode {
    let config = ProcvarConfig::load().ok().flatten();
    init_tracing(config.as_ref());

    let cli = Cli::parse();
    match run(cli.command, config.unwrap_or_default()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, config: ProcvarConfig) -> Result<()> {
    let mut out = io::stdout().lock();
    match command {
        Command::Inspect { blob } => {
            let codec = config.codec().context("invalid [[types]] in config")?;
            inspect(&codec, &blob, &mut out)?;
        }
        Command::Encode { json, blob } => {
            let codec = config.codec().context("invalid [[types]] in config")?;
            encode(&codec, &json, &blob, &mut out)?;
        }
        Command::Types => {
            let registry = config
                .type_registry()
                .context("invalid [[types]] in config")?;
            list_types(&registry, &mut out)?;
        }
    }
    Ok(())
}

fn inspect(codec: &ByteCodec, blob: &Path, out: &mut impl Write) -> Result<()> {
    let bytes = fs::read(blob).with_context(|| format!("failed to read {}", blob.display()))?;
    let value = codec
        .decode(&bytes)
        .with_context(|| format!("failed to decode {}", blob.display()))?;
    let json = serde_json::to_string_pretty(&to_json(&value))?;
    writeln!(out, "{json}")?;
    writeln!(out, "sha256: {}", fingerprint(&bytes))?;
    writeln!(out, "bytes: {}", bytes.len())?;
    Ok(())
}

fn encode(codec: &ByteCodec, json: &Path, blob: &Path, out: &mut impl Write) -> Result<()> {
    let text =
        fs::read_to_string(json).with_context(|| format!("failed to read {}", json.display()))?;
    let parsed: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", json.display()))?;
    let value =
        from_json(&parsed).with_context(|| format!("failed to convert {}", json.display()))?;
    let bytes = codec
        .encode(&value)
        .with_context(|| format!("failed to encode {}", json.display()))?;
    fs::write(blob, &bytes).with_context(|| format!("failed to write {}", blob.display()))?;
    tracing::debug!(path = %blob.display(), len = bytes.len(), "Wrote blob");
    writeln!(out, "sha256: {}", fingerprint(&bytes))?;
    Ok(())
}

fn list_types(registry: &TypeRegistry, out: &mut impl Write) -> Result<()> {
    for descriptor in registry.iter() {
        let mut line = format!("{} v{}", descriptor.name(), descriptor.type_version());
        if let Some(parent) = descriptor.parent_name() {
            line.push_str(&format!(" : {parent}"));
        }
        for old in descriptor.superseded_names() {
            line.push_str(&format!(" (supersedes {old})"));
        }
        if let Some(fields) = descriptor.schema() {
            line.push_str(&format!(" [{}]", fields.join(", ")));
        }
        if descriptor.is_immutable() {
            line.push_str(" immutable");
        }
        if descriptor.is_sealed() {
            line.push_str(" sealed");
        }
        writeln!(out, "{line}")?;
    }
    Ok(())
}
