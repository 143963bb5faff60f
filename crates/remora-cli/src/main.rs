mod commands;
mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "remora")]
#[command(version, about = "Signature scanner, module injector and hook controller")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "REMORA_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the section table of a module file
    Sections {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Search a module file for one pattern
    Scan {
        image: PathBuf,
        /// IDA-style pattern, e.g. "48 8D 0D ?? ?? ?? ?? E8"
        pattern: String,
        #[arg(long, value_enum, default_value_t = ScanMode::Text)]
        mode: ScanMode,
        /// Module base the addresses are relative to
        #[arg(long, default_value = "0x140000000")]
        base: String,
        /// Displacement added to the match before decoding (static mode)
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        offset: i64,
        /// Print every `.text` match instead of the first
        #[arg(long)]
        all: bool,
    },
    /// Resolve a signature file against a module file
    Resolve {
        image: PathBuf,
        #[arg(short, long)]
        signatures: Option<PathBuf>,
        #[arg(long, default_value = "0x140000000")]
        base: String,
        /// Report match counts instead of resolving
        #[arg(long)]
        check: bool,
        #[arg(long)]
        json: bool,
    },
    /// Wait for the target, inject the controller and keep it attached
    Attach {
        /// Executable name of the target process
        #[arg(short, long)]
        process: Option<String>,
        #[arg(short, long)]
        signatures: Option<PathBuf>,
        /// Directory holding the controller module
        #[arg(short, long)]
        resources: Option<PathBuf>,
        /// Resolve addresses without injecting
        #[arg(long)]
        scan_only: bool,
        /// Exit after the first session ends
        #[arg(long)]
        once: bool,
    },
    /// Print a block of the target's memory as a hexdump
    Dump {
        /// Address to read, in hex
        address: String,
        /// Number of bytes to read
        #[arg(short = 'n', long, default_value_t = 256)]
        size: usize,
        /// Treat the address as an offset from the main module base
        #[arg(long)]
        relative: bool,
        /// Process ID (overrides --process)
        #[arg(long)]
        pid: Option<u32>,
        /// Executable name of the target process
        #[arg(short, long)]
        process: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ScanMode {
    Text,
    Data,
    Module,
    Static,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("remora=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Sections { image, json } => commands::sections::run(&image, json),
        Command::Scan {
            image,
            pattern,
            mode,
            base,
            offset,
            all,
        } => commands::scan::run(&image, &pattern, mode, &base, offset, all),
        Command::Resolve {
            image,
            signatures,
            base,
            check,
            json,
        } => {
            let signatures = signatures.or(config.session.signatures.clone());
            commands::resolve::run(&image, signatures.as_deref(), &base, check, json)
        }
        Command::Attach {
            process,
            signatures,
            resources,
            scan_only,
            once,
        } => {
            let options = config.merge(process, signatures, resources, scan_only);
            commands::attach::run(options, once)
        }
        Command::Dump {
            address,
            size,
            relative,
            pid,
            process,
        } => {
            let process = process.or(Some(config.session.process_name.clone()));
            let target = commands::dump::Target::pick(pid, process)?;
            commands::dump::run(target, &address, size, relative)
        }
    }
}
