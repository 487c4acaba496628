use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use tracing::level_filters::LevelFilter;

use ropforge::builder::BuildOptions;
use ropforge::catalogue::Catalogue;
use ropforge::goals::{self, GoalName, GoalOptions, GoalRequest};
use ropforge::rop::{self, DEFAULT_DEPTH};
use ropforge::types::{to_hex, BadBytes};

#[derive(Parser)]
#[command(name = "ropforge", about = "Build x86_64 ROP chains from the gadgets of ELF or raw binaries")]
struct Cli {
    /// Binaries to take gadgets from; the first one is the primary target
    #[arg(required = true)]
    binaries: Vec<PathBuf>,

    /// Chain to build: execve or mprotect
    #[arg(short, long, default_value = "execve")]
    goal: GoalName,

    /// Command for execve (no arguments)
    #[arg(long)]
    cmd: Option<String>,

    /// execve: address of the command string; mprotect: start of the region
    #[arg(long)]
    address: Option<String>,

    /// execve: address of a null word, used with --address
    #[arg(long)]
    nulladdress: Option<String>,

    /// mprotect: size of the region (hex)
    #[arg(long)]
    size: Option<String>,

    /// Bytes that must not appear in the chain, as a hex string (e.g. 000a0d)
    #[arg(short, long = "badbytes", default_value = "00")]
    badbytes: String,

    /// Image base of the first binary (hex), overriding the one from its headers
    #[arg(long, value_parser = parse_image_base)]
    image_base: Option<u64>,

    /// Fail instead of emitting a partial chain
    #[arg(long)]
    strict: bool,

    /// Give up ordering register goals after this many attempts
    #[arg(long)]
    max_attempts: Option<usize>,

    /// Treat inputs as raw x86_64 code
    #[arg(long)]
    raw: bool,

    /// Maximum instructions per gadget, ret included
    #[arg(long, default_value_t = DEFAULT_DEPTH)]
    depth: usize,

    /// Also write the raw chain bytes to this file
    #[arg(long)]
    payload: Option<PathBuf>,

    /// Show selection and search details
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only show warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn parse_image_base(s: &str) -> Result<u64, String> {
    goals::parse_hex("image base", s).map_err(|e| e.to_string())
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else if cli.quiet {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("{}: {:#}", "error".red(), e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let bad_bytes = BadBytes::parse(&cli.badbytes)?;

    let mut binaries = Vec::with_capacity(cli.binaries.len());
    for path in &cli.binaries {
        let binary = rop::load_binary(path, cli.raw, cli.depth)
            .with_context(|| format!("loading {}", path.display()))?;
        eprintln!(
            "{} {} ({} gadgets, image base {})",
            "loaded".bold().cyan(),
            binary.name,
            binary.gadgets.len(),
            to_hex(binary.image_base)
        );
        binaries.push(binary);
    }
    if let (Some(base), Some(first)) = (cli.image_base, binaries.first_mut()) {
        first.image_base = base;
    }
    let catalogue = Catalogue::new(binaries);
    if catalogue.binaries().len() > 1 {
        eprintln!(
            "{} {} gadgets across {} binaries",
            "catalogued".bold().cyan(),
            catalogue.gadget_count(),
            catalogue.binaries().len()
        );
    }
    if catalogue.gadget_count() == 0 {
        tracing::warn!("no gadgets found; the chain will need manual steps");
    }

    let request = GoalRequest {
        goal: cli.goal,
        options: GoalOptions {
            cmd: cli.cmd.clone(),
            address: cli.address.clone(),
            nulladdress: cli.nulladdress.clone(),
            size: cli.size.clone(),
        },
    };
    let options = BuildOptions {
        bad_bytes,
        strict: cli.strict,
        max_attempts: cli.max_attempts,
    };

    let chain = goals::build(&catalogue, &request, &options)?;
    print!("{}", chain.render());

    if let Some(path) = &cli.payload {
        let bytes = chain.payload()?;
        std::fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
        eprintln!("{} {} bytes to {}", "wrote".bold().cyan(), bytes.len(), path.display());
    }

    if chain.complete {
        eprintln!("{} {} chain", "built".green().bold(), request.goal);
    } else {
        eprintln!(
            "{} {} chain is incomplete ({} manual step(s))",
            "warning".yellow().bold(),
            request.goal,
            chain.placeholders()
        );
    }
    Ok(())
}
