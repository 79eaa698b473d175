//! otk CLI - compile omnifests into build manifests

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use otk::{select_target, CompileOptions, FixSuggestion, Omnifest, OtkError, SearchPaths, Source};

#[derive(Parser)]
#[command(name = "otk")]
#[command(about = "otk is the omnifest toolkit: compile omnifest inputs into \
the native formats of image build tooling")]
#[command(version)]
struct Cli {
    /// Increase verbosity; can be passed multiple times
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Enable warnings; 'all' enables every warning
    #[arg(
        short = 'W',
        long = "warn",
        global = true,
        value_parser = ["all", "duplicate-definition"],
    )]
    warn: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct InputArgs {
    /// Omnifest to read, or none for STDIN
    #[arg(value_name = "INPUT")]
    input: Option<PathBuf>,

    /// Extra omnifest fragments resolved before INPUT
    #[arg(short = 'e', long = "extend", value_name = "FILE")]
    extend: Vec<PathBuf>,

    /// Target to resolve when the omnifest contains more than one
    #[arg(short, long)]
    target: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an omnifest
    Compile {
        #[command(flatten)]
        args: InputArgs,

        /// File to write to, or none for STDOUT
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate an omnifest without emitting output
    Validate {
        #[command(flatten)]
        args: InputArgs,
    },
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over -v when both are given.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let result = match &cli.command {
        Commands::Compile { args, output } => compile(args, &cli.warn, output.as_deref()),
        Commands::Validate { args } => validate(args, &cli.warn),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn compile(
    args: &InputArgs,
    warn: &[String],
    output: Option<&std::path::Path>,
) -> Result<(), OtkError> {
    let doc = process(args, warn)?;
    let text = doc.as_target_string()?;
    match output {
        Some(path) => fs::write(path, &text)?,
        None => {
            print!("{text}");
            io::stdout().flush()?;
        }
    }
    Ok(())
}

fn validate(args: &InputArgs, warn: &[String]) -> Result<(), OtkError> {
    process(args, warn)?;
    let name = args
        .input
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<stdin>".to_string());
    println!("{} Omnifest '{}' is valid", "✓".green(), name);
    Ok(())
}

/// Resolve the omnifest twice: a target-less discovery pass, then the real
/// pass with the selected target.
fn process(args: &InputArgs, warn: &[String]) -> Result<Omnifest, OtkError> {
    let mut sources: Vec<Source> = args.extend.iter().cloned().map(Source::File).collect();
    match &args.input {
        Some(path) => sources.push(Source::File(path.clone())),
        None => {
            let mut content = String::new();
            io::stdin().read_to_string(&mut content)?;
            sources.push(Source::stdin(content));
        }
    }

    let externals = SearchPaths::from_env();

    // The discovery pass runs without a target so no externals fire and the
    // user does not need -t for single-target documents.
    let discovery = CompileOptions {
        externals: externals.clone(),
        ..CompileOptions::default()
    };
    let doc = Omnifest::load(&sources, &discovery)?;
    let selected = select_target(&doc.targets(), args.target.as_deref())?;
    info!("selected the {selected} target");

    let options = CompileOptions {
        target: Some(selected),
        warn_duplicated_defs: warn
            .iter()
            .any(|w| w == "duplicate-definition" || w == "all"),
        externals,
        base: PathBuf::new(),
    };
    Omnifest::load(&sources, &options)
}
