//! dylibify - convert a Mach-O executable into a loadable dylib.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use dylibify::{dylibify, DylibifyOptions, TargetPlatform};

/// Convert a Mach-O executable into a loadable dylib.
#[derive(Parser, Debug)]
#[command(name = "dylibify")]
#[command(author, about, long_about = None)]
struct Cli {
    /// Input Mach-O executable
    #[arg(short = 'i', long = "in", value_name = "PATH")]
    input: PathBuf,

    /// Output Mach-O dylib
    #[arg(short = 'o', long = "out", value_name = "PATH")]
    output: PathBuf,

    /// Path for the LC_ID_DYLIB command,
    /// e.g. @executable_path/Frameworks/libfoo.dylib
    #[arg(short = 'd', long = "dylib-path", value_name = "PATH")]
    dylib_path: Option<String>,

    /// Remove a dylib dependency (repeatable, accepts multiple values)
    #[arg(short = 'r', long = "remove-dylib", value_name = "NAME", num_args = 1..)]
    remove_dylibs: Vec<String>,

    /// Automatically remove unavailable dylib dependencies
    #[arg(short = 'R', long = "auto-remove-dylibs")]
    auto_remove_dylibs: bool,

    /// Remove the __TEXT,__info_plist section
    #[arg(short = 'P', long = "remove-info-plist")]
    remove_info_plist: bool,

    /// Patch platform to iOS 11.0
    #[arg(short = 'I', long = "ios", conflicts_with = "macos")]
    ios: bool,

    /// Patch platform to macOS 11.0
    #[arg(short = 'M', long = "macos")]
    macos: bool,

    /// Verbose mode (narrates every mutation)
    #[arg(short = 'V', long = "verbose")]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let platform = if cli.ios {
        Some(TargetPlatform::Ios)
    } else if cli.macos {
        Some(TargetPlatform::Macos)
    } else {
        None
    };

    let options = DylibifyOptions {
        input: cli.input.clone(),
        output: cli.output,
        dylib_path: cli.dylib_path,
        remove_dylibs: cli.remove_dylibs,
        auto_remove_dylibs: cli.auto_remove_dylibs,
        remove_info_plist: cli.remove_info_plist,
        platform,
    };

    dylibify(&options).with_context(|| format!("failed to dylibify '{}'", cli.input.display()))
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::TRACE } else { Level::WARN };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}
