use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "vita-pkg-util")]
#[command(about = "PlayStation Vita, PSP and PSX PKG converter", long_about = None)]
pub struct Cli {
    /// Log progress details to stderr (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Convert a PKG file to a zip archive or loose files
    Extract {
        /// Path to the PKG file
        #[arg(value_name = "PKG_FILE")]
        pkg_path: PathBuf,

        /// Output directory (defaults to the current directory)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Write loose files instead of a zip archive
        #[arg(short = 'x', long)]
        extract_only: bool,

        /// Rebuild PSP disc images as CSO at this deflate level (0 writes an ISO)
        #[arg(short, long, value_name = "LEVEL", value_parser = clap::value_parser!(u32).range(0..=9))]
        cso: Option<u32>,

        /// Keep EBOOT.PBP instead of rebuilding the disc image
        #[arg(short, long)]
        pbp: bool,

        /// Unwrap PSP-KEY.EDAT even with --pbp
        #[arg(short, long)]
        decrypt: bool,

        /// Decoded license file (work.bin or RIF)
        #[arg(short, long, value_name = "FILE")]
        license: Option<PathBuf>,

        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Display information about a PKG file
    Info {
        /// Path to the PKG file
        #[arg(value_name = "PKG_FILE")]
        pkg_path: PathBuf,
    },

    /// List items in a PKG file
    List {
        /// Path to the PKG file
        #[arg(value_name = "PKG_FILE")]
        pkg_path: PathBuf,
    },
}
