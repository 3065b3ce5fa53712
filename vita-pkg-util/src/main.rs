mod cli;

use clap::Parser;
use cli::{Cli, Command};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use vita_pkg::naming;
use vita_pkg_util::{
    ConsoleProgress, ErrorClass, ExtractOptions, ExtractProgress, ImageFormat, License,
    OutputMode, PkgExtractor, SilentProgress,
};

/// Top-level application errors for vita-pkg-util.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to open PKG file '{}' ({class})", path.display()))]
    OpenPkg {
        path: PathBuf,
        class: ErrorClass,
        source: vita_pkg_util::OpenPkgError,
    },

    #[snafu(display("failed to extract '{}' ({class})", path.display()))]
    Extract {
        path: PathBuf,
        class: ErrorClass,
        source: vita_pkg_util::ExtractError,
    },

    #[snafu(display("failed to read license file '{}'", path.display()))]
    ReadLicense {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to read item"))]
    ReadItem { source: vita_pkg::item::ItemError },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Extract {
            pkg_path,
            output,
            extract_only,
            cso,
            pbp,
            decrypt,
            license,
            quiet,
        } => {
            let license = license
                .map(|path| {
                    std::fs::read(&path)
                        .map(License::new)
                        .context(ReadLicenseSnafu { path })
                })
                .transpose()?;

            let options = ExtractOptions {
                image_format: match cso {
                    None | Some(0) => ImageFormat::Iso,
                    Some(level) => ImageFormat::Cso { level },
                },
                keep_pbp: pbp,
                decrypt_always: decrypt,
                license,
            };
            let mode = if extract_only {
                OutputMode::Directory
            } else {
                OutputMode::Zip
            };

            cmd_extract(&pkg_path, output.as_deref(), mode, options, quiet)
        }
        Command::Info { pkg_path } => cmd_info(&pkg_path),
        Command::List { pkg_path } => cmd_list(&pkg_path),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open(path: &Path) -> Result<vita_pkg::Pkg<memmap2::Mmap>> {
    unsafe { vita_pkg_util::open_pkg(path) }.map_err(|source| Error::OpenPkg {
        path: path.to_path_buf(),
        class: source.class(),
        source,
    })
}

fn cmd_extract(
    path: &Path,
    output: Option<&Path>,
    mode: OutputMode,
    options: ExtractOptions,
    quiet: bool,
) -> Result<()> {
    let pkg = open(path)?;
    let output_dir = output.unwrap_or(Path::new("."));

    if quiet {
        run_extract(&pkg, path, output_dir, mode, options, SilentProgress)
    } else {
        let info = pkg.info();
        println!("Extracting {} ({})...", path.display(), info.kind().description());
        println!("[*] {}", info.title());
        run_extract(&pkg, path, output_dir, mode, options, ConsoleProgress::new())
    }
}

fn run_extract<P: ExtractProgress>(
    pkg: &vita_pkg::Pkg<memmap2::Mmap>,
    path: &Path,
    output_dir: &Path,
    mode: OutputMode,
    options: ExtractOptions,
    progress: P,
) -> Result<()> {
    let start = std::time::Instant::now();
    let extractor = PkgExtractor::new(pkg, progress, options);

    let written = extractor
        .extract_to(output_dir, mode)
        .map_err(|source| Error::Extract {
            path: path.to_path_buf(),
            class: source.class(),
            source,
        })?;

    tracing::info!(
        output = %written.display(),
        elapsed = start.elapsed().as_secs_f64(),
        "finished"
    );
    Ok(())
}

fn cmd_info(path: &Path) -> Result<()> {
    let pkg = open(path)?;
    let header = pkg.header();
    let info = pkg.info();
    let content_id = info.content_id();

    println!("PKG: {}", path.display());
    println!();
    println!("Content ID:     {}", content_id);
    println!("  Product ID:   {}", content_id.product_id());
    println!("  Label:        {}", content_id.label());
    println!("  Region:       {}", naming::region(content_id.product_id()));
    println!(
        "Content Type:   0x{:02X} ({})",
        pkg.metadata().content_type(),
        info.kind().description()
    );
    println!("Title:          {}", info.title());
    if !info.category().is_empty() {
        println!("Category:       {}", info.category());
    }
    if let Some(version) = info.min_version() {
        println!("Min Firmware:   {version}");
    }
    if let Some(version) = info.app_version() {
        println!("App Version:    {version}");
    }
    println!("Key Type:       {}", header.key_type());
    println!("PKG Type:       0x{:04X}", header.pkg_type());
    println!("PKG Size:       {} bytes", header.total_size());
    println!("Item Count:     {}", header.item_count());
    println!("Enc Offset:     0x{:X}", header.enc_offset());
    println!("Enc Size:       {} bytes", header.enc_size());
    println!("Output Name:    {}", naming::output_name(info));

    Ok(())
}

fn cmd_list(path: &Path) -> Result<()> {
    let pkg = open(path)?;

    println!("Items in {}:", path.display());
    println!("{:>6}  {:>5}  {:>12}  Name", "Index", "Flags", "Size");
    println!("{:-<6}  {:-<5}  {:-<12}  {:-<30}", "", "", "", "");

    for item in pkg.items() {
        let item = item.context(ReadItemSnafu)?;
        let name = if item.is_directory() {
            format!("{}/", item.name())
        } else {
            item.name().to_owned()
        };

        println!(
            "{:>6}  0x{:02X}   {:>12}  {}",
            item.index(),
            item.flags(),
            item.data_size(),
            name
        );
    }

    Ok(())
}
