use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use nix::fcntl::OFlag;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tarkit_core::backend::{Codec, CompressedBackend, RawBackend};
use tarkit_core::{Archive, ArchiveBuilder, BLOCK_SIZE, Backend, Options};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tarkit")]
#[command(about = "Copy and inspect tar archives through raw or compressed backends", version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log filter directive (overrides --verbose)
    #[arg(long, global = true, env = "TARKIT_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy an archive block by block, (de)compressing by file extension
    Copy {
        /// Archive to read
        #[arg(required = true)]
        src: PathBuf,

        /// Archive to write
        #[arg(required = true)]
        dst: PathBuf,

        /// Fail instead of replacing an existing destination
        #[arg(short = 'n', long = "no-overwrite")]
        no_overwrite: bool,

        /// Re-read the destination and compare digests
        #[arg(long)]
        verify: bool,
    },
    /// Show the size, digest and session details of an archive
    Stat {
        #[arg(required = true)]
        archive: PathBuf,
    },
}

fn init_tracing(verbose: bool, directive: Option<&str>) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::new(directive.unwrap_or(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Picks the backend for `path`: a codec layer when the extension names one,
/// the raw primitives otherwise.
fn backend_for(path: &Path) -> Box<dyn Backend> {
    match Codec::from_path(path) {
        Some(codec) => {
            debug!(path = %path.display(), %codec, "using compressed backend");
            Box::new(CompressedBackend::new(codec))
        }
        None => Box::new(RawBackend),
    }
}

fn describe(path: &Path) -> String {
    match Codec::from_path(path) {
        Some(codec) => format!("{} ({codec})", path.display()),
        None => path.display().to_string(),
    }
}

/// Streams every byte of `archive` into `sink`, hashing as it goes.
///
/// Returns the digest and the number of bytes read.
fn drain_archive(
    archive: &mut Archive<'_>,
    running: &AtomicBool,
    mut sink: impl FnMut(&[u8]) -> Result<()>,
) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    let mut block = [0u8; BLOCK_SIZE];

    loop {
        if !running.load(Ordering::SeqCst) {
            return Err(anyhow!("Operation cancelled by user"));
        }

        let n = archive.read_block(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
        sink(&block[..n])?;
        total += n as u64;
        if n < BLOCK_SIZE {
            warn!(
                path = %archive.pathname().display(),
                "archive ends with a partial block of {n} bytes"
            );
            break;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), total))
}

fn spinner(prefix: &'static str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_prefix(prefix);
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:12} [{elapsed_precise}] [{spinner}] {bytes} ({bytes_per_sec}) {msg}")?,
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn copy(src: &Path, dst: &Path, no_overwrite: bool, verify: bool, running: &AtomicBool) -> Result<()> {
    let src_backend = backend_for(src);
    let dst_backend = backend_for(dst);

    let mut reader = ArchiveBuilder::new()
        .backend(src_backend.as_ref())
        .open(src)
        .with_context(|| format!("Could not open '{}' for reading", src.display()))?;

    let options = if no_overwrite {
        Options::NO_OVERWRITE
    } else {
        Options::empty()
    };
    let mut writer = ArchiveBuilder::new()
        .flags(OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC)
        .options(options)
        .backend(dst_backend.as_ref())
        .open(dst)
        .with_context(|| format!("Could not open '{}' for writing", dst.display()))?;

    println!("  Source:      {}", style(describe(src)).cyan());
    println!("  Destination: {}", style(describe(dst)).cyan());
    println!();

    let copy_pb = spinner("Copying")?;
    let copied = drain_archive(&mut reader, running, |chunk| {
        writer.write_all(chunk)?;
        copy_pb.inc(chunk.len() as u64);
        Ok(())
    });

    let (src_digest, total) = match copied {
        Ok(result) => result,
        Err(e) => {
            copy_pb.finish_with_message("❌ Operation failed.");
            // Release both sessions before removing the partial copy.
            drop(writer);
            drop(reader);
            fs::remove_file(dst).ok();
            return Err(e);
        }
    };

    reader.close().into_result()?;
    writer
        .close()
        .into_result()
        .with_context(|| format!("Could not finish writing '{}'", dst.display()))?;
    copy_pb.finish_with_message("Copy complete.");

    if verify {
        let mut check = ArchiveBuilder::new()
            .backend(dst_backend.as_ref())
            .open(dst)
            .with_context(|| format!("Could not reopen '{}' for verification", dst.display()))?;

        let verify_pb = spinner("Verifying")?;
        let (dst_digest, _) = drain_archive(&mut check, running, |chunk| {
            verify_pb.inc(chunk.len() as u64);
            Ok(())
        })?;
        check.close().into_result()?;

        if src_digest != dst_digest {
            verify_pb.finish_with_message("❌ Verification failed.");
            return Err(anyhow!("Verification failed: hash mismatch."));
        }
        verify_pb.finish_with_message("Verification successful.");
    }

    println!(
        "\n✨ Successfully copied {} bytes from {} to {}.",
        total,
        style(src.display()).cyan(),
        style(dst.display()).cyan()
    );
    Ok(())
}

fn stat(path: &Path, running: &AtomicBool) -> Result<()> {
    let backend = backend_for(path);
    let mut archive = ArchiveBuilder::new()
        .backend(backend.as_ref())
        .open(path)
        .with_context(|| format!("Could not open '{}'", path.display()))?;

    let mut zero_blocks = 0u64;
    let (digest, total) = drain_archive(&mut archive, running, |chunk| {
        if chunk.len() == BLOCK_SIZE && chunk.iter().all(|&b| b == 0) {
            zero_blocks += 1;
        }
        Ok(())
    })?;

    let state = archive.state();
    println!("  {:<14} {}", "ARCHIVE", style(describe(path)).cyan());
    println!("  {:<14} {}", "BYTES", total);
    println!("  {:<14} {}", "BLOCKS", total.div_ceil(BLOCK_SIZE as u64));
    println!("  {:<14} {}", "ZERO BLOCKS", zero_blocks);
    println!("  {:<14} {}", "SHA-256", digest);
    println!(
        "  {:<14} {:?} ({} buckets)",
        "TABLE",
        state.kind(),
        state.capacity()
    );

    archive.close().into_result()?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log.as_deref());

    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Set up the Ctrl+C handler to toggle the `running` flag.
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    match cli.command {
        Commands::Copy {
            src,
            dst,
            no_overwrite,
            verify,
        } => copy(&src, &dst, no_overwrite, verify, &running),
        Commands::Stat { archive } => stat(&archive, &running),
    }
}
