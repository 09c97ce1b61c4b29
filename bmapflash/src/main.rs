use anyhow::{Context, Result, anyhow, bail};
use bmapflash_core::source::{self, Compression};
use bmapflash_core::{Bmap, FlashOptions, ProgressState, progress, verify, write};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "bmapflash")]
#[command(about = "Flash sparse disk images using bmap files", version)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the mapped blocks of an image to a device
    Flash {
        /// Image file to write (.gz, .xz and .zst are decompressed on the fly)
        #[arg(required = true)]
        image: PathBuf,

        /// Target block device (or file)
        #[arg(required = true)]
        device: PathBuf,

        /// bmap file describing the image [default: looked up next to the image]
        #[arg(short, long)]
        bmap: Option<PathBuf>,

        /// Zero this many bytes at the start of the device first (e.g. 1M, 0x100000)
        #[arg(short = 'z', long = "zero-prefix", value_parser = parse_size, default_value = "0")]
        zero_prefix: u64,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Check a device against the checksums of a bmap file
    Verify {
        /// Block device (or file) to check
        #[arg(required = true)]
        device: PathBuf,

        /// bmap file the device was flashed with
        #[arg(short, long, required = true)]
        bmap: PathBuf,
    },
}

/// Parses a byte count: decimal, `0x` hex, or with a `K`/`M`/`G` binary suffix.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 1u64 << 10),
        Some((i, 'm' | 'M')) => (&s[..i], 1 << 20),
        Some((i, 'g' | 'G')) => (&s[..i], 1 << 30),
        _ => (s, 1),
    };
    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))?
    } else {
        digits
            .parse::<u64>()
            .map_err(|e| format!("Invalid number: {}", e))?
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("Size {} is too large", s))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Finds the bmap file for an image: `image.img.xz` is looked up as
/// `image.img.bmap`, `image.img.xz.bmap`, then `image.bmap`.
fn find_bmap(image: &Path) -> Option<PathBuf> {
    let uncompressed = match Compression::from_path(image) {
        Compression::None => image.to_path_buf(),
        _ => image.with_extension(""),
    };
    [
        with_suffix(&uncompressed, ".bmap"),
        with_suffix(image, ".bmap"),
        uncompressed.with_extension("bmap"),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}

fn load_bmap(path: &Path) -> Result<Bmap> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read bmap file {}", path.display()))?;
    let bmap = Bmap::parse(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
    bmap.ensure_supported()?;
    log::info!(
        "Loaded bmap {} (version {}, {} of {} blocks mapped, {})",
        path.display(),
        bmap.version,
        bmap.mapped_blocks_count,
        bmap.blocks_count,
        bmap.checksum_type
    );
    Ok(bmap)
}

fn open_device(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open device {}", path.display()))
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn progress_bar(total: u64, prefix: &'static str, color: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_prefix(prefix);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
            ))?
            .progress_chars("■ "),
    );
    Ok(pb)
}

fn run_verify(device: &mut File, device_path: &Path, bmap: &Bmap) -> Result<()> {
    let verify_pb = progress_bar(bmap.mapped_bytes(), "Verifying", "magenta")?;
    let result = verify::run_with_bmap(
        device,
        bmap,
        progress::DEFAULT_INTERVAL,
        |state: &ProgressState| verify_pb.set_position(state.transferred),
    );

    let invalid = match result {
        Ok(invalid) => invalid,
        Err(e) => {
            verify_pb.abandon_with_message("❌ Operation failed.");
            return Err(anyhow!(e).context(format!("Failed to verify {}", device_path.display())));
        }
    };

    if invalid.is_empty() {
        verify_pb.finish_with_message("Verification successful.");
        return Ok(());
    }

    verify_pb.abandon_with_message("❌ Verification failed.");
    println!(
        "\n{} {} range(s) do not match the bmap checksums:",
        style("ERROR:").red().bold(),
        invalid.len()
    );
    for range in &invalid {
        println!(
            "  blocks {:>10}-{:<10} expected {}",
            range.from, range.to, range.checksum
        );
    }
    bail!("Verification failed: {} mismatched range(s)", invalid.len())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG still wins over -v
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Flash {
            image,
            device,
            bmap,
            zero_prefix,
            no_verify,
            yes,
        } => {
            let bmap_path = match bmap {
                Some(path) => path,
                None => find_bmap(&image).ok_or_else(|| {
                    anyhow!(
                        "No bmap file found for {}; pass one with --bmap",
                        image.display()
                    )
                })?,
            };
            let bmap = load_bmap(&bmap_path)?;

            println!(
                "{} This will overwrite data on '{}'.",
                style("WARNING:").red().bold(),
                device.display(),
            );
            println!("  Device: {}", style(device.display()).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            println!("  Bmap:   {}", style(bmap_path.display()).cyan());
            println!(
                "  Mapped: {} of {} bytes",
                bmap.mapped_bytes(),
                bmap.blocks_count * bmap.block_size
            );
            println!();

            if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Flash operation cancelled.");
                return Ok(());
            }

            println!();

            let image_stream = source::open_image(&image)
                .with_context(|| format!("Failed to open image {}", image.display()))?;
            let mut device_file = open_device(&device)?;
            let options = FlashOptions::new().zero_fill_prefix_bytes(zero_prefix);

            let write_pb = progress_bar(bmap.mapped_bytes(), "Writing", "green")?;
            let result = write::run_with_bmap(
                image_stream,
                &mut device_file,
                &bmap,
                &options,
                |state: &ProgressState| write_pb.set_position(state.transferred),
            );
            if let Err(e) = result {
                write_pb.abandon_with_message("❌ Operation failed.");
                return Err(anyhow!(e).context(format!("Failed to flash {}", device.display())));
            }
            write_pb.finish_with_message("Write complete.");

            if no_verify {
                println!("Verification skipped.");
            } else {
                run_verify(&mut device_file, &device, &bmap)?;
            }

            println!(
                "\n✨ Successfully flashed {} with {}.",
                style(device.display()).cyan(),
                style(image.display()).cyan()
            );
        }
        Commands::Verify { device, bmap } => {
            let bmap = load_bmap(&bmap)?;
            let mut device_file = open_device(&device)?;

            run_verify(&mut device_file, &device, &bmap)?;

            println!(
                "\n✨ {} matches its bmap.",
                style(device.display()).cyan()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("512"), Ok(512));
        assert_eq!(parse_size("0x200"), Ok(512));
        assert_eq!(parse_size("64K"), Ok(64 * 1024));
        assert_eq!(parse_size("1m"), Ok(1024 * 1024));
        assert_eq!(parse_size("0x1G"), Ok(1 << 30));
        assert!(parse_size("ten").is_err());
        assert!(parse_size("99999999999999G").is_err());
    }

    #[test]
    fn test_find_bmap_for_compressed_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("os.img.xz");
        assert_eq!(find_bmap(&image), None);

        fs::write(dir.path().join("os.bmap"), "").unwrap();
        assert_eq!(find_bmap(&image), Some(dir.path().join("os.bmap")));

        fs::write(dir.path().join("os.img.xz.bmap"), "").unwrap();
        assert_eq!(find_bmap(&image), Some(dir.path().join("os.img.xz.bmap")));

        fs::write(dir.path().join("os.img.bmap"), "").unwrap();
        assert_eq!(find_bmap(&image), Some(dir.path().join("os.img.bmap")));
    }

    #[test]
    fn test_find_bmap_for_raw_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("os.img");
        fs::write(dir.path().join("os.img.bmap"), "").unwrap();
        assert_eq!(find_bmap(&image), Some(dir.path().join("os.img.bmap")));
    }
}
