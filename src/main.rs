use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use diffmend::{parse_diffs, reconcile_diffs, FileContents, ReconcileOptions};
use env_logger::Builder;
use log::{error, info, warn, Level, LevelFilter};
use similar::TextDiff;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

// --- Main Application Entry Point ---

fn main() {
    let args = Args::parse();
    setup_logging(args.verbose);

    if let Err(e) = run(args) {
        // Using {:?} ensures the full error chain from `anyhow` is printed.
        eprintln!("{} {:?}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Contains the primary logic of the application.
fn run(args: Args) -> Result<()> {
    // --- Argument Validation ---
    if !args.target_dir.is_dir() {
        return Err(anyhow!(
            "Target directory '{}' not found or is not a directory.",
            args.target_dir.display()
        ));
    }
    if !(0.0..=1.0).contains(&args.threshold) {
        return Err(anyhow!("Similarity threshold must be between 0.0 and 1.0."));
    }

    let options = ReconcileOptions::builder()
        .diff_timeout(Duration::from_secs(args.timeout))
        .similarity_threshold(args.threshold)
        .build();

    // --- Diff Parsing ---
    let content = fs::read_to_string(&args.input_file)
        .with_context(|| format!("Failed to read input file '{}'", args.input_file.display()))?;
    let diffs = parse_diffs(&content, options.diff_timeout)
        .context("Failed to extract diff blocks from the input file")?;
    if diffs.is_empty() {
        info!("No diff blocks found or processed in the input file.");
        return Ok(());
    }
    info!("Found {} diff(s) to reconcile.", diffs.len());

    // --- Load Referenced Files ---
    // Every pre-edit file the diffs reference is loaded from the target
    // directory, keyed under the diff's own name so reconciliation can find
    // it. A file missing on disk becomes a problem during reconciliation.
    let mut files = FileContents::new();
    for diff in &diffs {
        if diff.is_new_file() {
            continue;
        }
        let disk_path = match sanitize_diff_path(&diff.filename_pre) {
            Ok(relative) => args.target_dir.join(relative),
            Err(error) => {
                warn!("{error}");
                continue;
            }
        };
        match fs::read_to_string(&disk_path) {
            Ok(text) => {
                files.insert(PathBuf::from(&diff.filename_pre), text);
            }
            Err(e) => {
                warn!("could not read '{}': {}", disk_path.display(), e);
            }
        }
    }

    // --- Reconcile and Write ---
    let targets: Vec<(String, String)> = diffs
        .iter()
        .map(|diff| (diff.filename_pre.clone(), diff.filename_post.clone()))
        .collect();
    let result = reconcile_diffs(diffs, &files, &options);

    for (pre, post) in &targets {
        let Some(new_content) = result.files.get(Path::new(post)) else {
            // The whole diff was dropped during reconciliation.
            continue;
        };
        let old_content = files.get(Path::new(pre)).map(String::as_str).unwrap_or("");
        if old_content == new_content {
            continue;
        }

        if args.dry_run {
            let text_diff = TextDiff::from_lines(old_content, new_content.as_str());
            println!("----- Proposed Changes for {} -----", post);
            print!("{}", text_diff.unified_diff().header(pre, post));
            println!("------------------------------------");
        } else {
            let disk_path = args.target_dir.join(sanitize_diff_path(post)?);
            if let Some(parent) = disk_path.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory '{}'", parent.display())
                })?;
            }
            fs::write(&disk_path, new_content)
                .with_context(|| format!("Failed to write '{}'", disk_path.display()))?;
            info!("Wrote {}", disk_path.display());
        }
    }

    // --- Final Summary ---
    if args.dry_run {
        info!("DRY RUN completed. No files were modified.");
    }
    if !result.problems.is_empty() {
        error!("--- Problems ---");
        for problem in &result.problems {
            warn!("{problem}");
        }
        return Err(anyhow!(
            "Completed with {} unresolved problem(s).",
            result.problems.len()
        ));
    }

    Ok(())
}

// --- Helper Structs and Functions ---

/// Turns a filename from a diff header into a path safe to join onto the
/// target directory. Strips the conventional `a/`/`b/` prefixes and rejects
/// anything that could escape the target directory.
fn sanitize_diff_path(name: &str) -> Result<PathBuf> {
    let trimmed = name.trim();
    let trimmed = trimmed
        .strip_prefix("a/")
        .or_else(|| trimmed.strip_prefix("b/"))
        .unwrap_or(trimmed);
    let path = Path::new(trimmed);
    if path.is_absolute() {
        bail!("Refusing absolute path '{}' from a diff header.", name);
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        bail!(
            "Refusing path '{}' that would escape the target directory.",
            name
        );
    }
    Ok(path.to_path_buf())
}

/// Defines the command-line arguments for the application.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Reconcile fuzzy unified diffs against the real files and apply the corrected edits.",
    long_about = "Parses unified diffs inside ``` markdown blocks, corrects each hunk against the \
                  file it claims to modify (re-anchoring wrong line numbers, restoring skipped \
                  lines, dropping invented ones), and applies what survives. Hunks that cannot \
                  be reconciled are reported as problems instead of aborting the run."
)]
struct Args {
    /// Path to the input file containing ```diff blocks.
    input_file: PathBuf,
    /// Path to the target directory holding the files to edit.
    target_dir: PathBuf,
    /// If set, show what would be done, but don't modify any files.
    #[arg(
        short = 'n',
        long,
        help = "Show what would be done, but don't modify files."
    )]
    dry_run: bool,
    /// Wall-clock budget for parsing diff blocks, in seconds.
    #[arg(
        short = 't',
        long,
        default_value_t = 3,
        help = "Wall-clock budget in seconds for parsing diff blocks."
    )]
    timeout: u64,
    /// Similarity threshold for fuzzy line matching (0.0 to 1.0).
    #[arg(long, default_value_t = diffmend::SIMILARITY_THRESHOLD, help = "Similarity threshold for fuzzy line matching (0.0 to 1.0). Higher is stricter.")]
    threshold: f64,
    /// Increase logging verbosity. Can be used multiple times.
    #[arg(short, long, action = clap::ArgAction::Count, long_help = "Increase logging verbosity.\n-v for info, -vv for debug, -vvv for trace.")]
    verbose: u8,
}

/// Sets up the global logger with a colored per-level format.
fn setup_logging(verbose: u8) {
    let log_level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace, // -vvv and higher
    };
    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| match record.level() {
            Level::Error => writeln!(buf, "{} {}", "error:".red().bold(), record.args()),
            Level::Warn => writeln!(buf, "{} {}", "warning:".yellow().bold(), record.args()),
            Level::Info => writeln!(buf, "{}", record.args()),
            Level::Debug => writeln!(buf, "{} {}", "debug:".blue().bold(), record.args()),
            Level::Trace => writeln!(buf, "{} {}", "trace:".cyan().bold(), record.args()),
        })
        .init();
}
