use std::io::{self, Write};
use std::process;

use anyhow::Context;
use clap::{ArgAction, CommandFactory, Parser};
use tracing::debug;
use tracing::level_filters::LevelFilter;

mod error;
mod estimate;
mod idlemap;
mod measure;
mod pagemap;
mod scanner;
mod sys;
mod walker;

use error::Error;
use idlemap::{IdleBitmap, KernelIdleBitmap};
use measure::Measurement;
use scanner::ProcFiles;

/// Estimate the working set size of a process.
///
/// Sets the kernel's idle page flags, sleeps, then counts the target's pages
/// that were referenced meanwhile. The idle bitmap is shared by the whole
/// host: don't run two measurements at once.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Process ID to watch
    pid: Option<i32>,

    /// Duration in seconds to measure
    #[arg(allow_negative_numbers = true)]
    duration: Option<f64>,

    /// Log per-region details; repeat for per-page details
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    let (Some(pid), Some(duration)) = (args.pid, args.duration) else {
        // Usage is not an error.
        let _ = Args::command().print_help();
        process::exit(0);
    };

    init_logging(args.verbose);

    let mut bitmap = KernelIdleBitmap::new();
    debug!(bitmap = %bitmap.path().display(), "Using idle page bitmap.");

    let result = run(
        pid,
        ProcFiles::for_pid(pid),
        duration,
        sys::page_size(),
        &mut bitmap,
        &mut io::stdout().lock(),
    );
    if let Err(e) = result {
        if let Some(Error::IntervalTooShort { .. }) = e.downcast_ref::<Error>() {
            eprintln!("Interval too short. Exiting.");
            process::exit(1);
        }
        eprintln!("Error: {e:#}");
        process::exit(2);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    tracing_subscriber::fmt()
        .compact()
        .with_max_level(level)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Validates the interval, then measures and writes the report to `out`.
/// The bitmap is left alone unless the interval is acceptable.
fn run<B, W>(
    pid: i32,
    files: ProcFiles,
    duration: f64,
    page_size: u64,
    bitmap: &mut B,
    out: &mut W,
) -> anyhow::Result<()>
where
    B: IdleBitmap + ?Sized,
    W: Write + ?Sized,
{
    let measurement = Measurement::new(files, duration, page_size)?;

    writeln!(
        out,
        "Watching PID {} page references during {:.2} seconds...",
        pid, duration
    )?;
    out.flush()?;
    debug!(pid, page_size, interval = ?measurement.interval(), "Starting measurement.");

    let report = measurement
        .run(bitmap)
        .with_context(|| format!("Failed to measure working set of PID {pid}"))?;

    write!(out, "{report}")?;
    out.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idlemap::MemoryIdleBitmap;

    const PRESENT: u64 = 1 << 63;

    #[test]
    fn short_interval_leaves_bitmap_alone() {
        let (_root, files) = ProcFiles::fixture("1000-2000 rw-p 00000000 00:00 0\n", &[(1, PRESENT | 1)]);
        let mut bitmap = MemoryIdleBitmap::new(64);
        let mut out = Vec::new();

        let err = run(1234, files, 0.009, 4096, &mut bitmap, &mut out).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::IntervalTooShort { .. })
        ));
        assert_eq!(bitmap.marks, 0);
        assert_eq!(bitmap.snapshots, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn prints_banner_and_report() {
        let (_root, files) = ProcFiles::fixture(
            "1000-3000 rw-p 00000000 00:00 0\n",
            &[(1, PRESENT | 1), (2, PRESENT | 2)],
        );
        let mut bitmap = MemoryIdleBitmap::new(64);
        let mut out = Vec::new();

        run(1234, files, 0.01, 4096, &mut bitmap, &mut out).unwrap();

        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.split('\n').collect();
        assert_eq!(bitmap.marks, 1);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Watching PID 1234 page references during 0.01 seconds...");
        assert_eq!(lines[1], "Est(s)     Ref(MB)");
        assert!(lines[2].ends_with("      0.00"), "unexpected data line {:?}", lines[2]);
    }

    #[test]
    fn measurement_errors_carry_context() {
        let root = tempfile::tempdir().unwrap();
        let mut bitmap = MemoryIdleBitmap::new(64);
        let mut out = Vec::new();

        let err = run(
            77,
            ProcFiles::under_root(root.path(), 77),
            0.01,
            4096,
            &mut bitmap,
            &mut out,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ProcessAccess { .. })
        ));
        assert!(format!("{err:#}").starts_with("Failed to measure working set of PID 77"));
    }
}
