//! A small frontend over the `cachedump` library: list VACBs, reconstruct
//! file content or rebuild the `$MFT` directory tree from a raw physical
//! memory snapshot.
use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use cachedump::{
    list_vacbs, scan_mft, FileDumper, NullProgress, ObjectReader, Pa, Profile, Progress, RawImage,
    Va, X64Space,
};
use clap::{Parser, Subcommand};

/// Progress notifications on stderr, out of the way of the row stream.
#[derive(Debug, Default, Clone, Copy)]
struct StderrProgress;

impl Progress for StderrProgress {
    fn report(&self, message: &str) {
        eprintln!("[.] {message}");
    }
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The raw physical memory snapshot.
    snapshot: PathBuf,
    /// JSON profile carrying the kernel globals and structure layouts.
    #[arg(short, long)]
    profile: PathBuf,
    /// Directory table base of the snapshotted kernel.
    #[arg(long)]
    dtb: Pa,
    /// Print progress notifications to stderr.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every block cached by the cache manager.
    Vacbs,
    /// Reconstruct file content into a directory of sparse files. Without
    /// explicit file-object addresses nothing is discovered here (process
    /// enumeration belongs to the embedding host), so pass at least one.
    Dumpfiles {
        /// Kernel address of a _FILE_OBJECT to dump; repeatable.
        #[arg(long = "file-object")]
        file_objects: Vec<Va>,
        /// Where the recovered files go.
        #[arg(short, long, default_value = "dumpfiles.out")]
        dump_dir: PathBuf,
    },
    /// Rebuild the directory tree from the resident $MFT records.
    Mfttree,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let snapshot = File::open(&args.snapshot).context("failed to open the snapshot")?;
    let phys = RawImage::new(snapshot).context("failed to map the snapshot")?;
    let kernel = X64Space::new(&phys, args.dtb);
    let profile: Profile =
        serde_json::from_reader(File::open(&args.profile).context("failed to open the profile")?)
            .context("failed to parse the profile")?;
    profile.validate()?;
    let reader = ObjectReader::new(&profile, &kernel);
    let progress: &dyn Progress = if args.verbose {
        &StderrProgress
    } else {
        &NullProgress
    };

    match args.command {
        Command::Vacbs => {
            println!(
                "{:18} {:7} {:18} {:10} {}",
                "_VACB", "Present", "Base", "Offset", "Filename"
            );
            for row in list_vacbs(&reader, progress) {
                println!("{row}");
            }
        }
        Command::Dumpfiles {
            file_objects,
            dump_dir,
        } => {
            println!(
                "{:20} {:14} {:10} {:7} {}",
                "Type", "Phys Offset", "File Offset", "Length", "Filename"
            );
            let dumper = FileDumper::new(&reader, &phys, dump_dir).with_progress(progress);
            for row in dumper.run(&[], &file_objects)? {
                println!("{row}");
            }
        }
        Command::Mfttree => {
            let table = scan_mft(&reader, progress);
            println!(
                "{:>5} {:19} {:19} {:19} {:19} {}",
                "MFT", "file_modified", "mft_modified", "access", "create_time", "Name"
            );
            for row in table.rows() {
                println!("{row}");
            }
        }
    }

    Ok(())
}
