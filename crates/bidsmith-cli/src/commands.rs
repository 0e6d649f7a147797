use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "bidsmith")]
#[command(about = "Organize MRI slice stacks into a canonical subject/session tree", long_about = None)]
pub struct Cli {
    /// Folder with one subfolder per subject
    pub input: PathBuf,

    /// Root of the canonical output tree
    pub output: PathBuf,

    /// Classification rule file (JSON)
    #[arg(short, long)]
    pub rules: PathBuf,

    /// Settings file; defaults to Bidsmith.toml in the working directory
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Preprocess subjects already in the output tree without converting
    #[arg(long)]
    pub skip_conversion: bool,

    /// Stop after conversion
    #[arg(long)]
    pub skip_preprocessing: bool,

    /// Only process this subject (raw or canonical name)
    #[arg(long)]
    pub subject: Option<String>,

    /// Only process this session (raw name, canonical name or index)
    #[arg(long)]
    pub session: Option<String>,

    /// Parallel conversion workers (capped at 12)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Per-task converter timeout; 0 disables it
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Discover and classify, print the plan, write nothing
    #[arg(long)]
    pub dry_run: bool,
}
