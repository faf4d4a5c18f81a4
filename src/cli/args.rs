//! Command line argument parsing and validation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Meta-installer assembly tool
#[derive(Parser, Debug)]
#[command(
    name = "mipack",
    version,
    about = "Assemble self-extracting meta-installers from a bundle catalog",
    long_about = "Assemble self-extracting meta-installers from a bundle catalog.

Each catalog line describes one bundle: the application binaries to embed,
an optional enterprise MSI request, and an optional tagging catalog. The
pipeline stages the payload, generates the offline update manifest, archives
and compresses the payload, embeds it into the extraction stub, and signs
the result.

Usage:
  mipack build bundles.catalog --config mipack.toml --official
  mipack build bundles.catalog --prefix TEST_ --jobs 2"
)]
pub struct Args {
    /// Operation to run
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level operations
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Assemble every installer in a bundle catalog
    Build(BuildArgs),
}

/// Arguments of the `build` operation
#[derive(clap::Args, Debug)]
pub struct BuildArgs {
    /// Bundle catalog: one JSON record per line, `#` starts a comment
    #[arg(value_name = "CATALOG")]
    pub catalog: PathBuf,

    /// Deployment configuration file
    #[arg(long, value_name = "FILE", default_value = "mipack.toml")]
    pub config: PathBuf,

    /// Root output directory for installers, manifests and reports
    #[arg(long, value_name = "DIR", default_value = "installers")]
    pub output_dir: PathBuf,

    /// Scratch directory for intermediate artifacts [default: <output-dir>/work]
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Directory holding the per-application manifest fragments (<guid>.gup)
    #[arg(long, value_name = "DIR", default_value = "fragments")]
    pub fragments_dir: PathBuf,

    /// Build official artifacts (without this, names get an UNOFFICIAL_
    /// prefix and outputs divert to a test directory)
    #[arg(long)]
    pub official: bool,

    /// Extra file-name prefix applied to every artifact
    #[arg(long, value_name = "PREFIX", default_value = "")]
    pub prefix: String,

    /// Bundles to assemble concurrently [default: number of CPUs]
    #[arg(long, short = 'j', value_name = "N", default_value_t = 0)]
    pub jobs: usize,

    /// Suppress progress output; errors still go to stderr
    #[arg(long, short)]
    pub quiet: bool,
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
