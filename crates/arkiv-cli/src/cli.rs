//! Arkiv command line interface
//!
//! Backs up one activity of a SQLite site database into a document and
//! restores documents into another site.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "arkiv")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Engine settings file (TOML)
    #[arg(short, long, env = "ARKIV_SETTINGS", global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Back up one activity into a document
    Backup {
        /// Path to the source SQLite database
        #[arg(short, long, env = "ARKIV_DATABASE")]
        database: PathBuf,

        /// Schema file describing the activity's tables
        #[arg(long)]
        schema: PathBuf,

        /// Id of the activity instance
        #[arg(long)]
        activity_id: i64,

        /// Id of the activity's course module
        #[arg(long)]
        course_module_id: i64,

        /// Leave out user data subtrees
        #[arg(long)]
        no_user_data: bool,

        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Gzip the document
        #[arg(long)]
        gzip: bool,
    },

    /// Restore a document into a database
    Restore {
        /// Path to the target SQLite database
        #[arg(short, long, env = "ARKIV_DATABASE")]
        database: PathBuf,

        /// Schema file describing the activity's tables
        #[arg(long)]
        schema: PathBuf,

        /// Backup document, plain or gzipped
        input: PathBuf,

        /// Course module the restored activity belongs to
        #[arg(long)]
        course_module_id: Option<i64>,

        /// Do not restore user data even if the document holds it
        #[arg(long)]
        no_user_data: bool,

        /// Known id mappings for entities outside the activity (TOML)
        #[arg(short, long)]
        mappings: Option<PathBuf>,

        /// Write every mapping, new ones included, to this file afterwards
        #[arg(long)]
        save_mappings: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = commands::run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
