use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::factor::Factor;

#[derive(Debug, Parser)]
#[command(
    name = "briefmatch",
    about = "Match creative briefs to ad-production portfolios"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build the artifact bundle from a portfolio record file
    Build(BuildArgs),
    /// Extract factors from a brief, then rank portfolios
    Search(SearchArgs),
    /// Rank portfolios from already extracted factors
    Rank(RankArgs),
    /// Extract {desc, what, how, style} from a text
    Extract(ExtractArgs),
    /// Search a single factor index
    Probe(ProbeArgs),
    /// Show artifact and configuration status
    Status(StatusArgs),
    /// Read and write persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Build --

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EncoderKind {
    /// Deterministic feature hashing, no model download
    Hashing,
    /// ColBERT sentence vectors plus a word-vector file
    Colbert,
}

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// Portfolio records as a JSON array or JSON Lines
    #[arg(long)]
    pub records: PathBuf,

    /// Embedding backend
    #[arg(long, value_enum, default_value = "hashing")]
    pub encoder: EncoderKind,

    /// ColBERT model ID or local model path
    #[arg(long)]
    pub model: Option<String>,

    /// Word vectors in word2vec/fastText text format (colbert encoder)
    #[arg(long)]
    pub word_vectors: Option<PathBuf>,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The brief to match
    pub brief: String,

    /// Number of results to return
    #[arg(short = 'n', long, allow_negative_numbers = true)]
    pub limit: Option<i64>,

    /// Diversify results with MMR
    #[arg(long)]
    pub diversity: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Rank --

#[derive(Debug, Parser)]
pub struct RankArgs {
    /// One-sentence summary of the ad
    #[arg(long, default_value = "")]
    pub desc: String,

    /// What is advertised
    #[arg(long, default_value = "")]
    pub what: String,

    /// Medium or format
    #[arg(long, default_value = "")]
    pub how: String,

    /// Tone or style
    #[arg(long, default_value = "")]
    pub style: String,

    /// Number of results to return
    #[arg(short = 'n', long, allow_negative_numbers = true)]
    pub limit: Option<i64>,

    /// Diversify results with MMR
    #[arg(long)]
    pub diversity: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Extract --

#[derive(Debug, Parser)]
pub struct ExtractArgs {
    /// Text to extract factors from
    pub text: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Probe --

#[derive(Debug, Parser)]
pub struct ProbeArgs {
    /// Factor index to search
    #[arg(long)]
    pub factor: Factor,

    /// Query text for that factor
    pub text: String,

    /// Number of hits to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the resolved value of a setting
    Get {
        /// Setting key
        key: String,
    },
    /// Persist a setting in config.redb
    Set {
        /// Setting key
        key: String,
        /// New value
        value: String,
    },
    /// Remove a persisted setting (revert to default)
    Unset {
        /// Setting key
        key: String,
    },
    /// List every resolved setting
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "briefmatch",
            &mut std::io::stdout(),
        );
    }
}
