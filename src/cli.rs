use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use rebate_rag::search::{SearchConfig, SearchMode};

#[derive(Debug, Parser)]
#[command(
    name = "rebate-rag",
    about = "Retrieve solved invoice pages to use as few-shot extraction examples"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Embedding backend used for the example store
    #[arg(long, value_enum, global = true)]
    pub embedder: Option<EmbedderKind>,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbedderKind {
    /// Offline feature hashing over the page tokenizer
    Hashing,
    /// Mean-pooled ColBERT token embeddings
    Colbert,
}

impl std::str::FromStr for EmbedderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Index a corpus of answered pages into a new shard
    Index(IndexArgs),
    /// Merge a staged shard, or every staged shard
    Merge(MergeArgs),
    /// Retrieve the examples most similar to a page text
    Search(SearchArgs),
    /// Add a hand-curated example
    Add(AddArgs),
    /// Delete an example by id
    Delete {
        /// Example id
        id: u64,
    },
    /// Remove corpus examples no manifest entry points to
    Reconcile,
    /// Drop every example and forget the indexing manifest
    Repair {
        /// Confirm the destructive operation
        #[arg(long)]
        yes: bool,
    },
    /// Show store size, manifest state and shards
    Status(StatusArgs),
    /// Manage persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Corpus root holding one folder per document
    pub corpus_root: PathBuf,

    /// Only index documents whose name matches this glob
    #[arg(long)]
    pub scope: Option<String>,

    /// Leave the shard staged instead of merging it
    #[arg(long)]
    pub no_merge: bool,

    /// Pages processed concurrently
    #[arg(long)]
    pub workers: Option<usize>,

    /// Output the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Merge --

#[derive(Debug, Parser)]
pub struct MergeArgs {
    /// Shard to merge; all staged shards when omitted
    pub shard_id: Option<String>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The page text to match
    #[arg(required_unless_present = "file", conflicts_with = "file")]
    pub query: Option<String>,

    /// Read the query text from a file
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Number of results to return
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Retrieval mode
    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<SearchMode>,

    /// Minimum dense similarity in [0, 1]
    #[arg(long)]
    pub min_similarity: Option<f32>,

    /// Dense weight for hybrid fusion in [0, 1]
    #[arg(long)]
    pub alpha: Option<f32>,

    /// Shortlist size handed to the reranker
    #[arg(long)]
    pub rerank_top_n: Option<usize>,

    /// Return the single nearest example when nothing passes the floor
    #[arg(long)]
    pub fallback: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_mode(s: &str) -> Result<SearchMode, String> {
    s.parse().map_err(|e: rebate_rag::Error| e.to_string())
}

impl SearchArgs {
    /// Overlay the flags that were given on top of `base`.
    pub fn apply(&self, base: SearchConfig) -> SearchConfig {
        SearchConfig {
            mode: self.mode.unwrap_or(base.mode),
            top_k: self.count.unwrap_or(base.top_k),
            min_similarity: self.min_similarity.unwrap_or(base.min_similarity),
            hybrid_alpha: self.alpha.unwrap_or(base.hybrid_alpha),
            rerank_top_n: self.rerank_top_n.unwrap_or(base.rerank_top_n),
            fallback_to_nearest: self.fallback || base.fallback_to_nearest,
        }
    }
}

// -- Add --

#[derive(Debug, Parser)]
pub struct AddArgs {
    /// Page text file
    pub text_file: PathBuf,

    /// Answer JSON file with `page_role` and `items`
    pub answer_json: PathBuf,

    /// Document name recorded in the example metadata
    #[arg(long, default_value = "manual")]
    pub document: String,

    /// Page number recorded in the example metadata
    #[arg(long, default_value = "1")]
    pub page: u32,
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
    /// Show every known setting and its stored value
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print one stored setting
    Get { key: String },
    /// Persist a setting
    Set { key: String, value: String },
    /// Remove a stored setting (revert to default)
    Clear { key: String },
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
            "rebate-rag",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["rebate-rag", "search", "合計 1200円"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query.as_deref(), Some("合計 1200円"));
                assert_eq!(args.count, None);
                assert!(!args.json);
                assert_eq!(args.apply(SearchConfig::default()), SearchConfig::default());
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn search_flags_override_settings() {
        let cli = Cli::parse_from([
            "rebate-rag",
            "search",
            "--file",
            "page.txt",
            "-n",
            "5",
            "--mode",
            "dense-only",
            "--alpha",
            "0.2",
            "--fallback",
        ]);
        let Command::Search(args) = cli.command else {
            panic!("expected search command");
        };
        let base = SearchConfig {
            rerank_top_n: 4,
            ..SearchConfig::default()
        };
        let config = args.apply(base);
        assert_eq!(config.mode, SearchMode::DenseOnly);
        assert_eq!(config.top_k, 5);
        assert_eq!(config.hybrid_alpha, 0.2);
        assert_eq!(config.rerank_top_n, 4);
        assert!(config.fallback_to_nearest);
    }

    #[test]
    fn search_needs_query_or_file() {
        assert!(Cli::try_parse_from(["rebate-rag", "search"]).is_err());
        assert!(
            Cli::try_parse_from(["rebate-rag", "search", "q", "--file", "f"])
                .is_err()
        );
    }

    #[test]
    fn parse_index_with_global_flags() {
        let cli = Cli::parse_from([
            "rebate-rag",
            "index",
            "corpus",
            "--scope",
            "2024/*",
            "--no-merge",
            "--embedder",
            "hashing",
            "-q",
        ]);
        assert_eq!(cli.embedder, Some(EmbedderKind::Hashing));
        assert!(cli.quiet);
        let Command::Index(args) = cli.command else {
            panic!("expected index command");
        };
        assert_eq!(args.scope.as_deref(), Some("2024/*"));
        assert!(args.no_merge);
        assert_eq!(args.workers, None);
    }

    #[test]
    fn embedder_kind_parses_settings_values() {
        assert_eq!("colbert".parse::<EmbedderKind>(), Ok(EmbedderKind::Colbert));
        assert!("openai".parse::<EmbedderKind>().is_err());
    }
}
