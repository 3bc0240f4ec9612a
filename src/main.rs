use std::sync::{Arc, Mutex};

use clap::Parser;
use kdam::{BarExt, tqdm};
use rebate_rag::{
    ConfigDb,
    DataDir,
    ExampleStore,
    HashingEmbedder,
    LexicalIndex,
    Manifest,
    ModelManager,
    embedding::Embedder,
    error::{self, Error},
    example::{AnswerPayload, ExampleMetadata},
    incremental::Scope,
    ingestion::SidecarLoader,
    manifest::ManifestStatus,
    model_manager::{DEFAULT_MODEL_ID, MODEL_ENV_VAR},
    pipeline::{Pipeline, PipelineOptions, ShardResult},
    reranker::{ColbertReranker, Reranker},
    search::{self, Retriever, SearchMode},
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction, EmbedderKind};

const LOG_ENV_VAR: &str = "REBATE_RAG_LOG";

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

/// Services shared by the commands, built once from flags and settings.
struct Services {
    store: ExampleStore,
    manifest: Manifest,
    model: Arc<ModelManager>,
}

fn model_id(cli: &Cli, config_db: &ConfigDb) -> error::Result<String> {
    if let Some(model) = &cli.model {
        return Ok(model.clone());
    }
    if let Some(model) = config_db.get_setting("model")? {
        return Ok(model);
    }
    Ok(std::env::var(MODEL_ENV_VAR)
        .unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string()))
}

fn embedder_kind(cli: &Cli, config_db: &ConfigDb) -> error::Result<EmbedderKind> {
    if let Some(kind) = cli.embedder {
        return Ok(kind);
    }
    match config_db.get_setting("embedder")? {
        Some(raw) => raw.parse().map_err(|e| {
            Error::Config(format!("invalid value '{raw}' for embedder: {e}"))
        }),
        None => Ok(EmbedderKind::Colbert),
    }
}

fn open_services(
    cli: &Cli,
    config_db: &ConfigDb,
    data_dir: &DataDir,
) -> error::Result<Services> {
    let model = Arc::new(ModelManager::with_model_id(model_id(cli, config_db)?));
    let embedder: Arc<dyn Embedder> = match embedder_kind(cli, config_db)? {
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::default()),
        EmbedderKind::Colbert => model.clone(),
    };
    let store = ExampleStore::open(
        &data_dir.examples_db(),
        embedder,
        config_db.store_config()?,
    )?;
    let manifest = Manifest::open(&data_dir.manifest_db())?;
    Ok(Services {
        store,
        manifest,
        model,
    })
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;

    if let Command::Config { action } = &cli.command {
        return cmd_config(&config_db, action);
    }

    let services = open_services(&cli, &config_db, &data_dir)?;

    match &cli.command {
        Command::Index(args) => cmd_index(&services, &config_db, args)?,
        Command::Merge(args) => cmd_merge(&services, args)?,
        Command::Search(args) => cmd_search(&services, &config_db, args)?,
        Command::Add(args) => cmd_add(&services, args)?,
        Command::Delete { id } => {
            if !services.store.delete(*id)? {
                return Err(Error::NotFound {
                    kind: "example",
                    name: id.to_string(),
                });
            }
            println!("Deleted example #{id}");
        }
        Command::Reconcile => {
            let report = pipeline(&services, PipelineOptions::default())
                .reconcile()?;
            println!(
                "Examined {} corpus example(s), removed {}",
                report.examined,
                report.removed.len()
            );
        }
        Command::Repair { yes } => cmd_repair(&services, *yes)?,
        Command::Status(args) => {
            cmd_status(&services, &data_dir, args.json)?;
        }
        Command::Config { .. } | Command::Completions(_) => {}
    }

    Ok(())
}

fn pipeline(services: &Services, options: PipelineOptions) -> Pipeline<'_> {
    Pipeline::new(&services.store, &services.manifest, &SidecarLoader, options)
}

fn cmd_index(
    services: &Services,
    config_db: &ConfigDb,
    args: &cli::IndexArgs,
) -> error::Result<()> {
    if !args.corpus_root.is_dir() {
        return Err(Error::Config(format!(
            "corpus root is not a directory: {}",
            args.corpus_root.display()
        )));
    }

    let workers = match args.workers {
        Some(n) => n,
        None => config_db
            .get_setting_or("index.workers", "1")?
            .parse()
            .map_err(|e| Error::Config(format!("invalid index.workers: {e}")))?,
    };
    let auto_merge = !args.no_merge
        && config_db
            .get_setting_or("index.auto_merge", "true")?
            .parse::<bool>()
            .map_err(|e| Error::Config(format!("invalid index.auto_merge: {e}")))?;
    let options = PipelineOptions {
        auto_merge,
        scope: Scope::parse(args.scope.as_deref())?,
        workers: workers.max(1),
    };

    let bar = (!args.json)
        .then(|| Mutex::new(tqdm!(desc = "Indexing", unit = " pages")));
    let progress = |done: usize, total: usize| {
        if let Some(bar) = &bar
            && let Ok(mut bar) = bar.lock()
        {
            bar.total = total;
            let _ = bar.update_to(done);
        }
    };

    let result = pipeline(services, options)
        .with_progress(&progress)
        .run(&args.corpus_root)?;
    if bar.is_some() && result.scanned > result.unchanged + result.held {
        eprintln!();
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_shard_result(&result);
    }
    Ok(())
}

fn print_shard_result(result: &ShardResult) {
    println!("Scanned {} page(s)", result.scanned);
    println!(
        "  new: {}  changed: {}  unchanged: {}  deleted: {}",
        result.new_pages, result.changed_pages, result.unchanged, result.deleted
    );
    if result.false_positives > 0 {
        println!("  touched but unchanged: {}", result.false_positives);
    }
    if result.held > 0 {
        println!("  held until merge: {}", result.held);
    }
    match &result.shard_id {
        Some(id) if result.merged > 0 => {
            println!("Shard {id}: merged {} page(s)", result.merged)
        }
        Some(id) => println!("Shard {id}: staged, run `rebate-rag merge {id}`"),
        None => println!("Nothing to stage."),
    }
    for failure in &result.failures {
        println!(
            "  failed {} p{}: {}",
            failure.document, failure.page, failure.reason
        );
    }
    println!("Corpus size: {}", result.corpus_size);
}

fn cmd_merge(services: &Services, args: &cli::MergeArgs) -> error::Result<()> {
    let pipeline = pipeline(services, PipelineOptions::default());
    let merged = match &args.shard_id {
        Some(id) => vec![(id.clone(), pipeline.merge(id)?)],
        None => pipeline.merge_all_staged()?,
    };
    if merged.is_empty() {
        println!("No staged shards.");
    }
    for (id, count) in &merged {
        println!("Merged {id}: {count} page(s)");
    }
    Ok(())
}

fn cmd_search(
    services: &Services,
    config_db: &ConfigDb,
    args: &cli::SearchArgs,
) -> error::Result<()> {
    let config = args.apply(config_db.search_config()?);
    config.validate()?;

    let query = match (&args.query, &args.file) {
        (_, Some(path)) => std::fs::read_to_string(path)?,
        (Some(q), None) => q.clone(),
        (None, None) => {
            return Err(Error::Config("a query or --file is required".into()));
        }
    };

    let lexical = LexicalIndex::new();
    let reranker = ColbertReranker::new(services.model.clone());
    let mut retriever = Retriever::new(&services.store, &lexical);
    if config.mode == SearchMode::Rerank {
        retriever = retriever.with_reranker(&reranker as &dyn Reranker);
    }
    let retrieval = retriever.retrieve(&query, &config)?;

    if args.json {
        search::format_json(&retrieval, &query)?;
    } else {
        search::format_human(&retrieval);
    }
    Ok(())
}

fn cmd_add(services: &Services, args: &cli::AddArgs) -> error::Result<()> {
    let text = std::fs::read_to_string(&args.text_file)?;
    let answer = AnswerPayload::from_file(&args.answer_json)?;
    let metadata =
        ExampleMetadata::manual(&args.document, args.page, &answer.page_role);
    let id = services.store.add(&text, answer, metadata)?;
    println!("Added example #{id}");
    Ok(())
}

fn cmd_repair(services: &Services, yes: bool) -> error::Result<()> {
    if !yes {
        return Err(Error::Config(
            "repair deletes every example; pass --yes to confirm".into(),
        ));
    }
    let removed = services.store.repair()?;
    let forgotten = services.manifest.clear()?;
    println!(
        "Removed {removed} example(s) and {forgotten} manifest entries; re-run `rebate-rag index`"
    );
    Ok(())
}

fn cmd_status(
    services: &Services,
    data_dir: &DataDir,
    json: bool,
) -> error::Result<()> {
    let store = &services.store;
    let counts = services.manifest.counts()?;
    let shards = services.manifest.list_shards()?;
    let staged_shards = shards
        .iter()
        .filter(|s| s.status == rebate_rag::manifest::ShardStatus::Staged)
        .count();

    if json {
        let counts: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(status, n)| (status.to_string(), (*n).into()))
            .collect();
        let out = serde_json::json!({
            "data_dir": data_dir.root(),
            "embedder": store.embedder().name(),
            "examples": store.count()?,
            "version": store.version()?,
            "dimension": store.dimension()?,
            "manifest": counts,
            "shards": shards,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Embedder: {}", store.embedder().name());
        println!("Examples: {}", store.count()?);
        if let Some(dim) = store.dimension()? {
            println!("Dimension: {dim}");
        }
        println!("Manifest:");
        for status in ManifestStatus::ALL {
            println!("  {status}: {}", counts.get(&status).copied().unwrap_or(0));
        }
        println!("Shards: {} ({staged_shards} staged)", shards.len());
        for shard in shards.iter().rev().take(10) {
            println!(
                "  {} {:?} {} page(s)",
                shard.id,
                shard.status,
                shard.pages.len()
            );
        }
    }
    Ok(())
}

fn cmd_config(config_db: &ConfigDb, action: &ConfigAction) -> error::Result<()> {
    match action {
        ConfigAction::Show { json } => {
            let stored = config_db.list_settings()?;
            let lookup = |key: &str| {
                stored.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
            };
            if *json {
                let map: serde_json::Map<String, serde_json::Value> = stored
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone().into()))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (key, description) in rebate_rag::config_db::KNOWN_SETTINGS {
                    let value = lookup(key).unwrap_or_else(|| "-".to_string());
                    println!("{key:<26} {value:<20} {description}");
                }
            }
        }
        ConfigAction::Get { key } => match config_db.get_setting(key)? {
            Some(value) => println!("{value}"),
            None => {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key.clone(),
                });
            }
        },
        ConfigAction::Set { key, value } => {
            let previous = config_db.get_setting(key)?;
            config_db.set_setting(key, value)?;
            if let Err(e) = validate_settings(config_db) {
                match previous {
                    Some(old) => config_db.set_setting(key, &old)?,
                    None => {
                        config_db.remove_setting(key)?;
                    }
                }
                return Err(e);
            }
            println!("Set {key} = {value}");
        }
        ConfigAction::Clear { key } => {
            if config_db.remove_setting(key)? {
                println!("Cleared {key}");
            } else {
                println!("{key} was not set");
            }
        }
    }
    Ok(())
}

/// Check that every stored setting parses into its typed form.
fn validate_settings(config_db: &ConfigDb) -> error::Result<()> {
    config_db.search_config()?;
    config_db.store_config()?;
    if let Some(raw) = config_db.get_setting("embedder")? {
        raw.parse::<EmbedderKind>().map_err(|e| {
            Error::Config(format!("invalid value '{raw}' for embedder: {e}"))
        })?;
    }
    if let Some(raw) = config_db.get_setting("index.workers")? {
        raw.parse::<usize>().map_err(|e| {
            Error::Config(format!("invalid value '{raw}' for index.workers: {e}"))
        })?;
    }
    if let Some(raw) = config_db.get_setting("index.auto_merge")? {
        raw.parse::<bool>().map_err(|e| {
            Error::Config(format!("invalid value '{raw}' for index.auto_merge: {e}"))
        })?;
    }
    Ok(())
}
