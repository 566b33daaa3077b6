use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use recall_core::config::{expand_path, resolve_with_base, Config, EngineConfig, FusionMethod};
use recall_core::loader::DocumentLoader;
use recall_core::traits::VectorStore;
use recall_core::types::SizeBudget;
use recall_embed::get_default_embedder;
use recall_hybrid::{HybridEngine, RetrieveOptions, SearchOptions};

const USAGE: &str = "Usage: recall <command> [args...]

Commands:
  ingest [dir] [--limit N]            index .txt/.md files under dir
  query \"<text>\" [options]            assemble a cited context bundle
  search \"<text>\" [options]           print fused, reranked results
  remove <source_id>                  drop a source from the index
  retry                               re-embed chunks marked embedding_failed
  verify                              check index consistency
  stats                               print index statistics

Options:
  --k N  --budget CHARS  --fusion rrf|weighted|max  --recent";

/// Flags shared by `query` and `search`.
#[derive(Debug, Default)]
struct QueryArgs {
    text: String,
    k: Option<usize>,
    budget: Option<usize>,
    fusion: Option<FusionMethod>,
    recent: bool,
}

impl QueryArgs {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let mut out = Self::default();
        let mut words = Vec::new();
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--k" => out.k = Some(number(args, &mut i, "--k")?),
                "--budget" => out.budget = Some(number(args, &mut i, "--budget")?),
                "--fusion" => out.fusion = Some(flag_value(args, &mut i, "--fusion")?.parse()?),
                "--recent" => out.recent = true,
                s if s.starts_with("--") => bail!("unknown option {s}"),
                s => words.push(s.to_string()),
            }
            i += 1;
        }
        out.text = words.join(" ");
        if out.text.trim().is_empty() {
            bail!("missing query text\n\n{USAGE}");
        }
        Ok(out)
    }

    fn search_options(&self) -> SearchOptions {
        let mut opts = SearchOptions::default();
        if let Some(k) = self.k {
            opts = opts.with_k(k);
        }
        if let Some(method) = self.fusion {
            opts = opts.with_fusion(method);
        }
        if self.recent {
            opts = opts.recent();
        }
        opts
    }
}

fn flag_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> anyhow::Result<&'a str> {
    *i += 1;
    args.get(*i).map(String::as_str).with_context(|| format!("{flag} requires a value"))
}

fn number(args: &[String], i: &mut usize, flag: &str) -> anyhow::Result<usize> {
    flag_value(args, i, flag)?.parse().with_context(|| format!("{flag} requires a number"))
}

#[cfg(feature = "lance")]
async fn open_store(index_dir: &Path, dim: usize) -> anyhow::Result<Arc<dyn VectorStore>> {
    let uri = index_dir.join("lance");
    Ok(Arc::new(recall_vector::LanceVectorStore::open(&uri.to_string_lossy(), dim).await?))
}

#[cfg(not(feature = "lance"))]
async fn open_store(index_dir: &Path, _dim: usize) -> anyhow::Result<Arc<dyn VectorStore>> {
    Ok(Arc::new(recall_vector::InMemoryVectorStore::load(index_dir)?))
}

async fn open_engine(
    engine_config: EngineConfig,
    index_dir: &Path,
) -> anyhow::Result<HybridEngine> {
    let provider = get_default_embedder(&engine_config.embed)?;
    let store = open_store(index_dir, provider.dim()).await?;
    Ok(HybridEngine::open(index_dir, engine_config, provider, store).await?)
}

async fn ingest(engine: &HybridEngine, config: &Config, args: &[String]) -> anyhow::Result<()> {
    let mut data_dir = None;
    let mut limit = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--limit" => limit = Some(number(args, &mut i, "--limit")?),
            s if !s.starts_with('-') => data_dir = Some(s.to_string()),
            s => bail!("unknown option {s}"),
        }
        i += 1;
    }
    let data_dir =
        data_dir.unwrap_or_else(|| config.get_or("data.raw_txt_dir", "./data".to_string()));
    let data_dir = resolve_with_base(&env::current_dir()?, data_dir);

    let mut loader = DocumentLoader::new();
    if let Some(limit) = limit {
        loader = loader.with_limit(limit);
    }
    let docs = loader.load_dir(&data_dir)?;
    println!("Ingesting {} files from {}", docs.len(), data_dir.display());

    let pb = ProgressBar::new(docs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] \
                 {pos}/{len} files ({percent}%) {msg}",
            )?
            .progress_chars("#>-"),
    );
    let (mut chunks, mut unchanged, mut failed_embeddings, mut errors) = (0, 0, 0, 0);
    for batch in docs.chunks(16) {
        for (source_id, result) in engine.ingest_many(batch).await {
            match result {
                Ok(report) => {
                    chunks += report.indexed;
                    unchanged += usize::from(report.unchanged);
                    failed_embeddings += report.embedding_failed.len();
                }
                Err(e) => {
                    errors += 1;
                    pb.println(format!("failed: {source_id}: {e}"));
                }
            }
        }
        pb.inc(batch.len() as u64);
    }
    pb.finish_with_message("done");

    println!("Indexed {chunks} chunks ({unchanged} files unchanged, {errors} files failed)");
    if failed_embeddings > 0 {
        println!("{failed_embeddings} chunks have no embedding yet; run `recall retry` later");
    }
    Ok(())
}

async fn query(engine: &HybridEngine, args: &[String]) -> anyhow::Result<()> {
    let q = QueryArgs::parse(args)?;
    let budget = q.budget.map_or_else(SizeBudget::default, SizeBudget::Chars);
    let bundle = engine.retrieve(&q.text, &RetrieveOptions::new(q.search_options(), budget)).await;
    if let Some(reason) = &bundle.degradation {
        println!("(degraded: {reason})\n");
    }
    if bundle.is_empty() {
        println!("No results.");
        return Ok(());
    }
    println!("{}", bundle.render());
    println!("\n{} passages, {} chars", bundle.len(), bundle.total_chars);
    Ok(())
}

async fn search(engine: &HybridEngine, args: &[String]) -> anyhow::Result<()> {
    let q = QueryArgs::parse(args)?;
    let outcome = engine.search(&q.text, &q.search_options()).await;
    if let Some(reason) = &outcome.degradation {
        println!("(degraded: {reason})\n");
    }
    println!(
        "{} lexical and {} vector candidates",
        outcome.lexical_candidates, outcome.vector_candidates
    );
    for (i, r) in outcome.results.iter().enumerate() {
        let lexical = r.lexical.map_or("-".to_string(), |s| format!("#{} {:.3}", s.rank, s.score));
        let vector = r.vector.map_or("-".to_string(), |s| format!("#{} {:.3}", s.rank, s.score));
        let citation = r.chunk.citation();
        println!("{:>2}. {:.4}  {citation}  [lexical {lexical} | vector {vector}]", i + 1, r.score);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }
    let cmd = args.remove(0);

    let config = Config::load().map_err(|e| {
        eprintln!("Error loading config: {e}");
        e
    })?;
    let engine_config = config.engine()?;
    let index_dir = expand_path(config.get_or("data.index_dir", "~/.recall/index".to_string()));
    let provider = &engine_config.embed.provider;
    info!(index_dir = %index_dir.display(), %provider, "opening index");
    let engine = open_engine(engine_config, &index_dir).await?;

    match cmd.as_str() {
        "ingest" => {
            ingest(&engine, &config, &args).await?;
            engine.save(&index_dir).await?;
        }
        "query" => query(&engine, &args).await?,
        "search" => search(&engine, &args).await?,
        "remove" => {
            let Some(source_id) = args.first() else { bail!("Usage: recall remove <source_id>") };
            let n = engine.remove_source(source_id).await?;
            engine.save(&index_dir).await?;
            println!("Removed {source_id} ({n} chunks)");
        }
        "retry" => {
            let report = engine.retry_failed_embeddings().await?;
            engine.save(&index_dir).await?;
            println!("Embedded {} chunks, {} still failing", report.indexed(), report.failed.len());
        }
        "verify" => match engine.verify().await {
            Ok(()) => println!("Index is consistent"),
            Err(e) => {
                if let Some(source) = e.affected_source() {
                    warn!(source, "re-ingest this source to repair the index");
                }
                bail!("verification failed: {e}");
            }
        },
        "stats" => println!("{}", serde_json::to_string_pretty(&engine.stats().await?)?),
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(1);
        }
    }
    Ok(())
}
