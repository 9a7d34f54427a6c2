//! CLI for energy-profiler: demo, list, show, summary, export, delete, cleanup, serve.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use energy_profiler::instrument::{OperationStrategy, ProfilingDepth};
use energy_profiler::model::DemoTransformer;
use energy_profiler::power::SyntheticSource;
use energy_profiler::profiling::{normalize_tags, JsonLinesSink, PowerMode, ProfilingRun, ProfilingSession};
use energy_profiler::store::{export_run, ExportFormat, ProfileStore, RunFilter, SortKey, SortOrder, SqliteStore};
use energy_profiler::ProfilerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "energy-profiler")]
#[command(about = "Power and energy profiling of transformer inference")]
struct Cli {
    /// JSON config file (overrides ENERGY_PROFILER_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum PowerChoice {
    /// Use the configured sampler if it starts, else timing only
    Auto,
    /// Fail if the configured sampler cannot start
    Required,
    /// Seeded synthetic power readings
    Synthetic,
    /// No power sampling
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Profile the built-in demo transformer and store the run
    Demo {
        #[arg(long, default_value = "The quick brown fox")]
        prompt: String,
        #[arg(long, default_value = "16")]
        max_tokens: usize,
        #[arg(long)]
        depth: Option<ProfilingDepth>,
        #[arg(long)]
        strategy: Option<OperationStrategy>,
        #[arg(long, value_enum, default_value = "auto")]
        power: PowerChoice,
        #[arg(long, default_value = "42")]
        seed: u64,
        #[arg(long)]
        experiment: Option<String>,
        /// Comma-separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        /// Stream events to stdout as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// List stored runs
    List {
        #[arg(long)]
        model: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        experiment: Option<String>,
        #[arg(long, default_value = "date")]
        sort_by: SortKey,
        #[arg(long, default_value = "desc")]
        order: SortOrder,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Print a full run as JSON
    Show { id: Uuid },

    /// Print run attributes and aggregates
    Summary { id: Uuid },

    /// Export a run as JSON or CSV
    Export {
        id: Uuid,
        #[arg(long, default_value = "json")]
        format: ExportFormat,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a run and all of its rows
    Delete { id: Uuid },

    /// Delete runs older than N days
    Cleanup {
        #[arg(long)]
        older_than_days: u32,
    },

    /// Serve the profile API over HTTP
    Serve {
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => {
            let mut c = ProfilerConfig::from_file(path)?;
            c.apply_env()?;
            c
        }
        None => ProfilerConfig::load()?,
    };
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    let rt = tokio::runtime::Runtime::new().context("tokio runtime")?;
    rt.block_on(run(cli.command, config))
}

async fn open_store(config: &ProfilerConfig) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    Ok(Arc::new(store))
}

async fn run(command: Commands, mut config: ProfilerConfig) -> Result<()> {
    let store = open_store(&config).await?;
    match command {
        Commands::Demo {
            prompt,
            max_tokens,
            depth,
            strategy,
            power,
            seed,
            experiment,
            tags,
            events,
        } => {
            if let Some(d) = depth {
                config.depth = d;
            }
            if let Some(s) = strategy {
                config.operation_strategy = s;
            }
            let run = run_demo(
                config,
                store.clone(),
                DemoArgs {
                    prompt,
                    max_tokens,
                    power,
                    seed,
                    experiment,
                    tags,
                    events,
                },
            )
            .await?;
            print_summary(&run);
        }
        Commands::List {
            model,
            tags,
            experiment,
            sort_by,
            order,
            limit,
            offset,
        } => {
            let filter = RunFilter {
                model,
                tags: normalize_tags(&tags),
                experiment,
                sort_by,
                sort_order: order,
                limit,
                offset,
                ..Default::default()
            };
            let runs = store.list(&filter).await?;
            println!(
                "{:<36}  {:<20}  {:<18}  {:>10}  {:>12}  {:>8}",
                "id", "created", "model", "ms", "mJ", "tok/J"
            );
            for r in &runs {
                println!(
                    "{:<36}  {:<20}  {:<18}  {:>10.1}  {:>12}  {:>8}",
                    r.id,
                    r.created_at.format("%Y-%m-%d %H:%M:%S"),
                    r.model_id,
                    r.summary.duration_ms,
                    fmt_opt(r.summary.energy_mj, 1),
                    fmt_opt(r.summary.tokens_per_joule, 2),
                );
            }
            info!("{} run(s)", runs.len());
        }
        Commands::Show { id } => {
            let Some(run) = store.get(id).await? else {
                bail!("run {id} not found");
            };
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::Summary { id } => {
            let Some(overview) = store.summarize(id).await? else {
                bail!("run {id} not found");
            };
            println!("{}", serde_json::to_string_pretty(&overview)?);
        }
        Commands::Export { id, format, output } => {
            let Some(run) = store.get(id).await? else {
                bail!("run {id} not found");
            };
            let body = export_run(&run, format)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, body)?;
                    info!("Exported run {} to {:?}", id, path);
                }
                None => print!("{body}"),
            }
        }
        Commands::Delete { id } => {
            if !store.delete(id).await? {
                bail!("run {id} not found");
            }
            info!("Deleted run {}", id);
        }
        Commands::Cleanup { older_than_days } => {
            let n = store
                .cleanup(chrono::Duration::days(i64::from(older_than_days)))
                .await?;
            info!("Deleted {} run(s) older than {} days", n, older_than_days);
        }
        Commands::Serve { port } => {
            energy_profiler::server::run_server(store, port)
                .await
                .context("server")?;
        }
    }
    Ok(())
}

struct DemoArgs {
    prompt: String,
    max_tokens: usize,
    power: PowerChoice,
    seed: u64,
    experiment: Option<String>,
    tags: Vec<String>,
    events: bool,
}

async fn run_demo(
    config: ProfilerConfig,
    store: Arc<SqliteStore>,
    args: DemoArgs,
) -> Result<ProfilingRun> {
    let mut model = DemoTransformer::tiny(args.seed)?;
    info!(
        "Demo transformer: {} layers, {} parameters",
        model.config().num_hidden_layers,
        model.parameter_count()
    );

    let mut builder = ProfilingSession::builder(config)
        .prompt(args.prompt.clone())
        .model(DemoTransformer::NAME)
        .tags(args.tags)
        .model_features(model.features())
        .store(store as Arc<dyn ProfileStore>);
    if let Some(name) = args.experiment {
        builder = builder.experiment(name);
    }
    builder = match args.power {
        PowerChoice::Auto => builder.power_mode(PowerMode::Optional),
        PowerChoice::Required => builder.power_mode(PowerMode::Required),
        PowerChoice::Synthetic => builder
            .power_source(SyntheticSource::default())
            .power_mode(PowerMode::Required),
        PowerChoice::Off => builder.power_mode(PowerMode::Disabled),
    };
    if args.events {
        builder = builder.sink(JsonLinesSink::new(std::io::stdout()));
    }

    let mut session = builder.start()?;
    let (text, depth) = match model.profile(&mut session, &args.prompt, args.max_tokens) {
        Ok(out) => out,
        Err(e) => {
            let run = session.abort().await?;
            bail!("demo aborted after {} tokens: {e}", run.tokens.len());
        }
    };
    info!("Generated {:?} at {} depth", text, depth);
    Ok(session.close().await?)
}

fn fmt_opt(v: Option<f64>, decimals: usize) -> String {
    v.map(|v| format!("{v:.decimals$}"))
        .unwrap_or_else(|| "-".to_string())
}

fn print_summary(run: &ProfilingRun) {
    let s = &run.summary;
    println!("Run {}", run.id);
    println!("  model:            {}", run.model_id);
    println!(
        "  depth:            {} (requested {}){}",
        run.effective_depth,
        run.requested_depth,
        if run.partial { ", partial" } else { "" }
    );
    println!("  duration:         {:.2} ms", s.duration_ms);
    println!("  energy:           {} mJ", fmt_opt(s.energy_mj, 3));
    println!("  avg / peak power: {} / {} mW", fmt_opt(s.avg_power_mw, 1), fmt_opt(s.peak_power_mw, 1));
    println!("  tokens in / out:  {} / {}", s.input_tokens, s.output_tokens);
    println!("  tokens per joule: {}", fmt_opt(s.tokens_per_joule, 3));
    for p in &s.phases {
        println!(
            "  {:<16}  {:>10.2} ms  {:>12} mJ",
            p.phase.as_str(),
            p.duration_ms,
            fmt_opt(p.energy_mj, 3)
        );
    }
    println!(
        "  rows: {} tokens, {} layer, {} component, {} operation",
        run.tokens.len(),
        run.layer_metric_count(),
        run.component_metric_count(),
        run.operation_metric_count()
    );
}
