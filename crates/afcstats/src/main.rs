use std::env;
use std::path::{Path, PathBuf};

use afcstats_core::api::{MediaWikiClient, MediaWikiClientConfig, WikiWriteApi};
use afcstats_core::chart::compile_charts;
use afcstats_core::config::{StatisticsConfig, load_config, patch_api_url};
use afcstats_core::migrate::run_migrations;
use afcstats_core::reconcile::SyncReport;
use afcstats_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_ready, init_layout, inspect_runtime, resolve_paths,
};
use afcstats_core::schedule::{ScheduleOptions, run_schedule};
use afcstats_core::store::{MirrorStore, StoredPage};
use afcstats_core::task::{Action, AfcStatistics, RunOutcome, SaveReport};
use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "afcstats",
    version,
    about = "Articles for Creation statistics mirror and chart publisher"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    #[command(about = "Reconcile the local mirror against the live wiki")]
    Sync(SyncArgs),
    #[command(about = "Compile the charts and publish them to the statistics page")]
    Save(SaveArgs),
    #[command(about = "Re-derive a single tracked page")]
    Update(TitleArgs),
    #[command(about = "Show the stored row for a tracked page")]
    Show(TitleArgs),
    #[command(about = "Per-chart row counts")]
    Stats,
    #[command(about = "Run sync and save periodically")]
    Schedule(ScheduleArgs),
    #[command(about = "Print the compiled charts without saving")]
    Compile,
    Db(DbArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .afcstats/config.toml")]
    no_config: bool,
    #[arg(long, value_name = "URL", help = "Set [wiki].api_url in the config")]
    api_url: Option<String>,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, help = "Run even when replication lag is above the limit")]
    ignore_replag: bool,
}

#[derive(Debug, Args)]
struct SaveArgs {
    #[arg(long, help = "Bypass the shutoff page and mark the edit as operator-requested")]
    operator: bool,
    #[arg(long, help = "Print a diff of the statistics region instead of editing")]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct TitleArgs {
    title: String,
}

#[derive(Debug, Args)]
struct ScheduleArgs {
    #[arg(long, value_name = "N", help = "Stop after N ticks")]
    max_ticks: Option<usize>,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::Save(args)) => run_save(&runtime, args),
        Some(Commands::Update(TitleArgs { title })) => run_update(&runtime, title),
        Some(Commands::Show(TitleArgs { title })) => run_show(&runtime, &title),
        Some(Commands::Stats) => run_stats(&runtime),
        Some(Commands::Schedule(args)) => run_schedule_command(&runtime, args),
        Some(Commands::Compile) => run_compile(&runtime),
        Some(Commands::Db(DbArgs {
            command: DbSubcommand::Migrate,
        })) => run_db_migrate(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let patched_api_url = match args.api_url.as_deref() {
        Some(api_url) => patch_api_url(&paths.config_path, api_url)?,
        None => false,
    };

    println!("Initialized afcstats runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("patched_api_url: {patched_api_url}");
    println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready(&paths, &status)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("applied: {}", report.applied.len());
    for migration in &report.applied {
        println!("applied.migration: v{:03}_{}", migration.version, migration.name);
    }
    println!("current_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    let session = Session::open(runtime)?;
    let mut client = session.client()?;
    let mut store = session.store()?;
    let task = AfcStatistics::new(session.config.clone());

    println!("sync");
    let outcome = task.run(
        Action::Sync {
            ignore_replag: args.ignore_replag,
        },
        &mut client,
        &mut store,
    )?;
    print_outcome(&outcome);
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_save(runtime: &RuntimeOptions, args: SaveArgs) -> Result<()> {
    let session = Session::open(runtime)?;
    let mut client = session.client()?;
    if !args.dry_run {
        login_from_env(&mut client)?;
    }
    let mut store = session.store()?;
    let task = AfcStatistics::new(session.config.clone());

    println!("save");
    let outcome = task.run(
        Action::Save {
            from_operator: args.operator,
            dry_run: args.dry_run,
        },
        &mut client,
        &mut store,
    )?;
    print_outcome(&outcome);
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_update(runtime: &RuntimeOptions, title: String) -> Result<()> {
    let session = Session::open(runtime)?;
    let mut client = session.client()?;
    let mut store = session.store()?;
    let task = AfcStatistics::new(session.config.clone());

    println!("update");
    let outcome = task.run(Action::Update { title }, &mut client, &mut store)?;
    print_outcome(&outcome);
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_show(runtime: &RuntimeOptions, title: &str) -> Result<()> {
    let session = Session::open(runtime)?;
    let store = session.store()?;
    let normalized = title.trim().replace('_', " ");
    if normalized.is_empty() {
        bail!("show requires a non-empty title");
    }

    println!("show");
    println!("target: {normalized}");
    match store.find_by_title(&normalized)? {
        Some(page) => print_stored_page(&page),
        None => println!("page: <not tracked>"),
    }
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_stats(runtime: &RuntimeOptions) -> Result<()> {
    let session = Session::open(runtime)?;
    let store = session.store()?;
    let status = inspect_runtime(&session.paths)?;
    let counts = store.chart_counts()?;

    println!("stats");
    println!("db_path: {}", normalize_path(&session.paths.db_path));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!(
        "tracked_pages: {}",
        counts.iter().map(|count| count.pages).sum::<usize>()
    );
    for count in &counts {
        println!("chart.{}.title: {}", count.chart_id, count.title);
        println!("chart.{}.pages: {}", count.chart_id, count.pages);
    }
    print_warnings(&status.warnings);
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_schedule_command(runtime: &RuntimeOptions, args: ScheduleArgs) -> Result<()> {
    let session = Session::open(runtime)?;
    let mut client = session.client()?;
    login_from_env(&mut client)?;
    let mut store = session.store()?;
    let task = AfcStatistics::new(session.config.clone());
    let options = ScheduleOptions::from_config(&task, args.max_ticks);

    let report = run_schedule(&task, &mut client, &mut store, &options)?;
    println!("schedule");
    println!("ticks: {}", report.ticks);
    println!("enqueued: {}", report.enqueued);
    println!("dropped: {}", report.dropped);
    println!("completed: {}", report.completed);
    println!("skipped: {}", report.skipped);
    println!("failed: {}", report.failed);
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_compile(runtime: &RuntimeOptions) -> Result<()> {
    let session = Session::open(runtime)?;
    let store = session.store()?;
    let afc = &session.config.afc;
    println!(
        "{}",
        compile_charts(&store, &afc.templates, afc.chart_row_limit)?
    );
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

/// Resolved paths plus loaded config for commands that touch the database.
struct Session {
    paths: ResolvedPaths,
    config: StatisticsConfig,
}

impl Session {
    fn open(runtime: &RuntimeOptions) -> Result<Self> {
        let paths = resolve_runtime_paths(runtime)?;
        let status = inspect_runtime(&paths)?;
        ensure_runtime_ready(&paths, &status)?;
        print_warnings(&status.warnings);
        let config = load_config(&paths.config_path)?;
        Ok(Self { paths, config })
    }

    fn store(&self) -> Result<MirrorStore> {
        MirrorStore::open(&self.paths)
    }

    fn client(&self) -> Result<MediaWikiClient> {
        MediaWikiClient::new(MediaWikiClientConfig::from_config(&self.config))
    }
}

fn login_from_env(client: &mut MediaWikiClient) -> Result<()> {
    let username = non_empty_env("WIKI_BOT_USER");
    let password = non_empty_env("WIKI_BOT_PASS");
    match (username, password) {
        (Some(username), Some(password)) => {
            client.login(&username, &password)?;
            info!(user = %username, "logged in");
            Ok(())
        }
        _ => bail!("WIKI_BOT_USER and WIKI_BOT_PASS must be set to edit the statistics page"),
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Skipped => println!("outcome: skipped (database lock held)"),
        RunOutcome::Synced(report) => print_sync_report(report),
        RunOutcome::Saved(report) => print_save_report(report),
        RunOutcome::Updated { title, page } => {
            println!("title: {title}");
            println!("outcome: {}", page.as_str());
        }
    }
}

fn print_sync_report(report: &SyncReport) {
    println!("replag_secs: {}", report.replag_secs);
    println!("skipped_for_replag: {}", format_flag(report.skipped_for_replag));
    println!("interrupted: {}", format_flag(report.interrupted));
    println!("updated: {}", report.updated);
    println!("unchanged: {}", report.unchanged);
    println!("added: {}", report.added);
    println!("untracked: {}", report.untracked);
    println!("stale_refreshed: {}", report.stale_refreshed);
    println!("deleted: {}", report.deleted);
    println!("request_count: {}", report.request_count);
    if report.errors.is_empty() {
        println!("errors: <none>");
    } else {
        println!("errors.count: {}", report.errors.len());
        for error in &report.errors {
            println!("errors.page: {error}");
        }
    }
}

fn print_save_report(report: &SaveReport) {
    println!("page: {}", report.page);
    println!("outcome: {}", report.status.as_str());
    println!("statistics_bytes: {}", report.statistics_bytes);
    if let Some(diff) = &report.diff {
        println!();
        print!("{diff}");
    }
}

fn print_stored_page(page: &StoredPage) {
    let record = &page.record;
    println!("page_id: {}", record.page_id);
    println!("title: {}", record.title);
    println!("status: {} ({})", record.status.code(), record.status);
    println!("chart: {}", page.chart);
    println!("size: {}", record.size);
    if record.notes.is_empty() {
        println!("notes: <none>");
    } else {
        println!("notes: {}", record.notes.to_storage());
    }
    println!("modify.user: {}", record.modify.user);
    println!("modify.time: {}", record.modify.timestamp.to_rfc3339());
    println!("modify.oldid: {}", record.modify.revision_id);
    match &record.special {
        Some(special) => {
            println!("special.user: {}", special.user);
            println!("special.time: {}", special.timestamp.to_rfc3339());
            println!("special.oldid: {}", special.revision_id);
        }
        None => println!("special: <unresolved>"),
    }
    println!(
        "updated_at: {}",
        page.updated_at
            .map(|time| time.to_rfc3339())
            .unwrap_or_else(|| "n/a".to_string())
    );
}

fn print_warnings(warnings: &[String]) {
    if !warnings.is_empty() {
        println!("warnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
