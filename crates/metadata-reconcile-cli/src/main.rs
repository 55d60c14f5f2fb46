use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use metadata_reconcile_core::{
    probe_connection, read_index, resolve_field, resolve_fields, run_job, AmbiguityPolicy,
    FieldSpec, JobSpec, LabelLookup, MetadataStore, ObjectId, ReconcileError, RunMode, RunOptions,
    RunReport,
};
use metadata_reconcile_store_sqlite::SqliteStore;
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

mod config;
mod csv_map;
mod logging;
mod vocabulary;

use config::Config;
use logging::LogTarget;

const CLI_CONTRACT_VERSION: &str = "mdr.v1";

#[derive(Debug, Parser)]
#[command(name = "mdr")]
#[command(about = "Metadata reconciliation for registry/value metadata stores")]
struct Cli {
    /// Store path; overrides the config file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// YAML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append log lines to this file instead of stderr.
    #[arg(long, global = true, conflicts_with = "stdout")]
    log_file: Option<PathBuf>,

    /// Write log lines to stdout, interleaved with the JSON report.
    #[arg(long, global = true, default_value_t = false)]
    stdout: bool,

    #[arg(long, global = true, value_enum)]
    ambiguity: Option<AmbiguityArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the registry and value tables in a new or existing store.
    Init,
    Field {
        #[command(subcommand)]
        command: FieldCommand,
    },
    Assertion {
        #[command(subcommand)]
        command: AssertionCommand,
    },
    TestConnection(TestConnectionArgs),
    FlattenSubjects(FlattenArgs),
    LabelIdentifiers(LabelArgs),
    RewritePaths(RewriteArgs),
    MapCsv(MapCsvArgs),
}

#[derive(Debug, Subcommand)]
enum FieldCommand {
    Register(FieldRegisterArgs),
}

#[derive(Debug, Args)]
struct FieldRegisterArgs {
    field: FieldSpec,
    #[arg(long)]
    scope_note: Option<String>,
}

#[derive(Debug, Subcommand)]
enum AssertionCommand {
    Add(AssertionAddArgs),
}

#[derive(Debug, Args)]
struct AssertionAddArgs {
    #[arg(long)]
    object: String,
    #[arg(long)]
    field: FieldSpec,
    #[arg(long)]
    value: String,
}

#[derive(Debug, Args)]
struct TestConnectionArgs {
    #[arg(long)]
    sample_term: Option<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Report what would change without opening a write transaction.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct FlattenArgs {
    #[arg(long)]
    source: Option<FieldSpec>,
    #[arg(long)]
    target: Option<FieldSpec>,
    #[arg(long)]
    display_field: Option<FieldSpec>,
    /// Only reconcile this object.
    #[arg(long)]
    object: Option<String>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct LabelArgs {
    #[arg(long)]
    source: Option<FieldSpec>,
    #[arg(long)]
    target: Option<FieldSpec>,
    /// Repeat in precedence order.
    #[arg(long = "label-field")]
    label_fields: Vec<FieldSpec>,
    /// Fields that identify objects without labelling them.
    #[arg(long = "known-field")]
    known_fields: Vec<FieldSpec>,
    #[arg(long)]
    object: Option<String>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct RewriteArgs {
    #[arg(long)]
    vocabulary: Option<PathBuf>,
    /// Restrict the rewrite to one field; store-wide when omitted.
    #[arg(long)]
    scope: Option<FieldSpec>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct MapCsvArgs {
    #[arg(long)]
    input_dir: PathBuf,
    /// Comma-separated identifier columns.
    #[arg(long, value_delimiter = ',', required = true)]
    columns: Vec<String>,
    #[arg(long, default_value = "_mapped")]
    output_suffix: String,
    #[arg(long = "label-field")]
    label_fields: Vec<FieldSpec>,
    #[arg(long = "known-field")]
    known_fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AmbiguityArg {
    FirstMatch,
    Strict,
}

impl AmbiguityArg {
    fn into_policy(self) -> AmbiguityPolicy {
        match self {
            Self::FirstMatch => AmbiguityPolicy::FirstMatch,
            Self::Strict => AmbiguityPolicy::Strict,
        }
    }
}

struct Settings {
    config: Config,
    db: PathBuf,
    policy: AmbiguityPolicy,
}

impl Settings {
    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db)
            .map_err(|err| {
                ReconcileError::Connectivity(format!("{}: {err:#}", self.db.display()))
            })
            .context("could not connect to metadata store")
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let log_file = cli.log_file.clone().or_else(|| config.log_file.clone());
    let target = match (&log_file, cli.stdout) {
        (_, true) => LogTarget::Stdout,
        (Some(path), false) => LogTarget::File(path),
        (None, false) => LogTarget::Stderr,
    };
    logging::init(target)?;

    let ctx = Settings {
        db: config.db_path(cli.db.as_deref()),
        policy: cli.ambiguity.map_or(config.ambiguity, AmbiguityArg::into_policy),
        config,
    };

    match cli.command {
        Command::Init => run_init(&ctx),
        Command::Field { command: FieldCommand::Register(args) } => {
            run_field_register(&ctx, &args)
        }
        Command::Assertion { command: AssertionCommand::Add(args) } => {
            run_assertion_add(&ctx, &args)
        }
        Command::TestConnection(args) => run_test_connection(&ctx, &args),
        Command::FlattenSubjects(args) => run_flatten(&ctx, args),
        Command::LabelIdentifiers(args) => run_label(&ctx, args),
        Command::RewritePaths(args) => run_rewrite(&ctx, args),
        Command::MapCsv(args) => run_map_csv(&ctx, &args),
    }
}

fn run_init(ctx: &Settings) -> Result<()> {
    let store = SqliteStore::create(&ctx.db)?;
    let assertions = store.count_assertions()?;
    tracing::info!(db = %ctx.db.display(), "store initialised");
    emit_json(serde_json::json!({
        "db": ctx.db.display().to_string(),
        "assertion_count": assertions
    }))
}

fn run_field_register(ctx: &Settings, args: &FieldRegisterArgs) -> Result<()> {
    let store = ctx.open_store()?;
    let field_id = store.register_field(&args.field, args.scope_note.as_deref())?;
    emit_json(serde_json::json!({
        "field": args.field,
        "field_id": field_id
    }))
}

fn run_assertion_add(ctx: &Settings, args: &AssertionAddArgs) -> Result<()> {
    let store = ctx.open_store()?;
    let field_id = resolve_field(&store, &args.field, ctx.policy)?;
    let object_id = ObjectId::new(args.object.clone());
    store.add_assertion(&object_id, field_id, &args.value)?;
    emit_json(serde_json::json!({
        "object_id": object_id,
        "field": args.field,
        "field_id": field_id,
        "value": args.value
    }))
}

fn run_test_connection(ctx: &Settings, args: &TestConnectionArgs) -> Result<()> {
    let store = ctx.open_store()?;
    let sample_term = args.sample_term.as_deref().or(ctx.config.sample_term.as_deref());
    let report = probe_connection(&store, sample_term)?;
    emit_json(serde_json::json!({
        "connected": true,
        "db": ctx.db.display().to_string(),
        "assertion_count": report.assertion_count,
        "sample_term": report.sample_term,
        "sample_term_matches": report.sample_term_matches
    }))
}

fn run_flatten(ctx: &Settings, args: FlattenArgs) -> Result<()> {
    let defaults = &ctx.config.flatten;
    let job = JobSpec::Flatten {
        source: args.source.unwrap_or_else(|| defaults.source.clone()),
        target: args.target.unwrap_or_else(|| defaults.target.clone()),
    };
    let display_field = args.display_field.unwrap_or_else(|| defaults.display_field.clone());
    execute(ctx, &job, &args.run, args.object, Some(display_field))
}

fn run_label(ctx: &Settings, args: LabelArgs) -> Result<()> {
    let defaults = &ctx.config.labels;
    let source = args
        .source
        .or_else(|| defaults.source.clone())
        .ok_or_else(|| anyhow!("no source field: pass --source or set labels.source"))?;
    let target = args
        .target
        .or_else(|| defaults.target.clone())
        .ok_or_else(|| anyhow!("no target field: pass --target or set labels.target"))?;
    let job = JobSpec::LabelIdentifiers {
        source,
        target,
        label_fields: label_fields(ctx, args.label_fields),
        known_fields: known_fields(ctx, args.known_fields),
    };
    execute(ctx, &job, &args.run, args.object, None)
}

fn run_rewrite(ctx: &Settings, args: RewriteArgs) -> Result<()> {
    let defaults = &ctx.config.rewrite;
    let vocabulary = args
        .vocabulary
        .or_else(|| defaults.vocabulary.clone())
        .ok_or_else(|| anyhow!("no vocabulary: pass --vocabulary or set rewrite.vocabulary"))?;
    let entries = vocabulary::load_vocabulary(&vocabulary)?;
    let scope = args.scope.or_else(|| defaults.scope.clone());
    let job = JobSpec::RewritePaths { scope, entries };
    execute(ctx, &job, &args.run, None, None)
}

fn run_map_csv(ctx: &Settings, args: &MapCsvArgs) -> Result<()> {
    let store = ctx.open_store()?;
    let labels = label_fields(ctx, args.label_fields.clone());
    let mut specs = labels.clone();
    specs.extend(known_fields(ctx, args.known_fields.clone()));
    let resolved = resolve_fields(&store, &specs, ctx.policy)?;
    let field_ids = resolved.iter().map(|field| field.field_id).collect::<Vec<_>>();
    let index = read_index(&store, &field_ids, None)?;
    tracing::info!(identifiers = index.object_count(), "fetched identifier labels");

    let label_ids = field_ids.iter().take(labels.len()).copied().collect();
    let lookup = LabelLookup::new(label_ids, index);
    let columns = args.columns.iter().map(|column| column.trim().to_string()).collect::<Vec<_>>();
    let summary = csv_map::map_directory(&args.input_dir, &columns, &args.output_suffix, &lookup);

    emit_json(serde_json::json!({
        "input_dir": args.input_dir.display().to_string(),
        "resolved": resolved,
        "mapped": summary.mapped,
        "failed": summary.failed
    }))
}

fn label_fields(ctx: &Settings, flags: Vec<FieldSpec>) -> Vec<FieldSpec> {
    if flags.is_empty() {
        ctx.config.labels.label_fields.clone()
    } else {
        flags
    }
}

fn known_fields(ctx: &Settings, flags: Vec<FieldSpec>) -> Vec<FieldSpec> {
    if flags.is_empty() {
        ctx.config.labels.known_fields.clone()
    } else {
        flags
    }
}

fn execute(
    ctx: &Settings,
    job: &JobSpec,
    run: &RunArgs,
    object: Option<String>,
    display_field: Option<FieldSpec>,
) -> Result<()> {
    let mut store = ctx.open_store()?;
    let options = RunOptions {
        mode: if run.dry_run { RunMode::DryRun } else { RunMode::Apply },
        policy: ctx.policy,
        object: object.map(ObjectId::new),
        display_field,
    };
    let run_id = Ulid::new();
    let span = tracing::info_span!("run", id = %run_id);
    let _entered = span.enter();

    let report = run_job(&mut store, job, &options).context("reconciliation run failed")?;
    emit_json(run_report_json(run_id, &report)?)
}

fn run_report_json(run_id: Ulid, report: &RunReport) -> Result<Value> {
    Ok(serde_json::json!({
        "run_id": run_id.to_string(),
        "generated_at": now_rfc3339()?,
        "rule": report.rule,
        "mode": report.apply.mode,
        "state": report.apply.state,
        "fingerprint": report.plan.fingerprint()?,
        "resolved": report.resolved,
        "counts": {
            "pending": report.plan.pending_count(),
            "already_satisfied": report.plan.satisfied_count(),
            "skipped": report.plan.skipped.len(),
            "executed": report.apply.executed,
            "inserted": report.apply.inserted,
            "satisfied_at_write": report.apply.already_satisfied,
            "rows_rewritten": report.apply.rows_rewritten
        },
        "objects": report.plan.objects,
        "instructions": report.plan.instructions,
        "skipped": report.plan.skipped
    }))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

