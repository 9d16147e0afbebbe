//! KN-017: CLI subcommands (init, validate, build, plan, up, status).

use crate::core::types::{self, OutputFacts, PlanAction, ProvenanceEvent};
use crate::core::urn::Urn;
use crate::core::{parser, planner, state};
use crate::host::Host;
use crate::provenance::{eventlog, hasher};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new kiln project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate kiln.yaml without building anything
    Validate {
        /// Path to kiln.yaml
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,
    },

    /// Run the blueprint and emit the IR document
    Build {
        /// Path to kiln.yaml
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,

        /// Write the IR here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print BLAKE3 hashes of the blueprint and IR instead
        #[arg(long)]
        hash: bool,
    },

    /// Show deployment plan (diff IR vs state lock)
    Plan {
        /// Path to kiln.yaml
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Plan, then apply reported outputs round by round
    Up {
        /// Path to kiln.yaml
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,

        /// Round files (`{urn: {output: value}}`), applied in order
        #[arg(short, long = "round")]
        rounds: Vec<PathBuf>,

        /// Show the plan without touching state
        #[arg(long)]
        dry_run: bool,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Show current state from lock files
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Only this application URN
        #[arg(short, long)]
        app: Option<String>,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Build { file, output, hash } => cmd_build(&file, output.as_deref(), hash),
        Commands::Plan { file, state_dir } => cmd_plan(&file, &state_dir),
        Commands::Up {
            file,
            rounds,
            dry_run,
            state_dir,
        } => cmd_up(&file, &state_dir, &rounds, dry_run),
        Commands::Status { state_dir, app } => cmd_status(&state_dir, app.as_deref()),
    }
}

const TEMPLATE: &str = r#"version: "1.0"
app:
  name: my-app
  project: my-project
  environment: dev
  account_id: default
  default_region: us-east-1

constructs:
  assets:
    type: Bucket
    properties:
      Versioned: true
  api:
    type: Container
    properties:
      Image: nginx:latest
      AssetsUrl: { $concat: ["s3://", { $output: assets.BucketName }] }
    bindings:
      - to: assets
        access: read_only
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let blueprint_path = path.join("kiln.yaml");
    if blueprint_path.exists() {
        return Err(format!("{} already exists", blueprint_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;

    std::fs::write(&blueprint_path, TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", blueprint_path.display(), e))?;

    println!("Initialized kiln project at {}", path.display());
    println!("  Created: {}", blueprint_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let blueprint = parse_and_validate(file)?;
    let bindings: usize = blueprint.constructs.values().map(|c| c.bindings.len()).sum();
    println!(
        "OK: {} ({} constructs, {} bindings)",
        blueprint.app.name,
        blueprint.constructs.len(),
        bindings
    );
    Ok(())
}

/// Parse and validate a blueprint, printing every problem found.
fn parse_and_validate(file: &Path) -> Result<types::Blueprint, String> {
    let blueprint = parser::parse_blueprint_file(file)?;
    let errors = parser::validate_blueprint(&blueprint);
    if errors.is_empty() {
        return Ok(blueprint);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(format!("{} validation error(s)", errors.len()))
}

fn cmd_build(file: &Path, output: Option<&Path>, hash: bool) -> Result<(), String> {
    let mut host = Host::new();
    let ir = host.send_ir(file)?;

    if hash {
        println!("blueprint: {}", hasher::hash_file(file)?);
        println!("ir:        {}", hasher::hash_string(&ir));
        return Ok(());
    }

    match output {
        Some(path) => {
            std::fs::write(path, &ir)
                .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
            println!("Wrote IR to {}", path.display());
        }
        None => print!("{}", ir),
    }
    Ok(())
}

fn cmd_plan(file: &Path, state_dir: &Path) -> Result<(), String> {
    let blueprint = parse_and_validate(file)?;
    let ir = Host::new().run_script(&blueprint)?;
    let lock = state::load_lock(state_dir, &ir.app_urn)?;
    let plan = planner::plan(&ir, lock.as_ref())?;
    print_plan(&plan);
    Ok(())
}

/// Display a plan to stdout.
fn print_plan(plan: &types::DeploymentPlan) {
    println!("Planning: {} ({} constructs)", plan.app_urn, plan.changes.len());
    println!();

    for (i, group) in plan.groups.iter().enumerate() {
        println!("group {}:", i + 1);
        for change in plan.changes.iter().filter(|c| group.contains(&c.urn)) {
            let symbol = match change.action {
                PlanAction::Create => "+",
                PlanAction::Update => "~",
                PlanAction::Destroy => "-",
                PlanAction::NoOp => " ",
            };
            println!("  {} {} ({})", symbol, change.construct, change.urn);
        }
    }

    println!();
    println!(
        "Plan: {} to add, {} to change, {} to destroy, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_destroy, plan.unchanged
    );
}

/// Read one round of reported outputs.
fn load_round(path: &Path) -> Result<OutputFacts, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read round {}: {}", path.display(), e))?;
    if content.trim().is_empty() {
        return Ok(OutputFacts::new());
    }
    serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid round {}: {}", path.display(), e))
}

fn cmd_up(file: &Path, state_dir: &Path, rounds: &[PathBuf], dry_run: bool) -> Result<(), String> {
    let start = std::time::Instant::now();
    let blueprint = parse_and_validate(file)?;
    let mut host = Host::new();
    let ir = host.run_script(&blueprint)?;
    let existing = state::load_lock(state_dir, &ir.app_urn)?;
    let plan = planner::plan(&ir, existing.as_ref())?;
    print_plan(&plan);

    if dry_run {
        println!("Dry run: no rounds applied.");
        return Ok(());
    }

    let app = ir.app_urn.clone();
    let run_id = eventlog::generate_run_id();
    eventlog::append_event(
        state_dir,
        &app,
        ProvenanceEvent::UpStarted {
            app: app.to_string(),
            run_id: run_id.clone(),
            kiln_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )?;
    for change in plan.changes.iter().filter(|c| c.action != PlanAction::NoOp) {
        eventlog::append_event(
            state_dir,
            &app,
            ProvenanceEvent::ConstructPlanned {
                construct: change.construct.clone(),
                action: change.action,
            },
        )?;
    }

    let mut lock = existing.unwrap_or_else(|| state::new_lock(&ir));
    state::apply_plan(&mut lock, &ir, &plan)?;

    let mut total_resolved = 0;
    for (round, path) in (1u32..).zip(rounds) {
        let facts = load_round(path)?;
        let resolved = host.resolve(&facts)?;

        for (address, outputs) in &facts {
            // malformed addresses were already reported by the round
            let Ok(urn) = Urn::parse(address) else {
                continue;
            };
            if let Err(e) = state::register_outputs(&mut lock, &urn, outputs) {
                tracing::warn!(urn = %urn, error = %e, "outputs not recorded in lock");
            }
        }
        if let Some(session) = host.session() {
            state::sync_inputs(&mut lock, session.constructs());
        }
        for r in &resolved {
            eventlog::append_event(
                state_dir,
                &app,
                ProvenanceEvent::OutputResolved {
                    run_id: run_id.clone(),
                    id: r.id.clone(),
                    hash: hasher::hash_serialized(&r.value)?,
                },
            )?;
        }
        eventlog::append_event(
            state_dir,
            &app,
            ProvenanceEvent::RoundApplied {
                run_id: run_id.clone(),
                round,
                facts: facts.len(),
                resolved: resolved.len(),
            },
        )?;
        println!(
            "round {}: {} reported, {} resolved",
            round,
            facts.len(),
            resolved.len()
        );
        total_resolved += resolved.len();
    }

    let failed = state::finalize(&mut lock)?;
    for change in plan.changes.iter().filter(|c| c.action != PlanAction::NoOp) {
        if let Some(entry) = lock.constructs.get(&change.construct) {
            eventlog::append_event(
                state_dir,
                &app,
                ProvenanceEvent::ConstructFinalized {
                    construct: change.construct.clone(),
                    status: entry.status.to_string(),
                },
            )?;
        }
    }
    state::save_lock(state_dir, &lock)?;

    let pending = host
        .session()
        .map(|s| s.registry().unresolved().len())
        .unwrap_or(0);
    let elapsed = start.elapsed().as_secs_f64();
    eventlog::append_event(
        state_dir,
        &app,
        ProvenanceEvent::UpCompleted {
            run_id,
            rounds: u32::try_from(rounds.len()).unwrap_or(u32::MAX),
            resolved: total_resolved,
            pending,
            total_seconds: elapsed,
        },
    )?;

    println!();
    if !failed.is_empty() {
        for (name, status) in &failed {
            println!("  FAILED: {} ({})", name, status);
        }
        return Err(format!("{} construct(s) failed", failed.len()));
    }
    println!(
        "Up complete: {} resolved, {} pending ({:.1}s).",
        total_resolved, pending, elapsed
    );
    Ok(())
}

fn cmd_status(state_dir: &Path, app_filter: Option<&str>) -> Result<(), String> {
    if !state_dir.exists() {
        println!("No state found. Run `kiln up` first.");
        return Ok(());
    }

    let mut found = false;
    for lock in state::find_locks(state_dir)? {
        if app_filter.is_some_and(|f| lock.app_urn.to_string() != f) {
            continue;
        }
        found = true;
        let events = eventlog::read_events(state_dir, &lock.app_urn)?;
        println!("Application: {} ({})", lock.app_urn, lock.default_region);
        println!("  Version: {}", lock.version);
        println!("  Generated: {}", lock.generated_at);
        println!("  Generator: {}", lock.generator);
        println!("  Events: {}", events.len());
        println!("  Constructs: {}", lock.constructs.len());
        for (name, entry) in &lock.constructs {
            println!(
                "    {}: {} [{}] {} output(s)",
                name,
                entry.status,
                entry.construct_type,
                entry.outputs.len()
            );
        }
        println!();
    }

    if !found {
        println!("No state found. Run `kiln up` first.");
    }
    Ok(())
}
