use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use study_conductor::{
    exit, AdapterRegistry, ConductorConfig, FileStateStore, LaunchError, Launcher, MemoryAdapter,
    MemoryStateStore, StateStore, StudyOutcome,
};
use study_graph::StudyGraph;
use study_spec::{SchedulerKind, StudySpec};
use tracing_subscriber::EnvFilter;

fn spec_arg() -> Arg {
    Arg::new("spec")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Study YAML file")
}

fn conductor_args(command: Command) -> Command {
    command
        .arg(spec_arg())
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .help("Conductor TOML config"),
        )
        .arg(
            Arg::new("workspace")
                .long("workspace")
                .value_parser(value_parser!(PathBuf))
                .help("Root directory for instance workspaces"),
        )
        .arg(
            Arg::new("state")
                .long("state")
                .value_parser(value_parser!(PathBuf))
                .help("State file (default: <workspace>/conductor.state.json)"),
        )
        .arg(
            Arg::new("max-concurrent")
                .long("max-concurrent")
                .value_parser(value_parser!(usize))
                .help("Maximum instances submitted or running at once"),
        )
        .arg(
            Arg::new("poll-ms")
                .long("poll-ms")
                .value_parser(value_parser!(u64))
                .help("Milliseconds between ticks"),
        )
}

fn cli() -> Command {
    Command::new("conductor")
        .version(study_conductor::VERSION)
        .about("Expand parameterized studies and run them on batch schedulers")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::Count)
                .help("Increase log verbosity (-v debug, -vv trace)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(conductor_args(Command::new("run").about("Launch a study")))
        .subcommand(conductor_args(
            Command::new("resume").about("Resume a study from its state file"),
        ))
        .subcommand(
            Command::new("validate")
                .about("Expand a study and print its instances without running it")
                .arg(spec_arg())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the expanded graph as JSON"),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Conduct the study against an in-memory scheduler"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Summarize a state file")
                .arg(
                    Arg::new("state")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("State file"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
}

fn init_tracing(verbosity: u8, json: bool) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &ArgMatches) -> anyhow::Result<ConductorConfig> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => ConductorConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ConductorConfig::new(),
    };
    if let Some(root) = args.get_one::<PathBuf>("workspace") {
        config = config.with_workspace_root(root);
    }
    if let Some(state) = args.get_one::<PathBuf>("state") {
        config = config.with_state_path(state);
    }
    if let Some(max) = args.get_one::<usize>("max-concurrent") {
        config = config.with_max_concurrent(*max);
    }
    if let Some(ms) = args.get_one::<u64>("poll-ms") {
        config = config.with_poll_interval(Duration::from_millis(*ms));
    }
    config.validate().context("invalid conductor config")?;
    Ok(config)
}

fn report_error(error: &LaunchError) -> u8 {
    eprintln!("error: {error}");
    error.exit_code()
}

fn print_outcome(outcome: &StudyOutcome) {
    let c = &outcome.counts;
    println!();
    println!("Study '{}' ({})", outcome.study, outcome.conductor_id);
    println!("  Ticks:     {}", outcome.ticks);
    println!("  Finished:  {}/{}", c.finished, c.total());
    println!("  Failed:    {}", c.failed);
    println!("  Cancelled: {}", c.cancelled);
    if outcome.cancel_requested {
        println!("  (cancelled on request)");
    }
}

async fn run(args: &ArgMatches, resume: bool) -> u8 {
    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return exit::UNAVAILABLE;
        }
    };
    let Some(path) = args.get_one::<PathBuf>("spec") else {
        return exit::SPEC_INVALID;
    };
    let spec = match StudySpec::from_path(path) {
        Ok(spec) => spec,
        Err(e) => return report_error(&LaunchError::Spec(e)),
    };

    let launcher = Launcher::new(AdapterRegistry::standard(), config);
    let started = if resume {
        launcher.resume(spec).await
    } else {
        launcher.launch(spec).await
    };
    let handle = match started {
        Ok(handle) => handle,
        Err(e) => return report_error(&e),
    };

    println!(
        "Conductor {} {} study '{}' ({} instances, state at {})",
        handle.conductor_id(),
        if resume { "resumed" } else { "launched" },
        handle.started().study,
        handle.started().instances,
        handle.state_path().display()
    );

    let switch = handle.cancel_switch();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling study");
            switch.cancel();
        }
    });

    match handle.wait().await {
        Ok(outcome) => {
            print_outcome(&outcome);
            if outcome.is_success() {
                exit::SUCCESS
            } else {
                exit::EXECUTION_FAILED
            }
        }
        Err(e) => report_error(&e),
    }
}

async fn validate(args: &ArgMatches) -> u8 {
    let Some(path) = args.get_one::<PathBuf>("spec") else {
        return exit::SPEC_INVALID;
    };
    let spec = match StudySpec::from_path(path) {
        Ok(spec) => spec,
        Err(e) => return report_error(&LaunchError::Spec(e)),
    };

    let graph = match StudyGraph::build(&spec, &AdapterRegistry::standard()) {
        Ok(graph) => graph,
        Err(e) => return report_error(&LaunchError::Spec(e)),
    };

    if args.get_flag("json") {
        match serde_json::to_string_pretty(&graph) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("error: {e}");
                return exit::EXECUTION_FAILED;
            }
        }
    } else {
        println!(
            "Study '{}': {} instances, {} edges, fingerprint {}",
            graph.study(),
            graph.len(),
            graph.edge_count(),
            graph.fingerprint()
        );
        for id in graph.topological_order() {
            let Some(instance) = graph.get(id) else {
                continue;
            };
            println!("  {id}  [{} upstream]", instance.depends.len());
            println!("      {}", instance.command.trim());
        }
    }

    if !args.get_flag("dry-run") {
        return exit::SUCCESS;
    }

    let memory = Arc::new(MemoryAdapter::new());
    let mut registry = AdapterRegistry::new();
    for kind in [SchedulerKind::Local, SchedulerKind::Slurm, SchedulerKind::Lsf, SchedulerKind::Flux] {
        registry.register(kind, memory.clone());
    }
    // nothing runs, so keep the output directory out of the caller's tree
    let config = ConductorConfig::new()
        .with_poll_interval(Duration::ZERO)
        .with_workspace_root(std::env::temp_dir().join("study-conductor-dry-run"));
    let launcher = Launcher::new(registry, config).with_store(Arc::new(MemoryStateStore::new()));

    let outcome = match launcher.launch(spec).await {
        Ok(handle) => handle.wait().await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(outcome) => {
            println!();
            println!("Dry run submission order:");
            for (n, request) in memory.submissions().iter().enumerate() {
                println!("  {:>4}  {}", n + 1, request.instance);
            }
            print_outcome(&outcome);
            if outcome.is_success() {
                exit::SUCCESS
            } else {
                exit::EXECUTION_FAILED
            }
        }
        Err(e) => report_error(&e),
    }
}

fn status(args: &ArgMatches) -> u8 {
    let Some(path) = args.get_one::<PathBuf>("state") else {
        return exit::UNAVAILABLE;
    };
    let state = match FileStateStore::new(path).load() {
        Ok(Some(state)) => state,
        Ok(None) => {
            eprintln!("error: no conductor state at {}", path.display());
            return exit::UNAVAILABLE;
        }
        Err(e) => {
            eprintln!("error: {e}");
            return exit::UNAVAILABLE;
        }
    };
    let integrity = state.check_consistency();
    let counts = state.counts();

    if args.get_flag("json") {
        let instances: Vec<_> = state
            .records()
            .map(|(id, r)| {
                serde_json::json!({
                    "id": id,
                    "status": r.status,
                    "handle": r.handle,
                    "runs": r.runs,
                    "last_error": r.last_error,
                })
            })
            .collect();
        let report = serde_json::json!({
            "study": state.study,
            "conductor_id": state.conductor_id,
            "tick": state.tick,
            "cancel_requested": state.cancel_requested,
            "journal_ok": integrity.is_ok(),
            "counts": counts,
            "instances": instances,
        });
        println!("{report:#}");
    } else {
        println!("Study '{}' ({})", state.study, state.conductor_id);
        println!("  Tick:      {}", state.tick);
        println!("  Updated:   {}", state.updated_at.to_rfc3339());
        println!(
            "  Pending {} / Waiting {} / Ready {} / Submitted {} / Running {}",
            counts.pending, counts.waiting, counts.ready, counts.submitted, counts.running
        );
        println!(
            "  Finished {} / Failed {} / Cancelled {}",
            counts.finished, counts.failed, counts.cancelled
        );
        for (id, record) in state.records() {
            match &record.last_error {
                Some(error) => println!("  {:<10} {id}  ({error})", record.status.to_string()),
                None => println!("  {:<10} {id}", record.status.to_string()),
            }
        }
        if let Err(e) = &integrity {
            println!("  WARNING: {e}");
        }
    }
    exit::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(matches.get_count("verbose"), matches.get_flag("json-logs"));

    let code = match matches.subcommand() {
        Some(("run", args)) => run(args, false).await,
        Some(("resume", args)) => run(args, true).await,
        Some(("validate", args)) => validate(args).await,
        Some(("status", args)) => status(args),
        _ => exit::UNAVAILABLE,
    };
    ExitCode::from(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn test_overrides_apply_on_top_of_defaults() {
        let matches = cli().get_matches_from([
            "conductor",
            "run",
            "study.yaml",
            "--workspace",
            "/work",
            "--max-concurrent",
            "2",
            "--poll-ms",
            "50",
        ]);
        let Some(("run", args)) = matches.subcommand() else {
            panic!("expected run");
        };
        let config = load_config(args).unwrap();
        assert_eq!(config.max_concurrent, Some(2));
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.state_file(), PathBuf::from("/work/conductor.state.json"));
    }
}
