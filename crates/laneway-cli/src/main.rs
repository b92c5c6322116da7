use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::{Env, Outcome, RunOptions, EXIT_ERROR};

fn cli() -> Command {
    Command::new("laneway")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Lane-aware pipeline execution engine")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("workspace")
                .long("workspace")
                .short('w')
                .global(true)
                .default_value(".")
                .value_parser(value_parser!(PathBuf))
                .help("Workspace root"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file (.toml, .yaml or .yml); defaults to <workspace>/laneway.toml"),
        )
        .arg(
            Arg::new("namespace")
                .long("namespace")
                .short('n')
                .global(true)
                .default_value("manual")
                .help("Checkpoint namespace (run id) for checkpoint commands"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print JSON"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("checkpoint")
                .about("Snapshot the workspace's critical files")
                .arg(
                    Arg::new("profile")
                        .long("profile")
                        .default_value("standard")
                        .help("Lane recorded with the checkpoint"),
                )
                .arg(
                    Arg::new("stage")
                        .long("stage")
                        .default_value("1")
                        .value_parser(value_parser!(u32))
                        .help("Stage number"),
                )
                .arg(
                    Arg::new("name")
                        .long("name")
                        .default_value("manual")
                        .help("Stage name"),
                )
                .arg(
                    Arg::new("failed")
                        .long("failed")
                        .value_name("MESSAGE")
                        .help("Record a failed stage transition with this message"),
                ),
        )
        .subcommand(
            Command::new("restore")
                .about("Restore the workspace from a checkpoint")
                .arg(Arg::new("id").required(true).help("Checkpoint id")),
        )
        .subcommand(Command::new("validate").about("Check critical files, drift and environment"))
        .subcommand(Command::new("cleanup").about("Remove transient artifacts and expired checkpoints"))
        .subcommand(
            Command::new("list").about("List checkpoints, newest first").arg(
                Arg::new("all")
                    .long("all")
                    .action(ArgAction::SetTrue)
                    .help("List every namespace"),
            ),
        )
        .subcommand(
            Command::new("detail")
                .about("Show one checkpoint")
                .arg(Arg::new("id").required(true).help("Checkpoint id")),
        )
        .subcommand(
            Command::new("plan")
                .about("Show the recovery plan for a failure on a lane")
                .arg(
                    Arg::new("failure-type")
                        .long("failure-type")
                        .required(true)
                        .help("timeout, test_failure, quality_gate_failure, resource_exhaustion, network_error, revision_control_error or unknown"),
                )
                .arg(
                    Arg::new("lane")
                        .long("lane")
                        .default_value("standard")
                        .help("Lane name"),
                ),
        )
        .subcommand(Command::new("profiles").about("List lanes"))
        .subcommand(change_args(
            Command::new("select").about("Pick the lane for a change"),
        ))
        .subcommand(change_args(
            Command::new("run")
                .about("Run a pipeline of shell commands declared in TOML")
                .arg(
                    Arg::new("pipeline")
                        .long("pipeline")
                        .short('p')
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Pipeline file"),
                )
                .arg(
                    Arg::new("metrics-out")
                        .long("metrics-out")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write the run's metrics snapshot (JSON) here"),
                ),
        ))
}

/// Arguments describing the change a lane is chosen for
fn change_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("lane")
            .long("lane")
            .help("Lane name; overrides auto-selection"),
    )
    .arg(
        Arg::new("added")
            .long("added")
            .default_value("0")
            .value_parser(value_parser!(usize))
            .help("Lines added by the change"),
    )
    .arg(
        Arg::new("removed")
            .long("removed")
            .default_value("0")
            .value_parser(value_parser!(usize))
            .help("Lines removed by the change"),
    )
    .arg(
        Arg::new("changed")
            .num_args(0..)
            .help("Paths changed by the change"),
    )
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("laneway=info"));
    let (plain, json) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)), None)
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .init();
}

fn strings(args: &ArgMatches, id: &str) -> Vec<String> {
    args.get_many::<String>(id)
        .map(|v| v.cloned().collect())
        .unwrap_or_default()
}

fn count(args: &ArgMatches, id: &str) -> usize {
    args.get_one::<usize>(id).copied().unwrap_or(0)
}

async fn dispatch(matches: &ArgMatches) -> anyhow::Result<Outcome> {
    let workspace = matches
        .get_one::<PathBuf>("workspace")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("."));
    let namespace = matches
        .get_one::<String>("namespace")
        .cloned()
        .unwrap_or_else(|| "manual".to_string());
    let env = Env::load(
        workspace,
        matches.get_one::<PathBuf>("config").map(PathBuf::as_path),
        namespace,
        matches.get_flag("json"),
    )?;

    match matches.subcommand() {
        Some(("checkpoint", args)) => commands::checkpoint(
            &env,
            args.get_one::<String>("profile").map_or("standard", String::as_str),
            args.get_one::<u32>("stage").copied().unwrap_or(1),
            args.get_one::<String>("name").map_or("manual", String::as_str),
            args.get_one::<String>("failed").map(String::as_str),
        ),
        Some(("restore", args)) => {
            commands::restore(&env, args.get_one::<String>("id").map_or("", String::as_str))
        }
        Some(("validate", _)) => commands::validate(&env),
        Some(("cleanup", _)) => commands::cleanup(&env),
        Some(("list", args)) => commands::list(&env, args.get_flag("all")),
        Some(("detail", args)) => {
            commands::detail(&env, args.get_one::<String>("id").map_or("", String::as_str))
        }
        Some(("plan", args)) => commands::plan(
            &env,
            args.get_one::<String>("failure-type").map_or("", String::as_str),
            args.get_one::<String>("lane").map_or("standard", String::as_str),
        ),
        Some(("profiles", _)) => commands::profiles(&env),
        Some(("select", args)) => commands::select(
            &env,
            args.get_one::<String>("lane").map(String::as_str),
            &strings(args, "changed"),
            count(args, "added"),
            count(args, "removed"),
        ),
        Some(("run", args)) => {
            let opts = RunOptions {
                pipeline: args.get_one::<PathBuf>("pipeline").cloned().unwrap_or_default(),
                lane: args.get_one::<String>("lane").cloned(),
                changed: strings(args, "changed"),
                added: count(args, "added"),
                removed: count(args, "removed"),
                metrics_out: args.get_one::<PathBuf>("metrics-out").cloned(),
            };
            commands::run(&env, opts).await
        }
        _ => anyhow::bail!("unknown command"),
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("log-json"));

    let code = match dispatch(&matches).await {
        Ok(outcome) => outcome.code(),
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("error: {e:#}");
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}
