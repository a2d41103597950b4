use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

use crate::config::{
    CHILD_SUBCOMMAND, DEFAULT_CGROUP_ROOT, DEFAULT_IMAGE, DEFAULT_STATE_DIR, EngineConfig,
};
use crate::container::RunOptions;
use crate::rootfs::ImageSource;

#[derive(Debug, Clone)]
pub enum CliCommand {
    Run(RunOptions),
    Start { id: String },
    Stop { id: String },
    Remove { id: String },
    Inspect { id: String },
    Ps,
    Child { command: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct Cli {
    pub config: EngineConfig,
    pub verbose: bool,
    pub command: CliCommand,
}

fn id_arg() -> Arg {
    Arg::new("id")
        .value_name("CONTAINER_ID")
        .required(true)
        .help("Container id")
        .value_parser(clap::value_parser!(String))
}

fn command_arg() -> Arg {
    Arg::new("command")
        .value_name("COMMAND")
        .help("Executable and arguments to run inside the container")
        .required(true)
        .num_args(1..)
        .trailing_var_arg(true)
        .allow_hyphen_values(true)
        .value_parser(clap::value_parser!(String))
}

pub fn build_command() -> Command {
    Command::new("cellbox")
        .version("0.1.0")
        .about("A minimal container engine: namespaces, pivot_root and cgroup v2 limits")
        .subcommand_required(true)
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .global(true)
                .value_name("PATH")
                .env("CELLBOX_STATE_DIR")
                .default_value(DEFAULT_STATE_DIR)
                .help("Directory holding container records and root filesystems")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("cgroup-root")
                .long("cgroup-root")
                .global(true)
                .value_name("PATH")
                .env("CELLBOX_CGROUP_ROOT")
                .default_value(DEFAULT_CGROUP_ROOT)
                .help("cgroup v2 mount point")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("image")
                .long("image")
                .global(true)
                .value_name("PATH_OR_URL")
                .env("CELLBOX_IMAGE")
                .default_value(DEFAULT_IMAGE)
                .help("Root filesystem archive (.tar or .tar.gz, local or http(s)) for new containers; empty disables")
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug logging"),
        )
        .subcommand(
            Command::new("run")
                .about("Create a container and run a command in it")
                .arg(
                    Arg::new("memory")
                        .long("memory")
                        .value_name("SIZE")
                        .help("Memory limit, e.g. 100M or 1G")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("cpu")
                        .long("cpu")
                        .value_name("QUOTA")
                        .help("CPU quota: 'max' or '<quota> <period>'")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("rootfs")
                        .long("rootfs")
                        .value_name("PATH")
                        .help("Use this root filesystem instead of a per-container one")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("hostname")
                        .long("hostname")
                        .value_name("HOSTNAME")
                        .help("container hostname")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("net")
                        .long("net")
                        .action(ArgAction::SetTrue)
                        .help("New network namespace with a veth pair"),
                )
                .arg(
                    Arg::new("userns")
                        .long("userns")
                        .action(ArgAction::SetTrue)
                        .help(
                            "New user namespace mapping root to the invoking user. \
                             Device nodes cannot be created there, so /dev setup fails \
                             and the container does not start",
                        ),
                )
                .arg(command_arg()),
        )
        .subcommand(
            Command::new("start")
                .about("Run a stopped container again")
                .arg(id_arg()),
        )
        .subcommand(
            Command::new("stop")
                .about("Kill a running container")
                .arg(id_arg()),
        )
        .subcommand(
            Command::new("rm")
                .about("Remove a container")
                .arg(id_arg()),
        )
        .subcommand(
            Command::new("inspect")
                .about("Show details of a container")
                .arg(id_arg()),
        )
        .subcommand(Command::new("ps").about("List containers"))
        .subcommand(
            Command::new(CHILD_SUBCOMMAND)
                .hide(true)
                .arg(command_arg()),
        )
}

pub fn parse_args() -> Cli {
    from_matches(&build_command().get_matches())
}

fn string_arg(matches: &ArgMatches, name: &str) -> Option<String> {
    matches.get_one::<String>(name).cloned()
}

fn id_of(matches: &ArgMatches) -> String {
    string_arg(matches, "id").unwrap_or_default()
}

fn from_matches(matches: &ArgMatches) -> Cli {
    let mut config = EngineConfig::default();
    if let Some(dir) = matches.get_one::<PathBuf>("state-dir") {
        config = config.with_state_dir(dir);
    }
    if let Some(root) = matches.get_one::<PathBuf>("cgroup-root") {
        config = config.with_cgroup_root(root);
    }
    let image = matches
        .get_one::<String>("image")
        .filter(|value| !value.is_empty())
        .map(|value| ImageSource::parse(value));
    config = config.with_image(image);
    let verbose = matches.get_flag("verbose");

    let command_of = |sub: &ArgMatches| -> Vec<String> {
        sub.get_many::<String>("command")
            .map(|vals| vals.cloned().collect())
            .unwrap_or_default()
    };
    let command = match matches.subcommand() {
        Some(("run", sub)) => CliCommand::Run(RunOptions {
            command: command_of(sub),
            memory: string_arg(sub, "memory"),
            cpu: string_arg(sub, "cpu"),
            rootfs: sub.get_one::<PathBuf>("rootfs").cloned(),
            hostname: string_arg(sub, "hostname"),
            network: sub.get_flag("net"),
            user_namespace: sub.get_flag("userns"),
        }),
        Some(("start", sub)) => CliCommand::Start { id: id_of(sub) },
        Some(("stop", sub)) => CliCommand::Stop { id: id_of(sub) },
        Some(("rm", sub)) => CliCommand::Remove { id: id_of(sub) },
        Some(("inspect", sub)) => CliCommand::Inspect { id: id_of(sub) },
        Some((CHILD_SUBCOMMAND, sub)) => CliCommand::Child {
            command: command_of(sub),
        },
        _ => CliCommand::Ps,
    };
    Cli {
        config,
        verbose,
        command,
    }
}
