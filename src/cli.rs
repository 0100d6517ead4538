use std::path::PathBuf;

use clap::Parser;

use crate::lockfile::{BACKUP_ID, PRIMARY_ID};

/// A getopt-style surface: every action is a short flag. Clap's built-in
/// help is disabled because `-h` must print usage to stderr.
#[derive(Debug, Parser)]
#[command(
    name = "procmon",
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct Cli {
    /// Start the supervisor in the backup role from the given configuration.
    #[arg(short = 'f', value_name = "FILE")]
    pub backup_config: Option<PathBuf>,

    /// Start the supervisor in the primary role from the given configuration.
    #[arg(short = 'F', value_name = "FILE")]
    pub primary_config: Option<PathBuf>,

    /// List monitored processes.
    #[arg(short = 'l')]
    pub list: bool,

    /// List monitored processes in the given format (`json` for JSON).
    #[arg(short = 'o', value_name = "FORMAT")]
    pub output_format: Option<String>,

    /// Kill a process and suspend its monitoring.
    #[arg(short = 'k', value_name = "PROC")]
    pub kill: Option<String>,

    /// Resume monitoring of a previously killed process.
    #[arg(short = 's', value_name = "PROC")]
    pub start: Option<String>,

    /// Restart a process.
    #[arg(short = 'r', value_name = "PROC")]
    pub restart: Option<String>,

    /// Stop a process and delete its monitoring.
    #[arg(short = 'd', value_name = "PROC")]
    pub delete: Option<String>,

    /// Shut down all monitored processes and both supervisors.
    #[arg(short = 'x')]
    pub shutdown: bool,

    /// Verbose output.
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Display usage.
    #[arg(short = 'h')]
    pub help: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Usage,
    Daemon { config: PathBuf, role: Role },
    Kill(String),
    Start(String),
    Restart(String),
    Delete(String),
    List(ListFormat),
    ShutdownAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Backup,
}

impl Role {
    /// Reserved lockfile id for this supervisor.
    pub fn own_id(self) -> &'static str {
        match self {
            Role::Primary => PRIMARY_ID,
            Role::Backup => BACKUP_ID,
        }
    }

    /// Reserved lockfile id for the supervisor this one monitors.
    pub fn peer_id(self) -> &'static str {
        match self {
            Role::Primary => BACKUP_ID,
            Role::Backup => PRIMARY_ID,
        }
    }

    /// Flag that selects this role on the command line.
    pub fn own_flag(self) -> &'static str {
        match self {
            Role::Primary => "-F",
            Role::Backup => "-f",
        }
    }

    /// Flag used to exec the peer: the primary spawns a backup and vice versa.
    pub fn peer_flag(self) -> &'static str {
        match self {
            Role::Primary => "-f",
            Role::Backup => "-F",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Backup => write!(f, "backup"),
        }
    }
}

impl Cli {
    /// Resolve the flag soup into a single action. Control flags win over
    /// daemon flags, and `-F` wins over `-f` when both are given.
    pub fn resolve(&self) -> Invocation {
        if self.help {
            return Invocation::Usage;
        }
        if let Some(id) = &self.delete {
            return Invocation::Delete(id.clone());
        }
        if let Some(id) = &self.kill {
            return Invocation::Kill(id.clone());
        }
        if let Some(id) = &self.restart {
            return Invocation::Restart(id.clone());
        }
        if let Some(id) = &self.start {
            return Invocation::Start(id.clone());
        }
        if self.shutdown {
            return Invocation::ShutdownAll;
        }
        if self.list || self.output_format.is_some() {
            let format = match self.output_format.as_deref() {
                Some("json") => ListFormat::Json,
                _ => ListFormat::Human,
            };
            return Invocation::List(format);
        }
        if let Some(config) = &self.primary_config {
            return Invocation::Daemon {
                config: config.clone(),
                role: Role::Primary,
            };
        }
        if let Some(config) = &self.backup_config {
            return Invocation::Daemon {
                config: config.clone(),
                role: Role::Backup,
            };
        }

        Invocation::Usage
    }
}

pub fn print_usage() {
    eprintln!(
        "procmon {}\n\
         usage: procmon [-v] [-h] [-l] [-x] \
         [-s <proc>] [-r <proc>] [-k <proc>] [-d <proc>] [-o <fmt>] [-f|F <filename>]\n\
         [-h] : display this help\n\
         [-l] : list all the monitored processes\n\
         [-o fmt] : list the monitored processes using fmt. eg json\n\
         [-x] : remove all monitored processes\n\
         [-k] : kill process and suspend monitoring\n\
         [-r] : restart process\n\
         [-s] : start monitoring a previously stopped process\n\
         [-d] : stop process and delete monitoring\n\
         [-v] : verbose output\n\
         [-f|F <filename>] : start processes as per configuration",
        env!("PROCMON_BUILD_VERSION")
    );
}

#[cfg(test)]
mod tests {
    use super::{Cli, Invocation, ListFormat, Role};
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("procmon").chain(args.iter().copied()))
            .expect("cli parse failed")
    }

    #[test]
    fn primary_flag_selects_primary_role() {
        let invocation = parse(&["-F", "procs.json"]).resolve();
        match invocation {
            Invocation::Daemon { config, role } => {
                assert_eq!(config.to_str(), Some("procs.json"));
                assert_eq!(role, Role::Primary);
            }
            other => panic!("unexpected invocation: {other:?}"),
        }
    }

    #[test]
    fn backup_flag_selects_backup_role() {
        let invocation = parse(&["-f", "procs.json"]).resolve();
        assert!(matches!(
            invocation,
            Invocation::Daemon {
                role: Role::Backup,
                ..
            }
        ));
    }

    #[test]
    fn primary_wins_when_both_config_flags_are_given() {
        let invocation = parse(&["-f", "a.json", "-F", "b.json"]).resolve();
        match invocation {
            Invocation::Daemon { config, role } => {
                assert_eq!(config.to_str(), Some("b.json"));
                assert_eq!(role, Role::Primary);
            }
            other => panic!("unexpected invocation: {other:?}"),
        }
    }

    #[test]
    fn control_flags_take_precedence_over_daemon_flags() {
        let invocation = parse(&["-k", "db", "-f", "procs.json"]).resolve();
        assert_eq!(invocation, Invocation::Kill("db".to_string()));
    }

    #[test]
    fn output_format_json_selects_json_listing() {
        assert_eq!(
            parse(&["-o", "json"]).resolve(),
            Invocation::List(ListFormat::Json)
        );
        assert_eq!(
            parse(&["-o", "table"]).resolve(),
            Invocation::List(ListFormat::Human)
        );
        assert_eq!(parse(&["-l"]).resolve(), Invocation::List(ListFormat::Human));
    }

    #[test]
    fn no_flags_resolves_to_usage() {
        assert_eq!(parse(&[]).resolve(), Invocation::Usage);
        assert_eq!(parse(&["-v"]).resolve(), Invocation::Usage);
    }

    #[test]
    fn roles_are_mutually_monitoring() {
        assert_eq!(Role::Primary.own_id(), "procmon1");
        assert_eq!(Role::Primary.peer_id(), "procmon2");
        assert_eq!(Role::Backup.own_id(), "procmon2");
        assert_eq!(Role::Backup.peer_id(), "procmon1");
        assert_eq!(Role::Primary.peer_flag(), "-f");
        assert_eq!(Role::Backup.peer_flag(), "-F");
    }
}
