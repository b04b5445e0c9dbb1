use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hdfsctl", version, about = "HDFS command line client")]
pub struct Cli {
    /// YAML client config
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Namenode host or HA nameservice
    #[arg(short, long, global = true)]
    pub service: Option<String>,

    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    #[arg(short, long, global = true)]
    pub user: Option<String>,

    /// Path to libhdfs3.so
    #[arg(long, global = true)]
    pub library: Option<PathBuf>,

    /// Use a throwaway in-process namenode instead of libhdfs3
    #[arg(long, global = true)]
    pub memory: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(flatten)]
    Fs(FsCommand),
    /// List the namenodes of an HA nameservice
    Namenodes { service: String },
}

/// Commands that run against a connected session.
#[derive(Subcommand)]
pub enum FsCommand {
    /// List a directory
    Ls {
        #[arg(default_value = ".")]
        path: String,
    },
    /// Show metadata of one path
    Stat { path: String },
    /// Create a directory and its parents
    Mkdir { path: String },
    /// Delete a path
    Rm {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Rename a path
    Mv { from: String, to: String },
    /// Print a file to stdout
    Cat { path: String },
    /// Upload a local file
    Put {
        local: PathBuf,
        remote: String,
        /// 0 uses the cluster default
        #[arg(long, default_value_t = 0)]
        replication: i16,
        #[arg(long)]
        append: bool,
    },
    /// Change permission bits (octal)
    Chmod { mode: String, path: String },
    /// Change owner and/or group
    Chown {
        path: String,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        group: Option<String>,
    },
    /// Truncate a file to a length
    Truncate { path: String, length: i64 },
    /// Show capacity and usage
    Df,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namenodes_is_not_a_session_command() {
        let cli = Cli::try_parse_from(["hdfsctl", "namenodes", "ns1"]).unwrap();
        assert!(matches!(cli.command, Commands::Namenodes { service } if service == "ns1"));
    }

    #[test]
    fn filesystem_commands_parse_with_globals() {
        let cli = Cli::try_parse_from(["hdfsctl", "ls", "--memory", "-u", "bob"]).unwrap();
        assert!(cli.memory);
        assert_eq!(cli.user.as_deref(), Some("bob"));
        assert!(matches!(cli.command, Commands::Fs(FsCommand::Ls { path }) if path == "."));

        let cli = Cli::try_parse_from(["hdfsctl", "rm", "-r", "/tmp/x"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Fs(FsCommand::Rm { recursive: true, .. })
        ));
    }
}
