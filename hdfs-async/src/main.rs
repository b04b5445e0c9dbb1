mod cli;

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::Parser;
use cli::{Cli, Commands, FsCommand};
use futures::TryStreamExt;
use hdfs_async::driver::Driver;
use hdfs_async::driver::memory::{MemoryCluster, MemoryDriver};
use hdfs_async::stream::{DEFAULT_CHUNK_SIZE, read_stream, write_all};
use hdfs_async::{
    ClientConfig, ClusterInfo, Dispatcher, Session, Truncation, WriteOptions, load_config,
};
use log::info;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

#[derive(Serialize)]
struct Usage {
    capacity: i64,
    used: i64,
    default_block_size: i64,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(service) = &cli.service {
        cfg.namenode.service = service.clone();
    }
    if let Some(port) = cli.port {
        cfg.namenode.port = port;
    }
    if let Some(user) = &cli.user {
        cfg.namenode.user = Some(user.clone());
    }
    if let Some(library) = &cli.library {
        cfg.library_path = Some(library.clone());
    }
    cfg.validate()?;

    if cli.memory {
        info!("using an in-process namenode");
        let driver = MemoryDriver::new(MemoryCluster::builder().build());
        run(driver, &cfg, cli.command).await
    } else {
        let driver = cfg.libhdfs3().context("Failed to load libhdfs3")?;
        run(driver, &cfg, cli.command).await
    }
}

async fn run<D: Driver>(driver: D, cfg: &ClientConfig, command: Commands) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::current()?;
    match command {
        // HA lookups need no connection.
        Commands::Namenodes { service } => {
            let info = ClusterInfo::new(driver, dispatcher);
            print_json(&info.namenodes(&service)?.await?)
        }
        Commands::Fs(command) => {
            let session = Session::connect(driver, dispatcher, &cfg.namenode)
                .context("Failed to connect")?
                .with_max_path_length(cfg.max_path_length);
            let outcome = run_fs(&session, command).await;
            session.close().await?;
            outcome
        }
    }
}

async fn run_fs<D: Driver>(session: &Session<D>, command: FsCommand) -> anyhow::Result<()> {
    match command {
        FsCommand::Ls { path } => print_json(&session.list(&path)?.await?)?,
        FsCommand::Stat { path } => print_json(&session.path_info(&path)?.await?)?,
        FsCommand::Mkdir { path } => session.create_directory(&path)?.await?,
        FsCommand::Rm { path, recursive } => session.delete(&path, recursive)?.await?,
        FsCommand::Mv { from, to } => session.rename(&from, &to)?.await?,
        FsCommand::Cat { path } => {
            let reader = session.reader(&path)?;
            let mut chunks = Box::pin(read_stream(reader, DEFAULT_CHUNK_SIZE));
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = chunks.try_next().await? {
                stdout.write_all(&chunk).await?;
            }
            stdout.flush().await?;
        }
        FsCommand::Put {
            local,
            remote,
            replication,
            append,
        } => {
            let data = tokio::fs::read(&local)
                .await
                .with_context(|| format!("Failed to read {}", local.display()))?;
            let options = WriteOptions::default()
                .replication(replication)
                .append(append);
            let writer = session.writer(&remote, options)?;
            writer.open()?.await?;
            let written = write_all(&writer, Bytes::from(data), DEFAULT_CHUNK_SIZE).await;
            writer.close().await?;
            info!("wrote {} bytes to {remote}", written?);
        }
        FsCommand::Chmod { mode, path } => {
            let mode = i16::from_str_radix(&mode, 8)
                .with_context(|| format!("Invalid octal mode {mode}"))?;
            session.chmod(&path, mode)?.await?;
        }
        FsCommand::Chown { path, owner, group } => {
            if owner.is_none() && group.is_none() {
                bail!("chown needs --owner or --group");
            }
            session
                .chown(&path, owner.as_deref(), group.as_deref())?
                .await?;
        }
        FsCommand::Truncate { path, length } => match session.truncate(&path, length)?.await? {
            Truncation::Done => println!("truncated"),
            Truncation::AwaitRecovery => println!("truncated, block recovery in progress"),
        },
        FsCommand::Df => {
            let usage = Usage {
                capacity: session.capacity()?.await?,
                used: session.used()?.await?,
                default_block_size: session.default_block_size()?.await?,
            };
            print_json(&usage)?;
        }
    }
    Ok(())
}
