use std::path::PathBuf;

use color_eyre::Result;
use color_eyre::eyre::{bail, ensure};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stickcopy::config::Settings;
use stickcopy::session::{Progress, Session};

const USAGE: &str = "usage: stickcopy [count | list | backup] [--config <path>] [--mock]";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Command {
    Count,
    List,
    Backup,
    Help,
}

struct Args {
    command: Command,
    config: Option<PathBuf>,
    mock: bool,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Args {
            command: Command::Backup,
            config: None,
            mock: false,
        };
        let mut command = None;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => match args.next() {
                    Some(path) => parsed.config = Some(PathBuf::from(path)),
                    None => bail!("--config needs a path\n{USAGE}"),
                },
                "--mock" => parsed.mock = true,
                "-h" | "--help" => {
                    parsed.command = Command::Help;
                    return Ok(parsed);
                }
                name => {
                    ensure!(command.is_none(), "more than one command given\n{USAGE}");
                    command = Some(match name {
                        "count" => Command::Count,
                        "list" => Command::List,
                        "backup" => Command::Backup,
                        other => bail!("unknown argument {other:?}\n{USAGE}"),
                    });
                }
            }
        }
        if let Some(command) = command {
            parsed.command = command;
        }
        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse(std::env::args().skip(1))?;
    if args.command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }
    let mut settings = Settings::load(args.config.as_deref());
    settings.mock_device |= args.mock;

    let session = Session::mount(settings).await?;
    let source = session.settings().source_path.clone();

    let Some(before) = session.count(args.command == Command::List).await? else {
        bail!("{source} not found on the stick");
    };
    info!("{} files to back up in {source}", before.count);
    match args.command {
        Command::Count => {
            println!("{}", before.count);
            return session.close().await;
        }
        Command::List => {
            for path in before.paths.unwrap_or_default() {
                println!("{path}");
            }
            return session.close().await;
        }
        Command::Backup | Command::Help => {}
    }

    let destination = &session.settings().destination_path;
    ensure!(
        destination.is_dir(),
        "destination {} does not exist",
        destination.display()
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(async move {
        while let Some(Progress(n)) = rx.recv().await {
            info!("copying file {n}");
        }
    });
    let outcome = session.backup(tx).await?;
    reporter.await?;
    let Some(outcome) = outcome else {
        bail!("{source} disappeared during the backup");
    };

    if outcome.is_success() {
        info!("backup complete, {} files", outcome.visited);
    } else {
        error!("{} files failed to back up:", outcome.failed.len());
        for name in &outcome.failed {
            error!("  {name}");
        }
    }

    if let Some(after) = session.count(false).await? {
        if after.count > 0 && session.settings().delete_after_backup {
            warn!("{} files remain in {source}", after.count);
        } else {
            info!("{} files now in {source}", after.count);
        }
    }
    session.close().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        Args::parse(args.iter().map(|a| a.to_string()))
    }

    #[test]
    fn backup_is_the_default_command() {
        let args = parse(&["--mock"]).unwrap();
        assert_eq!(args.command, Command::Backup);
        assert!(args.mock);
        assert_eq!(args.config, None);
    }

    #[test]
    fn help_stops_parsing() {
        let args = parse(&["list", "--help", "bogus"]).unwrap();
        assert_eq!(args.command, Command::Help);
    }

    #[test]
    fn config_takes_a_path() {
        let args = parse(&["count", "--config", "/tmp/c.json"]).unwrap();
        assert_eq!(args.command, Command::Count);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.json")));
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["count", "list"]).is_err());
    }
}
