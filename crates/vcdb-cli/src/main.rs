use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vcdb_core::crypto::MIN_PASSWORD_LEN;
use vcdb_core::{BackupFrequency, VaultPaths, VaultService};

const PASSWORD_ENV: &str = "VCDB_PASSWORD";
const NEW_PASSWORD_ENV: &str = "VCDB_NEW_PASSWORD";

#[derive(Parser, Debug)]
#[command(author, version, about = "Encrypted contact vault", long_about = None)]
struct Cli {
    /// Data directory (defaults to VCDB_DATA_DIR, then the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new vault
    Init,
    /// Show vault and safe-mode status
    Status,
    /// Check the master password by unlocking the vault
    Unlock,
    /// Change the master password and rotate the database key
    ChangePassword,
    /// Write a backup archive now
    Backup,
    /// List backup archives, newest first
    Backups,
    /// Replace the database with the contents of a backup archive
    Restore { archive: PathBuf },
    /// Delete the database file (a copy is kept in recovery/)
    ResetDb {
        #[arg(long)]
        yes: bool,
    },
    /// Inspect or leave safe mode
    SafeMode {
        #[command(subcommand)]
        action: SafeModeAction,
    },
    /// Write a diagnostics report (no secrets)
    Diagnostics { out: PathBuf },
    /// Show or change preferences
    Prefs {
        #[arg(long)]
        idle_timeout: Option<u32>,
        #[arg(long)]
        lock_on_minimize: Option<bool>,
        #[arg(long)]
        backup_enabled: Option<bool>,
        #[arg(long, value_enum)]
        backup_frequency: Option<Frequency>,
        #[arg(long)]
        max_backups: Option<usize>,
    },
    /// Unlock and keep running scheduled backups until Ctrl-C
    Watch,
}

#[derive(Subcommand, Debug)]
enum SafeModeAction {
    Status,
    Exit,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Frequency {
    Daily,
    Weekly,
}

impl From<Frequency> for BackupFrequency {
    fn from(f: Frequency) -> Self {
        match f {
            Frequency::Daily => BackupFrequency::Daily,
            Frequency::Weekly => BackupFrequency::Weekly,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let paths = match cli.data_dir {
        Some(dir) => VaultPaths::new(dir),
        None => VaultPaths::from_env()?,
    };
    let service = VaultService::open(paths).context("opening vault")?;
    let state = service.start()?;
    if state.safe_mode_enabled {
        warn!(
            reason = ?state.safe_mode_reason,
            "vault is in safe mode; only recovery actions are available"
        );
    }

    let result = run(&service, cli.command).await;
    service.shutdown()?;
    result
}

async fn run(service: &VaultService, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            let password = prompt_password_twice("Create master password: ", PASSWORD_ENV)?;
            service.setup(&password)?;
            println!("Vault created at {}", service.paths().root().display());
        }
        Commands::Status => {
            let recovery = service.safe_mode_status();
            println!("status: {}", service.status());
            println!(
                "safe mode: {}",
                match (recovery.safe_mode_enabled, recovery.safe_mode_reason) {
                    (true, Some(reason)) => format!("on ({reason})"),
                    (true, None) => "on".to_string(),
                    (false, _) => "off".to_string(),
                }
            );
            println!("crash count: {}", recovery.crash_count);
        }
        Commands::Unlock => {
            unlock(service)?;
            println!("Password accepted");
        }
        Commands::ChangePassword => {
            let old = prompt_password_once("Current master password: ", PASSWORD_ENV)?;
            service.unlock(&old)?;
            let new = prompt_password_twice("New master password: ", NEW_PASSWORD_ENV)?;
            service.change_password(&old, &new)?;
            println!("Password changed; database key rotated");
        }
        Commands::Backup => {
            unlock(service)?;
            let backup = service.run_backup()?;
            println!("{}", backup.path.display());
        }
        Commands::Backups => {
            for backup in service.list_backups()? {
                println!(
                    "{}  {:>10} bytes  {}",
                    backup.created_at.to_rfc3339(),
                    backup.size_bytes,
                    backup.file_name
                );
            }
        }
        Commands::Restore { archive } => {
            unlock(service)?;
            let manifest = service.restore_from_backup(&archive)?;
            println!("Restored backup from {}", manifest.created_at.to_rfc3339());
        }
        Commands::ResetDb { yes } => {
            if !yes {
                return Err(anyhow!("refusing to reset without --yes"));
            }
            match service.reset_database()? {
                Some(copy) => println!("Database removed; copy kept at {}", copy.display()),
                None => println!("No database file to remove"),
            }
        }
        Commands::SafeMode { action } => match action {
            SafeModeAction::Status => {
                println!("{}", serde_json::to_string_pretty(&service.safe_mode_status())?);
            }
            SafeModeAction::Exit => {
                service.exit_safe_mode()?;
                println!("Safe mode cleared");
            }
        },
        Commands::Diagnostics { out } => {
            service.export_diagnostics(&out)?;
            println!("Diagnostics written to {}", out.display());
        }
        Commands::Prefs {
            idle_timeout,
            lock_on_minimize,
            backup_enabled,
            backup_frequency,
            max_backups,
        } => {
            let record = if idle_timeout.is_some() || lock_on_minimize.is_some() {
                service.update_preferences(idle_timeout, lock_on_minimize)?
            } else {
                service.preferences()?
            };
            let backups = if backup_enabled.is_some()
                || backup_frequency.is_some()
                || max_backups.is_some()
            {
                service.backups().update_settings(
                    backup_enabled,
                    backup_frequency.map(Into::into),
                    max_backups,
                )?
            } else {
                service.backups().settings()
            };
            println!("idle timeout: {} min", record.idle_timeout_minutes);
            println!("lock on minimize: {}", record.lock_on_minimize);
            println!("{}", serde_json::to_string_pretty(&backups)?);
        }
        Commands::Watch => {
            unlock(service)?;
            info!("vault unlocked; backup scheduler running");
            let mut idle_check = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => break,
                    _ = idle_check.tick() => {
                        if service.check_idle(Utc::now())? {
                            info!("locked after idle timeout");
                            break;
                        }
                    }
                }
            }
            info!("watch stopping");
        }
    }
    Ok(())
}

fn unlock(service: &VaultService) -> Result<()> {
    let password = prompt_password_once("Master password: ", PASSWORD_ENV)?;
    service.unlock(&password)?;
    Ok(())
}

fn prompt_password_once(prompt: &str, env: &str) -> Result<String> {
    if let Ok(pw) = std::env::var(env) {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))
}

fn prompt_password_twice(prompt: &str, env: &str) -> Result<String> {
    if let Ok(pw) = std::env::var(env) {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    let first = prompt_password_once(prompt, env)?;
    if first.chars().count() < MIN_PASSWORD_LEN {
        return Err(anyhow!(
            "password too short; minimum {MIN_PASSWORD_LEN} characters"
        ));
    }
    let second = rpassword::prompt_password("Confirm password: ")
        .map_err(|e| anyhow!("password prompt: {e}"))?;
    if first != second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}
