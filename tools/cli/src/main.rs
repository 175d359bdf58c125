//! PhantomVault CLI - Command line interface for folder vault operations.
//!
//! This tool provides a command-line interface for managing profiles and
//! locking, unlocking and recovering folders.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

use phantomvault_common::{FolderId, ProfileId, UnlockMode};
use phantomvault_vault::{
    Credential, FolderRef, LockRequest, ServiceConfig, UnlockRequest, VaultService, VaultWorker,
};

#[derive(Parser)]
#[command(name = "phantomvault")]
#[command(about = "PhantomVault - Encrypted folder vaults")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Vault storage root (default: ~/.phantom_vault_storage).
    #[arg(long, env = "PHANTOMVAULT_ROOT", global = true)]
    root: Option<PathBuf>,

    /// JSON configuration file. Overrides --root.
    #[arg(long, env = "PHANTOMVAULT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Profile id to act as (default: the active profile).
    #[arg(short, long, global = true)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Temporary,
    Permanent,
}

impl From<ModeArg> for UnlockMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Temporary => UnlockMode::Temporary,
            ModeArg::Permanent => UnlockMode::Permanent,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new profile.
    CreateProfile {
        /// Profile name.
        #[arg(short, long)]
        name: String,
    },

    /// List profiles.
    Profiles {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Make a profile the active one.
    Activate {
        /// Profile id.
        id: String,
    },

    /// Lock a folder. Registers it on first use.
    Lock {
        /// Folder path, or folder id of a registered folder.
        folder: String,

        /// Give the folder its own password instead of the profile's.
        #[arg(long)]
        custom_password: bool,
    },

    /// Unlock a folder.
    Unlock {
        /// Folder path or folder id.
        folder: String,

        /// Unlock mode.
        #[arg(short, long, value_enum, default_value = "temporary")]
        mode: ModeArg,

        /// Confirm a permanent unlock.
        #[arg(short, long)]
        yes: bool,

        /// Authenticate with a recovery key instead of a password.
        #[arg(long)]
        recovery_key: bool,

        /// Give up and roll back after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Change the profile password and re-encrypt locked folders.
    ChangePassword,

    /// Finish re-encryption left over from a password change.
    ResumeRekey,

    /// List the profile's folders.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Check a folder's vault copy against its recorded digest.
    Verify {
        /// Folder path or folder id.
        folder: String,
    },

    /// Replace a damaged vault copy with its newest usable backup.
    Restore {
        /// Folder path or folder id.
        folder: String,

        /// Authenticate with a recovery key instead of a password.
        #[arg(long)]
        recovery_key: bool,
    },

    /// Apply the backup retention policy to a folder now.
    CleanBackups {
        /// Folder path or folder id.
        folder: String,
    },

    /// Show the profile's recovery key.
    RecoveryKey,

    /// Delete a profile with all of its vaults and backups.
    RemoveProfile {
        /// Confirm the removal.
        #[arg(short, long)]
        yes: bool,
    },

    /// Print shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "phantomvault", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let service = Arc::new(VaultService::open(config).context("Failed to open vault storage")?);
    let worker = VaultWorker::new(Arc::clone(&service));
    let profile = cli.profile.clone();

    match cli.command {
        Commands::CreateProfile { name } => cmd_create_profile(&service, profile, &name),
        Commands::Profiles { json } => cmd_profiles(&service, json),
        Commands::Activate { id } => cmd_activate(&service, &id),
        Commands::Lock {
            folder,
            custom_password,
        } => cmd_lock(&worker, profile, &folder, custom_password).await,
        Commands::Unlock {
            folder,
            mode,
            yes,
            recovery_key,
            timeout,
        } => cmd_unlock(&worker, profile, &folder, mode.into(), yes, recovery_key, timeout).await,
        Commands::ChangePassword => cmd_change_password(&worker, profile).await,
        Commands::ResumeRekey => cmd_resume_rekey(&worker, profile).await,
        Commands::List { json } => cmd_list(&service, profile, json),
        Commands::Verify { folder } => cmd_verify(&service, profile, &folder),
        Commands::Restore {
            folder,
            recovery_key,
        } => cmd_restore(&worker, profile, &folder, recovery_key).await,
        Commands::CleanBackups { folder } => cmd_clean_backups(&service, profile, &folder),
        Commands::RecoveryKey => cmd_recovery_key(&service, profile),
        Commands::RemoveProfile { yes } => cmd_remove_profile(&service, profile, yes),
        Commands::Completions { .. } => Ok(()),
    }
}

fn load_config(cli: &Cli) -> Result<ServiceConfig> {
    if let Some(path) = &cli.config {
        return ServiceConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .context("Cannot determine the OS user (set USER)")?;
    match &cli.root {
        Some(root) => Ok(ServiceConfig::new(root, username)),
        None => ServiceConfig::for_user(username).context("Failed to locate the home directory"),
    }
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password))
}

/// Prompt twice and insist on a match.
fn prompt_new_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = prompt_password(prompt)?;
    let confirm = prompt_password("Confirm password: ")?;
    if password != confirm {
        anyhow::bail!("Passwords do not match");
    }
    Ok(password)
}

fn prompt_credential(recovery_key: bool) -> Result<Credential> {
    if recovery_key {
        let key = prompt_password("Enter recovery key: ")?;
        Ok(Credential::recovery_key(key.as_str()))
    } else {
        let password = prompt_password("Enter password: ")?;
        Ok(Credential::password(password.as_str()))
    }
}

/// The explicit profile, or the active one.
fn resolve_profile(service: &VaultService, profile: Option<String>) -> Result<ProfileId> {
    match profile {
        Some(id) => ProfileId::new(id).context("Invalid profile id"),
        None => service
            .active_profile()?
            .map(|p| p.id)
            .context("No active profile; pass --profile or run create-profile"),
    }
}

/// Existing paths are folder paths; anything else is a folder id unless it
/// looks like a path.
fn folder_ref(folder: &str) -> Result<FolderRef> {
    let path = PathBuf::from(folder);
    if path.exists() || path.components().count() > 1 {
        return Ok(FolderRef::Path(path));
    }
    Ok(FolderRef::Id(FolderId::new(folder).context("Invalid folder id")?))
}

/// Create a new profile.
fn cmd_create_profile(service: &VaultService, profile: Option<String>, name: &str) -> Result<()> {
    info!("Creating profile: {}", name);

    let grant = match service.bootstrap_grant() {
        Ok(grant) => grant,
        Err(_) => {
            let admin = resolve_profile(service, profile)?;
            let password = prompt_password(&format!("Password of existing profile {}: ", admin))?;
            service
                .admin_grant(&admin, &password)
                .context("Not authorized to create profiles")?
        }
    };

    let password = prompt_new_password("New profile password: ")?;
    let created = service
        .create_profile(&grant, name, &password)
        .context("Failed to create profile")?;

    println!("Profile created successfully!");
    println!("  ID: {}", created.profile_id);
    println!("  Recovery key: {}", created.recovery_key.as_str());
    println!("\nStore the recovery key somewhere safe. It will not be shown again.");

    Ok(())
}

fn cmd_profiles(service: &VaultService, json: bool) -> Result<()> {
    let profiles = service.list_profiles()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        return Ok(());
    }
    if profiles.is_empty() {
        println!("No profiles.");
    }
    for p in profiles {
        let marker = if p.is_active { "*" } else { " " };
        let pending = if p.rekey_pending { " (re-encryption pending)" } else { "" };
        println!(
            "{} {}  {}  created {}{}",
            marker,
            p.id,
            p.name,
            p.created_at.format("%Y-%m-%d %H:%M"),
            pending
        );
    }
    Ok(())
}

fn cmd_activate(service: &VaultService, id: &str) -> Result<()> {
    let id = ProfileId::new(id).context("Invalid profile id")?;
    let password = prompt_password("Enter password: ")?;
    service
        .set_active_profile(&id, &password)
        .context("Failed to activate profile")?;
    println!("Active profile: {}", id);
    Ok(())
}

/// Lock a folder, registering it first if needed.
async fn cmd_lock(worker: &VaultWorker, profile: Option<String>, folder: &str, custom_password: bool) -> Result<()> {
    let profile = resolve_profile(worker.service(), profile)?;
    let target = folder_ref(folder)?;
    let registered = match &target {
        FolderRef::Id(_) => true,
        FolderRef::Path(path) => worker
            .service()
            .list_folders(&profile)?
            .iter()
            .any(|f| std::fs::canonicalize(path).map(|p| p == f.folder_path).unwrap_or(false)),
    };

    if registered {
        let credential = prompt_credential(false)?;
        let report = worker
            .lock(LockRequest::new(profile, target, credential))
            .await
            .context("Failed to lock folder")?;
        println!("Folder locked ({} bytes).", report.bytes_processed);
        return Ok(());
    }

    let FolderRef::Path(path) = target else {
        anyhow::bail!("Unknown folder: {}", folder);
    };
    info!("Registering and locking {}", path.display());
    let credential = prompt_credential(false)?;
    let custom = if custom_password {
        Some(prompt_new_password("Folder password: ")?.to_string())
    } else {
        None
    };
    let locked = worker
        .lock_new(profile, path, credential, custom, Default::default())
        .await
        .context("Failed to lock folder")?;

    println!("Folder locked successfully!");
    println!("  ID: {}", locked.folder_id);
    println!("  Vault: {}", locked.vault_path.display());
    if let Some(key) = &locked.custom_recovery_key {
        println!("  Folder recovery key: {}", key.as_str());
    }
    Ok(())
}

async fn cmd_unlock(
    worker: &VaultWorker,
    profile: Option<String>,
    folder: &str,
    mode: UnlockMode,
    yes: bool,
    recovery_key: bool,
    timeout: Option<u64>,
) -> Result<()> {
    if mode == UnlockMode::Permanent && !yes {
        anyhow::bail!("Permanent unlock removes the folder from the vault; pass --yes to confirm");
    }
    let profile = resolve_profile(worker.service(), profile)?;
    let credential = prompt_credential(recovery_key)?;
    let mut request = UnlockRequest::new(profile, folder_ref(folder)?, credential, mode);
    if yes {
        request = request.confirmed();
    }

    let report = match timeout {
        Some(secs) => {
            worker
                .unlock_with_timeout(request, std::time::Duration::from_secs(secs))
                .await
        }
        None => worker.unlock(request).await,
    }
    .context("Failed to unlock folder")?;

    println!("Folder unlocked ({}, {} bytes).", mode, report.bytes_processed);
    Ok(())
}

/// Change the profile password.
async fn cmd_change_password(worker: &VaultWorker, profile: Option<String>) -> Result<()> {
    info!("Changing profile password");
    let profile = resolve_profile(worker.service(), profile)?;

    let old_password = prompt_password("Enter current password: ")?;
    let new_password = prompt_new_password("Enter new password: ")?;

    let changed = worker
        .change_password(profile, old_password.to_string(), new_password.to_string())
        .await
        .context("Failed to change password")?;

    println!("Password changed successfully!");
    println!("  New recovery key: {}", changed.recovery_key.as_str());
    println!("  Folders re-encrypted: {}", changed.rekey.rekeyed.len());
    for (id, reason) in &changed.rekey.failures {
        println!("  Pending: {} ({})", id, reason);
    }
    if !changed.rekey.is_complete() {
        println!("\nRun resume-rekey to finish the remaining folders.");
    }
    Ok(())
}

async fn cmd_resume_rekey(worker: &VaultWorker, profile: Option<String>) -> Result<()> {
    let profile = resolve_profile(worker.service(), profile)?;
    let password = prompt_password("Enter password: ")?;
    let outcome = worker
        .resume_rekey(profile, password.to_string())
        .await
        .context("Failed to resume re-encryption")?;

    println!("Folders re-encrypted: {}", outcome.rekeyed.len());
    for (id, reason) in &outcome.failures {
        println!("  Still pending: {} ({})", id, reason);
    }
    Ok(())
}

fn cmd_list(service: &VaultService, profile: Option<String>, json: bool) -> Result<()> {
    let profile = resolve_profile(service, profile)?;
    let folders = service.list_folders(&profile)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&folders)?);
        return Ok(());
    }
    if folders.is_empty() {
        println!("No folders.");
    }
    for f in folders {
        let state = match (f.is_locked, f.unlock_mode) {
            (true, _) => "locked".to_string(),
            (false, Some(mode)) => format!("unlocked ({})", mode),
            (false, None) => "unlocked".to_string(),
        };
        println!("{}  {}  {}  [{}]", f.id, f.folder_name, f.folder_path.display(), state);
    }
    Ok(())
}

fn cmd_verify(service: &VaultService, profile: Option<String>, folder: &str) -> Result<()> {
    let profile = resolve_profile(service, profile)?;
    service
        .verify_folder(&profile, &folder_ref(folder)?)
        .context("Verification failed")?;
    println!("Folder verified.");
    Ok(())
}

async fn cmd_restore(worker: &VaultWorker, profile: Option<String>, folder: &str, recovery_key: bool) -> Result<()> {
    let profile = resolve_profile(worker.service(), profile)?;
    let target = folder_ref(folder)?;
    let credential = prompt_credential(recovery_key)?;
    let report = worker
        .run(move |service| service.restore_from_backup(&profile, &target, &credential, Default::default()))
        .await
        .context("Failed to restore from backup")?;
    println!("Vault restored from backup ({} bytes).", report.bytes_processed);
    Ok(())
}

fn cmd_clean_backups(service: &VaultService, profile: Option<String>, folder: &str) -> Result<()> {
    let profile = resolve_profile(service, profile)?;
    let removed = service
        .clean_backups(&profile, &folder_ref(folder)?)
        .context("Failed to clean backups")?;
    println!("Removed {} old backup(s).", removed);
    Ok(())
}

fn cmd_recovery_key(service: &VaultService, profile: Option<String>) -> Result<()> {
    let profile = resolve_profile(service, profile)?;
    let password = prompt_password("Enter password: ")?;
    let key = service
        .reveal_recovery_key(&profile, &password)
        .context("Failed to read recovery key")?;
    println!("Recovery key: {}", key.as_str());
    Ok(())
}

fn cmd_remove_profile(service: &VaultService, profile: Option<String>, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Removing a profile destroys its locked folders; pass --yes to confirm");
    }
    let profile = resolve_profile(service, profile)?;
    let credential = prompt_credential(false)?;
    service
        .remove_profile(&profile, &credential, yes)
        .context("Failed to remove profile")?;
    println!("Profile {} removed.", profile);
    Ok(())
}
