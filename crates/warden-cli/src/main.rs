use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use warden_core::credential::MIN_PASSPHRASE_LEN;
use warden_core::vault::ExportedSecret;
use warden_core::{paths, CredentialManager, EncryptionService, SecretStore, SecretVault, WardenSettings};

const PASSPHRASE_ENV: &str = "WARDEN_PASSPHRASE";
const PASSPHRASE_CONFIRM_ENV: &str = "WARDEN_PASSPHRASE_CONFIRM";
const NEW_PASSPHRASE_ENV: &str = "WARDEN_NEW_PASSPHRASE";

#[derive(Parser, Debug)]
#[command(author, version, about = "Warden local secret manager", long_about = None)]
struct Cli {
    /// Data directory (defaults to WARDEN_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the master credential
    Init,
    /// Change the master passphrase
    Passwd,
    /// Show credential and session state
    Status,
    /// Encrypted application settings
    Setting {
        #[command(subcommand)]
        action: SettingCommands,
    },
    /// Stored website/service passwords
    Password {
        #[command(subcommand)]
        action: PasswordCommands,
    },
    /// API keys kept in the encrypted database
    Apikey {
        #[command(subcommand)]
        action: ApiKeyCommands,
    },
    /// Conversation transcripts
    History {
        #[command(subcommand)]
        action: HistoryCommands,
    },
    /// Named secrets in the OS keyring
    Secret {
        #[command(subcommand)]
        action: SecretCommands,
    },
    /// Write an encrypted snapshot of the database
    Backup { dest: PathBuf },
    /// Replace the database with a backup
    Restore { src: PathBuf },
}

#[derive(Subcommand, Debug)]
enum SettingCommands {
    Get { key: String },
    /// VALUE is parsed as JSON, falling back to a plain string
    Set { key: String, value: String },
    Delete { key: String },
    List,
}

#[derive(Subcommand, Debug)]
enum PasswordCommands {
    Add {
        service: String,
        username: String,
        /// Prompted for when omitted
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    Get {
        service: String,
        username: Option<String>,
    },
    List,
    Delete {
        service: String,
        username: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ApiKeyCommands {
    Add {
        service: String,
        #[arg(long)]
        key: Option<String>,
        /// JSON object
        #[arg(long)]
        metadata: Option<String>,
    },
    Get { service: String },
    List,
    Delete { service: String },
}

#[derive(Subcommand, Debug)]
enum HistoryCommands {
    Add {
        conversation: String,
        role: String,
        content: String,
        #[arg(long)]
        mode: Option<String>,
    },
    Show {
        conversation: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    List,
    Delete { conversation: String },
}

#[derive(Subcommand, Debug)]
enum SecretCommands {
    Put {
        name: String,
        #[arg(long)]
        value: Option<String>,
        #[arg(long)]
        metadata: Option<String>,
    },
    Get { name: String },
    Delete { name: String },
    List,
    Preview { name: String },
    Export {
        #[arg(long)]
        include_values: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Import { path: PathBuf },
    Clear,
}

struct App {
    data_dir: PathBuf,
    settings: WardenSettings,
    credentials: Arc<CredentialManager>,
}

/// Logs out when dropped so every exit path clears the key.
struct Unlocked<'a>(&'a CredentialManager);

impl Drop for Unlocked<'_> {
    fn drop(&mut self) {
        self.0.logout();
    }
}

impl App {
    fn open(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        warden_core::fsutil::restrict_dir_permissions(&data_dir);
        let settings = WardenSettings::load(&data_dir.join("config.json"))?;
        let encryption = Arc::new(EncryptionService::with_iterations(settings.kdf.iterations));
        let credentials = Arc::new(CredentialManager::open(
            data_dir.join("master.json"),
            encryption,
            &settings,
        )?);
        Ok(Self {
            data_dir,
            settings,
            credentials,
        })
    }

    fn unlock(&self) -> Result<Unlocked<'_>> {
        if !self.credentials.has_master_credential() {
            bail!("no master credential; run `warden init` first");
        }
        let pass = prompt_passphrase_once("Master passphrase: ", PASSPHRASE_ENV)?;
        if !self.credentials.verify_and_unlock(&pass) {
            bail!("unlock failed");
        }
        self.credentials.touch_activity();
        Ok(Unlocked(&self.credentials))
    }

    fn store(&self) -> Result<SecretStore> {
        Ok(SecretStore::open(
            &self.data_dir.join("warden.db"),
            self.credentials.clone(),
        )?)
    }

    fn vault(&self) -> Result<SecretVault> {
        Ok(SecretVault::open_os(
            &self.settings.vault.service_namespace,
            self.credentials.clone(),
        )?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let data_dir = match cli.data_dir {
        Some(d) => d,
        None => paths::data_dir()?,
    };
    let app = App::open(data_dir)?;

    match cli.command {
        Commands::Init => init_command(&app),
        Commands::Passwd => passwd_command(&app),
        Commands::Status => {
            let info = app.credentials.session_info();
            print_json(&serde_json::json!({
                "data_dir": app.data_dir,
                "has_master_credential": app.credentials.has_master_credential(),
                "state": info.state,
                "session_timeout_secs": info.timeout.as_secs(),
            }))
        }
        Commands::Setting { action } => {
            let _session = app.unlock()?;
            setting_command(&app.store()?, action)
        }
        Commands::Password { action } => {
            let _session = app.unlock()?;
            password_command(&app.store()?, action)
        }
        Commands::Apikey { action } => {
            let _session = app.unlock()?;
            apikey_command(&app.store()?, action)
        }
        Commands::History { action } => {
            let _session = app.unlock()?;
            history_command(&app.store()?, action)
        }
        Commands::Secret { action } => {
            let _session = app.unlock()?;
            secret_command(&app.vault()?, action)
        }
        Commands::Backup { dest } => {
            let _session = app.unlock()?;
            let store = app.store()?;
            let out = tokio::task::spawn_blocking(move || store.backup(&dest))
                .await
                .map_err(|e| anyhow!("backup task: {e}"))??;
            println!("{}", out.display());
            Ok(())
        }
        Commands::Restore { src } => {
            let _session = app.unlock()?;
            let store = app.store()?;
            tokio::task::spawn_blocking(move || store.restore(&src))
                .await
                .map_err(|e| anyhow!("restore task: {e}"))??;
            println!("restored");
            Ok(())
        }
    }
}

fn init_command(app: &App) -> Result<()> {
    if app.credentials.has_master_credential() {
        bail!(
            "master credential already exists at {}",
            app.credentials.credential_path().display()
        );
    }
    let config = app.data_dir.join("config.json");
    if !config.exists() {
        app.settings.save(&config)?;
    }
    let pass = prompt_passphrase_twice("Create master passphrase: ", PASSPHRASE_ENV)?;
    app.credentials.set_master_credential(&pass)?;
    info!(data_dir = %app.data_dir.display(), "initialized");
    println!("Master credential created in {}", app.data_dir.display());
    Ok(())
}

fn passwd_command(app: &App) -> Result<()> {
    if !app.credentials.has_master_credential() {
        bail!("no master credential; run `warden init` first");
    }
    let old = prompt_passphrase_once("Current passphrase: ", PASSPHRASE_ENV)?;
    let new = prompt_passphrase_twice("New passphrase: ", NEW_PASSPHRASE_ENV)?;
    let changed = app.credentials.change_master_credential(&old, &new);
    app.credentials.logout();
    if !changed? {
        bail!("current passphrase rejected");
    }
    println!("Master passphrase changed");
    Ok(())
}

fn setting_command(store: &SecretStore, action: SettingCommands) -> Result<()> {
    match action {
        SettingCommands::Get { key } => match store.get_setting_value(&key)? {
            Some(v) => print_json(&v),
            None => bail!("setting {key} not found"),
        },
        SettingCommands::Set { key, value } => {
            let parsed: Value =
                serde_json::from_str(&value).unwrap_or_else(|_| Value::String(value.clone()));
            store.set_setting(&key, &parsed)?;
            Ok(())
        }
        SettingCommands::Delete { key } => {
            if !store.delete_setting(&key)? {
                bail!("setting {key} not found");
            }
            Ok(())
        }
        SettingCommands::List => {
            for key in store.list_setting_keys()? {
                println!("{key}");
            }
            Ok(())
        }
    }
}

fn password_command(store: &SecretStore, action: PasswordCommands) -> Result<()> {
    match action {
        PasswordCommands::Add {
            service,
            username,
            password,
            url,
            notes,
        } => {
            let password = match password {
                Some(p) => Zeroizing::new(p),
                None => prompt_secret(&format!("Password for {username}@{service}: "))?,
            };
            store.store_password(&service, &username, &password, url.as_deref(), notes.as_deref())?;
            Ok(())
        }
        PasswordCommands::Get { service, username } => {
            match store.get_password(&service, username.as_deref())? {
                Some(entry) => print_json(&entry),
                None => bail!("no password stored for {service}"),
            }
        }
        PasswordCommands::List => print_json(&store.list_passwords()?),
        PasswordCommands::Delete { service, username } => {
            let removed = store.delete_password(&service, username.as_deref())?;
            if removed == 0 {
                bail!("no password stored for {service}");
            }
            println!("{removed}");
            Ok(())
        }
    }
}

fn apikey_command(store: &SecretStore, action: ApiKeyCommands) -> Result<()> {
    match action {
        ApiKeyCommands::Add {
            service,
            key,
            metadata,
        } => {
            let key = match key {
                Some(k) => Zeroizing::new(k),
                None => prompt_secret(&format!("API key for {service}: "))?,
            };
            let metadata = parse_metadata(metadata.as_deref())?;
            store.store_api_key(&service, &key, metadata.as_ref())?;
            Ok(())
        }
        ApiKeyCommands::Get { service } => match store.get_api_key(&service)? {
            Some(record) => print_json(&record),
            None => bail!("no API key stored for {service}"),
        },
        ApiKeyCommands::List => print_json(&store.list_api_keys()?),
        ApiKeyCommands::Delete { service } => {
            if !store.delete_api_key(&service)? {
                bail!("no API key stored for {service}");
            }
            Ok(())
        }
    }
}

fn history_command(store: &SecretStore, action: HistoryCommands) -> Result<()> {
    match action {
        HistoryCommands::Add {
            conversation,
            role,
            content,
            mode,
        } => {
            let id = store.store_conversation_message(&conversation, &role, &content, mode.as_deref(), None)?;
            println!("{id}");
            Ok(())
        }
        HistoryCommands::Show {
            conversation,
            limit,
        } => print_json(&store.get_conversation_history(&conversation, limit)?),
        HistoryCommands::List => print_json(&store.list_conversations()?),
        HistoryCommands::Delete { conversation } => {
            println!("{}", store.delete_conversation(&conversation)?);
            Ok(())
        }
    }
}

fn secret_command(vault: &SecretVault, action: SecretCommands) -> Result<()> {
    match action {
        SecretCommands::Put {
            name,
            value,
            metadata,
        } => {
            let value = match value {
                Some(v) => Zeroizing::new(v),
                None => prompt_secret(&format!("Value for {name}: "))?,
            };
            vault.store_secret(&name, &value, parse_metadata(metadata.as_deref())?)?;
            Ok(())
        }
        SecretCommands::Get { name } => match vault.get_secret(&name)? {
            Some(secret) => {
                println!("{}", secret.value);
                Ok(())
            }
            None => bail!("secret {name} not found"),
        },
        SecretCommands::Delete { name } => {
            if !vault.delete_secret(&name)? {
                bail!("secret {name} not found");
            }
            Ok(())
        }
        SecretCommands::List => {
            for name in vault.list_names()? {
                println!("{name}");
            }
            Ok(())
        }
        SecretCommands::Preview { name } => print_json(&vault.get_secret_preview(&name)?),
        SecretCommands::Export {
            include_values,
            out,
        } => {
            let exported = vault.export(include_values)?;
            match out {
                Some(path) => {
                    warden_core::fsutil::write_json_atomic(&path, &exported)?;
                    println!("{}", exported.len());
                    Ok(())
                }
                None => print_json(&exported),
            }
        }
        SecretCommands::Import { path } => {
            let records = read_import(&path)?;
            let report = vault.import(records)?;
            print_json(&report)?;
            if !report.failed.is_empty() {
                bail!("{} secrets failed to import", report.failed.len());
            }
            Ok(())
        }
        SecretCommands::Clear => {
            if !vault.clear_all()? {
                bail!("some secrets could not be removed; see log");
            }
            Ok(())
        }
    }
}

fn read_import(path: &Path) -> Result<BTreeMap<String, ExportedSecret>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn parse_metadata(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|m| serde_json::from_str(m).context("metadata must be JSON"))
        .transpose()
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn prompt_secret(prompt: &str) -> Result<Zeroizing<String>> {
    let value = rpassword::prompt_password(prompt).map_err(|e| anyhow!("prompt: {e}"))?;
    Ok(Zeroizing::new(value))
}

fn prompt_passphrase_once(prompt: &str, env: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(env) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    prompt_secret(prompt)
}

fn prompt_passphrase_twice(prompt: &str, env: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(env) {
        if !pw.is_empty() {
            if let Ok(confirm) = std::env::var(PASSPHRASE_CONFIRM_ENV) {
                if confirm != pw {
                    bail!("passphrase confirmation mismatch");
                }
            }
            return Ok(Zeroizing::new(pw));
        }
    }
    let first = prompt_secret(prompt)?;
    if first.chars().count() < MIN_PASSPHRASE_LEN {
        bail!("passphrase too short; minimum {MIN_PASSPHRASE_LEN} characters");
    }
    let second = prompt_secret("Confirm passphrase: ")?;
    if *first != *second {
        bail!("passphrases do not match");
    }
    Ok(first)
}
