use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden_core::{paths, WardenSettings};
use warden_trust::{checksum_async, detect_signature_verifier, ArtifactTrustVerifier};

#[derive(Parser, Debug)]
#[command(author, version, about = "Model artifact integrity gate", long_about = None)]
struct Cli {
    /// Directory holding the trust registries (defaults to WARDEN_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the SHA-256 of a file
    Checksum { path: PathBuf },
    /// Check a file against an expected or pinned digest (fail closed)
    Verify {
        path: PathBuf,
        #[arg(long)]
        expected: Option<String>,
    },
    /// Run every check and print the result as JSON
    Validate {
        path: PathBuf,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        publisher: Option<String>,
        #[arg(long)]
        expected: Option<String>,
    },
    /// Manage the trusted-source registry
    Sources {
        #[command(subcommand)]
        action: SourceCommands,
    },
    /// Manage pinned checksums
    Checksums {
        #[command(subcommand)]
        action: ChecksumCommands,
    },
}

#[derive(Subcommand, Debug)]
enum SourceCommands {
    List,
    Add {
        domain: String,
        #[arg(long)]
        require_signature: bool,
        #[arg(long = "publisher")]
        publishers: Vec<String>,
    },
    Remove { domain: String },
    Enable { domain: String },
    Disable { domain: String },
}

#[derive(Subcommand, Debug)]
enum ChecksumCommands {
    Store {
        name: String,
        digest: String,
        #[arg(long)]
        source: Option<String>,
    },
    Import { path: PathBuf },
    Export { path: PathBuf },
    Remove { name: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let data_dir = cli.data_dir;

    match cli.command {
        Commands::Checksum { path } => {
            println!("{}", checksum_async(path).await?);
        }
        Commands::Verify { path, expected } => {
            let verifier = open_verifier(data_dir)?;
            let outcome = verifier
                .verify_checksum(&path, expected.as_deref())
                .with_context(|| format!("verifying {}", path.display()))?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Commands::Validate {
            path,
            source,
            publisher,
            expected,
        } => {
            let verifier = open_verifier(data_dir)?;
            let result = verifier.validate_before_load(
                &path,
                source.as_deref(),
                publisher.as_deref(),
                expected.as_deref(),
            );
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.valid {
                bail!("artifact rejected: {}", result.errors.join("; "));
            }
        }
        Commands::Sources { action } => {
            let verifier = open_verifier(data_dir)?;
            sources_command(&verifier, action)?;
        }
        Commands::Checksums { action } => {
            let verifier = open_verifier(data_dir)?;
            checksums_command(&verifier, action)?;
        }
    }
    Ok(())
}

fn sources_command(verifier: &ArtifactTrustVerifier, action: SourceCommands) -> Result<()> {
    match action {
        SourceCommands::List => {
            println!("{}", serde_json::to_string_pretty(&verifier.list_trusted_sources())?);
        }
        SourceCommands::Add {
            domain,
            require_signature,
            publishers,
        } => {
            let src = verifier.add_trusted_source(&domain, require_signature, &publishers)?;
            println!("{}", serde_json::to_string_pretty(&src)?);
        }
        SourceCommands::Remove { domain } => {
            if !verifier.remove_trusted_source(&domain)? {
                bail!("unknown source {domain}");
            }
        }
        SourceCommands::Enable { domain } => set_enabled(verifier, &domain, true)?,
        SourceCommands::Disable { domain } => set_enabled(verifier, &domain, false)?,
    }
    Ok(())
}

fn checksums_command(verifier: &ArtifactTrustVerifier, action: ChecksumCommands) -> Result<()> {
    match action {
        ChecksumCommands::Store {
            name,
            digest,
            source,
        } => verifier.store_checksum(&name, &digest, source.as_deref())?,
        ChecksumCommands::Import { path } => {
            let summary = verifier.import_checksums(&path)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        ChecksumCommands::Export { path } => {
            let count = verifier.export_checksums(&path)?;
            info!(count, path = %path.display(), "export complete");
            println!("{count}");
        }
        ChecksumCommands::Remove { name } => {
            if !verifier.remove_checksum(&name)? {
                bail!("no checksum pinned for {name}");
            }
        }
    }
    Ok(())
}

fn open_verifier(data_dir: Option<PathBuf>) -> Result<ArtifactTrustVerifier> {
    let data_dir = match data_dir {
        Some(d) => d,
        None => paths::data_dir()?,
    };
    let settings = WardenSettings::load(&data_dir.join("config.json"))?;
    let signatures = detect_signature_verifier(&settings.trust.signing_keys);
    let verifier = ArtifactTrustVerifier::open(
        &data_dir.join("trusted_sources.json"),
        &data_dir.join("model_checksums.json"),
        signatures,
    )?;
    Ok(verifier)
}

fn set_enabled(verifier: &ArtifactTrustVerifier, domain: &str, enabled: bool) -> Result<()> {
    if !verifier.set_source_enabled(domain, enabled)? {
        bail!("unknown source {domain}");
    }
    Ok(())
}
