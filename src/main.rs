use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use keyslot::{
    config::StoreConfig,
    fingerprint::{FingerprintCollector, SystemSignals},
    integrity::{LogObserver, PurgeOutcome},
    medium::FileMedium,
    vault::Vault,
};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyslot")]
#[command(about = "Device-scoped local storage for the password generator.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding store.json
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Screen size reported by the UI, e.g. 1920x1080
    #[arg(short, long, value_parser = parse_screen)]
    screen: Option<(u32, u32)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the device fingerprint and the derived storage key
    Key,
    /// Print the stored payload, recovering it if needed
    Show,
    /// Set one application field
    Set {
        name: String,
        /// JSON value; anything that does not parse is stored as a string
        value: String,
    },
    /// Run one integrity pass
    Check,
    /// Recover data left under a previous fingerprint
    Recover,
    /// Write an export bundle
    Export { path: PathBuf },
    /// Merge an export bundle into the current data
    Import { path: PathBuf },
    /// Delete pre-versioning data once it has been migrated
    PurgeLegacy,
    /// Keep running integrity passes on the configured schedule
    Watch,
}

fn parse_screen(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s}"))?;
    let w = w.trim().parse().map_err(|_| format!("bad width: {w}"))?;
    let h = h.trim().parse().map_err(|_| format!("bad height: {h}"))?;
    Ok((w, h))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    config = config.apply_env()?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }

    let mut signals = SystemSignals::new();
    if let Some((w, h)) = cli.screen {
        signals = signals.with_screen(w, h);
    }
    let signals = Arc::new(signals);

    let data_file = config.data_file();
    let medium = FileMedium::open(&data_file, config.capacity_bytes)
        .with_context(|| format!("opening {}", data_file.display()))?;
    let vault = Vault::open(config, Box::new(medium), signals.clone()).await?;
    info!("🔐 Store ready at {}", data_file.display());

    match cli.command {
        Commands::Key => {
            let fingerprint = FingerprintCollector::new(signals).collect()?;
            println!("🖥️  Device fingerprint");
            println!("{}", "─".repeat(50));
            println!("🆔 Id: {}", fingerprint.id());
            println!("🧾 Canonical: {}", fingerprint.canonical());
            println!("🔑 Storage key: {}", vault.current_key());
            if vault.keys().is_degraded() {
                println!("⚠️  Keys use the rolling hash (secure digest disabled)");
            }
        }
        Commands::Show => match vault.load().await {
            Some(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
            None => println!("📭 No data stored for this device"),
        },
        Commands::Set { name, value } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            if !vault.update_field(&name, value).await.is_written() {
                bail!("could not write field {name}");
            }
            println!("✅ Saved {name}");
        }
        Commands::Check => {
            let report = vault.integrity().perform_integrity_check().await;
            println!("🩺 Integrity check");
            println!("{}", "─".repeat(50));
            println!("{} Valid: {}", if report.valid { "✅" } else { "⚠️ " }, report.valid);
            println!("🧹 Cleaned entries: {}", report.cleaned_entries);
            println!("📦 Migrated entries: {}", report.migrated_entries);
            for issue in &report.issues {
                println!("   • {issue}");
            }
        }
        Commands::Recover => {
            let outcome = vault.recovery().attempt_data_recovery().await;
            match (&outcome.recovered_from, outcome.data_found) {
                (Some(from), _) => println!("♻️  Recovered data from {from}"),
                (None, true) => println!("✅ Data already present, nothing to recover"),
                (None, false) => println!("📭 No previous data found"),
            }
        }
        Commands::Export { path } => {
            let bundle = vault
                .transfer()
                .export_to_file(&path)
                .await
                .with_context(|| format!("exporting to {}", path.display()))?;
            println!("📤 Exported {} fields to {}", bundle.payload.fields.len(), path.display());
        }
        Commands::Import { path } => {
            let imported = vault
                .transfer()
                .import_from_file(&path)
                .await
                .with_context(|| format!("importing {}", path.display()))?;
            if !imported {
                bail!("{} is not a valid export bundle", path.display());
            }
            println!("📥 Imported {}", path.display());
        }
        Commands::PurgeLegacy => match vault.integrity().purge_legacy().await {
            PurgeOutcome::Purged => println!("🗑️  Legacy data removed"),
            PurgeOutcome::NothingToPurge => println!("✨ No legacy data to remove"),
            PurgeOutcome::CurrentEmpty => println!("⏸️  Legacy data kept: current data is still empty"),
            PurgeOutcome::Failed => bail!("could not remove legacy data"),
        },
        Commands::Watch => {
            let handle = vault.start_integrity_schedule(Arc::new(LogObserver));
            info!("⏱️  Integrity schedule running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            handle.abort();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_screen() {
        assert_eq!(parse_screen("1920x1080"), Ok((1920, 1080)));
        assert_eq!(parse_screen("800X600"), Ok((800, 600)));
        assert!(parse_screen("wide").is_err());
        assert!(parse_screen("10xabc").is_err());
    }
}
