//! modelrepo admin CLI
//!
//! Inspects and maintains layer directories while no repository has them open.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use modelrepo_common::{DirectoryFingerprint, LayerDescriptor, RecordKey, RepositoryConfig, UnitId};
use modelrepo_storage::{CompactStats, DiskLayer, DiskLayerConfig, RecordLookup};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "modelrepo-cli")]
#[command(about = "modelrepo layer administration CLI")]
#[command(version)]
struct Args {
    /// Repository configuration file (TOML)
    #[arg(short, long, env = "MODELREPO_CONFIG")]
    config: Option<PathBuf>,

    /// Expected on-disk format version, overrides the configuration file
    #[arg(long)]
    format_version: Option<u32>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print JSON instead of tables
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the layer header and totals
    Info {
        /// Layer directory or file:// URI (defaults to the first configured layer)
        layer: Option<String>,
    },
    /// List the units a layer knows about
    Units { layer: Option<String> },
    /// Hex dump of one record payload
    Dump {
        layer: Option<String>,
        /// Layer-local unit id
        #[arg(long)]
        unit: u32,
        #[arg(long)]
        index: u32,
    },
    /// Re-read every record and check its checksum
    Verify { layer: Option<String> },
    /// Digest of every file below the layer root
    Fingerprint { layer: Option<String> },
    /// Rewrite data files without dead records
    Compact {
        layer: Option<String>,
        /// Only this unit
        #[arg(long)]
        unit: Option<u32>,
    },
    /// Delete a unit and all of its records
    Expunge {
        layer: Option<String>,
        #[arg(long)]
        unit: u32,
    },
}

#[derive(Serialize)]
struct LayerInfo {
    location: String,
    format_version: u32,
    uuid: String,
    created_at: u64,
    units: usize,
    filesystems: usize,
    records: usize,
    tombstones: usize,
    live_bytes: u64,
    data_bytes: u64,
}

#[derive(Serialize)]
struct UnitRow {
    id: u32,
    name: String,
    filesystem: String,
    generation: u32,
    records: usize,
    tombstones: usize,
    live_bytes: u64,
}

#[derive(Serialize)]
struct RecordDump {
    unit: u32,
    index: u32,
    len: usize,
    payload: String,
}

fn load_config(args: &Args) -> Result<RepositoryConfig> {
    let mut config = match &args.config {
        Some(path) => RepositoryConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RepositoryConfig::default(),
    };
    if let Some(version) = args.format_version {
        config.format_version = version;
    }
    Ok(config)
}

/// Layer named on the command line, else the first configured one
fn resolve_layer(arg: Option<&str>, config: &RepositoryConfig) -> Result<LayerDescriptor> {
    match arg {
        Some(location) => Ok(LayerDescriptor::parse(location)),
        None => config
            .layers
            .first()
            .map(modelrepo_common::LayerConfig::descriptor)
            .ok_or_else(|| anyhow!("No layer given and none configured")),
    }
}

/// Start a layer without ever letting startup rebuild it
fn open_layer(
    desc: LayerDescriptor,
    config: &RepositoryConfig,
    writable: bool,
) -> Result<DiskLayer> {
    let header = DiskLayer::probe(desc.root())
        .with_context(|| format!("Failed to read layer header in {desc}"))?
        .ok_or_else(|| anyhow!("{desc} is not a layer directory"))?;

    let mut version = config.format_version;
    if header.version != version {
        if writable {
            bail!(
                "Layer {} has format version {}, expected {}; refusing to modify it",
                desc,
                header.version,
                version
            );
        }
        warn!(
            "Layer {} has format version {}, expected {}",
            desc, header.version, version
        );
        version = header.version;
    }

    let layer = DiskLayer::new(desc, DiskLayerConfig::from(config));
    // A read-only start fails on a damaged manifest instead of wiping it
    layer.startup(version, true, false)?;
    if writable {
        layer.shutdown()?;
        layer.startup(version, false, false)?;
    }
    Ok(layer)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn hex_line(offset: usize, chunk: &[u8]) -> String {
    let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
    let ascii: String = chunk
        .iter()
        .map(|b| {
            if b.is_ascii_graphic() || *b == b' ' {
                char::from(*b)
            } else {
                '.'
            }
        })
        .collect();
    format!("{:08x}  {:<47}  |{}|", offset, bytes.join(" "), ascii)
}

fn layer_info(layer: &DiskLayer) -> Result<LayerInfo> {
    let header = layer
        .header()
        .ok_or_else(|| anyhow!("Layer {} has no header", layer.descriptor()))?;
    let mut info = LayerInfo {
        location: layer.descriptor().uri(),
        format_version: header.version,
        uuid: header.layer_uuid.to_string(),
        created_at: header.created_at,
        units: layer.manifest().unit_count(),
        filesystems: layer.manifest().filesystems().len(),
        records: 0,
        tombstones: 0,
        live_bytes: 0,
        data_bytes: 0,
    };
    for unit in layer.units()? {
        if let Some(stats) = layer.unit_stats(unit)? {
            info.records += stats.records;
            info.tombstones += stats.tombstones;
            info.live_bytes += stats.live_bytes;
            info.data_bytes += stats.data_bytes;
        }
    }
    Ok(info)
}

fn unit_rows(layer: &DiskLayer) -> Result<Vec<UnitRow>> {
    let mut rows = Vec::new();
    for (id, desc) in layer.manifest().units() {
        let stats = layer.unit_stats(id)?.unwrap_or_default();
        rows.push(UnitRow {
            id: id.get(),
            name: desc.name,
            filesystem: desc.filesystem.to_string(),
            generation: stats.generation,
            records: stats.records,
            tombstones: stats.tombstones,
            live_bytes: stats.live_bytes,
        });
    }
    Ok(rows)
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;

    match args.command {
        Commands::Info { ref layer } => {
            let layer = open_layer(resolve_layer(layer.as_deref(), &config)?, &config, false)?;
            let info = layer_info(&layer)?;
            if args.json {
                print_json(&info)?;
            } else {
                println!("Layer: {}", info.location);
                println!("Format version: {}", info.format_version);
                println!("UUID: {}", info.uuid);
                println!("Created: {}", info.created_at);
                println!("Units: {}", info.units);
                println!("Filesystems: {}", info.filesystems);
                println!("Records: {}", info.records);
                println!("Tombstones: {}", info.tombstones);
                println!("Live bytes: {}", info.live_bytes);
                println!("Data bytes: {}", info.data_bytes);
            }
        }
        Commands::Units { ref layer } => {
            let layer = open_layer(resolve_layer(layer.as_deref(), &config)?, &config, false)?;
            let rows = unit_rows(&layer)?;
            if args.json {
                print_json(&rows)?;
            } else if rows.is_empty() {
                println!("No units found");
            } else {
                println!(
                    "{:<8} {:<40} {:<20} {:<6} {:<10} {:<12}",
                    "ID", "NAME", "FILESYSTEM", "GEN", "RECORDS", "LIVE BYTES"
                );
                println!("{}", "-".repeat(100));
                for row in rows {
                    println!(
                        "{:<8} {:<40} {:<20} {:<6} {:<10} {:<12}",
                        row.id, row.name, row.filesystem, row.generation, row.records, row.live_bytes
                    );
                }
            }
        }
        Commands::Dump {
            ref layer,
            unit,
            index,
        } => {
            let layer = open_layer(resolve_layer(layer.as_deref(), &config)?, &config, false)?;
            let key = RecordKey::new(UnitId::new(unit), index);
            let data = match layer.lookup(key)? {
                RecordLookup::Found(data) => data,
                RecordLookup::Removed => bail!("Record {key} was removed"),
                RecordLookup::Absent => bail!("Record {key} not found"),
            };
            if args.json {
                print_json(&RecordDump {
                    unit,
                    index,
                    len: data.len(),
                    payload: hex::encode(&data),
                })?;
            } else {
                println!("Record {} ({} bytes)", key, data.len());
                for (i, chunk) in data.chunks(16).enumerate() {
                    println!("{}", hex_line(i * 16, chunk));
                }
            }
        }
        Commands::Verify { ref layer } => {
            let layer = open_layer(resolve_layer(layer.as_deref(), &config)?, &config, false)?;
            let report = layer.verify()?;
            if args.json {
                print_json(&report)?;
            } else {
                println!("Units: {}", report.units);
                println!("Records: {}", report.records);
                for (key, reason) in &report.corrupt {
                    println!("CORRUPT {key}: {reason}");
                }
                for (unit, reason) in &report.bad_units {
                    println!("DAMAGED unit {unit}: {reason}");
                }
            }
            if !report.is_clean() {
                bail!(
                    "{} corrupt records, {} damaged units",
                    report.corrupt.len(),
                    report.bad_units.len()
                );
            }
        }
        Commands::Fingerprint { ref layer } => {
            let desc = resolve_layer(layer.as_deref(), &config)?;
            let fingerprint = DirectoryFingerprint::compute(desc.root())?;
            if args.json {
                print_json(&serde_json::json!({
                    "location": desc.uri(),
                    "files": fingerprint.files.len(),
                    "digest": fingerprint.hex(),
                }))?;
            } else {
                println!("{}  {} files  {}", fingerprint.hex(), fingerprint.files.len(), desc);
            }
        }
        Commands::Compact { ref layer, unit } => {
            let layer = open_layer(resolve_layer(layer.as_deref(), &config)?, &config, true)?;
            let units = match unit {
                Some(unit) => vec![UnitId::new(unit)],
                None => layer.units()?,
            };
            let mut results: Vec<(u32, CompactStats)> = Vec::new();
            for unit in units {
                if let Some(stats) = layer.compact_unit(unit)? {
                    info!(
                        "Compacted unit {}: {} -> {} bytes",
                        unit, stats.bytes_before, stats.bytes_after
                    );
                    results.push((unit.get(), stats));
                }
            }
            layer.shutdown()?;
            if args.json {
                print_json(&results)?;
            } else if results.is_empty() {
                println!("Nothing to compact");
            } else {
                for (unit, stats) in results {
                    println!(
                        "Unit {}: generation {}, {} records, {} -> {} bytes",
                        unit, stats.generation, stats.records, stats.bytes_before, stats.bytes_after
                    );
                }
            }
        }
        Commands::Expunge { ref layer, unit } => {
            let layer = open_layer(resolve_layer(layer.as_deref(), &config)?, &config, true)?;
            let unit = UnitId::new(unit);
            if !layer.manifest().contains_unit(unit) && !layer.unit_dir(unit).exists() {
                bail!("Unit {unit} not found in {}", layer.descriptor());
            }
            layer.close_unit(unit, false, &[], true)?;
            layer.shutdown()?;
            println!("Expunged unit {unit}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelrepo_common::{Behavior, UnitDescriptor};
    use tempfile::tempdir;

    fn populated(root: &std::path::Path) -> UnitId {
        let layer = DiskLayer::new(LayerDescriptor::new(root), DiskLayerConfig::default());
        layer.startup(1, false, true).unwrap();
        let unit = layer.register_unit(&UnitDescriptor::local("main.c")).unwrap();
        for index in 0..4 {
            layer
                .write(
                    RecordKey::new(unit, index),
                    vec![index as u8; 64].into(),
                    Behavior::Default,
                )
                .unwrap();
        }
        layer.commit(unit).unwrap();
        layer.remove(RecordKey::new(unit, 3)).unwrap();
        layer.close_unit(unit, true, &[], false).unwrap();
        layer.shutdown().unwrap();
        unit
    }

    #[test]
    fn test_parse_args() {
        let args = Args::try_parse_from([
            "modelrepo-cli",
            "--format-version",
            "2",
            "dump",
            "/tmp/layer",
            "--unit",
            "1",
            "--index",
            "7",
        ])
        .unwrap();
        assert_eq!(args.format_version, Some(2));
        assert!(matches!(
            args.command,
            Commands::Dump { unit: 1, index: 7, .. }
        ));

        assert!(Args::try_parse_from(["modelrepo-cli", "expunge", "/tmp/layer"]).is_err());
    }

    #[test]
    fn test_resolve_layer_prefers_argument() {
        let config = RepositoryConfig::single_layer("/var/cache/top");
        assert_eq!(
            resolve_layer(Some("file:///opt/shared"), &config).unwrap(),
            LayerDescriptor::new("/opt/shared")
        );
        assert_eq!(
            resolve_layer(None, &config).unwrap(),
            LayerDescriptor::new("/var/cache/top")
        );
        assert!(resolve_layer(None, &RepositoryConfig::default()).is_err());
    }

    #[test]
    fn test_info_and_units() {
        let dir = tempdir().unwrap();
        let unit = populated(dir.path());

        let layer = open_layer(
            LayerDescriptor::new(dir.path()),
            &RepositoryConfig::default(),
            false,
        )
        .unwrap();
        let info = layer_info(&layer).unwrap();
        assert_eq!(info.format_version, 1);
        assert_eq!(info.units, 1);
        assert_eq!(info.records, 3);
        assert_eq!(info.tombstones, 1);

        let rows = unit_rows(&layer).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, unit.get());
        assert_eq!(rows[0].name, "main.c");
    }

    #[test]
    fn test_version_mismatch_is_never_rebuilt() {
        let dir = tempdir().unwrap();
        populated(dir.path());
        let before = DirectoryFingerprint::compute(dir.path()).unwrap();

        let mut config = RepositoryConfig::default();
        config.format_version = 2;
        assert!(open_layer(LayerDescriptor::new(dir.path()), &config, true).is_err());

        // Inspection falls back to the version found on disk
        let layer = open_layer(LayerDescriptor::new(dir.path()), &config, false).unwrap();
        assert_eq!(layer.header().unwrap().version, 1);
        drop(layer);

        assert_eq!(DirectoryFingerprint::compute(dir.path()).unwrap(), before);
    }

    #[test]
    fn test_open_rejects_plain_directory() {
        let dir = tempdir().unwrap();
        assert!(
            open_layer(
                LayerDescriptor::new(dir.path()),
                &RepositoryConfig::default(),
                false
            )
            .is_err()
        );
    }

    #[test]
    fn test_hex_line() {
        assert_eq!(
            hex_line(16, b"ab\x00"),
            format!("00000010  {:<47}  |ab.|", "61 62 00")
        );
    }
}
