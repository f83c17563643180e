//! Amalgam CLI, a thin operational shell over the correlation engine.
//!
//! Usage:
//!   amalgam ingest <file.jsonl> --plugin-name ad --plugin-unique-name ad_adapter_0 [--db path]
//!   amalgam show <plugin_unique_name> <id> [--db path]
//!   amalgam link --reason <why> <plugin_unique_name:id>... [--db path]
//!   amalgam unlink <plugin_unique_name> <id> [--db path]
//!   amalgam delete <plugin_unique_name> <id> [--db path]
//!   amalgam stats [--db path]

use amalgam::{
    AdapterIdentity, CorrelationEngine, CorrelationResult, EngineSettings, EntityOps, EntityType,
    OpenStore, PluginIdentity, SqliteStore,
};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "amalgam",
    version,
    about = "Asset-aggregation and entity correlation engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Entity domain to operate on
    #[arg(long, global = true, default_value = "devices")]
    entity_type: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a JSON-lines file of parsed adapter records
    Ingest {
        /// File with one JSON record per line (each must carry an "id")
        file: PathBuf,
        /// Adapter plugin name
        #[arg(long)]
        plugin_name: String,
        /// Adapter plugin unique name (connection instance)
        #[arg(long)]
        plugin_unique_name: String,
        /// Client/connection label recorded on every member
        #[arg(long)]
        client: Option<String>,
    },
    /// Print the merged entity owning an adapter entity
    Show {
        plugin_unique_name: String,
        id: String,
    },
    /// Merge the entities owning the given adapter entities
    Link {
        /// Why these entities are the same real-world entity
        #[arg(long)]
        reason: String,
        /// Adapter identities as plugin_unique_name:id pairs
        #[arg(required = true)]
        identities: Vec<String>,
    },
    /// Split one adapter entity out into its own merged entity
    Unlink {
        plugin_unique_name: String,
        id: String,
    },
    /// Remove an adapter entity entirely (archive, then delete)
    Delete {
        plugin_unique_name: String,
        id: String,
    },
    /// Entity counts per domain
    Stats,
}

/// Get the default database path (~/.local/share/amalgam/amalgam.db)
fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let amalgam_dir = data_dir.join("amalgam");
    std::fs::create_dir_all(&amalgam_dir).ok();
    amalgam_dir.join("amalgam.db")
}

fn open_engine(db: Option<PathBuf>) -> Result<Arc<CorrelationEngine>, String> {
    let db_path = db.unwrap_or_else(default_db_path);
    let store =
        SqliteStore::open(&db_path).map_err(|e| format!("Failed to open database: {}", e))?;
    Ok(Arc::new(CorrelationEngine::new(
        Arc::new(store),
        EngineSettings::default(),
    )))
}

fn parse_entity_type(s: &str) -> Result<EntityType, String> {
    match s {
        "devices" => Ok(EntityType::Devices),
        "users" => Ok(EntityType::Users),
        other => Err(format!("unknown entity type '{}'", other)),
    }
}

/// Parse "plugin_unique_name:id" into an adapter identity
fn parse_identity(s: &str) -> Result<AdapterIdentity, String> {
    match s.split_once(':') {
        Some((plugin_unique_name, id)) if !id.is_empty() => {
            Ok(AdapterIdentity::new(plugin_unique_name, id))
        }
        _ => Err(format!("expected plugin_unique_name:id, got '{}'", s)),
    }
}

fn cmd_ingest(
    engine: Arc<CorrelationEngine>,
    entity_type: EntityType,
    file: &PathBuf,
    plugin_name: String,
    plugin_unique_name: String,
    client: Option<String>,
) -> i32 {
    let reader = match std::fs::File::open(file) {
        Ok(f) => std::io::BufReader::new(f),
        Err(e) => {
            eprintln!("Error: cannot open '{}': {}", file.display(), e);
            return 1;
        }
    };
    let mut records: Vec<Map<String, Value>> = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error: read failed at line {}: {}", line_no + 1, e);
                return 1;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Map<String, Value>>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                eprintln!("Warning: skipping malformed line {}: {}", line_no + 1, e);
            }
        }
    }

    let plugin = PluginIdentity::new("Adapter", plugin_name, plugin_unique_name);
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match runtime.block_on(engine.save_adapter_entities(client, records, entity_type, plugin)) {
        Ok(count) => {
            println!("Ingested {} records", count);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_show(
    engine: &CorrelationEngine,
    entity_type: EntityType,
    plugin_unique_name: &str,
    id: &str,
) -> i32 {
    let identity = AdapterIdentity::new(plugin_unique_name, id);
    match amalgam::storage::find_by_quick_id(engine.store(), entity_type, &identity.quick_id()) {
        Ok(Some(doc)) => {
            match serde_json::to_string_pretty(&doc) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return 1;
                }
            }
            0
        }
        Ok(None) => {
            eprintln!("Error: no merged entity contains {}", identity);
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_link(
    engine: &CorrelationEngine,
    entity_type: EntityType,
    reason: String,
    identities: &[String],
) -> i32 {
    let mut associated_adapters = Vec::with_capacity(identities.len());
    for raw in identities {
        match parse_identity(raw) {
            Ok(identity) => associated_adapters.push(identity),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    }
    let correlation = CorrelationResult {
        associated_adapters,
        reason,
    };
    match engine.link_adapters(entity_type, &correlation, None) {
        Ok(survivor) => {
            println!("Linked into {}", survivor);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_unlink(
    engine: &CorrelationEngine,
    entity_type: EntityType,
    plugin_unique_name: &str,
    id: &str,
) -> i32 {
    let identity = AdapterIdentity::new(plugin_unique_name, id);
    match engine.unlink_adapter(entity_type, &identity) {
        Ok((new_id, old_id)) => {
            println!("Split {} out of {}", new_id, old_id);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_delete(
    engine: &CorrelationEngine,
    entity_type: EntityType,
    plugin_unique_name: &str,
    id: &str,
) -> i32 {
    let identity = AdapterIdentity::new(plugin_unique_name, id);
    match engine.delete_adapter_entity(entity_type, &identity) {
        Ok(()) => {
            println!("Deleted {}", identity);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_stats(engine: &CorrelationEngine) -> i32 {
    for entity_type in [EntityType::Devices, EntityType::Users] {
        match engine.store().count_entities(entity_type) {
            Ok(count) => println!("{:<8} {:>8}", entity_type, count),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    }
    0
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let entity_type = match parse_entity_type(&cli.entity_type) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let engine = match open_engine(cli.db) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Ingest {
            file,
            plugin_name,
            plugin_unique_name,
            client,
        } => cmd_ingest(
            Arc::clone(&engine),
            entity_type,
            &file,
            plugin_name,
            plugin_unique_name,
            client,
        ),
        Commands::Show {
            plugin_unique_name,
            id,
        } => cmd_show(&engine, entity_type, &plugin_unique_name, &id),
        Commands::Link { reason, identities } => cmd_link(&engine, entity_type, reason, &identities),
        Commands::Unlink {
            plugin_unique_name,
            id,
        } => cmd_unlink(&engine, entity_type, &plugin_unique_name, &id),
        Commands::Delete {
            plugin_unique_name,
            id,
        } => cmd_delete(&engine, entity_type, &plugin_unique_name, &id),
        Commands::Stats => cmd_stats(&engine),
    };
    std::process::exit(code);
}
