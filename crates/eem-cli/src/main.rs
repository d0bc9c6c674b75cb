//! 🚀 eem-cli: the front door, the bouncer, the maitre d' of the entity manager.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Parses a subcommand, loads config, builds a client, and lets the library
//! do the heavy lifting. Like a manager. 🦆

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use eem::common::{EntityDefinition, EntityDefinitionUpdate};
use eem::backends::SortOrder;
use eem::{EntityClient, FindEntitiesOptions, FindOptions};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "eem", about = "🧬 Manage entity definitions on an Elasticsearch cluster")]
struct Cli {
    /// 🔧 TOML config file. Skipped silently if it doesn't exist; env vars (EEM_*) still apply.
    #[arg(long, default_value = "eem.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install a definition from a JSON file and start it
    Create {
        #[arg(long)]
        file: PathBuf,
        /// Install resources but leave the transforms stopped
        #[arg(long)]
        install_only: bool,
    },
    /// Apply a JSON patch file to a definition and reinstall it
    Update {
        id: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Uninstall a definition
    Delete {
        id: String,
        /// Also delete the history and latest indices
        #[arg(long)]
        delete_data: bool,
    },
    /// List definitions
    List {
        #[arg(long = "type")]
        entity_type: Option<String>,
        #[arg(long)]
        built_in: Option<bool>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        per_page: Option<usize>,
        #[arg(long)]
        include_state: bool,
    },
    /// Show one definition as JSON
    Get {
        id: String,
        #[arg(long)]
        include_state: bool,
    },
    /// Start a definition's transforms
    Start { id: String },
    /// Stop a definition's transforms
    Stop { id: String },
    /// Search the entities every definition has produced
    Entities {
        /// Lucene query string, e.g. `entity.type:service`
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value_t = 10)]
        per_page: usize,
        #[arg(long, default_value = "entity.lastSeenTimestamp")]
        sort_field: String,
        /// Newest (or biggest) first
        #[arg(long)]
        desc: bool,
        /// The `searchAfter` array printed with the previous page, as JSON
        #[arg(long)]
        search_after: Option<String>,
    },
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("💀 Could not read '{}'", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("💀 '{}' is not what we expected in there", path.display()))
}

fn yes_no(flag: Option<bool>) -> &'static str {
    match flag {
        Some(true) => "yes",
        Some(false) => "no",
        None => "-",
    }
}

async fn run<C, S>(client: EntityClient<C, S>, command: Command) -> Result<()>
where
    C: eem::backends::Cluster,
    S: eem::backends::DefinitionStore,
{
    match command {
        Command::Create { file, install_only } => {
            let definition: EntityDefinition = read_json(&file)?;
            let installed = client.create(definition, install_only).await?;
            info!(
                "✅ Created entity definition [{}] revision {}",
                installed.id, installed.revision
            );
        }
        Command::Update { id, file } => {
            let update: EntityDefinitionUpdate = read_json(&file)?;
            let updated = client.update(&id, update).await?;
            info!(
                "✅ Updated entity definition [{}] to revision {}",
                updated.id, updated.revision
            );
        }
        Command::Delete { id, delete_data } => {
            client.delete(&id, delete_data).await?;
            info!("✅ Deleted entity definition [{id}]");
        }
        Command::List {
            entity_type,
            built_in,
            page,
            per_page,
            include_state,
        } => {
            let found = client
                .find(FindOptions {
                    id: None,
                    entity_type,
                    built_in,
                    page,
                    per_page,
                    include_state,
                })
                .await?;
            let mut table = Table::new();
            table.set_header(vec![
                "id", "type", "revision", "status", "installed", "running", "entities",
            ]);
            for entry in &found.definitions {
                let definition = &entry.definition;
                table.add_row(vec![
                    definition.id.clone(),
                    definition.entity_type.clone(),
                    definition.revision.to_string(),
                    definition
                        .install_status
                        .map(|status| status.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    yes_no(entry.state.as_ref().map(|state| state.installed)).to_string(),
                    yes_no(entry.state.as_ref().map(|state| state.running)).to_string(),
                    entry
                        .stats
                        .as_ref()
                        .map(|stats| stats.entity_count.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ]);
            }
            println!("{table}");
            println!(
                "page {} ({} per page), {} total",
                found.page, found.per_page, found.total
            );
        }
        Command::Get { id, include_state } => {
            let found = client.get(&id, include_state).await?;
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
        Command::Start { id } => {
            client.start(&id).await?;
            info!("🏃 Started transforms of entity definition [{id}]");
        }
        Command::Stop { id } => {
            client.stop(&id).await?;
            info!("🛑 Stopped transforms of entity definition [{id}]");
        }
        Command::Entities {
            query,
            per_page,
            sort_field,
            desc,
            search_after,
        } => {
            let search_after = search_after
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("💀 --search-after should be the JSON array printed with the previous page")?;
            let found = client
                .find_entities(FindEntitiesOptions {
                    per_page,
                    query,
                    search_after,
                    sort_field,
                    sort_direction: if desc { SortOrder::Desc } else { SortOrder::Asc },
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = async {
        // 🔒 A missing file is fine, env vars may be all we need. An unreadable path is not.
        let config_file = cli.config.as_path();
        let config_file = match config_file.try_exists().with_context(|| {
            format!(
                "💀 Couldn't check whether the config file exists. Was checking here: '{}'",
                config_file.display()
            )
        })? {
            true => Some(config_file),
            false => None,
        };
        let app_config = eem::app_config::load_config(config_file)
            .context("💀 In eem-cli, main, we couldn't load the config. Take a look at the file and the EEM_* env vars")?;
        let client = eem::app_config::build_client(&app_config).await?;
        run(client, cli.command).await
    }
    .await;

    if let Err(err) = result {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one layer at a time
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }
        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: looks like Elasticsearch isn't reachable. \
                Check `elasticsearch.url` (or EEM_ELASTICSEARCH__URL) and that the cluster is up. \
                If you're using Docker, `docker ps` knows more than we do. ☕"
            );
        }
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_the_flags_parse_like_they_say_they_do() {
        let cli = Cli::try_parse_from([
            "eem", "list", "--type", "service", "--built-in", "false", "--per-page", "5",
            "--include-state",
        ])
        .expect("parse");
        assert_eq!(cli.config, PathBuf::from("eem.toml"));
        match cli.command {
            Command::List {
                entity_type,
                built_in,
                page,
                per_page,
                include_state,
            } => {
                assert_eq!(entity_type.as_deref(), Some("service"));
                assert_eq!(built_in, Some(false));
                assert_eq!(page, 1);
                assert_eq!(per_page, Some(5));
                assert!(include_state);
            }
            plot_twist => panic!("💀 expected List, got {plot_twist:?}"),
        }
    }

    #[test]
    fn the_one_where_delete_keeps_the_data_unless_asked() {
        let cli = Cli::try_parse_from(["eem", "delete", "svc"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::Delete { ref id, delete_data: false } if id == "svc"
        ));
    }

    #[test]
    fn the_one_where_entities_default_to_oldest_first() {
        let cli = Cli::try_parse_from(["eem", "entities", "--search-after", "[1, \"a\"]"])
            .expect("parse");
        match cli.command {
            Command::Entities {
                query,
                per_page,
                sort_field,
                desc,
                search_after,
            } => {
                assert!(query.is_none());
                assert_eq!(per_page, 10);
                assert_eq!(sort_field, "entity.lastSeenTimestamp");
                assert!(!desc);
                assert_eq!(search_after.as_deref(), Some("[1, \"a\"]"));
            }
            plot_twist => panic!("💀 expected Entities, got {plot_twist:?}"),
        }
    }
}
