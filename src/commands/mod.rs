// Commands module - command-line surface over the dispatch layer
// 命令模块 - 批处理分发、发布与连接管理的命令行入口

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::{
    BatchRequest, ConnectionResolver, ConnectionStatus, ConnectionStore, MediaAsset,
    PlatformConnection, PlatformType, PublishOptions,
};
use crate::dispatch::BatchDispatcher;
use crate::http::{HttpTransport, ReqwestTransport};
use crate::media::MediaLibrary;
use crate::platforms::factory::{BatcherRegistry, PublisherFactory};
use crate::platforms::traits::PlatformBatcher;
use crate::storage::DatabaseManager;

#[derive(Parser, Debug)]
#[command(author, version, about = "Batched platform API dispatch and publishing", long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database holding platform connections (overrides the config file)
    #[arg(long, value_name = "FILE", global = true)]
    pub database: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a batch of requests against one connection and print the result map
    Dispatch {
        #[arg(long)]
        connection: String,

        /// JSON file with an array of {id, request_type, request_params}
        #[arg(long, value_name = "FILE")]
        requests: PathBuf,
    },
    /// Publish a post for an organization
    Publish {
        /// facebook, instagram, twitter, linkedin, tiktok or google_business
        #[arg(long)]
        platform: String,

        #[arg(long)]
        org: String,

        #[arg(long, default_value = "")]
        content: String,

        /// JSON file with an array of media items
        #[arg(long, value_name = "FILE")]
        media: Option<PathBuf>,

        /// Publish options as inline JSON
        #[arg(long)]
        options: Option<String>,
    },
    /// Manage stored platform connections
    Connections {
        #[command(subcommand)]
        action: ConnectionAction,
    },
    /// List registered batchers and their settings
    Batchers,
}

#[derive(Subcommand, Debug)]
pub enum ConnectionAction {
    Add {
        /// Generated when omitted
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        org: String,

        /// meta, google, tiktok, linkedin, twitter or snapchat
        #[arg(long)]
        platform: String,

        #[arg(long)]
        token: Option<String>,

        #[arg(long)]
        account: Option<String>,

        /// Extra credentials as a JSON object
        #[arg(long)]
        credentials: Option<String>,

        #[arg(long)]
        inactive: bool,
    },
    List,
    Remove {
        id: String,
    },
}

/// Shared wiring for one CLI invocation
struct AppContext {
    config: AppConfig,
    store: Arc<DatabaseManager>,
    transport: Arc<dyn HttpTransport>,
}

impl AppContext {
    fn new(config: AppConfig, database: Option<PathBuf>) -> Result<Self> {
        let db_path = database.unwrap_or_else(|| config.database_path.clone());
        tracing::debug!("[App] Database path: {:?}", db_path);
        let transport = ReqwestTransport::new(config.http_timeout())
            .context("Failed to build HTTP client")?;
        Ok(Self {
            store: Arc::new(DatabaseManager::new(db_path)),
            transport: Arc::new(transport),
            config,
        })
    }

    fn resolver(&self) -> ConnectionResolver {
        ConnectionResolver::new(self.store.clone())
    }

    fn registry(&self) -> BatcherRegistry {
        BatcherRegistry::defaults(self.transport.clone(), &self.config)
    }

    fn media(&self) -> MediaLibrary {
        MediaLibrary::new(
            self.config.media.storage_root.clone(),
            self.config.media.public_base_url.clone(),
            self.transport.clone(),
        )
    }
}

/// Execute a parsed command line
pub async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let ctx = AppContext::new(config, cli.database)?;

    match cli.command {
        Commands::Dispatch {
            connection,
            requests,
        } => {
            let requests = read_requests(&requests)?;
            let dispatcher = BatchDispatcher::new(ctx.resolver(), Arc::new(ctx.registry()));
            let results = dispatcher.dispatch(&connection, &requests).await;
            print_json(&results)
        }
        Commands::Publish {
            platform,
            org,
            content,
            media,
            options,
        } => {
            let media = match media {
                Some(path) => read_media(&path)?,
                None => Vec::new(),
            };
            let options = parse_options(options.as_deref())?;
            let factory = PublisherFactory::new(ctx.resolver(), ctx.transport.clone(), ctx.media())
                .with_polling(ctx.config.polling.clone());
            let result = factory
                .publish(&platform, &org, &content, &media, &options)
                .await;
            print_json(&result)?;
            if !result.success {
                bail!(
                    "{}",
                    result.message.unwrap_or_else(|| "publish failed".to_string())
                );
            }
            Ok(())
        }
        Commands::Connections { action } => run_connection_action(&ctx, action).await,
        Commands::Batchers => {
            let summaries: Vec<BatcherSummary> =
                ctx.registry().iter().map(|b| BatcherSummary::of(b.as_ref())).collect();
            print_json(&summaries)
        }
    }
}

async fn run_connection_action(ctx: &AppContext, action: ConnectionAction) -> Result<()> {
    match action {
        ConnectionAction::Add {
            id,
            org,
            platform,
            token,
            account,
            credentials,
            inactive,
        } => {
            let connection = build_connection(
                id,
                org,
                &platform,
                token,
                account,
                credentials.as_deref(),
                inactive,
            )?;
            ctx.store.save(&connection).await?;
            tracing::info!(
                "[Connections] 已保存连接 {} ({})",
                connection.id,
                connection.platform.as_str()
            );
            Ok(())
        }
        ConnectionAction::List => {
            let connections: Vec<ConnectionSummary> = ctx
                .store
                .list()
                .await?
                .iter()
                .map(ConnectionSummary::of)
                .collect();
            print_json(&connections)
        }
        ConnectionAction::Remove { id } => {
            if !ctx.store.delete(&id).await? {
                bail!("Connection {} not found", id);
            }
            tracing::info!("[Connections] 已删除连接 {}", id);
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn read_requests(path: &Path) -> Result<Vec<BatchRequest>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read requests file {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid requests file {:?}", path))
}

pub fn read_media(path: &Path) -> Result<Vec<MediaAsset>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read media file {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid media file {:?}", path))
}

pub fn parse_options(raw: Option<&str>) -> Result<PublishOptions> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(raw).context("Invalid --options JSON")
        }
        _ => Ok(PublishOptions::default()),
    }
}

pub fn build_connection(
    id: Option<String>,
    org_id: String,
    platform: &str,
    access_token: Option<String>,
    account_id: Option<String>,
    credentials: Option<&str>,
    inactive: bool,
) -> Result<PlatformConnection> {
    let Some(platform) = PlatformType::parse(platform) else {
        bail!("Unknown platform '{}'", platform);
    };
    let credentials = match credentials {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("Invalid --credentials JSON")? {
            Value::Object(map) => map,
            _ => bail!("--credentials must be a JSON object"),
        },
        None => Map::new(),
    };
    Ok(PlatformConnection {
        id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        org_id,
        platform,
        access_token,
        account_id,
        credentials,
        status: if inactive {
            ConnectionStatus::Inactive
        } else {
            ConnectionStatus::Active
        },
    })
}

#[derive(Debug, Serialize)]
pub struct BatcherSummary {
    pub platform: &'static str,
    pub strategy: &'static str,
    pub max_batch_size: usize,
    pub flush_interval_secs: u64,
    pub request_types: &'static [&'static str],
}

impl BatcherSummary {
    pub fn of(batcher: &dyn PlatformBatcher) -> Self {
        Self {
            platform: batcher.platform().as_str(),
            strategy: batcher.batch_strategy().as_str(),
            max_batch_size: batcher.max_batch_size(),
            flush_interval_secs: batcher.flush_interval().as_secs(),
            request_types: batcher.supported_request_types(),
        }
    }
}

/// Connection listing without the token
#[derive(Debug, Serialize)]
struct ConnectionSummary {
    id: String,
    org_id: String,
    platform: &'static str,
    account_id: Option<String>,
    status: &'static str,
    has_token: bool,
}

impl ConnectionSummary {
    fn of(connection: &PlatformConnection) -> Self {
        Self {
            id: connection.id.clone(),
            org_id: connection.org_id.clone(),
            platform: connection.platform.as_str(),
            account_id: connection.account_id.clone(),
            status: connection.status.as_str(),
            has_token: connection.token().is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MediaKind;
    use crate::http::ScriptedTransport;

    #[test]
    fn test_parse_publish_command() {
        let cli = Cli::try_parse_from([
            "platform-dispatch",
            "publish",
            "--platform",
            "instagram",
            "--org",
            "org-1",
            "--content",
            "hello",
            "--options",
            r##"{"first_comment":"#launch"}"##,
        ])
        .unwrap();
        match cli.command {
            Commands::Publish {
                platform, options, ..
            } => {
                assert_eq!(platform, "instagram");
                let options = parse_options(options.as_deref()).unwrap();
                assert_eq!(options.first_comment.as_deref(), Some("#launch"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_build_connection_validates_input() {
        let conn = build_connection(
            Some("c1".into()),
            "org".into(),
            "LinkedIn",
            Some("tok".into()),
            None,
            Some(r#"{"organization_id": 42}"#),
            false,
        )
        .unwrap();
        assert_eq!(conn.platform, PlatformType::LinkedIn);
        assert_eq!(conn.credential("organization_id").as_deref(), Some("42"));
        assert!(conn.is_usable());

        assert!(build_connection(None, "o".into(), "myspace", None, None, None, false).is_err());
        assert!(build_connection(None, "o".into(), "meta", None, None, Some("[1]"), false).is_err());

        let generated = build_connection(None, "o".into(), "x", None, None, None, true).unwrap();
        assert_eq!(generated.id.len(), 36);
        assert_eq!(generated.status, ConnectionStatus::Inactive);
    }

    #[test]
    fn test_read_requests_and_media_files() {
        let dir = tempfile::tempdir().unwrap();
        let requests = dir.path().join("requests.json");
        std::fs::write(
            &requests,
            r#"[{"id": "r1", "request_type": "get_campaigns", "request_params": {"status": "ACTIVE"}},
                {"id": "r2", "request_type": "get_ads"}]"#,
        )
        .unwrap();
        let parsed = read_requests(&requests).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].request_params, Value::Null);

        let media = dir.path().join("media.json");
        std::fs::write(
            &media,
            r#"[{"type": "video", "storage_path": "org/clip.mp4"}, {"type": "image", "url": "https://cdn.test/a.jpg"}]"#,
        )
        .unwrap();
        let assets = read_media(&media).unwrap();
        assert_eq!(assets[0].kind, MediaKind::Video);
        assert!(!assets[1].is_video());
    }

    #[test]
    fn test_batcher_summary_lists_every_platform() {
        let registry = BatcherRegistry::defaults(
            Arc::new(ScriptedTransport::unreachable()),
            &AppConfig::default(),
        );
        let summaries: Vec<BatcherSummary> =
            registry.iter().map(|b| BatcherSummary::of(b.as_ref())).collect();
        assert_eq!(summaries.len(), 6);
        let google = summaries.iter().find(|s| s.platform == "google").unwrap();
        assert_eq!(google.strategy, "search_stream");
        assert!(google.request_types.contains(&"update_ads"));
    }
}
