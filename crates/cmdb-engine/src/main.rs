//! CLI entry point for the CMDB consistency engine.
//!
//! Request bodies are read as JSON from stdin and results are written as
//! JSON to stdout. Logs go to stderr.

use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use cmdb_audit::AuditFilter;
use cmdb_core::config::{CmdbConfig, LogFormat};
use cmdb_core::types::{
    CiFilter, CreateCiRequest, CreateCiTypeRequest, CreateRelationshipRequest, RelationshipFilter,
    UpdateCiRequest, UpdateCiTypeRequest, UpdateRelationshipRequest,
};
use cmdb_core::{CiId, CiTypeId, RelationshipId, RequestContext, UserId};
use cmdb_graph::GraphFilter;

use cmdb_engine::Engine;

#[derive(Parser)]
#[command(name = "cmdb")]
#[command(about = "Consistency engine for the CMDB primary store, graph index, cache and audit trail")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file prefix (default: cmdb).
    #[arg(short, long, default_value = "cmdb", global = true)]
    config: String,

    /// User recorded as the actor of mutations (default: nil UUID).
    #[arg(long, global = true)]
    actor: Option<Uuid>,

    /// Client address recorded in the audit trail.
    #[arg(long, default_value = "", global = true)]
    ip_address: String,

    /// Client user agent recorded in the audit trail.
    #[arg(long, default_value = "cmdb-cli", global = true)]
    user_agent: String,
}

#[derive(Subcommand)]
enum Command {
    /// Manage CI type schemas.
    #[command(subcommand)]
    Type(TypeCommand),
    /// Manage configuration items.
    #[command(subcommand)]
    Ci(CiCommand),
    /// Manage relationships between CIs.
    #[command(subcommand)]
    Rel(RelCommand),
    /// Query the graph index.
    #[command(subcommand)]
    Graph(GraphCommand),
    /// Dashboard totals from the primary store.
    Stats,
    /// Hit and miss counters of the CI cache.
    CacheStats,
    /// Inspect and maintain the audit trail.
    #[command(subcommand)]
    Audit(AuditCommand),
    /// Drive the graph mirror outbox.
    #[command(subcommand)]
    Mirror(MirrorCommand),
    /// Rebuild the graph index from the primary store.
    Reconcile,
    /// Create Neo4j constraints and indexes.
    InitSchema,
}

#[derive(Args)]
struct Paging {
    #[arg(long)]
    page: Option<u32>,
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Subcommand)]
enum TypeCommand {
    /// Create a CI type (reads JSON from stdin).
    Create,
    Get {
        #[arg(long, conflicts_with = "name", required_unless_present = "name")]
        id: Option<CiTypeId>,
        #[arg(long)]
        name: Option<String>,
    },
    List {
        #[arg(long)]
        search: Option<String>,
        #[command(flatten)]
        paging: Paging,
    },
    /// Update a CI type (reads JSON from stdin).
    Update {
        #[arg(long)]
        id: CiTypeId,
    },
    Delete {
        #[arg(long)]
        id: CiTypeId,
    },
}

#[derive(Subcommand)]
enum CiCommand {
    /// Create a CI (reads JSON from stdin).
    Create,
    Get {
        #[arg(long)]
        id: CiId,
    },
    List {
        #[arg(long)]
        ci_type: Option<String>,
        #[arg(long)]
        search: Option<String>,
        /// Match CIs carrying any of these tags.
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[command(flatten)]
        paging: Paging,
    },
    /// Update a CI (reads JSON from stdin).
    Update {
        #[arg(long)]
        id: CiId,
    },
    Delete {
        #[arg(long)]
        id: CiId,
    },
}

#[derive(Subcommand)]
enum RelCommand {
    /// Create a relationship (reads JSON from stdin).
    Create,
    Get {
        #[arg(long)]
        id: RelationshipId,
    },
    List {
        #[arg(long)]
        source: Option<CiId>,
        #[arg(long)]
        target: Option<CiId>,
        #[arg(long)]
        relationship_type: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[command(flatten)]
        paging: Paging,
    },
    /// Update relationship attributes (reads JSON from stdin).
    Update {
        #[arg(long)]
        id: RelationshipId,
    },
    Delete {
        #[arg(long)]
        id: RelationshipId,
    },
}

#[derive(Subcommand)]
enum GraphCommand {
    /// Nodes and edges, optionally restricted by type or name.
    Data {
        #[arg(long = "ci-type")]
        ci_types: Vec<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Undirected neighbourhood of a CI.
    Network {
        #[arg(long)]
        id: CiId,
        #[arg(long, default_value_t = 2)]
        depth: usize,
    },
    /// Relationships touching a CI.
    Neighbors {
        #[arg(long)]
        id: CiId,
    },
    Cycles,
    Impact {
        #[arg(long)]
        id: CiId,
    },
    Connected {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Usage,
}

#[derive(Subcommand)]
enum AuditCommand {
    List {
        /// Filter as JSON, e.g. '{"entity_type":"ci","limit":10}'.
        #[arg(long)]
        filter: Option<String>,
    },
    Stats {
        #[arg(long)]
        filter: Option<String>,
    },
    /// Write matching entries as CSV to stdout.
    Export {
        #[arg(long)]
        filter: Option<String>,
    },
    /// Delete entries older than the retention window.
    Cleanup,
    /// Walk the hash chain and report the first break.
    Verify,
}

#[derive(Subcommand)]
enum MirrorCommand {
    /// Apply every outbox entry that is due, once.
    Drain,
    /// Drain continuously until Ctrl-C.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = CmdbConfig::load(&cli.config)?;
    init_tracing(&config);

    let ctx = RequestContext::new(UserId(cli.actor.unwrap_or_else(Uuid::nil)))
        .with_client(cli.ip_address.clone(), cli.user_agent.clone());

    let engine = Engine::build(config).await?;
    let orch = &engine.orchestrator;

    match cli.command {
        Command::Type(cmd) => match cmd {
            TypeCommand::Create => {
                let req: CreateCiTypeRequest = read_request()?;
                emit(&orch.create_ci_type(req, &ctx).await?)?;
            }
            TypeCommand::Get { id, name } => {
                let def = match (id, name) {
                    (Some(id), _) => orch.get_ci_type(id).await?,
                    (None, Some(name)) => orch.get_ci_type_by_name(&name).await?,
                    (None, None) => anyhow::bail!("--id or --name is required"),
                };
                emit(&def)?;
            }
            TypeCommand::List { search, paging } => emit(
                &orch
                    .list_ci_types(search.as_deref(), paging.page, paging.limit)
                    .await?,
            )?,
            TypeCommand::Update { id } => {
                let req: UpdateCiTypeRequest = read_request()?;
                emit(&orch.update_ci_type(id, req, &ctx).await?)?;
            }
            TypeCommand::Delete { id } => {
                orch.delete_ci_type(id, &ctx).await?;
                emit(&serde_json::json!({ "deleted": id }))?;
            }
        },

        Command::Ci(cmd) => match cmd {
            CiCommand::Create => {
                let req: CreateCiRequest = read_request()?;
                emit(&orch.create_ci(req, &ctx).await?)?;
            }
            CiCommand::Get { id } => emit(&orch.get_ci(id).await?)?,
            CiCommand::List {
                ci_type,
                search,
                tags,
                paging,
            } => {
                let filter = CiFilter {
                    ci_type,
                    search,
                    tags,
                    ..Default::default()
                };
                emit(&orch.list_cis(&filter, paging.page, paging.limit).await?)?;
            }
            CiCommand::Update { id } => {
                let req: UpdateCiRequest = read_request()?;
                emit(&orch.update_ci(id, req, &ctx).await?)?;
            }
            CiCommand::Delete { id } => {
                orch.delete_ci(id, &ctx).await?;
                emit(&serde_json::json!({ "deleted": id }))?;
            }
        },

        Command::Rel(cmd) => match cmd {
            RelCommand::Create => {
                let req: CreateRelationshipRequest = read_request()?;
                emit(&orch.create_relationship(req, &ctx).await?)?;
            }
            RelCommand::Get { id } => emit(&orch.get_relationship(id).await?)?,
            RelCommand::List {
                source,
                target,
                relationship_type,
                search,
                paging,
            } => {
                let filter = RelationshipFilter {
                    source_id: source,
                    target_id: target,
                    relationship_type,
                    search,
                    ..Default::default()
                };
                emit(
                    &orch
                        .list_relationships(&filter, paging.page, paging.limit)
                        .await?,
                )?;
            }
            RelCommand::Update { id } => {
                let req: UpdateRelationshipRequest = read_request()?;
                emit(&orch.update_relationship(id, req, &ctx).await?)?;
            }
            RelCommand::Delete { id } => {
                orch.delete_relationship(id, &ctx).await?;
                emit(&serde_json::json!({ "deleted": id }))?;
            }
        },

        Command::Graph(cmd) => match cmd {
            GraphCommand::Data {
                ci_types,
                search,
                limit,
            } => {
                let filter = GraphFilter {
                    ci_types,
                    search,
                    limit,
                };
                emit(&orch.graph_data(filter).await?)?;
            }
            GraphCommand::Network { id, depth } => emit(&orch.ci_network(id, depth).await?)?,
            GraphCommand::Neighbors { id } => emit(&orch.ci_relationships(id).await?)?,
            GraphCommand::Cycles => emit(&orch.find_cycles().await?)?,
            GraphCommand::Impact { id } => emit(&orch.impact_analysis(id).await?)?,
            GraphCommand::Connected { limit } => emit(&orch.most_connected(limit).await?)?,
            GraphCommand::Usage => emit(&orch.type_usage().await?)?,
        },

        Command::Stats => emit(&orch.dashboard_stats().await?)?,
        Command::CacheStats => emit(&orch.cache_stats().await?)?,

        Command::Audit(cmd) => {
            let audit = orch.audit();
            match cmd {
                AuditCommand::List { filter } => emit(&audit.list(&parse_filter(filter)?).await?)?,
                AuditCommand::Stats { filter } => {
                    emit(&audit.stats(&parse_filter(filter)?).await?)?
                }
                AuditCommand::Export { filter } => {
                    print!("{}", audit.export_csv(&parse_filter(filter)?).await?);
                }
                AuditCommand::Cleanup => {
                    let deleted = audit.cleanup().await?;
                    emit(&serde_json::json!({ "deleted": deleted }))?;
                }
                AuditCommand::Verify => {
                    let report = audit.verify_chain().await?;
                    emit(&report)?;
                    if !report.is_intact() {
                        anyhow::bail!("audit chain is broken after {} entries", report.checked);
                    }
                }
            }
        }

        Command::Mirror(cmd) => match cmd {
            MirrorCommand::Drain => emit(&engine.mirror_worker().drain_once().await?)?,
            MirrorCommand::Run => {
                let worker = engine.mirror_worker();
                let (tx, rx) = watch::channel(false);
                let handle = tokio::spawn(async move { worker.run(rx).await });

                tokio::signal::ctrl_c().await?;
                tracing::info!("Shutdown requested");
                // The worker also stops if every sender is gone.
                let _ = tx.send(true);
                handle.await?;
            }
        },

        Command::Reconcile => emit(&orch.reconcile().await?)?,

        Command::InitSchema => {
            let client = engine
                .neo4j
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("init-schema requires graph.backend = \"neo4j\""))?;
            client.init_schema().await?;
            tracing::info!("Neo4j schema initialised");
        }
    }

    Ok(())
}

fn init_tracing(config: &CmdbConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

fn read_request<T: DeserializeOwned>() -> anyhow::Result<T> {
    let input = std::io::read_to_string(std::io::stdin())?;
    Ok(serde_json::from_str(&input)?)
}

fn parse_filter(raw: Option<String>) -> anyhow::Result<AuditFilter> {
    match raw {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(AuditFilter::default()),
    }
}

fn emit<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
