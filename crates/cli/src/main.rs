use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use fleetshard_core::labels::LABEL_DEPLOYMENT_ID;
use fleetshard_core::{is_secret_linked, ConnectorDeployment, ManagedConnector};
use fleetshard_kubehub::{
    ClientConfig, ConnectorEvent, FleetShardClient, InMemoryFleetShardClient, KubeFleetShardClient,
};
use fleetshard_sync::{ConnectorDeploymentProvisioner, Provisioned};
use kube::{CustomResourceExt, ResourceExt};
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fleetshardctl", version, about = "Connector deployment provisioning")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Cluster id
    #[arg(long = "cluster-id", env = "FLEETSHARD_CLUSTER_ID", global = true)]
    cluster_id: Option<String>,

    /// Namespace holding managed connectors and their secrets
    #[arg(long = "namespace", short = 'n', env = "FLEETSHARD_CONNECTORS_NAMESPACE", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision a connector deployment descriptor (JSON or YAML)
    Provision {
        file: PathBuf,
        /// Run against a process-local store instead of the cluster
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// List managed connectors of this cluster
    Ls,
    /// Print the highest deployment resource revision seen on this cluster
    MaxRevision,
    /// Delete a managed connector and, through ownership, its secrets
    Delete { name: String },
    /// Stream connector events until Ctrl-C
    Watch,
    /// Print the ManagedConnector CRD
    Crd,
}

fn init_tracing() {
    let env = std::env::var("FLEETSHARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLEETSHARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FLEETSHARD_METRICS_ADDR; expected host:port");
        }
    }
}

/// Flags win over the environment.
fn client_config(cli: &Cli) -> Result<ClientConfig> {
    ClientConfig::from_lookup(|key| {
        let flag = match key {
            "FLEETSHARD_CLUSTER_ID" => cli.cluster_id.clone(),
            "FLEETSHARD_CONNECTORS_NAMESPACE" => cli.namespace.clone(),
            _ => None,
        };
        flag.or_else(|| std::env::var(key).ok())
    })
}

async fn connect(config: ClientConfig, dry_run: bool) -> Result<Arc<dyn FleetShardClient>> {
    if dry_run {
        info!(cluster_id = %config.cluster_id, "dry run: using in-memory store");
        return Ok(Arc::new(InMemoryFleetShardClient::new(config)));
    }
    let client = KubeFleetShardClient::try_default(config)
        .await
        .context("connecting to the cluster")?;
    Ok(Arc::new(client))
}

fn load_deployment(path: &Path) -> Result<ConnectorDeployment> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_deployment(&raw, path.extension().and_then(|e| e.to_str()))
        .with_context(|| format!("parsing {}", path.display()))
}

fn parse_deployment(raw: &str, ext: Option<&str>) -> Result<ConnectorDeployment> {
    match ext {
        Some("json") => Ok(serde_json::from_str(raw)?),
        _ => Ok(serde_yaml::from_str(raw)?),
    }
}

#[derive(Debug, Serialize)]
struct Row {
    namespace: String,
    name: String,
    connector_id: String,
    deployment_id: String,
    revision: i64,
    desired_state: String,
    secret: Option<String>,
    linked: bool,
    age: String,
}

impl Row {
    fn new(c: &ManagedConnector, linked: bool) -> Self {
        let d = &c.spec.deployment;
        Self {
            namespace: c.namespace().unwrap_or_default(),
            name: c.name_any(),
            connector_id: c.spec.connector_id.clone(),
            deployment_id: c.spec.deployment_id.clone(),
            revision: d.deployment_resource_version,
            desired_state: d.desired_state.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            secret: d.secret.clone(),
            linked,
            age: c
                .creation_timestamp()
                .map(|t| render_age(chrono::Utc::now().signed_duration_since(t.0)))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

fn render_age(age: chrono::Duration) -> String {
    let mut secs = age.num_seconds().max(0);
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

fn print_rows(output: Output, rows: &[Row]) -> Result<()> {
    match output {
        Output::Human => {
            println!(
                "{:<42} {:<12} {:<12} {:<8} {:<10} {:<7} AGE",
                "NAME", "CONNECTOR", "DEPLOYMENT", "REV", "STATE", "LINKED"
            );
            for r in rows {
                println!(
                    "{:<42} {:<12} {:<12} {:<8} {:<10} {:<7} {}",
                    r.name, r.connector_id, r.deployment_id, r.revision, r.desired_state, r.linked, r.age
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(rows)?),
    }
    Ok(())
}

/// A connector counts as linked when the secret for its current revision exists
/// and matches the recorded name and checksum.
async fn linked(client: &dyn FleetShardClient, c: &ManagedConnector) -> Result<bool> {
    if !c.has_secret_reference() {
        return Ok(false);
    }
    let Some(deployment_id) = c.labels().get(LABEL_DEPLOYMENT_ID) else {
        return Ok(false);
    };
    let secret = client
        .get_secret_by_deployment_id_and_revision(deployment_id, c.spec.deployment.deployment_resource_version)
        .await?;
    Ok(secret.is_some_and(|s| is_secret_linked(c, &s)))
}

fn print_provisioned(output: Output, out: &Provisioned) -> Result<()> {
    let row = Row::new(&out.connector, out.is_linked());
    match output {
        Output::Human => {
            println!(
                "{}/{} rev={} state={} secret={} linked={}",
                row.namespace,
                row.name,
                row.revision,
                row.desired_state,
                row.secret.as_deref().unwrap_or("-"),
                row.linked
            );
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&row)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&ManagedConnector::crd())?);
        }
        Commands::Provision { file, dry_run } => {
            let deployment = load_deployment(file)?;
            let client = connect(client_config(&cli)?, *dry_run).await?;
            info!(file = %file.display(), deployment_id = %deployment.id, dry_run = *dry_run, "provision invoked");
            let provisioner = ConnectorDeploymentProvisioner::new(client);
            match provisioner.provision(&deployment).await {
                Ok(out) => print_provisioned(cli.output, &out)?,
                Err(e) => {
                    error!(error = %e, retryable = e.is_retryable(), "provision failed");
                    return Err(e.into());
                }
            }
        }
        Commands::Ls => {
            let client = connect(client_config(&cli)?, false).await?;
            info!(cluster_id = %client.cluster_id(), "ls invoked");
            let mut rows = Vec::new();
            for c in client.get_all_connectors().await? {
                let is_linked = linked(client.as_ref(), &c).await?;
                rows.push(Row::new(&c, is_linked));
            }
            print_rows(cli.output, &rows)?;
        }
        Commands::MaxRevision => {
            let client = connect(client_config(&cli)?, false).await?;
            let rev = client.max_deployment_resource_revision().await?;
            match cli.output {
                Output::Human => println!("{}", rev),
                Output::Json => println!("{}", serde_json::json!({ "revision": rev })),
            }
        }
        Commands::Delete { name } => {
            let client = connect(client_config(&cli)?, false).await?;
            info!(name = %name, "delete invoked");
            let deleted = client.delete_connector(name).await?;
            match cli.output {
                Output::Human if deleted => println!("deleted {}", name),
                Output::Human => println!("{} not found", name),
                Output::Json => println!("{}", serde_json::json!({ "name": name, "deleted": deleted })),
            }
        }
        Commands::Watch => {
            let client = connect(client_config(&cli)?, false).await?;
            info!(cluster_id = %client.cluster_id(), "watch invoked");
            let (tx, mut rx) = mpsc::channel::<ConnectorEvent>(256);
            let watcher_handle = tokio::spawn({
                let client = Arc::clone(&client);
                async move {
                    if let Err(e) = client.watch_connectors(tx).await {
                        error!(error = %e, "watcher failed");
                    }
                }
            });
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        match maybe {
                            Some(ev) => print_event(cli.output, &ev)?,
                            None => {
                                warn!("event channel closed; exiting watch loop");
                                break;
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            watcher_handle.abort();
        }
    }

    Ok(())
}

fn print_event(output: Output, ev: &ConnectorEvent) -> Result<()> {
    let (sign, c) = match ev {
        ConnectorEvent::Applied(c) => ("+", c),
        ConnectorEvent::Deleted(c) => ("-", c),
    };
    match output {
        Output::Human => println!(
            "{} {}/{} rev={} secret={}",
            sign,
            c.namespace().unwrap_or_default(),
            c.name_any(),
            c.spec.deployment.deployment_resource_version,
            c.spec.deployment.secret.as_deref().unwrap_or("-")
        ),
        Output::Json => println!(
            "{}",
            serde_json::json!({ "event": if sign == "+" { "applied" } else { "deleted" }, "connector": c })
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetshard_core::DesiredState;

    #[test]
    fn parses_yaml_and_json_descriptors() {
        let yaml = r#"
id: d1
metadata:
  resource_version: 3
spec:
  connector_id: c1
  connector_type_id: log_sink_0.1
  connector_resource_version: 1
  operator_id: camel-op
  desired_state: running
  shard_metadata:
    operators:
      - type: camel
        version: "1.0"
"#;
        let d = parse_deployment(yaml, Some("yaml")).unwrap();
        assert_eq!(d.resource_version(), 3);
        assert_eq!(d.desired_state(), &DesiredState::Ready);
        assert_eq!(d.operator_selector().unwrap().type_, "camel");

        let json = serde_json::to_string(&d).unwrap();
        let back = parse_deployment(&json, Some("json")).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn flags_override_environment() {
        let cli = Cli::parse_from(["fleetshardctl", "--cluster-id", "k9", "-n", "conn", "ls"]);
        let cfg = client_config(&cli).unwrap();
        assert_eq!(cfg.cluster_id, "k9");
        assert_eq!(cfg.connectors_namespace, "conn");
    }

    #[test]
    fn age_is_compact() {
        assert_eq!(render_age(chrono::Duration::seconds(42)), "42s");
        assert_eq!(render_age(chrono::Duration::seconds(3 * 3600 + 120)), "3h2m");
        assert_eq!(render_age(chrono::Duration::seconds(2 * 86_400 + 3600)), "2d1h");
        assert_eq!(render_age(chrono::Duration::seconds(-5)), "0s");
    }

    #[tokio::test]
    async fn linkage_is_reported_for_provisioned_connectors() {
        let client = Arc::new(InMemoryFleetShardClient::new(ClientConfig::new("k1", "connectors")));
        let yaml = r#"
id: d1
metadata: { resource_version: 1 }
spec:
  connector_id: c1
  connector_type_id: t
  connector_resource_version: 1
  operator_id: op
  desired_state: ready
  shard_metadata: { operators: [ { type: camel, version: "1.0" } ] }
"#;
        let d = parse_deployment(yaml, None).unwrap();
        let out = ConnectorDeploymentProvisioner::new(client.clone()).provision(&d).await.unwrap();
        assert!(linked(client.as_ref(), &out.connector).await.unwrap());

        let mut stale = out.connector.clone();
        stale.spec.deployment.secret_checksum = Some("0".repeat(64));
        assert!(!linked(client.as_ref(), &stale).await.unwrap());
    }
}
