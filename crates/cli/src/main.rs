use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fabrica_core::{EventKind, OpVerb, Resource, ResourceKey};
use fabrica_fabric::{FabricClient, HttpFabricClient};
use fabrica_store::DesiredStore;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fabricactl", version, about = "Fabrica operator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Fabric controller endpoint
    #[arg(long, global = true, env = "FABRICA_ENDPOINT")]
    endpoint: Option<String>,

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
    /// List fabric objects under a scope
    Poll {
        /// Scope key, e.g. "tn-green" or "tn-green/bd-web"
        scope: String,
    },
    /// Fetch one fabric object
    Get {
        /// Full key, e.g. "tn-green/bd-web/subnet-10.0.0.0_24"
        key: String,
    },
    /// Stream fabric change events for a scope, one line each
    Watch {
        scope: String,
    },
    /// Diff a desired YAML document against the live fabric
    Diff {
        scope: String,
        /// Desired resources, YAML
        #[arg(short = 'f', long = "file")]
        file: std::path::PathBuf,
    },
    /// Seed a desired store database from a YAML document
    Load {
        /// Desired resources, YAML
        #[arg(short = 'f', long = "file")]
        file: std::path::PathBuf,
        /// SQLite path of the desired store
        #[arg(long = "db")]
        db: String,
    },
    /// Show desired records in a store database
    Status {
        /// SQLite path of the desired store
        #[arg(long = "db")]
        db: String,
        /// Restrict to one scope
        scope: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("FABRICA_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn client(cli: &Cli) -> Result<HttpFabricClient> {
    let endpoint = cli
        .endpoint
        .as_deref()
        .context("--endpoint (or FABRICA_ENDPOINT) is required for fabric commands")?;
    HttpFabricClient::new(endpoint, Duration::from_secs(10))
}

fn print_resources(output: Output, resources: &[Resource]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<50} {:<15} PROPS", "KEY", "KIND");
            for r in resources {
                let props: Vec<String> =
                    r.props.iter().map(|(k, v)| format!("{k}={v}")).collect();
                println!("{:<50} {:<15} {}", r.key.as_str(), r.kind.to_string(), props.join(","));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(resources)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Poll { scope } => {
            let scope = ResourceKey::parse(scope)?;
            let resources = client(&cli)?.poll(&scope).await?;
            print_resources(cli.output, &resources)?;
        }
        Commands::Get { key } => {
            let key = ResourceKey::parse(key)?;
            match client(&cli)?.get(&key).await? {
                Some(r) => print_resources(cli.output, std::slice::from_ref(&r))?,
                None => {
                    eprintln!("{key}: not found");
                    std::process::exit(1);
                }
            }
        }
        Commands::Watch { scope } => {
            let scope = ResourceKey::parse(scope)?;
            let fabric = client(&cli)?;
            let mut sub = fabric.subscribe(&scope).await?;
            info!(scope = %scope, "watching");
            loop {
                tokio::select! {
                    maybe = sub.recv() => match maybe {
                        Some(ev) => {
                            let sigil = match ev.kind {
                                EventKind::Created => '+',
                                EventKind::Updated => '~',
                                EventKind::Deleted => '-',
                                EventKind::ResyncNeeded => '!',
                            };
                            match cli.output {
                                Output::Human => println!("{sigil} {}", ev.key),
                                Output::Json => println!("{}", serde_json::to_string(&ev)?),
                            }
                        }
                        None => {
                            warn!("subscription lost; exiting");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => break,
                }
            }
        }
        Commands::Diff { scope, file } => {
            let scope = ResourceKey::parse(scope)?;
            let doc = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let store = DesiredStore::in_memory();
            store.load_yaml(&doc)?;
            let desired = store.snapshot().subtree(&scope);
            let observed = client(&cli)?.poll(&scope).await?;
            let ops = fabrica_diff::diff(&desired, &observed);
            match cli.output {
                Output::Human => {
                    if ops.is_empty() {
                        println!("in sync: nothing to do");
                    }
                    for op in &ops {
                        let verb = match op.verb {
                            OpVerb::Create => "create",
                            OpVerb::Update => "update",
                            OpVerb::Delete => "delete",
                        };
                        println!("{verb:<7} {}", op.key);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&ops)?),
            }
        }
        Commands::Load { file, db } => {
            let doc = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let store = DesiredStore::open(db)?;
            let n = store.load_yaml(&doc)?;
            println!("loaded {n} records into {db}");
        }
        Commands::Status { db, scope } => {
            let store = DesiredStore::open(db)?;
            let snap = store.snapshot();
            let scope = match scope {
                Some(s) => Some(ResourceKey::parse(s)?),
                None => None,
            };
            let mut rows: Vec<_> = snap
                .records
                .values()
                .filter(|r| scope.as_ref().map_or(true, |s| r.resource.key.in_scope(s)))
                .collect();
            rows.sort_by(|a, b| a.resource.key.cmp(&b.resource.key));
            match cli.output {
                Output::Human => {
                    println!("{:<50} {:>8} {}", "KEY", "VERSION", "STATE");
                    for r in rows {
                        let state = if r.deleting { "deleting" } else { "live" };
                        println!("{:<50} {:>8} {}", r.resource.key.as_str(), r.resource.version, state);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }

    Ok(())
}
