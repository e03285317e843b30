use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use stagehand_core::DeployOptions;
use stagehand_deploy::{resolve_context, RegionDeployer};
use stagehand_project::Project;
use stagehand_provider::AwsProvider;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "stagehandctl", version, about = "Stagehand: single-region API Gateway stage deployer")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Project file
    #[arg(long = "project", global = true, default_value = "stagehand.yml")]
    project: PathBuf,

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
    /// Create a stage deployment in one region, reconciling authorizers first
    Deploy {
        /// Target stage name, e.g. "dev"
        #[arg(long)]
        stage: String,
        /// Target region identifier, e.g. "us-east-1"
        #[arg(long)]
        region: String,
        /// REST API identifier
        #[arg(long = "rest-api-id")]
        rest_api_id: String,
        /// Deployment description (defaults to a fixed literal)
        #[arg(long)]
        description: Option<String>,
    },
    /// List the project's functions and their authorizer declarations
    Functions,
}

fn init_tracing() {
    let env = std::env::var("STAGEHAND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STAGEHAND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STAGEHAND_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let project = Project::from_path(&cli.project)?;

    match cli.command {
        Commands::Deploy { stage, region, rest_api_id, description } => {
            info!(stage = %stage, region = %region, rest_api_id = %rest_api_id, "deploy invoked");
            let opts = DeployOptions {
                stage,
                region: region.clone(),
                rest_api_id,
                description,
            };
            let cx = resolve_context(&project, opts)?;
            let gateway = AwsProvider::connect(&region).await;
            match RegionDeployer::new(&gateway).deploy(&project, &cx).await {
                Ok(outcome) => match cli.output {
                    Output::Human => println!("deployment {}", outcome.deployment_id),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
                },
                Err(e) => {
                    error!(stage = %cx.stage, region = %cx.region, error = %e, "deploy failed");
                    return Err(e.into());
                }
            }
        }
        Commands::Functions => {
            match cli.output {
                Output::Human => {
                    println!("NAME                 DEPLOYED NAME          AUTHORIZER");
                    for f in project.all_functions() {
                        let auth = if f.wants_authorizer() { "yes" } else { "-" };
                        println!("{:<20} {:<22} {}", f.name, f.deployed_name(), auth);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(project.all_functions())?),
            }
        }
    }

    Ok(())
}
