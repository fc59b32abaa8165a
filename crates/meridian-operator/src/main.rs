//! Meridian operator - declarative convergence of managed product installations

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};

use meridian_common::config::{EngineConfig, RequeuePolicy, DEFAULT_DOMAIN};
use meridian_common::crd::Installation;
use meridian_operator::controller::{self, OperatorConfig, CONTROLLER_NAME};
use meridian_operator::telemetry::init_telemetry;

/// Meridian - installs and tears down managed products for each Installation
#[derive(Parser, Debug)]
#[command(name = "meridian", version, about, long_about = None)]
struct Cli {
    /// Print the Installation CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// OTLP collector for traces and metrics; logs only when unset
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Installation controller (default mode)
    Controller,
}

#[derive(Args, Debug, Clone)]
struct ControllerArgs {
    /// Domain used for finalizer markers and labels
    #[arg(long, env = "MERIDIAN_DOMAIN", default_value = DEFAULT_DOMAIN)]
    domain: String,

    /// Only watch Installations in this namespace
    #[arg(long, env = "MERIDIAN_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Budget for one reconcile in seconds, 0 for unbounded
    #[arg(long, env = "MERIDIAN_RECONCILE_TIMEOUT_SECS", default_value_t = 120)]
    reconcile_timeout_secs: u64,

    /// Namespace holding the operator catalog source
    #[arg(long, env = "MERIDIAN_CATALOG_NAMESPACE", default_value = "openshift-marketplace")]
    catalog_namespace: String,

    /// Identity-provider group promoted to API management admins
    #[arg(long, env = "MERIDIAN_PRIVILEGED_GROUP", default_value = "dedicated-admins")]
    privileged_group: String,

    /// Do not apply the Installation CRD on start-up
    #[arg(long, env = "MERIDIAN_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,
}

impl ControllerArgs {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            engine: EngineConfig {
                domain: self.domain.clone(),
                reconcile_timeout: (self.reconcile_timeout_secs > 0)
                    .then(|| Duration::from_secs(self.reconcile_timeout_secs)),
                requeue: RequeuePolicy::default(),
            },
            watch_namespace: self.watch_namespace.clone(),
            catalog_namespace: self.catalog_namespace.clone(),
            privileged_group: self.privileged_group.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Installation::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let telemetry = init_telemetry(cli.otlp_endpoint.as_deref())?;

    let result = match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    };
    if let Some(telemetry) = telemetry {
        telemetry.shutdown();
    }
    result
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    if !args.skip_crd_install {
        ensure_crd_installed(&client).await?;
    }
    controller::run(client, args.operator_config(), None).await;
    Ok(())
}

/// Server-side apply the Installation CRD so its schema always matches the
/// running operator
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    tracing::info!("Installing Installation CRD...");
    crds.patch(
        "installations.meridian.dev",
        &params,
        &Patch::Apply(&Installation::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Installation CRD: {}", e))?;
    Ok(())
}
