use std::fs;
use std::path::PathBuf;

use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use clap::{crate_authors, crate_description, crate_version, Parser, Subcommand};
use graphdeploy_engine::engine::{DeployOptions, RetryPolicy};
use graphdeploy_engine::factory::{DirectFactory, HandleStatus};
use graphdeploy_engine::readiness::poller::{PollConfig, ProgressEvent};
use graphdeploy_engine::resource::{Resource, ResourceGraph};
use graphdeploy_engine::telemetry;
use graphdeploy_k8s_util::client::new_client_with_metrics;
use kube::Config;
use prometheus_client::registry::Registry;
use serde_json::Value as Json;
use tokio::sync::Mutex;

struct State {
    registry: Mutex<Registry>,
    factory: DirectFactory,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let mut buf = String::new();
    let encoded = {
        let registry = c.registry.lock().await;
        prometheus_client::encoding::text::encode(&mut buf, &registry)
    };
    match encoded {
        Ok(()) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(buf),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

/// Deploys a resource graph to a concrete spec, tears one down, or reports its status (§6.1).
#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve `--graph` against `--spec` and apply it.
    Deploy {
        /// Path to the resource graph template (JSON or YAML).
        #[arg(long)]
        graph: PathBuf,

        /// Path to the user spec to resolve references against (JSON or YAML).
        #[arg(long)]
        spec: PathBuf,

        /// Execution mode: resolve and apply directly, or hand off to the in-cluster Kro controller.
        #[arg(long, value_enum, default_value_t = ModeArg::Direct)]
        mode: ModeArg,

        /// Namespace to apply resources into.
        #[arg(long, default_value = "default")]
        namespace: String,

        /// Block until every resource reports ready (or times out).
        #[arg(long, default_value_t = true)]
        wait_for_ready: bool,

        /// Per-resource readiness timeout, in milliseconds.
        #[arg(long, default_value_t = 300_000)]
        timeout_ms: u64,

        /// Validate and render the instance without calling the Kubernetes API.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Hydrate resource status from the live cluster once deployed.
        #[arg(long, default_value_t = true)]
        hydrate_status: bool,

        /// Maximum attempts for a single resource's apply call before giving up on a
        /// transient failure.
        #[arg(long, default_value_t = 3)]
        retry_max_attempts: u32,

        /// Delay between apply retry attempts, in milliseconds.
        #[arg(long, default_value_t = 2_000)]
        retry_backoff_ms: u64,
    },
    /// Tear down a previously deployed instance in reverse dependency order.
    Rollback {
        /// Instance name returned by a prior `deploy`.
        #[arg(long)]
        instance: String,

        /// Namespace the instance was deployed into.
        #[arg(long, default_value = "default")]
        namespace: String,
    },
    /// Report the tracked status of a previously deployed instance.
    Status {
        /// Instance name returned by a prior `deploy`.
        #[arg(long)]
        instance: String,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ModeArg {
    Direct,
    Kro,
}

#[derive(Parser, Debug)]
#[command(
    name = "deployctl",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Listen on given port for `/health` and `/metrics`.
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,graphdeploy=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

fn load_json_or_yaml(path: &PathBuf) -> anyhow::Result<Json> {
    let raw = fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(serde_json::from_str(&raw)?),
        _ => Ok(serde_yaml::from_str(&raw)?),
    }
}

/// On-disk shape for a `--graph` file: a name, an ordered list of manifests keyed by a local
/// id, and the explicit dependency edges between those ids (§3). Evaluator callbacks cannot be
/// carried in a file, so graphs loaded this way rely entirely on the per-kind readiness table.
#[derive(serde::Deserialize)]
struct GraphFile {
    name: String,
    resources: Vec<GraphFileResource>,
    #[serde(default)]
    dependencies: std::collections::BTreeMap<String, Vec<String>>,
}

#[derive(serde::Deserialize)]
struct GraphFileResource {
    id: String,
    manifest: Json,
}

fn load_graph(path: &PathBuf) -> anyhow::Result<ResourceGraph> {
    let raw = fs::read_to_string(path)?;
    let file: GraphFile = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw)?,
        _ => serde_yaml::from_str(&raw)?,
    };

    let mut graph = ResourceGraph::new(file.name);
    for resource in file.resources {
        graph.add_resource(Resource::new(resource.id, resource.manifest));
    }
    for (resource, dependencies) in file.dependencies {
        for dependency in dependencies {
            graph.depends_on(resource.clone(), dependency);
        }
    }
    Ok(graph)
}

#[allow(clippy::too_many_arguments)]
async fn run_deploy(
    state: &State,
    graph: PathBuf,
    spec: PathBuf,
    mode: ModeArg,
    namespace: String,
    wait_for_ready: bool,
    timeout_ms: u64,
    dry_run: bool,
    hydrate_status: bool,
    retry_max_attempts: u32,
    retry_backoff_ms: u64,
) -> anyhow::Result<()> {
    if matches!(mode, ModeArg::Kro) {
        anyhow::bail!("--mode kro is reconciled by the in-cluster Kro controller, not this CLI's Direct factory");
    }

    let graph = load_graph(&graph)?;
    let spec = load_json_or_yaml(&spec)?;

    let options = DeployOptions {
        namespace,
        wait_for_ready,
        dry_run,
        poll: PollConfig {
            timeout: std::time::Duration::from_millis(timeout_ms),
            ..PollConfig::default()
        },
        hydrate_status,
        retry: RetryPolicy {
            max_attempts: retry_max_attempts,
            backoff: std::time::Duration::from_millis(retry_backoff_ms),
        },
    };

    let on_progress = |event: ProgressEvent| {
        tracing::info!(?event, "deploy progress");
    };

    let handle = state.factory.deploy(&graph, &spec, &options, &on_progress).await?;
    println!("{}", serde_json::to_string_pretty(&handle)?);
    Ok(())
}

async fn run_rollback(state: &State, instance: String, namespace: String) -> anyhow::Result<()> {
    let result = state.factory.delete_instance(&instance, &namespace).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_status(state: &State, instance: String) -> anyhow::Result<()> {
    let status = state.factory.get_status(&instance).await?;
    println!("{}", status_json(status));
    Ok(())
}

fn status_json(status: HandleStatus) -> String {
    serde_json::json!({ "status": format!("{status:?}").to_lowercase() }).to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let mut registry = Registry::with_prefix("graphdeploy");
    let config = Config::infer().await?;
    let client = new_client_with_metrics(config, &mut registry).await?;
    let factory = DirectFactory::new(client);

    let state = Data::new(State {
        registry: Mutex::new(registry),
        factory,
    });

    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(server_state.clone())
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    let command = async {
        match args.command {
            Command::Deploy {
                graph,
                spec,
                mode,
                namespace,
                wait_for_ready,
                timeout_ms,
                dry_run,
                hydrate_status,
                retry_max_attempts,
                retry_backoff_ms,
            } => {
                run_deploy(
                    &state,
                    graph,
                    spec,
                    mode,
                    namespace,
                    wait_for_ready,
                    timeout_ms,
                    dry_run,
                    hydrate_status,
                    retry_max_attempts,
                    retry_backoff_ms,
                )
                .await
            }
            Command::Rollback { instance, namespace } => run_rollback(&state, instance, namespace).await,
            Command::Status { instance } => run_status(&state, instance).await,
        }
    };

    // The command runs once and exits; the server stays up for `/health` and `/metrics` until
    // the process is signalled, mirroring the teacher's `tokio::join!` shutdown coordination.
    let (command_result, server_result) = tokio::join!(command, server.run());
    command_result?;
    server_result?;
    Ok(())
}
