//! End-to-end scenarios against a mocked apiserver (§8), grounded on the teacher's
//! `ApiServerVerifier`/`tower_test::mock` harness: a paired mock service stands in for the
//! Kubernetes API, and each scenario drives the engine/factory/orchestrator against scripted
//! request/response pairs instead of a live cluster.

use std::time::Duration;

use graphdeploy_engine::engine::{DeployOptions, DirectEngine, Mode};
use graphdeploy_engine::error::Error;
use graphdeploy_engine::factory::DirectFactory;
use graphdeploy_engine::graph::DependencyGraph;
use graphdeploy_engine::kro::KroGraph;
use graphdeploy_engine::readiness::poller::PollConfig;
use graphdeploy_engine::resource::{DeploymentStatus, Resource, ResourceGraph, ResourceGraphInstance};
use graphdeploy_engine::rollback::RollbackStatus;

use http::{Request, Response};
use kube::client::Body;
use kube::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;

type MockHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

fn mock_client() -> (Client, MockHandle) {
    let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(service, "default"), handle)
}

async fn next(handle: &mut MockHandle) -> (Request<Body>, impl FnOnce(Response<Body>)) {
    let (request, send) = handle.next_request().await.expect("apiserver not called");
    (request, move |response| send.send_response(response))
}

fn respond(send: impl FnOnce(Response<Body>), status: u16, body: serde_json::Value) {
    let bytes = serde_json::to_vec(&body).unwrap();
    send(Response::builder().status(status).body(Body::from(bytes)).unwrap());
}

fn configmap_manifest(name: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name},
        "data": {"APP_NAME": name},
    })
}

fn deployment_manifest(name: &str, image: &str) -> serde_json::Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name},
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {"containers": [{"name": "app", "image": image}]},
            },
        },
    })
}

fn deployment_manifest_with_config_ref(name: &str, image: &str, config_map_name: &str) -> serde_json::Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name},
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {
                    "containers": [{
                        "name": "app",
                        "image": image,
                        "envFrom": [{"configMapRef": {"name": config_map_name}}],
                    }],
                },
            },
        },
    })
}

fn service_manifest(name: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": name},
        "spec": {"selector": {"app": name}, "ports": [{"port": 80}]},
    })
}

/// Scenario 1 (§8.1): ConfigMap, then Deployment (depends on the ConfigMap via an inferred
/// `envFrom` reference, with no explicit edge declared), then Service (depends on the
/// Deployment, declared explicitly). All three reach `ready`.
#[tokio::test]
async fn configmap_deployment_service_happy_path() {
    let (client, mut handle) = mock_client();

    let mut graph = ResourceGraph::new("webapp-graph");
    graph.add_resource(Resource::new("cm", configmap_manifest("shared-config")));
    graph.add_resource(Resource::new(
        "deploy",
        deployment_manifest_with_config_ref("${schema.spec.name}", "${schema.spec.image}", "shared-config"),
    ));
    graph.add_resource(Resource::new("svc", service_manifest("${schema.spec.name}")));
    // no graph.depends_on("deploy", "cm") -- that edge must come from the envFrom reference.
    graph.depends_on("svc", "deploy");

    let spec = json!({"name": "test-app", "image": "nginx:alpine"});

    let apiserver = tokio::spawn(async move {
        // ConfigMap: create, then one readiness GET (always ready).
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::POST);
        assert!(req.uri().to_string().contains("configmaps"));
        respond(send, 201, configmap_manifest("shared-config"));

        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        respond(send, 200, configmap_manifest("shared-config"));

        // Deployment: create, then a GET that already reports full availability.
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::POST);
        assert!(req.uri().to_string().contains("deployments"));
        respond(send, 201, deployment_manifest_with_config_ref("test-app", "nginx:alpine", "shared-config"));

        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        let mut ready = deployment_manifest_with_config_ref("test-app", "nginx:alpine", "shared-config");
        ready["status"] = json!({"readyReplicas": 1, "availableReplicas": 1, "unavailableReplicas": 0});
        respond(send, 200, ready);

        // Service: create, then a GET (ClusterIP is ready immediately).
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::POST);
        assert!(req.uri().to_string().contains("services"));
        respond(send, 201, service_manifest("test-app"));

        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        respond(send, 200, service_manifest("test-app"));

        // Post-deploy status hydration: one GET per deployed resource, in apply order.
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        respond(send, 200, configmap_manifest("shared-config"));

        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        let mut ready = deployment_manifest_with_config_ref("test-app", "nginx:alpine", "shared-config");
        ready["status"] = json!({"readyReplicas": 1, "availableReplicas": 1, "unavailableReplicas": 0});
        respond(send, 200, ready);

        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        respond(send, 200, service_manifest("test-app"));
    });

    let factory = DirectFactory::new(client);
    let on_progress = |_event: graphdeploy_engine::readiness::poller::ProgressEvent| {};
    let handle_result = factory
        .deploy(&graph, &spec, &DeployOptions::default(), &on_progress)
        .await
        .expect("deploy succeeds");

    assert_eq!(handle_result.deployment.status, DeploymentStatus::Success);
    assert_eq!(handle_result.deployment.resources.len(), 3);
    assert!(handle_result.deployment.resources.iter().all(|r| r.status == graphdeploy_engine::resource::DeployedResourceStatus::Ready));
    assert_eq!(handle_result.status_fields.len(), 3);

    let deploy_id = handle_result
        .deployment
        .resources
        .iter()
        .find(|r| r.kind == "Deployment")
        .map(|r| r.id.clone())
        .expect("deployment tracked");
    let cm_id = handle_result
        .deployment
        .resources
        .iter()
        .find(|r| r.kind == "ConfigMap")
        .map(|r| r.id.clone())
        .expect("configmap tracked");
    assert!(handle_result.deployment.dependency_graph.dependencies_of(&deploy_id).any(|dep| dep == &cm_id));

    tokio::time::timeout(Duration::from_secs(1), apiserver)
        .await
        .expect("apiserver script completed")
        .unwrap();
}

/// Scenario 2 (§8.2): a Deployment whose image never becomes available times out rather than
/// hanging forever; `ReadinessTimeout` names the stuck resource.
#[tokio::test]
async fn deployment_readiness_timeout() {
    let (client, mut handle) = mock_client();
    let engine = DirectEngine::new(client, Mode::Direct);
    let resource = Resource::new("deploy", deployment_manifest("broken-app", "does/not/exist:tag"));

    let options = DeployOptions {
        wait_for_ready: true,
        poll: PollConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 1.0,
            error_retry_delay: Duration::from_millis(5),
            progress_interval: 100,
            timeout: Duration::from_millis(60),
        },
        ..DeployOptions::default()
    };

    let apiserver = tokio::spawn(async move {
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::POST);
        respond(send, 201, deployment_manifest("broken-app", "does/not/exist:tag"));

        // Keep answering GETs with a never-ready status until the poller gives up.
        loop {
            let Ok(Some((req, send))) = tokio::time::timeout(Duration::from_millis(200), handle.next_request()).await else {
                break;
            };
            assert_eq!(req.method(), http::Method::GET);
            let mut stuck = deployment_manifest("broken-app", "does/not/exist:tag");
            stuck["status"] = json!({"readyReplicas": 0, "availableReplicas": 0, "unavailableReplicas": 1});
            let bytes = serde_json::to_vec(&stuck).unwrap();
            send.send_response(Response::builder().status(200).body(Body::from(bytes)).unwrap());
        }
    });

    let cancel = CancellationToken::new();
    let on_progress = |_event: graphdeploy_engine::readiness::poller::ProgressEvent| {};
    let result = engine.deploy_resource(&resource, &options, &cancel, &on_progress).await;

    match result {
        Err(Error::ReadinessTimeout { resource, .. }) => assert_eq!(resource.resource_id, "deploy"),
        other => panic!("expected ReadinessTimeout, got {other:?}"),
    }

    apiserver.abort();
}

/// Scenario 5 (§8.5): a graph with a dependency cycle fails validation before any API call.
#[tokio::test]
async fn cycle_detection_blocks_before_any_api_call() {
    let (client, _handle) = mock_client();
    let engine = DirectEngine::new(client, Mode::Direct);

    let mut dependency_graph = DependencyGraph::new();
    dependency_graph.add_dependency("a", "b");
    dependency_graph.add_dependency("b", "a");

    let instance = ResourceGraphInstance {
        instance_name: "cyclic".to_owned(),
        resources: vec![
            Resource::new("a", json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}})),
            Resource::new("b", json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b"}})),
        ],
        dependency_graph,
        evaluators: Default::default(),
    };

    let cancel = CancellationToken::new();
    let on_progress = |_event: graphdeploy_engine::readiness::poller::ProgressEvent| {};
    let state = engine.deploy(&instance, &DeployOptions::default(), &cancel, &on_progress).await;

    assert_eq!(state.status, DeploymentStatus::Failed);
    assert!(state.resources.is_empty(), "no resource should have been applied");
    assert!(matches!(
        state.errors.first().map(|e| e.message.contains("cyclic")),
        Some(true)
    ));
}

/// Scenario 4 (§8.4): after a successful deploy, `rollback` deletes every tracked resource.
#[tokio::test]
async fn rollback_after_success_deletes_tracked_resources() {
    let (client, mut handle) = mock_client();

    let mut graph = ResourceGraph::new("cm-only-graph");
    graph.add_resource(Resource::new("cm", configmap_manifest("${schema.spec.name + '-cm'}")));
    let spec = json!({"name": "solo-app"});

    let apiserver = tokio::spawn(async move {
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::POST);
        respond(send, 201, configmap_manifest("solo-app-cm"));

        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        respond(send, 200, configmap_manifest("solo-app-cm"));

        // Post-deploy status hydration read.
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        respond(send, 200, configmap_manifest("solo-app-cm"));

        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::DELETE);
        assert!(req.uri().to_string().contains("solo-app-cm"));
        respond(send, 200, configmap_manifest("solo-app-cm"));
    });

    let factory = DirectFactory::new(client);
    let on_progress = |_event: graphdeploy_engine::readiness::poller::ProgressEvent| {};
    let handle_result = factory
        .deploy(&graph, &spec, &DeployOptions::default(), &on_progress)
        .await
        .expect("deploy succeeds");

    let result = factory
        .delete_instance(&handle_result.instance_name, "default")
        .await
        .expect("rollback succeeds");

    assert_eq!(result.status, RollbackStatus::Success);
    assert_eq!(result.rolled_back.len(), 1);

    tokio::time::timeout(Duration::from_secs(1), apiserver)
        .await
        .expect("apiserver script completed")
        .unwrap();
}

/// Scenario 3 (§8.3): RGD applied, CRD established, instance applied, Kro readiness reached.
#[tokio::test]
async fn kro_rgd_and_instance_happy_path() {
    use graphdeploy_engine::kro::KroOrchestrator;

    let (client, mut handle) = mock_client();
    let orchestrator = KroOrchestrator::new(client);

    let graph = KroGraph {
        schema_kind: "WebApp".to_owned(),
        user_version: "v2beta1".to_owned(),
        rgd_manifest: json!({
            "apiVersion": "kro.run/v1alpha1",
            "kind": "ResourceGraphDefinition",
            "metadata": {"name": "webapp-graph"},
        }),
        instance_template: json!({
            "apiVersion": "kro.run/v2beta1",
            "kind": "WebApp",
            "metadata": {},
        }),
        pre_rgd_closures: Default::default(),
        static_status_fields: Default::default(),
    };

    let spec = json!({"name": "x", "image": "nginx:alpine", "replicas": 2, "environment": "production"});

    let apiserver = tokio::spawn(async move {
        // RGD apply + readiness.
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::POST);
        assert!(req.uri().to_string().contains("resourcegraphdefinitions"));
        respond(
            send,
            201,
            json!({"apiVersion": "kro.run/v1alpha1", "kind": "ResourceGraphDefinition", "metadata": {"name": "webapp-graph"}}),
        );
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        respond(
            send,
            200,
            json!({
                "apiVersion": "kro.run/v1alpha1",
                "kind": "ResourceGraphDefinition",
                "metadata": {"name": "webapp-graph"},
                "status": {},
            }),
        );

        // CRD establishment.
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        assert!(req.uri().to_string().contains("webapps.kro.run"));
        respond(
            send,
            200,
            json!({
                "apiVersion": "apiextensions.k8s.io/v1",
                "kind": "CustomResourceDefinition",
                "metadata": {"name": "webapps.kro.run"},
                "status": {"conditions": [
                    {"type": "Established", "status": "True", "reason": "r", "message": "m", "lastTransitionTime": "2024-01-01T00:00:00Z"},
                    {"type": "NamesAccepted", "status": "True", "reason": "r", "message": "m", "lastTransitionTime": "2024-01-01T00:00:00Z"},
                ]},
            }),
        );

        // Instance apply + Kro readiness.
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::POST);
        assert!(req.uri().to_string().contains("webapps"));
        respond(
            send,
            201,
            json!({"apiVersion": "kro.run/v2beta1", "kind": "WebApp", "metadata": {"name": "x"}}),
        );
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        respond(
            send,
            200,
            json!({
                "apiVersion": "kro.run/v2beta1",
                "kind": "WebApp",
                "metadata": {"name": "x"},
                "status": {
                    "state": "ACTIVE",
                    "conditions": [{"type": "InstanceSynced", "status": "True", "reason": "r", "message": "m", "lastTransitionTime": "2024-01-01T00:00:00Z"}],
                },
            }),
        );

        // Post-readiness hydration read.
        let (req, send) = next(&mut handle).await;
        assert_eq!(req.method(), http::Method::GET);
        respond(
            send,
            200,
            json!({
                "apiVersion": "kro.run/v2beta1",
                "kind": "WebApp",
                "metadata": {"name": "x"},
                "status": {
                    "state": "ACTIVE",
                    "conditions": [{"type": "InstanceSynced", "status": "True", "reason": "r", "message": "m", "lastTransitionTime": "2024-01-01T00:00:00Z"}],
                    "phase": "Running",
                    "replicas": 2,
                    "readyReplicas": 2,
                },
            }),
        );
    });

    let cancel = CancellationToken::new();
    let on_progress = |_event: graphdeploy_engine::readiness::poller::ProgressEvent| {};
    let deployed = orchestrator
        .deploy(&graph, "x", &spec, &DeployOptions::default(), &cancel, &on_progress)
        .await
        .expect("kro deploy succeeds");

    assert_eq!(deployed.instance_name, "x");
    assert_eq!(deployed.status, graphdeploy_engine::factory::HandleStatus::Ready);
    assert_eq!(deployed.status_fields.get("phase").and_then(serde_json::Value::as_str), Some("Running"));
    assert_eq!(deployed.status_fields.get("readyReplicas").and_then(serde_json::Value::as_i64), Some(2));

    tokio::time::timeout(Duration::from_secs(1), apiserver)
        .await
        .expect("apiserver script completed")
        .unwrap();
}
