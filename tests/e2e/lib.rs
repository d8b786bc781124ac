#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use graphdeploy_engine::engine::DeployOptions;
    use graphdeploy_engine::factory::{DirectFactory, HandleStatus};
    use graphdeploy_engine::readiness::poller::ProgressEvent;
    use graphdeploy_engine::resource::{DeploymentStatus, Resource, ResourceGraph};
    use kube::Client;
    use serde_json::json;
    use tokio::time::timeout;

    fn configmap_and_deployment_graph(name: &str) -> ResourceGraph {
        let mut graph = ResourceGraph::new(format!("{name}-graph"));
        graph.add_resource(Resource::new(
            "cm",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "${schema.spec.name + '-cm'}"},
                "data": {"GREETING": "hello"},
            }),
        ));
        graph.add_resource(Resource::new(
            "deploy",
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "${schema.spec.name}"},
                "spec": {
                    "replicas": 1,
                    "selector": {"matchLabels": {"app": "${schema.spec.name}"}},
                    "template": {
                        "metadata": {"labels": {"app": "${schema.spec.name}"}},
                        "spec": {"containers": [{"name": "app", "image": "inanimate/echo-server:latest"}]},
                    },
                },
            }),
        ));
        graph.depends_on("deploy", "cm");
        graph
    }

    async fn factory() -> DirectFactory {
        let client = Client::try_default().await.unwrap();
        DirectFactory::new(client)
    }

    /// Deploys a ConfigMap+Deployment graph against a live cluster and waits for both to
    /// report ready (§8.1 against real infrastructure rather than a mocked apiserver).
    #[tokio::test]
    async fn deploy_configmap_and_deployment_reaches_ready() {
        let name = "e2e-create";
        let factory = factory().await;
        let graph = configmap_and_deployment_graph(name);
        let spec = json!({"name": name});

        let on_progress = |_event: ProgressEvent| {};
        let handle = timeout(
            Duration::from_secs(60),
            factory.deploy(&graph, &spec, &DeployOptions::default(), &on_progress),
        )
        .await
        .expect("deploy did not time out")
        .expect("deploy succeeds");

        assert_eq!(handle.deployment.status, DeploymentStatus::Success);
        assert_eq!(handle.status, HandleStatus::Ready);

        factory.delete_instance(&handle.instance_name, "default").await.unwrap();
    }

    /// A rolled-back instance no longer reports as tracked: rollback both deletes the cluster
    /// objects and marks the handle `destroyed` (§4.7/§4.8).
    #[tokio::test]
    async fn rollback_destroys_tracked_instance() {
        let name = "e2e-rollback";
        let factory = factory().await;
        let graph = configmap_and_deployment_graph(name);
        let spec = json!({"name": name});

        let on_progress = |_event: ProgressEvent| {};
        let handle = timeout(
            Duration::from_secs(60),
            factory.deploy(&graph, &spec, &DeployOptions::default(), &on_progress),
        )
        .await
        .expect("deploy did not time out")
        .expect("deploy succeeds");

        let result = factory.delete_instance(&handle.instance_name, "default").await.unwrap();
        assert_eq!(result.rolled_back.len(), handle.deployment.resources.len());

        let status = factory.get_status(&handle.instance_name).await.unwrap();
        assert_eq!(status, HandleStatus::Destroyed);
    }
}
