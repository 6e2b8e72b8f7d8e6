//! Integration tests for the provisioning lifecycle
//!
//! Exercises the full service stack against an in-memory engine fake:
//! provisioning, capacity admission, reconciliation, cleanup, status
//! reporting and the HTTP surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tower::ServiceExt;

use gantry_core::application::provisioning::{
    ProvisionError, ProvisionRequest, ProvisioningService,
};
use gantry_core::application::registry::InstanceRegistry;
use gantry_core::application::status::StatusService;
use gantry_core::domain::backend::{
    ApiVersion, BackendError, ContainerBackend, NodeDescriptor, SecretRef,
};
use gantry_core::domain::instance::{
    AgentInstance, AgentRegistration, AUTO_REGISTER_KEY_ENV, SERVER_URL_ENV,
};
use gantry_core::domain::job::JobIdentifier;
use gantry_core::domain::profile::{keys as profile_keys, AgentProfile, Properties};
use gantry_core::domain::settings::ClusterSettings;
use gantry_core::presentation::api;

/// In-memory engine double. Accepts every well-formed request and
/// remembers the services it runs; failure toggles simulate a wedged
/// engine.
struct FakeSwarm {
    services: Mutex<HashMap<String, AgentInstance>>,
    volumes: Vec<String>,
    secrets: Vec<SecretRef>,
    api_version: ApiVersion,
    fail_create: Mutex<bool>,
    fail_list: Mutex<bool>,
    fail_logs: Mutex<bool>,
    backdate_created: bool,
    created: AtomicUsize,
}

impl FakeSwarm {
    fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            volumes: vec!["build-cache".to_string()],
            secrets: vec![SecretRef {
                id: "sec-1".to_string(),
                name: "registry-token".to_string(),
            }],
            api_version: ApiVersion {
                major: 1,
                minor: 41,
            },
            fail_create: Mutex::new(false),
            fail_list: Mutex::new(false),
            fail_logs: Mutex::new(false),
            backdate_created: false,
            created: AtomicUsize::new(0),
        }
    }

    /// A swarm whose services were all created long before the
    /// auto-register window.
    fn backdated() -> Self {
        Self {
            backdate_created: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl ContainerBackend for FakeSwarm {
    async fn create_instance(
        &self,
        profile: &AgentProfile,
        settings: &ClusterSettings,
        registration: &AgentRegistration,
        job: &JobIdentifier,
    ) -> Result<AgentInstance, BackendError> {
        if *self.fail_create.lock() {
            return Err(BackendError::Unavailable("engine is down".to_string()));
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst);
        let name = format!("agent-{serial:04}");
        let mut environment = profile.environment.clone();
        environment.push(format!("{}={}", SERVER_URL_ENV, settings.server_url));
        if let Some(key) = &registration.auto_register_key {
            environment.push(format!("{AUTO_REGISTER_KEY_ENV}={key}"));
        }
        let created_at = if self.backdate_created {
            Utc::now() - ChronoDuration::minutes(90)
        } else {
            Utc::now()
        };
        let memory_limit = profile
            .max_memory
            .as_deref()
            .and_then(|raw| gantry_core::domain::size::parse_size(raw).ok())
            .map(|bytes| bytes as i64);
        let instance = AgentInstance {
            id: format!("svc-{serial:04}"),
            name: name.clone(),
            created_at: Some(created_at),
            image: profile.image.clone(),
            command: profile.command.clone(),
            environment,
            memory_limit,
            job: Some(job.clone()),
            ..Default::default()
        };
        self.services.lock().insert(name, instance.clone());
        Ok(instance)
    }

    async fn list_instances(&self) -> Result<Vec<AgentInstance>, BackendError> {
        if *self.fail_list.lock() {
            return Err(BackendError::Unavailable("engine is down".to_string()));
        }
        Ok(self.services.lock().values().cloned().collect())
    }

    async fn remove_instance(&self, name: &str) -> Result<(), BackendError> {
        self.services
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("service {name} not found")))
    }

    async fn api_version(&self) -> Result<ApiVersion, BackendError> {
        Ok(self.api_version)
    }

    async fn list_volumes(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.volumes.clone())
    }

    async fn list_secrets(&self) -> Result<Vec<SecretRef>, BackendError> {
        Ok(self.secrets.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeDescriptor>, BackendError> {
        Ok(vec![NodeDescriptor {
            id: "node-1".to_string(),
            hostname: Some("worker-1".to_string()),
            role: Some("manager".to_string()),
            state: Some("ready".to_string()),
            nano_cpus: Some(8_000_000_000),
            memory_bytes: Some(17_179_869_184),
            ..Default::default()
        }])
    }

    async fn instance_logs(&self, name: &str) -> Result<String, BackendError> {
        if *self.fail_logs.lock() {
            return Err(BackendError::Unavailable(
                "log endpoint is down".to_string(),
            ));
        }
        if self.services.lock().contains_key(name) {
            Ok(format!("[{name}] agent started\n"))
        } else {
            Err(BackendError::NotFound(format!("service {name} not found")))
        }
    }
}

fn props(pairs: &[(&str, &str)]) -> Properties {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn defaults(max_instances: usize) -> ClusterSettings {
    ClusterSettings {
        server_url: "https://ci.example.com/go".to_string(),
        max_instances,
        auto_register_timeout: 10,
        docker_uri: None,
        private_registry: None,
    }
}

fn stack(swarm: Arc<FakeSwarm>, max_instances: usize) -> Arc<ProvisioningService> {
    let backend: Arc<dyn ContainerBackend> = swarm;
    let registry = Arc::new(InstanceRegistry::default());
    Arc::new(ProvisioningService::new(
        backend,
        registry,
        defaults(max_instances),
    ))
}

fn status_stack(
    swarm: Arc<FakeSwarm>,
    max_instances: usize,
) -> (Arc<ProvisioningService>, StatusService) {
    let provisioning = stack(Arc::clone(&swarm), max_instances);
    let status = StatusService::new(swarm as Arc<dyn ContainerBackend>, Arc::clone(&provisioning));
    (provisioning, status)
}

fn request(job_name: &str) -> ProvisionRequest {
    ProvisionRequest {
        profile: props(&[
            (profile_keys::IMAGE, "build-agent:latest"),
            (profile_keys::MAX_MEMORY, "1G"),
        ]),
        cluster: Properties::new(),
        registration: AgentRegistration {
            auto_register_key: Some("secret-key".to_string()),
            environment: Some("staging".to_string()),
        },
        job: JobIdentifier {
            pipeline_name: "up42".to_string(),
            pipeline_counter: 1,
            pipeline_label: "1".to_string(),
            stage_name: "stage".to_string(),
            stage_counter: "1".to_string(),
            job_name: job_name.to_string(),
            job_id: 100,
        },
    }
}

// ── Provisioning service ────────────────────────────────────────────────

#[tokio::test]
async fn provisioning_creates_a_service_and_registers_it() {
    let swarm = Arc::new(FakeSwarm::new());
    let service = stack(Arc::clone(&swarm), 5);

    let instance = service.provision(&request("job1")).await.unwrap();

    assert!(instance.name.starts_with("agent-"));
    assert!(instance
        .environment
        .iter()
        .any(|entry| entry == "AGENT_SERVER_URL=https://ci.example.com/go"));
    assert!(service.registry().get(&instance.name).is_some());
    assert_eq!(service.registry().instance_count(), 1);
    assert_eq!(service.admission_state().available, 4);
    assert_eq!(swarm.services.lock().len(), 1);
}

#[tokio::test]
async fn invalid_profiles_are_rejected_before_touching_the_engine() {
    let swarm = Arc::new(FakeSwarm::new());
    let service = stack(Arc::clone(&swarm), 5);
    let mut request = request("job1");
    request.profile = props(&[(profile_keys::MAX_MEMORY, "3M")]);

    let err = service.provision(&request).await.unwrap_err();
    match err {
        ProvisionError::InvalidProfile(result) => {
            let messages: Vec<&str> = result
                .errors()
                .iter()
                .map(|error| error.message.as_str())
                .collect();
            assert!(messages.contains(&"Image must not be blank."));
            assert!(messages.contains(&"Minimum allowed value is 4M"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(swarm.services.lock().is_empty());
}

#[tokio::test]
async fn profiles_are_checked_against_the_engine_catalogs() {
    let swarm = Arc::new(FakeSwarm::new());
    let service = stack(Arc::clone(&swarm), 5);

    let good = props(&[
        (profile_keys::IMAGE, "build-agent:latest"),
        (profile_keys::MOUNTS, "source=build-cache, target=/cache"),
        (profile_keys::SECRETS, "src=registry-token"),
    ]);
    let result = service.validate_profile(&good).await;
    assert!(result.is_ok(), "unexpected errors: {result}");

    let bad = props(&[
        (profile_keys::IMAGE, "build-agent:latest"),
        (profile_keys::MOUNTS, "source=missing-volume, target=/cache"),
    ]);
    let result = service.validate_profile(&bad).await;
    assert_eq!(
        result.errors()[0].message,
        "Volume `missing-volume` does not exist."
    );
}

#[tokio::test]
async fn capacity_is_enforced_across_requests() {
    let swarm = Arc::new(FakeSwarm::new());
    let service = stack(Arc::clone(&swarm), 1);

    service.provision(&request("job1")).await.unwrap();
    let err = service.provision(&request("job2")).await.unwrap_err();

    assert!(matches!(err, ProvisionError::CapacityExceeded(_)));
    assert_eq!(
        err.to_string(),
        "all 1 instance slots are in use; retry after the next reconcile"
    );
    assert_eq!(swarm.services.lock().len(), 1);
}

#[tokio::test]
async fn a_failed_create_returns_the_capacity_slot() {
    let swarm = Arc::new(FakeSwarm::new());
    let service = stack(Arc::clone(&swarm), 1);

    *swarm.fail_create.lock() = true;
    let err = service.provision(&request("job1")).await.unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::Backend(BackendError::Unavailable(_))
    ));

    *swarm.fail_create.lock() = false;
    service.provision(&request("job1")).await.unwrap();
    assert_eq!(swarm.services.lock().len(), 1);
}

#[tokio::test]
async fn an_unreachable_engine_fails_provisioning_cleanly() {
    let swarm = Arc::new(FakeSwarm::new());
    let service = stack(Arc::clone(&swarm), 5);

    *swarm.fail_list.lock() = true;
    let err = service.provision(&request("job1")).await.unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Backend(BackendError::Unavailable(_))
    ));
    assert_eq!(service.registry().instance_count(), 0);
    assert!(swarm.services.lock().is_empty());
}

#[tokio::test]
async fn reconcile_adopts_services_created_outside_the_daemon() {
    let swarm = Arc::new(FakeSwarm::new());
    swarm.services.lock().insert(
        "agent-orphan".to_string(),
        AgentInstance {
            id: "svc-orphan".to_string(),
            name: "agent-orphan".to_string(),
            created_at: Some(Utc::now()),
            ..Default::default()
        },
    );
    let service = stack(Arc::clone(&swarm), 5);

    service.refresh(service.defaults()).await.unwrap();

    assert!(service.registry().get("agent-orphan").is_some());
    let state = service.admission_state();
    assert_eq!(state.observed, 1);
    assert_eq!(state.available, 4);
}

#[tokio::test]
async fn cleanup_removes_instances_that_never_registered() {
    let swarm = Arc::new(FakeSwarm::backdated());
    let service = stack(Arc::clone(&swarm), 5);
    let instance = service.provision(&request("job1")).await.unwrap();

    // The orchestrator still knows this agent: protected.
    let known = vec![instance.name.clone()];
    let removed = service
        .terminate_unregistered(&known, service.defaults())
        .await
        .unwrap();
    assert!(removed.is_empty());

    // Forgotten by the orchestrator and past the window: reaped.
    let removed = service
        .terminate_unregistered(&[], service.defaults())
        .await
        .unwrap();
    assert_eq!(removed, vec![instance.name.clone()]);
    assert!(swarm.services.lock().is_empty());
    assert_eq!(service.registry().instance_count(), 0);
}

#[tokio::test]
async fn fresh_instances_survive_cleanup() {
    let swarm = Arc::new(FakeSwarm::new());
    let service = stack(Arc::clone(&swarm), 5);
    service.provision(&request("job1")).await.unwrap();

    let removed = service
        .terminate_unregistered(&[], service.defaults())
        .await
        .unwrap();

    assert!(removed.is_empty());
    assert_eq!(swarm.services.lock().len(), 1);
}

// ── Status service ──────────────────────────────────────────────────────

#[tokio::test]
async fn agent_reports_include_logs_and_filter_the_register_key() {
    let swarm = Arc::new(FakeSwarm::new());
    let (provisioning, status) = status_stack(Arc::clone(&swarm), 5);
    let instance = provisioning.provision(&request("job1")).await.unwrap();

    let report = status.agent_report(&instance.name).await.unwrap();

    assert_eq!(report.name, instance.name);
    assert!(report.logs.contains("agent started"));
    assert!(report
        .environment
        .iter()
        .all(|entry| !entry.starts_with("AGENT_AUTO_REGISTER_KEY")));
    assert!(report
        .environment
        .iter()
        .any(|entry| entry.starts_with("AGENT_SERVER_URL=")));
    assert_eq!(report.job_representation, "up42/1/stage/1/job1");
    assert_eq!(report.memory_limit, "1 GB");
}

#[tokio::test]
async fn status_for_an_unknown_agent_is_not_found() {
    let swarm = Arc::new(FakeSwarm::new());
    let (_provisioning, status) = status_stack(swarm, 5);

    let err = status.agent_report("agent-nope").await.unwrap_err();

    assert_eq!(
        err.to_string(),
        "agent instance `agent-nope` is not registered"
    );
}

#[tokio::test]
async fn log_fetch_failures_degrade_to_a_notice() {
    let swarm = Arc::new(FakeSwarm::new());
    let (provisioning, status) = status_stack(Arc::clone(&swarm), 5);
    let instance = provisioning.provision(&request("job1")).await.unwrap();

    *swarm.fail_logs.lock() = true;
    let report = status.agent_report(&instance.name).await.unwrap();
    assert!(report.logs.starts_with("Logs are not available:"));

    // Once a tail has been cached it survives later fetch failures.
    *swarm.fail_logs.lock() = false;
    status.agent_report(&instance.name).await.unwrap();
    *swarm.fail_logs.lock() = true;
    let report = status.agent_report(&instance.name).await.unwrap();
    assert!(report.logs.contains("agent started"));
    assert!(report.logs.contains("(log fetch failed:"));
}

#[tokio::test]
async fn cluster_reports_cover_nodes_and_instances() {
    let swarm = Arc::new(FakeSwarm::new());
    let (provisioning, status) = status_stack(Arc::clone(&swarm), 5);
    provisioning.provision(&request("job1")).await.unwrap();

    let report = status.cluster_report().await.unwrap();

    assert_eq!(report.nodes.len(), 1);
    assert_eq!(report.nodes[0].hostname, "worker-1");
    assert_eq!(report.nodes[0].role, "manager");
    assert_eq!(report.nodes[0].availability, "Not Specified");
    assert_eq!(report.nodes[0].cpus, "8");
    assert_eq!(report.nodes[0].memory, "16 GB");

    assert_eq!(report.instances.len(), 1);
    assert_eq!(report.instances[0].image, "build-agent:latest");
    assert_eq!(report.instances[0].state, "Not Specified");
}

// ── HTTP surface ────────────────────────────────────────────────────────

fn router(swarm: Arc<FakeSwarm>, max_instances: usize) -> axum::Router {
    let (provisioning, status) = status_stack(swarm, max_instances);
    api::app(provisioning, Arc::new(status))
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = match body {
        Some(payload) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn create_payload() -> serde_json::Value {
    json!({
        "profile_properties": { "Image": "build-agent:latest" },
        "auto_register_key": "key-123",
        "job_identifier": {
            "pipelineName": "up42",
            "pipelineCounter": 7,
            "stageName": "build",
            "stageCounter": "1",
            "jobName": "unit",
            "jobId": 42
        }
    })
}

#[tokio::test]
async fn health_endpoint_reports_healthy() {
    let app = router(Arc::new(FakeSwarm::new()), 5);
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn profile_validation_endpoint_returns_the_error_list() {
    let app = router(Arc::new(FakeSwarm::new()), 5);
    let (status, body) = send(&app, "POST", "/api/profile/validate", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([{ "key": "Image", "message": "Image must not be blank." }])
    );
}

#[tokio::test]
async fn cluster_validation_endpoint_returns_the_error_list() {
    let app = router(Arc::new(FakeSwarm::new()), 5);
    let (status, body) = send(&app, "POST", "/api/cluster/validate", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([{ "key": "server_url", "message": "Server URL must not be blank." }])
    );
}

#[tokio::test]
async fn created_agents_are_visible_through_the_status_route() {
    let app = router(Arc::new(FakeSwarm::new()), 5);

    let (status, body) = send(&app, "POST", "/api/agents", Some(create_payload())).await;
    assert_eq!(status, StatusCode::CREATED);
    let name = body["id"].as_str().unwrap().to_string();

    let (status, report) = send(&app, "GET", &format!("/api/agents/{name}/status"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["name"], name.as_str());
    assert_eq!(report["jobRepresentation"], "up42/7/build/1/unit");

    let (status, overview) = send(&app, "GET", "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(overview["instances"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_capacity_maps_to_http_429() {
    let app = router(Arc::new(FakeSwarm::new()), 1);

    let (status, _) = send(&app, "POST", "/api/agents", Some(create_payload())).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, "POST", "/api/agents", Some(create_payload())).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("instance slots are in use"));
}

#[tokio::test]
async fn rejected_profiles_map_to_http_422() {
    let app = router(Arc::new(FakeSwarm::new()), 5);
    let job = create_payload()["job_identifier"].clone();
    let payload = json!({
        "profile_properties": {},
        "job_identifier": job
    });

    let (status, body) = send(&app, "POST", "/api/agents", Some(payload)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["errors"][0]["key"], "Image");
}

#[tokio::test]
async fn deleting_agents_round_trips() {
    let swarm = Arc::new(FakeSwarm::new());
    let app = router(Arc::clone(&swarm), 5);

    let (_, body) = send(&app, "POST", "/api/agents", Some(create_payload())).await;
    let name = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "DELETE", &format!("/api/agents/{name}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], name.as_str());
    assert!(swarm.services.lock().is_empty());

    let (status, _) = send(&app, "DELETE", "/api/agents/agent-ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn the_cleanup_route_reaps_stale_agents() {
    let swarm = Arc::new(FakeSwarm::backdated());
    let app = router(Arc::clone(&swarm), 5);

    let (_, body) = send(&app, "POST", "/api/agents", Some(create_payload())).await;
    let name = body["id"].as_str().unwrap().to_string();

    let payload = json!({ "known_agent_ids": [] });
    let (status, body) = send(&app, "POST", "/api/agents/cleanup", Some(payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], json!([name]));
    assert!(swarm.services.lock().is_empty());
}
