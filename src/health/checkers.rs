use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{DockerTarget, GatewayTarget, HealthInventory};
use crate::models::health::{CheckResult, CheckStatus, HealthPolicy};
use crate::store::Store;

/// Probe timeout. The HTTP client in `CheckContext` is built with this.
pub const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Shared state handed to every checker run.
pub struct CheckContext {
    pub client: reqwest::Client,
    pub store: Arc<Store>,
    pub orchestrator_url: Option<String>,
    pub policies: HashMap<String, HealthPolicy>,
}

impl CheckContext {
    pub fn new(
        store: Arc<Store>,
        orchestrator_url: Option<String>,
        policies: HashMap<String, HealthPolicy>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        CheckContext {
            client,
            store,
            orchestrator_url,
            policies,
        }
    }

    fn max_response_time_ms(&self, service: &str) -> i64 {
        self.policies
            .get(service)
            .map(|p| p.max_response_time_ms)
            .unwrap_or(2000)
    }
}

/// The stock checker variants, dispatched statically.
#[derive(Debug, Clone)]
pub enum Checker {
    Http {
        name: String,
        url: String,
    },
    Database,
    Docker {
        project: String,
        services: Vec<String>,
    },
    Gateway {
        url: String,
        routes: HashMap<String, String>,
    },
    Metrics {
        endpoints: Vec<String>,
    },
    Dependency {
        deps: HashMap<String, Vec<String>>,
        health_urls: HashMap<String, String>,
    },
}

/// Assemble the checker set for one tick from the configured inventory.
pub fn build_checkers(inventory: &HealthInventory) -> Vec<Checker> {
    let mut checkers = vec![Checker::Database];
    for target in &inventory.services {
        checkers.push(Checker::Http {
            name: target.name.clone(),
            url: target.url.clone(),
        });
    }
    if let Some(DockerTarget { project, services }) = &inventory.docker {
        checkers.push(Checker::Docker {
            project: project.clone(),
            services: services.clone(),
        });
    }
    if let Some(GatewayTarget { url, routes }) = &inventory.gateway {
        checkers.push(Checker::Gateway {
            url: url.clone(),
            routes: routes.clone(),
        });
    }
    if !inventory.metrics_endpoints.is_empty() {
        checkers.push(Checker::Metrics {
            endpoints: inventory.metrics_endpoints.clone(),
        });
    }
    if !inventory.dependencies.is_empty() {
        let health_urls = inventory
            .services
            .iter()
            .map(|s| (s.name.clone(), s.url.clone()))
            .collect();
        checkers.push(Checker::Dependency {
            deps: inventory.dependencies.clone(),
            health_urls,
        });
    }
    checkers
}

impl Checker {
    pub fn name(&self) -> &str {
        match self {
            Checker::Http { name, .. } => name,
            Checker::Database => "database",
            Checker::Docker { .. } => "docker",
            Checker::Gateway { .. } => "gateway",
            Checker::Metrics { .. } => "metrics",
            Checker::Dependency { .. } => "dependencies",
        }
    }

    pub async fn run(&self, cx: &CheckContext) -> CheckResult {
        let start = Instant::now();
        let (status, message, details) = match self {
            Checker::Http { name, url } => check_http(cx, name, url).await,
            Checker::Database => check_database(cx),
            Checker::Docker { project, services } => check_docker(cx, project, services).await,
            Checker::Gateway { url, routes } => check_gateway(cx, url, routes).await,
            Checker::Metrics { endpoints } => check_metrics(cx, endpoints).await,
            Checker::Dependency { deps, health_urls } => {
                check_dependencies(cx, deps, health_urls).await
            }
        };
        CheckResult {
            name: self.name().to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as i64,
            details,
        }
    }
}

type Outcome = (CheckStatus, String, serde_json::Value);

async fn check_http(cx: &CheckContext, name: &str, url: &str) -> Outcome {
    let start = Instant::now();
    match cx.client.get(url).send().await {
        Ok(response) => {
            let latency_ms = start.elapsed().as_millis() as i64;
            let status = response.status();
            if !status.is_success() {
                return (
                    CheckStatus::Fail,
                    format!("unexpected status {status}"),
                    serde_json::json!({ "latency_ms": latency_ms, "http_status": status.as_u16() }),
                );
            }
            let limit = cx.max_response_time_ms(name);
            if latency_ms > limit {
                (
                    CheckStatus::Warn,
                    format!("responded in {latency_ms}ms (limit {limit}ms)"),
                    serde_json::json!({ "latency_ms": latency_ms, "limit_ms": limit }),
                )
            } else {
                (
                    CheckStatus::Pass,
                    format!("ok in {latency_ms}ms"),
                    serde_json::json!({ "latency_ms": latency_ms }),
                )
            }
        }
        Err(e) => (
            CheckStatus::Fail,
            format!("request failed: {e}"),
            serde_json::Value::Null,
        ),
    }
}

fn check_database(cx: &CheckContext) -> Outcome {
    match cx.store.ping() {
        Ok(()) => (
            CheckStatus::Pass,
            "store reachable".to_string(),
            serde_json::Value::Null,
        ),
        Err(e) => (
            CheckStatus::Fail,
            format!("store ping failed: {e}"),
            serde_json::Value::Null,
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    name: String,
    state: String,
}

async fn check_docker(cx: &CheckContext, project: &str, services: &[String]) -> Outcome {
    let Some(base) = cx.orchestrator_url.as_deref() else {
        return (
            CheckStatus::Warn,
            "orchestrator not configured".to_string(),
            serde_json::Value::Null,
        );
    };
    let url = format!("{base}/api/projects/{project}/containers");
    let containers: Vec<ContainerState> = match cx.client.get(&url).send().await {
        Ok(response) if response.status().is_success() => match response.json().await {
            Ok(list) => list,
            Err(e) => {
                return (
                    CheckStatus::Fail,
                    format!("bad container listing: {e}"),
                    serde_json::Value::Null,
                );
            }
        },
        Ok(response) => {
            return (
                CheckStatus::Fail,
                format!("orchestrator status {}", response.status()),
                serde_json::Value::Null,
            );
        }
        Err(e) => {
            return (
                CheckStatus::Fail,
                format!("orchestrator unreachable: {e}"),
                serde_json::Value::Null,
            );
        }
    };

    let by_name: HashMap<&str, &str> = containers
        .iter()
        .map(|c| (c.name.as_str(), c.state.as_str()))
        .collect();
    let mut missing = Vec::new();
    let mut restarting = Vec::new();
    let mut stopped = Vec::new();
    for service in services {
        match by_name.get(service.as_str()) {
            Some(&"running") => {}
            Some(&"restarting") => restarting.push(service.clone()),
            Some(state) => stopped.push(format!("{service} ({state})")),
            None => missing.push(service.clone()),
        }
    }

    let details = serde_json::json!({
        "missing": missing, "restarting": restarting, "stopped": stopped,
    });
    if !missing.is_empty() || !stopped.is_empty() {
        (
            CheckStatus::Fail,
            format!("containers unhealthy: missing={missing:?} stopped={stopped:?}"),
            details,
        )
    } else if !restarting.is_empty() {
        (
            CheckStatus::Warn,
            format!("containers restarting: {restarting:?}"),
            details,
        )
    } else {
        (
            CheckStatus::Pass,
            format!("{} containers running", services.len()),
            details,
        )
    }
}

async fn check_gateway(cx: &CheckContext, url: &str, expected: &HashMap<String, String>) -> Outcome {
    let routes_url = format!("{url}/routes");
    let actual: HashMap<String, String> = match cx.client.get(&routes_url).send().await {
        Ok(response) if response.status().is_success() => {
            match response.json().await {
                Ok(map) => map,
                Err(e) => {
                    return (
                        CheckStatus::Fail,
                        format!("bad routing table: {e}"),
                        serde_json::Value::Null,
                    );
                }
            }
        }
        Ok(response) => {
            return (
                CheckStatus::Fail,
                format!("gateway status {}", response.status()),
                serde_json::Value::Null,
            );
        }
        Err(e) => {
            return (
                CheckStatus::Fail,
                format!("gateway unreachable: {e}"),
                serde_json::Value::Null,
            );
        }
    };

    let mismatched = diff_routes(expected, &actual);
    if mismatched.is_empty() {
        (
            CheckStatus::Pass,
            format!("{} routes match", expected.len()),
            serde_json::Value::Null,
        )
    } else {
        (
            CheckStatus::Fail,
            format!("routing mismatch: {mismatched:?}"),
            serde_json::json!({ "mismatched": mismatched }),
        )
    }
}

/// Routes whose backend is absent or differs from the expectation.
pub fn diff_routes(
    expected: &HashMap<String, String>,
    actual: &HashMap<String, String>,
) -> Vec<String> {
    let mut mismatched: Vec<String> = expected
        .iter()
        .filter(|(route, backend)| actual.get(*route) != Some(backend))
        .map(|(route, _)| route.clone())
        .collect();
    mismatched.sort();
    mismatched
}

async fn check_metrics(cx: &CheckContext, endpoints: &[String]) -> Outcome {
    let mut per_endpoint = Vec::new();
    let mut failures = 0usize;
    for endpoint in endpoints {
        let start = Instant::now();
        let (ok, status) = match cx.client.get(endpoint).send().await {
            Ok(response) => (response.status().is_success(), response.status().as_u16()),
            Err(_) => (false, 0),
        };
        if !ok {
            failures += 1;
        }
        per_endpoint.push(serde_json::json!({
            "endpoint": endpoint,
            "ok": ok,
            "http_status": status,
            "latency_ms": start.elapsed().as_millis() as i64,
            "collected_at": Utc::now().to_rfc3339(),
        }));
    }

    let details = serde_json::Value::Array(per_endpoint);
    if failures == 0 {
        (
            CheckStatus::Pass,
            format!("{} endpoints collected", endpoints.len()),
            details,
        )
    } else if failures < endpoints.len() {
        (
            CheckStatus::Warn,
            format!("{failures}/{} endpoints failing", endpoints.len()),
            details,
        )
    } else {
        (
            CheckStatus::Fail,
            "all metrics endpoints failing".to_string(),
            details,
        )
    }
}

async fn check_dependencies(
    cx: &CheckContext,
    deps: &HashMap<String, Vec<String>>,
    health_urls: &HashMap<String, String>,
) -> Outcome {
    // Probe every involved service once.
    let mut statuses: HashMap<String, CheckStatus> = HashMap::new();
    let mut involved: Vec<&String> = deps.keys().chain(deps.values().flatten()).collect();
    involved.sort();
    involved.dedup();
    for service in involved {
        let status = match health_urls.get(service) {
            Some(url) => match cx.client.get(url).send().await {
                Ok(response) if response.status().is_success() => CheckStatus::Pass,
                _ => CheckStatus::Fail,
            },
            None => CheckStatus::Warn,
        };
        statuses.insert(service.clone(), status);
    }
    evaluate_dependencies(deps, &statuses)
}

/// Topologically walk the dependency graph and flag every service with a
/// dependency below `warn`. A cycle is itself a failure.
pub fn evaluate_dependencies(
    deps: &HashMap<String, Vec<String>>,
    statuses: &HashMap<String, CheckStatus>,
) -> Outcome {
    let order = match topo_order(deps) {
        Ok(order) => order,
        Err(cycle) => {
            return (
                CheckStatus::Fail,
                format!("dependency cycle involving {cycle:?}"),
                serde_json::Value::Null,
            );
        }
    };

    let mut broken: Vec<String> = Vec::new();
    for service in &order {
        let Some(service_deps) = deps.get(service) else {
            continue;
        };
        for dep in service_deps {
            if statuses.get(dep).copied().unwrap_or(CheckStatus::Warn) == CheckStatus::Fail {
                broken.push(format!("{service} -> {dep}"));
            }
        }
    }

    let details = serde_json::json!({
        "order": order,
        "broken": broken,
        "statuses": statuses
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str()))
            .collect::<HashMap<_, _>>(),
    });
    if broken.is_empty() {
        (
            CheckStatus::Pass,
            "all dependencies healthy".to_string(),
            details,
        )
    } else {
        (
            CheckStatus::Fail,
            format!("unhealthy dependencies: {broken:?}"),
            details,
        )
    }
}

/// Kahn's algorithm over the dependency edges; `Err` carries the services
/// stuck in a cycle.
fn topo_order(deps: &HashMap<String, Vec<String>>) -> Result<Vec<String>, Vec<String>> {
    let mut nodes: Vec<String> = deps
        .keys()
        .cloned()
        .chain(deps.values().flatten().cloned())
        .collect();
    nodes.sort();
    nodes.dedup();

    // in_degree[s] = number of services s depends on.
    let mut in_degree: HashMap<String, usize> = nodes.iter().map(|n| (n.clone(), 0)).collect();
    for (service, service_deps) in deps {
        *in_degree.get_mut(service).unwrap() += service_deps.len();
    }

    let mut queue: Vec<String> = nodes
        .iter()
        .filter(|n| in_degree[*n] == 0)
        .cloned()
        .collect();
    queue.sort();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(next) = queue.pop() {
        order.push(next.clone());
        for (service, service_deps) in deps {
            if service_deps.contains(&next) {
                let remaining = in_degree.get_mut(service).unwrap();
                *remaining -= 1;
                if *remaining == 0 {
                    queue.push(service.clone());
                }
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        let cycle: Vec<String> = nodes
            .into_iter()
            .filter(|n| !order.contains(n))
            .collect();
        Err(cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceTarget;

    fn statuses(pairs: &[(&str, CheckStatus)]) -> HashMap<String, CheckStatus> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn deps(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_build_checkers_from_inventory() {
        let mut inventory = HealthInventory::default();
        inventory.services.push(ServiceTarget {
            name: "portal".into(),
            url: "http://portal/health".into(),
        });
        inventory.metrics_endpoints.push("http://portal/metrics".into());
        inventory
            .dependencies
            .insert("review".into(), vec!["portal".into()]);

        let checkers = build_checkers(&inventory);
        let names: Vec<&str> = checkers.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["database", "portal", "metrics", "dependencies"]);
    }

    #[test]
    fn test_dependency_failure_propagates() {
        let graph = deps(&[("review", &["portal"]), ("billing", &["review"])]);
        let s = statuses(&[
            ("portal", CheckStatus::Fail),
            ("review", CheckStatus::Pass),
            ("billing", CheckStatus::Pass),
        ]);
        let (status, message, _) = evaluate_dependencies(&graph, &s);
        assert_eq!(status, CheckStatus::Fail);
        assert!(message.contains("review -> portal"));
    }

    #[test]
    fn test_warn_dependency_is_acceptable() {
        let graph = deps(&[("review", &["portal"])]);
        let s = statuses(&[
            ("portal", CheckStatus::Warn),
            ("review", CheckStatus::Pass),
        ]);
        let (status, _, _) = evaluate_dependencies(&graph, &s);
        assert_eq!(status, CheckStatus::Pass);
    }

    #[test]
    fn test_dependency_cycle_fails() {
        let graph = deps(&[("a", &["b"]), ("b", &["a"])]);
        let (status, message, _) = evaluate_dependencies(&graph, &statuses(&[]));
        assert_eq!(status, CheckStatus::Fail);
        assert!(message.contains("cycle"));
    }

    #[test]
    fn test_topo_order_roots_first() {
        let graph = deps(&[("review", &["portal"]), ("billing", &["review"])]);
        let order = topo_order(&graph).unwrap();
        let pos = |name: &str| order.iter().position(|s| s == name).unwrap();
        assert!(pos("portal") < pos("review"));
        assert!(pos("review") < pos("billing"));
    }

    #[test]
    fn test_diff_routes() {
        let mut expected = HashMap::new();
        expected.insert("/portal".to_string(), "http://portal:8080".to_string());
        expected.insert("/review".to_string(), "http://review:8081".to_string());

        let mut actual = expected.clone();
        assert!(diff_routes(&expected, &actual).is_empty());

        actual.insert("/review".to_string(), "http://stale:1".to_string());
        assert_eq!(diff_routes(&expected, &actual), vec!["/review"]);

        actual.remove("/portal");
        assert_eq!(diff_routes(&expected, &actual), vec!["/portal", "/review"]);
    }
}
