pub mod exec;
pub mod logs;
mod unidle;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::sync::Semaphore;

/// Deadline for individual Kubernetes API operations, and for acquiring a
/// shell (scale-up plus pod readiness).
pub const API_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("namespace lacks label {0}")]
    MissingLabel(&'static str),

    #[error("invalid label value {value:?} for {label}")]
    InvalidLabel { label: &'static str, value: String },

    #[error("no deployment found for service {0}")]
    NoDeployment(String),

    #[error("deployment {0} has no running pods")]
    NoPods(String),

    #[error("pod {0} has no containers")]
    NoContainers(String),

    #[error("concurrent log session limit reached")]
    ConcurrentLogLimit,

    #[error("log session time limit reached")]
    LogTimeLimit,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("{0}")]
    Stream(String),
}

/// Environment identity read off namespace labels.
#[derive(Debug, Clone)]
pub struct NamespaceDetails {
    pub environment_id: i32,
    pub project_id: i32,
    pub environment_name: String,
    pub project_name: String,
}

/// Client for the workload cluster: deployment lookup, un-idling, remote
/// exec, and log streaming. Cheap to clone; clones share the log session
/// limits.
#[derive(Clone)]
pub struct Bridge {
    client: Client,
    log_limit: Arc<Semaphore>,
    log_time_limit: Duration,
    /// Live `(request ID, container ID)` log streams, kept briefly after
    /// close to absorb informer re-emission races.
    log_stream_ids: Arc<Mutex<HashSet<(String, String)>>>,
}

impl Bridge {
    pub async fn new(
        concurrent_log_limit: usize,
        log_time_limit: Duration,
    ) -> Result<Self, BridgeError> {
        let client = Client::try_default().await?;
        Ok(Self::with_client(
            client,
            concurrent_log_limit,
            log_time_limit,
        ))
    }

    pub fn with_client(
        client: Client,
        concurrent_log_limit: usize,
        log_time_limit: Duration,
    ) -> Self {
        Self {
            client,
            log_limit: Arc::new(Semaphore::new(concurrent_log_limit)),
            log_time_limit,
            log_stream_ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Resolve an environment from its namespace labels. Every label is
    /// required; a namespace without them is not a Lagoon environment.
    pub async fn namespace_details(&self, name: &str) -> Result<NamespaceDetails, BridgeError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = tokio::time::timeout(API_TIMEOUT, namespaces.get(name))
            .await
            .map_err(|_| BridgeError::Timeout("namespace lookup"))??;
        let labels = namespace.metadata.labels.unwrap_or_default();

        Ok(NamespaceDetails {
            environment_id: int_from_label(&labels, "lagoon.sh/environmentId")?,
            project_id: int_from_label(&labels, "lagoon.sh/projectId")?,
            environment_name: string_from_label(&labels, "lagoon.sh/environment")?,
            project_name: string_from_label(&labels, "lagoon.sh/project")?,
        })
    }

    /// Name of the deployment backing a Lagoon service within a namespace.
    pub async fn find_deployment(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<String, BridgeError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("lagoon.sh/service={service}"));
        let list = tokio::time::timeout(API_TIMEOUT, deployments.list(&params))
            .await
            .map_err(|_| BridgeError::Timeout("deployment list"))??;
        list.items
            .into_iter()
            .find_map(|d| d.metadata.name)
            .ok_or_else(|| BridgeError::NoDeployment(service.to_string()))
    }

    /// Label selector string of a deployment's pod template.
    async fn deployment_selector(
        &self,
        namespace: &str,
        deployment: &str,
    ) -> Result<String, BridgeError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let object = tokio::time::timeout(API_TIMEOUT, deployments.get(deployment))
            .await
            .map_err(|_| BridgeError::Timeout("deployment lookup"))??;
        let labels = object
            .spec
            .and_then(|spec| spec.selector.match_labels)
            .unwrap_or_default();
        Ok(selector_string(&labels))
    }

    /// First pod matching a deployment's selector.
    async fn first_pod(&self, namespace: &str, deployment: &str) -> Result<Pod, BridgeError> {
        let selector = self.deployment_selector(namespace, deployment).await?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector);
        let list = tokio::time::timeout(API_TIMEOUT, pods.list(&params))
            .await
            .map_err(|_| BridgeError::Timeout("pod list"))??;
        list.items
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::NoPods(deployment.to_string()))
    }
}

fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn string_from_label(
    labels: &BTreeMap<String, String>,
    label: &'static str,
) -> Result<String, BridgeError> {
    labels
        .get(label)
        .cloned()
        .ok_or(BridgeError::MissingLabel(label))
}

/// Strictly parse an integer-valued label. Lagoon IDs fit in i32; anything
/// else is a malformed namespace.
fn int_from_label(
    labels: &BTreeMap<String, String>,
    label: &'static str,
) -> Result<i32, BridgeError> {
    let value = labels.get(label).ok_or(BridgeError::MissingLabel(label))?;
    value.parse().map_err(|_| BridgeError::InvalidLabel {
        label,
        value: value.clone(),
    })
}

#[cfg(test)]
pub(crate) fn stub_client() -> Client {
    // Never contacted in unit tests; any use fails fast on connect.
    let config = kube::Config::new("https://127.0.0.1:1".parse().unwrap());
    Client::try_from(config).expect("stub kube client")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn int_from_label_parses_plain_integers() {
        let labels = labels(&[("lagoon.sh/projectId", "1")]);
        assert_eq!(int_from_label(&labels, "lagoon.sh/projectId").unwrap(), 1);
    }

    #[test]
    fn int_from_label_rejects_non_numeric() {
        for value in ["hello", "true", ""] {
            let labels = labels(&[("lagoon.sh/projectId", value)]);
            assert!(matches!(
                int_from_label(&labels, "lagoon.sh/projectId"),
                Err(BridgeError::InvalidLabel { .. })
            ));
        }
    }

    #[test]
    fn int_from_label_rejects_overflow() {
        let labels = labels(&[("lagoon.sh/projectId", "9223372036854775808")]);
        assert!(int_from_label(&labels, "lagoon.sh/projectId").is_err());
    }

    #[test]
    fn int_from_label_rejects_missing_key() {
        let labels = labels(&[]);
        assert!(matches!(
            int_from_label(&labels, "lagoon.sh/projectId"),
            Err(BridgeError::MissingLabel(_))
        ));
    }

    #[test]
    fn selector_string_joins_pairs() {
        let labels = labels(&[("app", "cli"), ("tier", "web")]);
        assert_eq!(selector_string(&labels), "app=cli,tier=web");
    }
}
