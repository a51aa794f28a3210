use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{ListParams, Patch, PatchParams};
use kube::Api;

use super::{API_TIMEOUT, Bridge, BridgeError};

/// Idle-watch label selectors, in priority order.
const IDLE_WATCH_SELECTORS: [&str; 2] = ["idling.lagoon.sh/watch=true", "idling.amazee.io/watch=true"];

/// Replica-count annotations matching the selector order above.
const UNIDLE_REPLICA_ANNOTATIONS: [&str; 2] = [
    "idling.lagoon.sh/unidle-replicas",
    "idling.amazee.io/unidle-replicas",
];

/// Target replica count when waking an idled deployment. Clamped to a sane
/// window; any unparseable annotation wakes a single replica.
pub(crate) fn unidle_replicas(value: &str) -> i32 {
    value
        .parse::<i64>()
        .map(|n| n.clamp(1, 16) as i32)
        .unwrap_or(1)
}

impl Bridge {
    /// Wake every idled deployment in the namespace that carries an
    /// idle-watch label. Both label sets are scanned; a deployment matching
    /// more than one is handled once, and the annotation priority decides
    /// which replica count applies to it.
    #[tracing::instrument(skip(self))]
    pub async fn unidle_namespace(&self, namespace: &str) -> Result<(), BridgeError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);

        let mut seen = std::collections::HashSet::new();
        for selector in IDLE_WATCH_SELECTORS {
            let params = ListParams::default().labels(selector);
            let list = tokio::time::timeout(API_TIMEOUT, deployments.list(&params))
                .await
                .map_err(|_| BridgeError::Timeout("idled deployment list"))??;

            for deployment in &list.items {
                let Some(name) = deployment.metadata.name.as_deref() else {
                    continue;
                };
                if !seen.insert(name.to_string()) {
                    continue;
                }
                let replicas = deployment.spec.as_ref().and_then(|s| s.replicas);
                if replicas.unwrap_or(0) != 0 {
                    continue;
                }
                let target = deployment
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|annotations| {
                        UNIDLE_REPLICA_ANNOTATIONS
                            .iter()
                            .find_map(|key| annotations.get(*key))
                    })
                    .map_or(1, |value| unidle_replicas(value));
                tracing::info!(deployment = name, replicas = target, "unidling deployment");
                self.scale(namespace, name, target).await?;
            }
        }
        Ok(())
    }

    /// Make sure a deployment has at least one replica, then wait for its
    /// first pod to reach the Running phase.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_scaled(&self, namespace: &str, deployment: &str) -> Result<(), BridgeError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let object = tokio::time::timeout(API_TIMEOUT, deployments.get(deployment))
            .await
            .map_err(|_| BridgeError::Timeout("deployment lookup"))??;
        if object.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0) == 0 {
            self.scale(namespace, deployment, 1).await?;
        }

        tokio::time::timeout(API_TIMEOUT, async {
            loop {
                if let Ok(pod) = self.first_pod(namespace, deployment).await {
                    let running = pod
                        .status
                        .as_ref()
                        .and_then(|status| status.phase.as_deref())
                        == Some("Running");
                    if running {
                        return Ok::<(), BridgeError>(());
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        })
        .await
        .map_err(|_| BridgeError::Timeout("pod to start running"))?
    }

    async fn scale(
        &self,
        namespace: &str,
        deployment: &str,
        replicas: i32,
    ) -> Result<(), BridgeError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        tokio::time::timeout(
            API_TIMEOUT,
            deployments.patch_scale(deployment, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .map_err(|_| BridgeError::Timeout("deployment scale"))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unidle_replicas_zero_becomes_one() {
        assert_eq!(unidle_replicas("0"), 1);
    }

    #[test]
    fn unidle_replicas_clamps_above_sixteen() {
        assert_eq!(unidle_replicas("17"), 16);
        assert_eq!(unidle_replicas("100"), 16);
    }

    #[test]
    fn unidle_replicas_overflow_defaults_to_one() {
        assert_eq!(unidle_replicas("9223372036854775808"), 1);
    }

    #[test]
    fn unidle_replicas_negative_becomes_one() {
        assert_eq!(unidle_replicas("-1"), 1);
    }

    #[test]
    fn unidle_replicas_non_numeric_defaults_to_one() {
        assert_eq!(unidle_replicas("lots"), 1);
        assert_eq!(unidle_replicas(""), 1);
    }

    #[test]
    fn unidle_replicas_passes_in_range_values() {
        assert_eq!(unidle_replicas("1"), 1);
        assert_eq!(unidle_replicas("4"), 4);
        assert_eq!(unidle_replicas("16"), 16);
    }
}
