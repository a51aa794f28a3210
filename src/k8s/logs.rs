use std::time::Duration;

use futures_util::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::{ListParams, LogParams};
use kube::runtime::{WatchStreamExt, watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{API_TIMEOUT, Bridge, BridgeError};

/// How long a closed stream's identity lingers in the duplicate set. The
/// informer occasionally re-emits a ready event just as a stream closes;
/// without this window the same container would be streamed twice.
const STREAM_ID_RETENTION: Duration = Duration::from_secs(1);

/// Capacity of the line channel between log producers and the SSH writer.
/// A slow client exerts backpressure on every producer through it.
pub const LOG_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub follow: bool,
    pub tail_lines: i64,
    /// Correlates duplicate-stream suppression within one SSH request.
    pub request_id: String,
}

/// Which platform job pods to read logs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemLogKind {
    Build,
    Task,
}

impl SystemLogKind {
    fn selector(self) -> &'static str {
        match self {
            Self::Build => "lagoon.sh/jobType=build",
            Self::Task => "lagoon.sh/jobType=task",
        }
    }
}

impl std::str::FromStr for SystemLogKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(Self::Build),
            "task" => Ok(Self::Task),
            other => anyhow::bail!("unknown system log source: {other}"),
        }
    }
}

impl Bridge {
    /// Stream logs from the pods of a deployment, optionally restricted to
    /// one container.
    #[tracing::instrument(skip(self, out, cancel), fields(request_id = %opts.request_id))]
    pub async fn container_logs(
        &self,
        namespace: &str,
        deployment: &str,
        container: Option<String>,
        opts: LogOptions,
        out: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        let selector = self.deployment_selector(namespace, deployment).await?;
        self.selector_logs(namespace, selector, container, opts, out, cancel)
            .await
    }

    /// Stream logs from platform job pods (builds or tasks).
    #[tracing::instrument(skip(self, out, cancel), fields(request_id = %opts.request_id))]
    pub async fn system_logs(
        &self,
        namespace: &str,
        kind: SystemLogKind,
        opts: LogOptions,
        out: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        self.selector_logs(namespace, kind.selector().to_string(), None, opts, out, cancel)
            .await
    }

    async fn selector_logs(
        &self,
        namespace: &str,
        selector: String,
        container: Option<String>,
        opts: LogOptions,
        out: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        let follow = opts.follow;
        self.log_session(cancel, async {
            if follow {
                self.follow_logs(namespace, &selector, container.as_deref(), &opts, &out)
                    .await
            } else {
                self.dump_logs(namespace, &selector, container.as_deref(), &opts, &out)
                    .await
            }
        })
        .await
    }

    /// Guard one log session with the concurrency semaphore and the session
    /// time limit.
    async fn log_session<F>(&self, cancel: CancellationToken, work: F) -> Result<(), BridgeError>
    where
        F: Future<Output = Result<(), BridgeError>>,
    {
        let _permit = self
            .log_limit
            .clone()
            .try_acquire_owned()
            .map_err(|_| BridgeError::ConcurrentLogLimit)?;

        tokio::select! {
            () = cancel.cancelled() => Ok(()),
            bounded = tokio::time::timeout(self.log_time_limit, work) => match bounded {
                Ok(result) => result,
                Err(_) => Err(BridgeError::LogTimeLimit),
            },
        }
    }

    /// One-shot mode: read the current log tail of every matching pod.
    async fn dump_logs(
        &self,
        namespace: &str,
        selector: &str,
        container: Option<&str>,
        opts: &LogOptions,
        out: &mpsc::Sender<String>,
    ) -> Result<(), BridgeError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(selector);
        let list = tokio::time::timeout(API_TIMEOUT, pods.list(&params))
            .await
            .map_err(|_| BridgeError::Timeout("pod list"))??;

        for pod in list.items {
            let Some(pod_name) = pod.metadata.name.clone() else {
                continue;
            };
            for (container_name, _) in pod_containers(&pod, container) {
                stream_pod_logs(&pods, &pod_name, &container_name, false, opts.tail_lines, out)
                    .await?;
            }
        }
        Ok(())
    }

    /// Follow mode: watch the selector and stream every container of each
    /// pod that becomes ready, suppressing duplicate streams.
    async fn follow_logs(
        &self,
        namespace: &str,
        selector: &str,
        container: Option<&str>,
        opts: &LogOptions,
        out: &mpsc::Sender<String>,
    ) -> Result<(), BridgeError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let watch = watcher(
            pods.clone(),
            watcher::Config::default().labels(selector),
        );
        let mut ready_pods = std::pin::pin!(watch.applied_objects());

        let mut streams = tokio::task::JoinSet::new();
        loop {
            let pod = match ready_pods.try_next().await {
                Ok(Some(pod)) => pod,
                Ok(None) => break,
                Err(err) => return Err(BridgeError::Stream(err.to_string())),
            };
            if !containers_ready(&pod) {
                continue;
            }
            let Some(pod_name) = pod.metadata.name.clone() else {
                continue;
            };

            for (container_name, container_id) in pod_containers(&pod, container) {
                let key = (opts.request_id.clone(), container_id);
                {
                    let mut ids = self
                        .log_stream_ids
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    if !ids.insert(key.clone()) {
                        continue;
                    }
                }

                let api = pods.clone();
                let out = out.clone();
                let pod_name = pod_name.clone();
                let tail_lines = opts.tail_lines;
                let ids = self.log_stream_ids.clone();
                streams.spawn(async move {
                    if let Err(err) =
                        stream_pod_logs(&api, &pod_name, &container_name, true, tail_lines, &out)
                            .await
                    {
                        tracing::debug!(pod = %pod_name, container = %container_name,
                            error = %err, "log stream ended");
                    }
                    // Keep the identity around briefly so an informer
                    // re-emission does not restart the stream.
                    tokio::time::sleep(STREAM_ID_RETENTION).await;
                    ids.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
                });
            }
        }
        streams.abort_all();
        Ok(())
    }
}

/// Stream one container's logs line by line into the output channel, each
/// line prefixed with its origin.
async fn stream_pod_logs(
    pods: &Api<Pod>,
    pod_name: &str,
    container: &str,
    follow: bool,
    tail_lines: i64,
    out: &mpsc::Sender<String>,
) -> Result<(), BridgeError> {
    let params = LogParams {
        container: Some(container.to_string()),
        follow,
        tail_lines: Some(tail_lines),
        ..LogParams::default()
    };
    let stream = pods.log_stream(pod_name, &params).await?;
    let mut lines = stream.lines();
    let prefix = log_line_prefix(pod_name, container);
    while let Some(line) = lines
        .try_next()
        .await
        .map_err(|err| BridgeError::Stream(err.to_string()))?
    {
        if out.send(format!("{prefix}{line}")).await.is_err() {
            // The session writer hung up.
            return Ok(());
        }
    }
    Ok(())
}

fn log_line_prefix(pod: &str, container: &str) -> String {
    format!("[pod/{pod}/{container}] ")
}

fn containers_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "ContainersReady" && c.status == "True")
        })
}

/// `(name, container ID)` for each container of interest in a pod. The
/// runtime container ID is preferred as the stream identity; pods without
/// status yet fall back to a name-based identity.
fn pod_containers(pod: &Pod, filter: Option<&str>) -> Vec<(String, String)> {
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref());

    let names: Vec<String> = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default();

    names
        .into_iter()
        .filter(|name| filter.is_none_or(|wanted| wanted == name))
        .map(|name| {
            let id = statuses
                .and_then(|statuses| statuses.iter().find(|s| s.name == name))
                .and_then(|status| status.container_id.clone())
                .unwrap_or_else(|| format!("{pod_name}/{name}"));
            (name, id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::stub_client;
    use super::*;

    fn test_bridge(limit: usize, time_limit: Duration) -> Bridge {
        Bridge::with_client(stub_client(), limit, time_limit)
    }

    fn pod(name: &str, containers: &[&str], ready: bool, ids: &[(&str, &str)]) -> Pod {
        use k8s_openapi::api::core::v1::{Container, ContainerStatus, PodCondition, PodSpec, PodStatus};

        Pod {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|c| Container {
                        name: (*c).to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "ContainersReady".into(),
                    status: if ready { "True".into() } else { "False".into() },
                    ..Default::default()
                }]),
                container_statuses: Some(
                    ids.iter()
                        .map(|(container, id)| ContainerStatus {
                            name: (*container).to_string(),
                            container_id: Some((*id).to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn prefix_format() {
        assert_eq!(log_line_prefix("web-0", "nginx"), "[pod/web-0/nginx] ");
    }

    #[test]
    fn containers_ready_requires_true_condition() {
        assert!(containers_ready(&pod("web-0", &["nginx"], true, &[])));
        assert!(!containers_ready(&pod("web-0", &["nginx"], false, &[])));
        assert!(!containers_ready(&Pod::default()));
    }

    #[test]
    fn pod_containers_prefer_runtime_container_ids() {
        let pod = pod(
            "web-0",
            &["nginx", "php"],
            true,
            &[("nginx", "containerd://abc"), ("php", "containerd://def")],
        );
        let containers = pod_containers(&pod, None);
        assert_eq!(
            containers,
            vec![
                ("nginx".to_string(), "containerd://abc".to_string()),
                ("php".to_string(), "containerd://def".to_string()),
            ]
        );
    }

    #[test]
    fn pod_containers_filter_by_name() {
        let pod = pod("web-0", &["nginx", "php"], true, &[]);
        let containers = pod_containers(&pod, Some("php"));
        assert_eq!(containers, vec![("php".to_string(), "web-0/php".to_string())]);
        assert!(pod_containers(&pod, Some("absent")).is_empty());
    }

    #[test]
    fn pod_containers_fall_back_to_name_identity() {
        let pod = pod("web-0", &["nginx"], true, &[]);
        let containers = pod_containers(&pod, None);
        assert_eq!(
            containers,
            vec![("nginx".to_string(), "web-0/nginx".to_string())]
        );
    }

    #[test]
    fn system_log_kind_parses() {
        assert_eq!("build".parse::<SystemLogKind>().unwrap(), SystemLogKind::Build);
        assert_eq!("task".parse::<SystemLogKind>().unwrap(), SystemLogKind::Task);
        assert!("deploy".parse::<SystemLogKind>().is_err());
    }

    #[tokio::test]
    async fn log_session_time_limit_expires() {
        let bridge = test_bridge(2, Duration::from_millis(50));
        let result = bridge
            .log_session(CancellationToken::new(), std::future::pending())
            .await;
        assert!(matches!(result, Err(BridgeError::LogTimeLimit)));
    }

    #[tokio::test]
    async fn log_session_concurrency_limit() {
        let bridge = test_bridge(2, Duration::from_secs(5));
        let cancel = CancellationToken::new();

        // Two sessions fit; the third is rejected while they hold permits.
        let first = tokio::spawn({
            let bridge = bridge.clone();
            let cancel = cancel.clone();
            async move {
                bridge
                    .log_session(cancel, async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    })
                    .await
            }
        });
        let second = tokio::spawn({
            let bridge = bridge.clone();
            let cancel = cancel.clone();
            async move {
                bridge
                    .log_session(cancel, async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    })
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let third = bridge
            .log_session(cancel.clone(), async { Ok(()) })
            .await;
        assert!(matches!(third, Err(BridgeError::ConcurrentLogLimit)));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());

        // Permits are released once the sessions finish.
        assert!(bridge.log_session(cancel, async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn log_session_cancel_is_clean() {
        let bridge = test_bridge(1, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = bridge
            .log_session(cancel, std::future::pending())
            .await;
        assert!(result.is_ok());
    }
}
