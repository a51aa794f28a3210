pub mod server;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bus subject carrying SSH authorization queries.
pub const SUBJECT: &str = "lagoon.sshportal.api";

/// Queue group shared by all policy workers, so each query is handled once.
pub const QUEUE: &str = "sshportalapi";

/// Caller-side wait for a policy decision. No reply within this window is a
/// denial.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// An SSH authorization query from the edge to the policy service. Field
/// names are part of the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshAccessQuery {
    #[serde(rename = "SessionID")]
    pub session_id: String,
    #[serde(rename = "SSHFingerprint")]
    pub ssh_fingerprint: String,
    #[serde(rename = "NamespaceName")]
    pub namespace_name: String,
    #[serde(rename = "ProjectID")]
    pub project_id: i32,
    #[serde(rename = "EnvironmentID")]
    pub environment_id: i32,
}

/// Connect to NATS, logging connection state transitions. A terminal close
/// cancels `shutdown` so the owning service exits rather than serving with a
/// dead bus.
pub async fn connect(
    url: &str,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<async_nats::Client, async_nats::ConnectError> {
    let client = async_nats::ConnectOptions::new()
        .event_callback(move |event| {
            let shutdown = shutdown.clone();
            async move {
                match event {
                    async_nats::Event::Disconnected => tracing::warn!("NATS disconnected"),
                    async_nats::Event::Connected => tracing::info!("NATS connected"),
                    async_nats::Event::Closed => {
                        tracing::error!("NATS connection closed");
                        shutdown.cancel();
                    }
                    other => tracing::debug!(event = %other, "NATS event"),
                }
            }
        })
        .connect(url)
        .await?;
    Ok(client)
}

/// Ask the policy service whether `query` may proceed. Anything but a timely
/// literal `true` is a denial.
#[tracing::instrument(skip(nats, query), fields(session_id = %query.session_id, namespace = %query.namespace_name))]
pub async fn query_access(
    nats: &async_nats::Client,
    query: &SshAccessQuery,
) -> anyhow::Result<bool> {
    let payload = serde_json::to_vec(query)?;
    let reply = tokio::time::timeout(REQUEST_TIMEOUT, nats.request(SUBJECT, payload.into()))
        .await
        .map_err(|_| anyhow::anyhow!("authorization query timed out"))??;
    Ok(serde_json::from_slice::<bool>(&reply.payload).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_wire_field_names() {
        let query = SshAccessQuery {
            session_id: "abc".into(),
            ssh_fingerprint: "SHA256:xyz".into(),
            namespace_name: "project-main".into(),
            project_id: 4,
            environment_id: 7,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&query).unwrap()).unwrap();
        assert_eq!(value["SessionID"], "abc");
        assert_eq!(value["SSHFingerprint"], "SHA256:xyz");
        assert_eq!(value["NamespaceName"], "project-main");
        assert_eq!(value["ProjectID"], 4);
        assert_eq!(value["EnvironmentID"], 7);
    }

    #[test]
    fn query_roundtrip() {
        let json = r#"{"SessionID":"s","SSHFingerprint":"f","NamespaceName":"n",
            "ProjectID":1,"EnvironmentID":2}"#;
        let query: SshAccessQuery = serde_json::from_str(json).unwrap();
        assert_eq!(query.project_id, 1);
        assert_eq!(query.environment_id, 2);
    }
}
