use chrono::Utc;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::SshapiConfig;
use crate::lagoondb::{self, DbError};
use crate::metrics;
use crate::permission::Permission;
use crate::{bus, keycloak};

type PolicyEngine = Permission<keycloak::Client, lagoondb::Client>;

/// Run the authorization policy service: subscribe to the query subject as
/// part of the shared queue group and answer until shutdown.
pub async fn run(cfg: SshapiConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let db = lagoondb::Client::connect(&cfg.db).await?;
    let keycloak = keycloak::Client::discover(&cfg.keycloak).await?;
    let permission = Permission::new(keycloak, db.clone(), cfg.block_developer_ssh);

    let nats = bus::connect(&cfg.nats_url, shutdown.clone()).await?;
    let mut queries = nats
        .queue_subscribe(bus::SUBJECT, bus::QUEUE.into())
        .await?;
    tracing::info!(subject = bus::SUBJECT, queue = bus::QUEUE, "sshapi serving");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            message = queries.next() => {
                let Some(message) = message else { break };
                handle_query(&nats, &permission, &db, message).await;
            }
        }
    }

    queries.unsubscribe().await.ok();
    tracing::info!("sshapi stopped");
    Ok(())
}

/// Answer one query. Malformed payloads and transport failures produce no
/// reply at all; the edge times out and denies by default.
async fn handle_query(
    nats: &async_nats::Client,
    permission: &PolicyEngine,
    db: &lagoondb::Client,
    message: async_nats::Message,
) {
    metrics::SSHPORTALAPI_REQUESTS_TOTAL.inc();

    let query: bus::SshAccessQuery = match serde_json::from_slice(&message.payload) {
        Ok(query) => query,
        Err(err) => {
            tracing::warn!(error = %err, "malformed SSH access query");
            return;
        }
    };
    let Some(reply) = message.reply else {
        tracing::warn!(session_id = %query.session_id, "query without reply subject");
        return;
    };
    if query.ssh_fingerprint.is_empty() || query.namespace_name.is_empty() {
        tracing::warn!(session_id = %query.session_id, "query lacks fingerprint or namespace");
        return;
    }

    let environment = match db.environment_by_namespace_name(&query.namespace_name).await {
        Ok(environment) => environment,
        Err(DbError::NotFound) => {
            tracing::warn!(session_id = %query.session_id,
                namespace = %query.namespace_name, "unknown environment");
            respond(nats, reply, false).await;
            return;
        }
        Err(err) => {
            tracing::error!(session_id = %query.session_id, error = %err,
                "environment lookup failed");
            return;
        }
    };

    // Non-zero IDs in the query must agree with the database; a mismatch
    // means the edge resolved a namespace we do not recognise.
    if (query.project_id != 0 && query.project_id != environment.project_id)
        || (query.environment_id != 0 && query.environment_id != environment.id)
    {
        tracing::warn!(session_id = %query.session_id, namespace = %query.namespace_name,
            query_project_id = query.project_id, project_id = environment.project_id,
            query_environment_id = query.environment_id, environment_id = environment.id,
            "query IDs disagree with environment record");
        respond(nats, reply, false).await;
        return;
    }

    let user = match db.user_by_ssh_fingerprint(&query.ssh_fingerprint).await {
        Ok(user) => user,
        Err(DbError::NotFound) => {
            tracing::debug!(session_id = %query.session_id, "unknown SSH key fingerprint");
            respond(nats, reply, false).await;
            return;
        }
        Err(err) => {
            tracing::error!(session_id = %query.session_id, error = %err, "user lookup failed");
            return;
        }
    };

    if let Err(err) = db.ssh_key_used(&query.ssh_fingerprint, Utc::now()).await {
        tracing::warn!(session_id = %query.session_id, error = %err,
            "failed to record SSH key use");
    }

    match permission
        .can_ssh_to_environment(&user.uuid, environment.project_id, environment.typ)
        .await
    {
        Ok(granted) => {
            tracing::info!(session_id = %query.session_id, user_uuid = %user.uuid,
                project = %environment.project_name, environment = %environment.name,
                granted, "authorization decision");
            respond(nats, reply, granted).await;
        }
        Err(err) => {
            tracing::error!(session_id = %query.session_id, user_uuid = %user.uuid,
                error = %err, "policy evaluation failed");
        }
    }
}

async fn respond(nats: &async_nats::Client, reply: async_nats::Subject, granted: bool) {
    let payload = if granted { &b"true"[..] } else { &b"false"[..] };
    if let Err(err) = nats.publish(reply, payload.into()).await {
        tracing::error!(error = %err, "failed to publish authorization reply");
    }
}
