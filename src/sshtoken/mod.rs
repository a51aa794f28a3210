use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use russh::server::{Auth, Handle, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::{HashAlg, PublicKey};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SshtokendConfig;
use crate::lagoondb::{self, DbError};
use crate::metrics;
use crate::permission::Permission;
use crate::sshd::{drain_sessions, load_host_keys, server_config};
use crate::keycloak;

/// The user name that selects the token flow; anything else gets the
/// redirect banner.
const TOKEN_USER: &str = "lagoon";

const MAX_AUTH_ATTEMPTS: usize = 10;

type PolicyEngine = Permission<keycloak::Client, lagoondb::Client>;

/// Run the token-issuing SSH server until shutdown.
pub async fn run(cfg: SshtokendConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let keys = load_host_keys(
        cfg.host_key_ecdsa.as_deref(),
        cfg.host_key_ed25519.as_deref(),
        cfg.host_key_rsa.as_deref(),
    )?;
    let db = lagoondb::Client::connect(&cfg.db).await?;
    let keycloak = keycloak::Client::discover(&cfg.keycloak).await?;
    let permission = Arc::new(Permission::new(
        keycloak.clone(),
        db.clone(),
        cfg.block_developer_ssh,
    ));

    let config = Arc::new(server_config(keys, cfg.banner.clone()));
    let active = Arc::new(AtomicUsize::new(0));
    let mut server = TokenServer {
        db,
        keycloak,
        permission,
        active: active.clone(),
        shutdown: shutdown.clone(),
    };

    tracing::info!(port = cfg.port, "sshtokend listening");
    tokio::select! {
        () = shutdown.cancelled() => {
            drain_sessions(&active).await;
        }
        result = server.run_on_address(config, (std::net::Ipv4Addr::UNSPECIFIED, cfg.port)) => {
            result?;
        }
    }
    tracing::info!("sshtokend stopped");
    Ok(())
}

struct TokenServer {
    db: lagoondb::Client,
    keycloak: keycloak::Client,
    permission: Arc<PolicyEngine>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl russh::server::Server for TokenServer {
    type Handler = TokenHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> TokenHandler {
        self.active.fetch_add(1, Ordering::Relaxed);
        metrics::SSHTOKEN_SESSIONS_TOTAL.inc();
        TokenHandler {
            db: self.db.clone(),
            keycloak: self.keycloak.clone(),
            permission: self.permission.clone(),
            active: self.active.clone(),
            cancel: self.shutdown.child_token(),
            session_id: Uuid::new_v4().to_string(),
            peer,
            auth_attempts: 0,
            pending: None,
            user: None,
            username: None,
            dispatched: false,
        }
    }
}

/// Identity established at authentication: the platform user owning the
/// offered key.
#[derive(Debug, Clone)]
struct AuthedUser {
    uuid: Uuid,
    fingerprint: String,
}

struct TokenHandler {
    db: lagoondb::Client,
    keycloak: keycloak::Client,
    permission: Arc<PolicyEngine>,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
    session_id: String,
    peer: Option<SocketAddr>,
    auth_attempts: usize,
    pending: Option<AuthedUser>,
    user: Option<AuthedUser>,
    username: Option<String>,
    dispatched: bool,
}

impl TokenHandler {
    /// A key is acceptable iff its fingerprint belongs to a platform user.
    async fn identify(&self, fingerprint: &str) -> Option<AuthedUser> {
        match self.db.user_by_ssh_fingerprint(fingerprint).await {
            Ok(user) => Some(AuthedUser {
                uuid: user.uuid,
                fingerprint: fingerprint.to_string(),
            }),
            Err(DbError::NotFound) => {
                tracing::debug!(session_id = %self.session_id, fingerprint, peer = ?self.peer,
                    "unknown SSH key fingerprint");
                None
            }
            Err(err) => {
                tracing::error!(session_id = %self.session_id, error = %err,
                    "user lookup failed");
                None
            }
        }
    }

    fn dispatch(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
        words: Vec<String>,
    ) -> Result<(), anyhow::Error> {
        let Some(user) = self.user.clone() else {
            anyhow::bail!("channel request before authentication");
        };
        let Some(username) = self.username.clone() else {
            anyhow::bail!("channel request before authentication");
        };
        if self.dispatched {
            anyhow::bail!("only one command per session");
        }
        self.dispatched = true;

        session.channel_success(channel)?;
        let handle = session.handle();

        if username == TOKEN_USER {
            tokio::spawn(token_flow(
                handle,
                channel,
                self.keycloak.clone(),
                user,
                words,
                self.session_id.clone(),
            ));
        } else {
            tokio::spawn(redirect_flow(
                handle,
                channel,
                self.db.clone(),
                self.permission.clone(),
                user,
                username,
                self.session_id.clone(),
            ));
        }
        Ok(())
    }
}

impl Drop for TokenHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait::async_trait]
impl russh::server::Handler for TokenHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.auth_attempts += 1;
        if self.auth_attempts > MAX_AUTH_ATTEMPTS {
            tracing::warn!(session_id = %self.session_id, peer = ?self.peer,
                "auth attempt cap exceeded");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();
        match self.identify(&fingerprint).await {
            Some(user) => {
                self.pending = Some(user);
                Ok(Auth::Accept)
            }
            None => Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::PUBLICKEY),
            }),
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();
        let identified = match self.pending.take() {
            Some(pending) if pending.fingerprint == fingerprint => Some(pending),
            _ => self.identify(&fingerprint).await,
        };
        let Some(identified) = identified else {
            return Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::PUBLICKEY),
            });
        };

        if let Err(err) = self.db.ssh_key_used(&fingerprint, Utc::now()).await {
            tracing::warn!(session_id = %self.session_id, error = %err,
                "failed to record SSH key use");
        }

        tracing::info!(session_id = %self.session_id, user_uuid = %identified.uuid,
            username = user, peer = ?self.peer, "token session authenticated");
        if self.user.is_none() {
            self.user = Some(identified);
            self.username = Some(user.to_string());
        }
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let words: Vec<String> = String::from_utf8_lossy(data)
            .split_whitespace()
            .map(ToString::to_string)
            .collect();
        self.dispatch(channel, session, words)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, session, Vec::new())
    }
}

/// `lagoon@…` sessions: exactly `token` (access token string) or `grant`
/// (the full token response JSON).
async fn token_flow(
    handle: Handle,
    channel: ChannelId,
    keycloak: keycloak::Client,
    user: AuthedUser,
    words: Vec<String>,
    session_id: String,
) {
    let issued = match words.as_slice() {
        [command] if command == "token" => keycloak.user_access_token(&user.uuid).await,
        [command] if command == "grant" => keycloak.user_access_token_response(&user.uuid).await,
        _ => {
            tracing::warn!(session_id = %session_id, ?words, "invalid token command");
            stderr_msg(
                &handle,
                channel,
                "invalid command: specify one of 'token' or 'grant'",
                &session_id,
            )
            .await;
            finish(&handle, channel, 1).await;
            return;
        }
    };

    match issued {
        Ok(token) => {
            let _ = handle
                .data(channel, CryptoVec::from(format!("{token}\r\n")))
                .await;
            finish(&handle, channel, 0).await;
        }
        Err(err) => {
            tracing::error!(session_id = %session_id, user_uuid = %user.uuid, error = %err,
                "token issuance failed");
            stderr_msg(&handle, channel, "token request failed", &session_id).await;
            finish(&handle, channel, 1).await;
        }
    }
}

/// Non-`lagoon` user names are taken as a namespace: a user with SSH access
/// to that environment is pointed at its real SSH endpoint, anyone else
/// learns nothing beyond the lack of shell access.
async fn redirect_flow(
    handle: Handle,
    channel: ChannelId,
    db: lagoondb::Client,
    permission: Arc<PolicyEngine>,
    user: AuthedUser,
    username: String,
    session_id: String,
) {
    let environment = match db.environment_by_namespace_name(&username).await {
        Ok(environment) => environment,
        Err(DbError::NotFound) => {
            tracing::info!(session_id = %session_id, namespace = %username,
                "redirect for unknown environment");
            deny_shell_access(&handle, channel, &session_id).await;
            return;
        }
        Err(err) => {
            tracing::error!(session_id = %session_id, error = %err, "environment lookup failed");
            deny_shell_access(&handle, channel, &session_id).await;
            return;
        }
    };

    let granted = permission
        .can_ssh_to_environment(&user.uuid, environment.project_id, environment.typ)
        .await;
    if !matches!(granted, Ok(true)) {
        if let Err(err) = granted {
            tracing::error!(session_id = %session_id, user_uuid = %user.uuid, error = %err,
                "policy evaluation failed");
        }
        deny_shell_access(&handle, channel, &session_id).await;
        return;
    }

    match db.ssh_endpoint_by_environment_id(environment.id).await {
        Ok((host, port)) => {
            let banner = redirect_banner(&username, &host, &port);
            let _ = handle.data(channel, CryptoVec::from(banner)).await;
            finish(&handle, channel, 0).await;
        }
        Err(err) => {
            tracing::error!(session_id = %session_id, environment_id = environment.id,
                error = %err, "no SSH endpoint for environment");
            deny_shell_access(&handle, channel, &session_id).await;
        }
    }
}

fn redirect_banner(namespace: &str, host: &str, port: &str) -> String {
    let endpoint = if port == "22" {
        format!("ssh {namespace}@{host}")
    } else {
        format!("ssh -p {port} {namespace}@{host}")
    };
    format!(
        "This SSH server does not provide shell access to your environment.\r\n\
         To SSH into your environment use this endpoint:\r\n\
         \r\n    {endpoint}\r\n"
    )
}

async fn deny_shell_access(handle: &Handle, channel: ChannelId, session_id: &str) {
    stderr_msg(
        handle,
        channel,
        "This SSH server does not provide shell access",
        session_id,
    )
    .await;
    finish(handle, channel, 1).await;
}

async fn stderr_msg(handle: &Handle, channel: ChannelId, message: &str, session_id: &str) {
    let text = format!("{message}. SID: {session_id}\r\n");
    let _ = handle
        .extended_data(channel, 1, CryptoVec::from(text))
        .await;
}

async fn finish(handle: &Handle, channel: ChannelId, code: u32) {
    let _ = handle.exit_status_request(channel, code).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}
