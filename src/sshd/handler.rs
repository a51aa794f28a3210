use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Pty};
use russh_keys::{HashAlg, PublicKey};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{self, SshAccessQuery};
use crate::k8s::exec::{ExecIo, INTERNAL_EXEC_FAILURE};
use crate::k8s::logs::{LOG_CHANNEL_CAPACITY, LogOptions, SystemLogKind};
use crate::k8s::{Bridge, BridgeError};
use crate::metrics;
use crate::sshd::command::{self, Intent, LogsSpec, SFTP_COMMAND};

/// Public keys a client may offer before the connection is cut off.
const MAX_AUTH_ATTEMPTS: usize = 10;

/// Exit status for failures inside the log subsystem, distinct from remote
/// command failures and from SSH's own 255.
const LOG_SUBSYSTEM_FAILURE: u32 = 253;

/// How long shell acquisition may run silently before the spinner starts.
const SPINNER_DELAY: Duration = Duration::from_secs(2);

/// Per-process server state handed to each new connection.
pub struct PortalServer {
    nats: async_nats::Client,
    bridge: Bridge,
    log_access_enabled: bool,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl PortalServer {
    pub fn new(
        nats: async_nats::Client,
        bridge: Bridge,
        log_access_enabled: bool,
        active: Arc<AtomicUsize>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            nats,
            bridge,
            log_access_enabled,
            active,
            shutdown,
        }
    }
}

impl russh::server::Server for PortalServer {
    type Handler = SessionHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SessionHandler {
        self.active.fetch_add(1, Ordering::Relaxed);
        metrics::SSHD_SESSIONS_TOTAL.inc();
        SessionHandler::new(
            self.nats.clone(),
            self.bridge.clone(),
            self.log_access_enabled,
            self.active.clone(),
            self.shutdown.child_token(),
            peer,
        )
    }
}

/// Authorized environment identity, written exactly once when a public key
/// passes the policy check and read by the dispatch path afterwards.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub environment_id: i32,
    pub project_id: i32,
    pub environment_name: String,
    pub project_name: String,
    pub namespace: String,
    pub fingerprint: String,
}

/// Per-connection SSH state machine.
pub struct SessionHandler {
    nats: async_nats::Client,
    bridge: Bridge,
    log_access_enabled: bool,
    active: Arc<AtomicUsize>,
    session_id: String,
    peer: Option<SocketAddr>,
    auth_attempts: usize,
    /// Decision taken for an offered key, pending its ownership proof.
    pending: Option<SessionContext>,
    ctx: Option<Arc<SessionContext>>,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    winch_tx: watch::Sender<(u16, u16)>,
    pty: bool,
    dispatched: bool,
    cancel: CancellationToken,
}

impl SessionHandler {
    fn new(
        nats: async_nats::Client,
        bridge: Bridge,
        log_access_enabled: bool,
        active: Arc<AtomicUsize>,
        cancel: CancellationToken,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            nats,
            bridge,
            log_access_enabled,
            active,
            session_id: Uuid::new_v4().to_string(),
            peer,
            auth_attempts: 0,
            pending: None,
            ctx: None,
            stdin_tx: None,
            winch_tx: watch::Sender::new((0, 0)),
            pty: false,
            dispatched: false,
            cancel,
        }
    }

    /// Resolve the namespace the client named as its user and ask the policy
    /// service whether this fingerprint may enter it.
    async fn authorize(&self, namespace: &str, fingerprint: &str) -> Option<SessionContext> {
        let details = match self.bridge.namespace_details(namespace).await {
            Ok(details) => details,
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, namespace, error = %err,
                    "cannot resolve namespace for auth");
                return None;
            }
        };

        let query = SshAccessQuery {
            session_id: self.session_id.clone(),
            ssh_fingerprint: fingerprint.to_string(),
            namespace_name: namespace.to_string(),
            project_id: details.project_id,
            environment_id: details.environment_id,
        };
        match bus::query_access(&self.nats, &query).await {
            Ok(true) => {
                tracing::info!(session_id = %self.session_id, namespace, fingerprint,
                    peer = ?self.peer, "SSH access granted");
                Some(SessionContext {
                    environment_id: details.environment_id,
                    project_id: details.project_id,
                    environment_name: details.environment_name,
                    project_name: details.project_name,
                    namespace: namespace.to_string(),
                    fingerprint: fingerprint.to_string(),
                })
            }
            Ok(false) => {
                tracing::info!(session_id = %self.session_id, namespace, fingerprint,
                    "SSH access denied");
                None
            }
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, namespace, error = %err,
                    "authorization query failed");
                None
            }
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::PUBLICKEY),
        }
    }

    /// Accept one command per session and run its intent in a dedicated
    /// task, leaving the session loop free for stdin and window changes.
    fn dispatch(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
        words: Vec<String>,
        sftp: bool,
    ) -> Result<(), anyhow::Error> {
        let Some(ctx) = self.ctx.clone() else {
            anyhow::bail!("channel request before authentication");
        };
        if self.dispatched {
            anyhow::bail!("only one command per session");
        }
        self.dispatched = true;

        session.channel_success(channel)?;

        let (stdin_tx, stdin_rx) = mpsc::channel(16);
        self.stdin_tx = Some(stdin_tx);

        let request = IntentRequest {
            handle: session.handle(),
            channel,
            bridge: self.bridge.clone(),
            ctx,
            session_id: self.session_id.clone(),
            log_access_enabled: self.log_access_enabled,
            tty: self.pty,
            stdin: stdin_rx,
            winch: self.winch_tx.subscribe(),
            cancel: self.cancel.child_token(),
        };
        let intent = command::parse_intent(&words, sftp);
        tokio::spawn(run_intent(request, intent));
        Ok(())
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait::async_trait]
impl russh::server::Handler for SessionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
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
        match self.authorize(user, &fingerprint).await {
            Some(ctx) => {
                self.pending = Some(ctx);
                Ok(Auth::Accept)
            }
            None => Ok(Self::reject()),
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();

        // Ownership is proven; promote the decision recorded for this key,
        // or re-run it for clients that skipped the offer phase.
        let decided = match self.pending.take() {
            Some(pending) if pending.fingerprint == fingerprint => Some(pending),
            _ => self.authorize(user, &fingerprint).await,
        };
        match decided {
            Some(ctx) if self.ctx.is_none() => {
                self.ctx = Some(Arc::new(ctx));
                Ok(Auth::Accept)
            }
            Some(_) => Ok(Auth::Accept),
            None => Ok(Self::reject()),
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty = true;
        self.winch_tx
            .send_replace((col_width as u16, row_height as u16));
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.winch_tx
            .send_replace((col_width as u16, row_height as u16));
        Ok(())
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
        self.dispatch(channel, session, words, false)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, session, Vec::new(), false)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(channel)?;
            return Ok(());
        }
        self.dispatch(channel, session, Vec::new(), true)
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(stdin) = &self.stdin_tx {
            // Backpressure: a stalled remote process slows the reader here.
            if stdin.send(data.to_vec()).await.is_err() {
                self.stdin_tx = None;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender propagates EOF to the remote stdin.
        self.stdin_tx = None;
        Ok(())
    }
}

/// Everything a spawned intent task needs from the session.
struct IntentRequest {
    handle: Handle,
    channel: ChannelId,
    bridge: Bridge,
    ctx: Arc<SessionContext>,
    session_id: String,
    log_access_enabled: bool,
    tty: bool,
    stdin: mpsc::Receiver<Vec<u8>>,
    winch: watch::Receiver<(u16, u16)>,
    cancel: CancellationToken,
}

async fn run_intent(request: IntentRequest, intent: anyhow::Result<Intent>) {
    let handle = request.handle.clone();
    let channel = request.channel;
    let session_id = request.session_id.clone();

    let code = match intent {
        Err(err) => {
            stderr_msg(&handle, channel, &err.to_string(), &session_id).await;
            1
        }
        Ok(Intent::Exec {
            service,
            container,
            command,
        }) => exec_intent(request, &service, container, command).await,
        Ok(Intent::Sftp { service, container }) => {
            let command = SFTP_COMMAND.iter().map(ToString::to_string).collect();
            exec_intent(request, &service, container, command).await
        }
        Ok(Intent::ContainerLogs {
            service,
            container,
            logs,
        }) => container_logs_intent(request, &service, container, logs).await,
        Ok(Intent::SystemLogs { kind, logs }) => system_logs_intent(request, kind, logs).await,
    };

    let _ = handle.exit_status_request(channel, code).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

/// Exec and SFTP: find the service's deployment, wake the environment, and
/// bridge the channel to a remote exec.
async fn exec_intent(
    request: IntentRequest,
    service: &str,
    container: Option<String>,
    command: Vec<String>,
) -> u32 {
    let IntentRequest {
        handle,
        channel,
        bridge,
        ctx,
        session_id,
        tty,
        stdin,
        winch,
        cancel,
        ..
    } = request;

    let deployment = match bridge.find_deployment(&ctx.namespace, service).await {
        Ok(deployment) => deployment,
        Err(err) => {
            tracing::warn!(session_id = %session_id, namespace = %ctx.namespace, service,
                error = %err, "no deployment for service");
            stderr_msg(&handle, channel, "unknown service", &session_id).await;
            return INTERNAL_EXEC_FAILURE as u32;
        }
    };

    // Interactive sessions get a spinner if waking the environment is slow.
    let spinner = tty.then(|| spawn_spinner(handle.clone(), channel, cancel.child_token()));

    let prepared = async {
        bridge.unidle_namespace(&ctx.namespace).await?;
        bridge.ensure_scaled(&ctx.namespace, &deployment).await
    }
    .await;
    if let Some(spinner) = spinner {
        spinner.cancel();
    }
    if let Err(err) = prepared {
        tracing::error!(session_id = %session_id, namespace = %ctx.namespace,
            deployment, error = %err, "failed to wake environment");
        stderr_msg(&handle, channel, "environment is not available", &session_id).await;
        return INTERNAL_EXEC_FAILURE as u32;
    }

    let (stdout_tx, mut stdout_rx) = mpsc::channel::<Vec<u8>>(16);
    let (stderr_tx, mut stderr_rx) = mpsc::channel::<Vec<u8>>(16);
    let stdout_writer = tokio::spawn({
        let handle = handle.clone();
        async move {
            while let Some(chunk) = stdout_rx.recv().await {
                if handle.data(channel, CryptoVec::from(chunk)).await.is_err() {
                    break;
                }
            }
        }
    });
    let stderr_writer = tokio::spawn({
        let handle = handle.clone();
        async move {
            while let Some(chunk) = stderr_rx.recv().await {
                if handle
                    .extended_data(channel, 1, CryptoVec::from(chunk))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    });

    let io = ExecIo {
        stdin,
        stdout: stdout_tx,
        stderr: stderr_tx,
        winch,
    };
    let result = bridge
        .exec(
            &ctx.namespace,
            &deployment,
            container,
            command,
            tty,
            io,
            cancel,
        )
        .await;
    let _ = stdout_writer.await;
    let _ = stderr_writer.await;

    match result {
        Ok(code) => code.clamp(0, 255) as u32,
        Err(err) => {
            tracing::error!(session_id = %session_id, namespace = %ctx.namespace,
                deployment, error = %err, "remote exec failed");
            stderr_msg(&handle, channel, "remote execution failed", &session_id).await;
            INTERNAL_EXEC_FAILURE as u32
        }
    }
}

async fn container_logs_intent(
    request: IntentRequest,
    service: &str,
    container: Option<String>,
    logs: LogsSpec,
) -> u32 {
    let deployment = match request
        .bridge
        .find_deployment(&request.ctx.namespace, service)
        .await
    {
        Ok(deployment) => deployment,
        Err(err) => {
            tracing::warn!(session_id = %request.session_id, service, error = %err,
                "no deployment for log request");
            stderr_msg(
                &request.handle,
                request.channel,
                "unknown service",
                &request.session_id,
            )
            .await;
            return LOG_SUBSYSTEM_FAILURE;
        }
    };
    stream_logs(request, logs, |bridge, opts, out, cancel, namespace| async move {
        bridge
            .container_logs(&namespace, &deployment, container, opts, out, cancel)
            .await
    })
    .await
}

async fn system_logs_intent(request: IntentRequest, kind: SystemLogKind, logs: LogsSpec) -> u32 {
    stream_logs(request, logs, |bridge, opts, out, cancel, namespace| async move {
        bridge.system_logs(&namespace, kind, opts, out, cancel).await
    })
    .await
}

/// Common log plumbing: gate on the feature flag, run the stream with a
/// bounded line channel, and map resource-limit errors to exit code 253.
async fn stream_logs<F, Fut>(request: IntentRequest, logs: LogsSpec, stream: F) -> u32
where
    F: FnOnce(Bridge, LogOptions, mpsc::Sender<String>, CancellationToken, String) -> Fut,
    Fut: Future<Output = Result<(), BridgeError>>,
{
    let IntentRequest {
        handle,
        channel,
        bridge,
        ctx,
        session_id,
        log_access_enabled,
        cancel,
        ..
    } = request;

    if !log_access_enabled {
        stderr_msg(&handle, channel, "log access is disabled", &session_id).await;
        return LOG_SUBSYSTEM_FAILURE;
    }

    let (line_tx, mut line_rx) = mpsc::channel::<String>(LOG_CHANNEL_CAPACITY);
    let writer = tokio::spawn({
        let handle = handle.clone();
        async move {
            while let Some(line) = line_rx.recv().await {
                let data = CryptoVec::from(format!("{line}\r\n"));
                if handle.data(channel, data).await.is_err() {
                    break;
                }
            }
        }
    });

    let opts = LogOptions {
        follow: logs.follow,
        tail_lines: logs.tail_lines,
        request_id: session_id.clone(),
    };
    let result = stream(bridge, opts, line_tx, cancel, ctx.namespace.clone()).await;
    let _ = writer.await;

    match result {
        Ok(()) => 0,
        Err(err @ (BridgeError::ConcurrentLogLimit | BridgeError::LogTimeLimit)) => {
            stderr_msg(&handle, channel, &err.to_string(), &session_id).await;
            LOG_SUBSYSTEM_FAILURE
        }
        Err(err) => {
            tracing::error!(session_id = %session_id, error = %err, "log streaming failed");
            stderr_msg(&handle, channel, "log streaming failed", &session_id).await;
            LOG_SUBSYSTEM_FAILURE
        }
    }
}

/// Client-visible error line: a short message plus the session ID so
/// operators can correlate, never internal error detail.
async fn stderr_msg(handle: &Handle, channel: ChannelId, message: &str, session_id: &str) {
    let text = format!("{message}. SID: {session_id}\r\n");
    let _ = handle
        .extended_data(channel, 1, CryptoVec::from(text))
        .await;
}

/// Single-line stderr spinner, started only when acquisition is slow and
/// cleared once the shell is ready.
fn spawn_spinner(handle: Handle, channel: ChannelId, token: CancellationToken) -> CancellationToken {
    let spinner = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = spinner.cancelled() => return,
            () = tokio::time::sleep(SPINNER_DELAY) => {}
        }
        let frames = ['|', '/', '-', '\\'];
        let mut i = 0usize;
        loop {
            let frame = format!("\r{} waiting for environment", frames[i % frames.len()]);
            if handle
                .extended_data(channel, 1, CryptoVec::from(frame))
                .await
                .is_err()
            {
                return;
            }
            i += 1;
            tokio::select! {
                () = spinner.cancelled() => break,
                () = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
        // CSI 2K erases the spinner line before the shell takes over.
        let _ = handle
            .extended_data(channel, 1, CryptoVec::from("\r\x1b[2K".to_string()))
            .await;
    });
    token
}
