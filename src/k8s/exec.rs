use futures_util::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::Api;
use kube::api::{AttachParams, TerminalSize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{API_TIMEOUT, Bridge, BridgeError};

/// Exit status reported when the remote command's own status is unknown.
pub const INTERNAL_EXEC_FAILURE: i32 = 254;

/// Stream endpoints bridging an SSH session to a remote exec.
pub struct ExecIo {
    /// Client keystrokes / stdin data.
    pub stdin: mpsc::Receiver<Vec<u8>>,
    pub stdout: mpsc::Sender<Vec<u8>>,
    pub stderr: mpsc::Sender<Vec<u8>>,
    /// Latest terminal dimensions as `(columns, rows)`.
    pub winch: watch::Receiver<(u16, u16)>,
}

impl Bridge {
    /// Open a remote exec in the first pod of a deployment and bridge its
    /// streams until the command exits or the session is cancelled. Returns
    /// the remote exit code.
    #[tracing::instrument(skip(self, command, io, cancel))]
    pub async fn exec(
        &self,
        namespace: &str,
        deployment: &str,
        container: Option<String>,
        command: Vec<String>,
        tty: bool,
        io: ExecIo,
        cancel: CancellationToken,
    ) -> Result<i32, BridgeError> {
        let pod = self.first_pod(namespace, deployment).await?;
        let pod_name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| BridgeError::NoPods(deployment.to_string()))?;
        let container = match container {
            Some(name) => name,
            None => first_container(&pod)?,
        };

        let params = AttachParams::default()
            .stdin(true)
            .stdout(true)
            // the API server rejects a tty exec with a separate stderr stream
            .stderr(!tty)
            .tty(tty)
            .container(container);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut attached = tokio::time::timeout(API_TIMEOUT, pods.exec(&pod_name, command, &params))
            .await
            .map_err(|_| BridgeError::Timeout("remote exec"))??;

        let mut pumps = tokio::task::JoinSet::new();
        if let Some(stdout) = attached.stdout() {
            pumps.spawn(pump(stdout, io.stdout.clone()));
        }
        if let Some(stderr) = attached.stderr() {
            pumps.spawn(pump(stderr, io.stderr.clone()));
        }

        let stdin_task = tokio::spawn(forward_stdin(io.stdin, attached.stdin()));

        let winch_task = attached.terminal_size().map(|sizes| {
            tokio::spawn(forward_terminal_size(io.winch, sizes, cancel.clone()))
        });

        let status = attached.take_status();
        let code = tokio::select! {
            () = cancel.cancelled() => {
                pumps.abort_all();
                stdin_task.abort();
                if let Some(task) = winch_task {
                    task.abort();
                }
                return Err(BridgeError::Stream("session cancelled".into()));
            }
            status = async {
                match status {
                    Some(status) => status.await,
                    None => None,
                }
            } => exit_code(status),
        };

        // Drain buffered output before reporting the exit status; the pumps
        // finish once the remote streams reach EOF.
        while pumps.join_next().await.is_some() {}
        stdin_task.abort();
        if let Some(task) = winch_task {
            task.abort();
        }
        Ok(code)
    }
}

async fn forward_stdin(
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    stdin: Option<impl tokio::io::AsyncWrite + Unpin>,
) {
    let Some(mut stdin) = stdin else { return };
    while let Some(data) = stdin_rx.recv().await {
        if stdin.write_all(&data).await.is_err() {
            return;
        }
        if stdin.flush().await.is_err() {
            return;
        }
    }
    // Channel closed: the client sent EOF.
    let _ = stdin.shutdown().await;
}

async fn forward_terminal_size<S>(
    mut winch: watch::Receiver<(u16, u16)>,
    mut sizes: S,
    cancel: CancellationToken,
) where
    S: futures_util::Sink<TerminalSize> + Unpin,
{
    // Seed the remote terminal with the current size before streaming
    // subsequent window changes.
    let (width, height) = *winch.borrow();
    if width > 0 && height > 0 && sizes.send(TerminalSize { width, height }).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            changed = winch.changed() => {
                if changed.is_err() {
                    return;
                }
                let (width, height) = *winch.borrow();
                if sizes.send(TerminalSize { width, height }).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn pump(mut reader: impl AsyncRead + Unpin, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn first_container(pod: &Pod) -> Result<String, BridgeError> {
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    pod.spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .map(|container| container.name.clone())
        .ok_or(BridgeError::NoContainers(pod_name))
}

/// Translate the exec status frame into an exit code. An absent or
/// unparseable status reads as an internal failure, never as success.
fn exit_code(status: Option<Status>) -> i32 {
    let Some(status) = status else {
        return INTERNAL_EXEC_FAILURE;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .and_then(|details| details.causes)
        .and_then(|causes| {
            causes
                .into_iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message)
        .and_then(|message| message.trim().parse().ok())
        .unwrap_or(INTERNAL_EXEC_FAILURE)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    use super::*;

    #[test]
    fn success_status_is_zero() {
        let status = Status {
            status: Some("Success".into()),
            ..Default::default()
        };
        assert_eq!(exit_code(Some(status)), 0);
    }

    #[test]
    fn nonzero_exit_code_is_extracted() {
        let status = Status {
            status: Some("Failure".into()),
            reason: Some("NonZeroExitCode".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("42".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code(Some(status)), 42);
    }

    #[test]
    fn missing_status_is_internal_failure() {
        assert_eq!(exit_code(None), INTERNAL_EXEC_FAILURE);
    }

    #[test]
    fn failure_without_cause_is_internal_failure() {
        let status = Status {
            status: Some("Failure".into()),
            ..Default::default()
        };
        assert_eq!(exit_code(Some(status)), INTERNAL_EXEC_FAILURE);
    }

    #[test]
    fn garbage_exit_code_is_internal_failure() {
        let status = Status {
            status: Some("Failure".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("not-a-number".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code(Some(status)), INTERNAL_EXEC_FAILURE);
    }
}
