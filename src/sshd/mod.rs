pub mod command;
mod handler;

pub use handler::{PortalServer, SessionContext, SessionHandler};

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use russh::server::Server as _;
use tokio_util::sync::CancellationToken;

use crate::bus;
use crate::config::SshdConfig;
use crate::k8s::Bridge;

/// Grace period for in-flight sessions once shutdown starts.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(8);

/// Run the edge SSH server until shutdown.
pub async fn run(cfg: SshdConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let keys = load_host_keys(
        cfg.host_key_ecdsa.as_deref(),
        cfg.host_key_ed25519.as_deref(),
        cfg.host_key_rsa.as_deref(),
    )?;
    let nats = bus::connect(&cfg.nats_url, shutdown.clone()).await?;
    let bridge = Bridge::new(cfg.concurrent_log_limit, cfg.log_time_limit).await?;

    let config = Arc::new(server_config(keys, cfg.banner.clone()));
    let active = Arc::new(AtomicUsize::new(0));
    let mut server = PortalServer::new(
        nats,
        bridge,
        cfg.log_access_enabled,
        active.clone(),
        shutdown.clone(),
    );

    tracing::info!(port = cfg.port, "sshd listening");
    tokio::select! {
        () = shutdown.cancelled() => {
            drain_sessions(&active).await;
        }
        result = server.run_on_address(config, (std::net::Ipv4Addr::UNSPECIFIED, cfg.port)) => {
            result?;
        }
    }
    tracing::info!("sshd stopped");
    Ok(())
}

/// Wait for open sessions to finish, up to the shutdown deadline.
pub(crate) async fn drain_sessions(active: &AtomicUsize) {
    let drained = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        while active.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            sessions = active.load(Ordering::Relaxed),
            "shutdown deadline reached with sessions still open"
        );
    }
}

/// Decode the configured PEM host keys. At least one is required; a server
/// with no identity must not start.
pub(crate) fn load_host_keys(
    ecdsa: Option<&str>,
    ed25519: Option<&str>,
    rsa: Option<&str>,
) -> anyhow::Result<Vec<russh_keys::PrivateKey>> {
    let mut keys = Vec::new();
    for pem in [ecdsa, ed25519, rsa].into_iter().flatten() {
        keys.push(russh_keys::decode_secret_key(pem, None)?);
    }
    anyhow::ensure!(!keys.is_empty(), "no host key provided: set at least one of HOST_KEY_ECDSA, HOST_KEY_ED25519, HOST_KEY_RSA");
    Ok(keys)
}

/// Server configuration shared by sshd and sshtokend: public-key auth only,
/// SHA1-free algorithm lists, and an aggressive keepalive so dead
/// multiplexed channels are torn down quickly.
pub(crate) fn server_config(
    keys: Vec<russh_keys::PrivateKey>,
    banner: Option<String>,
) -> russh::server::Config {
    russh::server::Config {
        methods: russh::MethodSet::PUBLICKEY,
        keys,
        auth_banner: banner.map(|text| &*Box::leak(text.into_boxed_str())),
        keepalive_interval: Some(Duration::from_secs(2)),
        keepalive_max: 3,
        preferred: russh::Preferred {
            kex: Cow::Borrowed(&[
                russh::kex::CURVE25519_PRE_RFC_8731,
                russh::kex::CURVE25519,
                russh::kex::DH_G16_SHA512,
                russh::kex::DH_G14_SHA256,
            ]),
            mac: Cow::Borrowed(&[
                russh::mac::HMAC_SHA256_ETM,
                russh::mac::HMAC_SHA512_ETM,
                russh::mac::HMAC_SHA256,
                russh::mac::HMAC_SHA512,
            ]),
            ..russh::Preferred::default()
        },
        ..russh::server::Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_keys_require_at_least_one() {
        assert!(load_host_keys(None, None, None).is_err());
    }

    #[test]
    fn server_config_is_publickey_only_without_sha1() {
        let config = server_config(vec![], None);
        assert_eq!(config.methods, russh::MethodSet::PUBLICKEY);
        let kex = format!("{:?}", config.preferred.kex);
        assert!(!kex.contains("sha1"), "SHA1 KEX offered: {kex}");
        let mac = format!("{:?}", config.preferred.mac);
        assert!(!mac.contains("sha1-96"), "HMAC-SHA1-96 offered: {mac}");
    }

    #[test]
    fn keepalive_is_configured() {
        let config = server_config(vec![], None);
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(2)));
    }
}
