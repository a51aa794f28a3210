use std::sync::LazyLock;

use prometheus::{IntCounter, Registry};

/// Process-wide metric registry. The serving endpoint is wired by the
/// deployment, not by this crate; counters are additive from any task.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Authorization queries received by the sshapi worker.
pub static SSHPORTALAPI_REQUESTS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("sshportalapi_requests_total", "SSH access queries received"));

/// Sessions accepted by the edge SSH server.
pub static SSHD_SESSIONS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("sshd_sessions_total", "SSH sessions handled by sshd"));

/// Sessions accepted by the token SSH server.
pub static SSHTOKEN_SESSIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_counter(
        "sshtoken_sessions_total",
        "SSH sessions handled by sshtokend",
    )
});

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter spec");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("unique counter registration");
    counter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_increment() {
        let before = SSHPORTALAPI_REQUESTS_TOTAL.get();
        SSHPORTALAPI_REQUESTS_TOTAL.inc();
        assert_eq!(SSHPORTALAPI_REQUESTS_TOTAL.get(), before + 1);
    }
}
