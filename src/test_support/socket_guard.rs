//! Gate for backend tests that talk to a localhost wiremock server.
//!
//! The bind check runs once per test binary and its outcome is shared by
//! every backend suite. `FILER_REQUIRE_SOCKET_TESTS=1` turns a skip into a
//! failure so CI cannot silently lose the HTTP, DRS and object store suites.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::OnceLock;

use wiremock::MockServer;

const REQUIRE_SOCKET_TESTS_ENV: &str = "FILER_REQUIRE_SOCKET_TESTS";

static LOCALHOST_BIND: OnceLock<Result<(), String>> = OnceLock::new();

fn localhost_bind() -> &'static Result<(), String> {
    LOCALHOST_BIND.get_or_init(|| {
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map(drop)
            .map_err(|e| e.to_string())
    })
}

fn socket_tests_required() -> bool {
    std::env::var(REQUIRE_SOCKET_TESTS_ENV)
        .is_ok_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Starts a mock server for a `backend` suite, or returns `None` when
/// localhost cannot be bound.
///
/// # Panics
///
/// When binding fails and `FILER_REQUIRE_SOCKET_TESTS` is set.
pub async fn start_mock_server_or_skip(backend: &str) -> Option<MockServer> {
    match localhost_bind() {
        Ok(()) => Some(MockServer::start().await),
        Err(reason) => {
            assert!(
                !socket_tests_required(),
                "{backend} backend test needs a localhost listener: {reason}"
            );
            eprintln!("[socket-bound-test] skipping {backend} backend test: {reason}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_check_runs_once_per_binary() {
        assert!(std::ptr::eq(localhost_bind(), localhost_bind()));
    }
}
