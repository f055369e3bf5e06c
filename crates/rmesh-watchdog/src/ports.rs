// SPDX-License-Identifier: MIT OR Apache-2.0
//! Port occupancy checks and process eviction.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// Grace between SIGTERM and SIGKILL when evicting port holders.
const EVICT_GRACE: Duration = Duration::from_millis(200);

/// Whether something is listening on `127.0.0.1:port`.
pub async fn port_in_use(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_millis(200),
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Whether a binary is present on PATH.
pub(crate) fn binary_on_path(binary: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(binary).is_file())
}

fn parse_pids(text: &str) -> Vec<i32> {
    text.split_whitespace()
        .filter_map(|token| token.trim().parse().ok())
        .collect()
}

/// PIDs holding a TCP port, via `lsof` with a `fuser` fallback.
pub async fn pids_on_port(port: u16) -> Vec<i32> {
    if binary_on_path("lsof") {
        if let Ok(out) = Command::new("lsof")
            .arg("-ti")
            .arg(format!(":{port}"))
            .output()
            .await
        {
            return parse_pids(&String::from_utf8_lossy(&out.stdout));
        }
    }
    if binary_on_path("fuser")
        && let Ok(out) = Command::new("fuser")
            .arg("-n")
            .arg("tcp")
            .arg(port.to_string())
            .output()
            .await
    {
        return parse_pids(&String::from_utf8_lossy(&out.stdout));
    }
    Vec::new()
}

/// Deliver a signal to a process.
pub(crate) fn send_signal(pid: i32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

/// Free the given ports: SIGTERM the holders, then SIGKILL any that remain
/// after a short grace.
pub async fn free_ports(ports: &[u16]) {
    for &port in ports {
        if port == 0 || !port_in_use(port).await {
            continue;
        }
        debug!(target: "rmesh_watchdog", port, "freeing busy port");
        for pid in pids_on_port(port).await {
            send_signal(pid, libc::SIGTERM);
        }
        tokio::time::sleep(EVICT_GRACE).await;
        if port_in_use(port).await {
            for pid in pids_on_port(port).await {
                send_signal(pid, libc::SIGKILL);
            }
            tokio::time::sleep(EVICT_GRACE).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_parsing_is_permissive() {
        assert_eq!(parse_pids("123\n456\n"), vec![123, 456]);
        assert_eq!(parse_pids(" 7  eight 9 "), vec![7, 9]);
        assert!(parse_pids("").is_empty());
    }

    #[tokio::test]
    async fn bound_port_is_detected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use(port).await);
        drop(listener);
        assert!(!port_in_use(port).await);
    }
}
