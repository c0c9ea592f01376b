//! Readiness protocol for a freshly started server.
//!
//! Reachability first: poll the published notebook port until an HTTP request
//! stops erroring (this proves the socket answers, not that the application
//! is done booting). Then scrape the running notebook's own "list servers"
//! commands for the line carrying the access URL and token. Scrape failure is
//! soft; reachability failure after the attempt budget is fatal.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::sleep;
use tracing::{debug, warn};

use datalab_common::{DatalabError, Result};

use crate::runtime::ContainerRuntime;

/// Commands asked for a URL-bearing line, in priority order. Different
/// notebook generations answer different ones.
const LIST_COMMANDS: [&[&str]; 3] = [
    &["jupyter", "lab", "list"],
    &["jupyter", "server", "list"],
    &["jupyter", "notebook", "list"],
];

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            delay: Duration::from_secs(1),
        }
    }
}

/// Transient per-invocation probe outcome. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct ReadinessState {
    pub attempts: u32,
    pub last_error: Option<String>,
    pub url: Option<String>,
    pub token: Option<String>,
}

pub struct ReadinessProber {
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
    config: ProbeConfig,
}

impl ReadinessProber {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_config(runtime, ProbeConfig::default())
    }

    pub fn with_config(runtime: Arc<dyn ContainerRuntime>, config: ProbeConfig) -> Self {
        Self {
            runtime,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Poll `url` until a request completes without a transport error.
    /// Returns the number of attempts used; surfaces the last error once the
    /// budget is exhausted.
    pub async fn wait_reachable(&self, url: &str) -> Result<u32> {
        let mut last_error = String::new();
        for attempt in 1..=self.config.max_attempts {
            match self.http.get(url).send().await {
                Ok(_) => {
                    debug!(url, attempt, "Server reachable");
                    return Ok(attempt);
                }
                Err(e) => {
                    debug!(url, attempt, error = %e, "Server not reachable yet");
                    last_error = e.to_string();
                    sleep(self.config.delay).await;
                }
            }
        }
        Err(DatalabError::Readiness(format!(
            "{url} not reachable after {} attempts: {last_error}",
            self.config.max_attempts
        )))
    }

    /// Scrape the container's list commands for the first URL-bearing log
    /// line. Soft: returns None when nothing matched.
    pub async fn server_url(&self, instance_name: &str) -> Option<String> {
        for cmd in LIST_COMMANDS {
            let output = match self.runtime.exec(instance_name, cmd).await {
                Ok(output) => output,
                Err(e) => {
                    debug!(instance_name, ?cmd, error = %e, "List command failed");
                    continue;
                }
            };
            // The notebook prints its listing on stderr; check it first.
            for line in output.stderr.lines().chain(output.stdout.lines()) {
                if let Some(url) = extract_url(line) {
                    return Some(url);
                }
            }
        }
        warn!(instance_name, "No access URL found in server logs");
        None
    }

    /// Full probe: reachability, then URL and token extraction.
    pub async fn probe(&self, instance_name: &str, reach_url: &str) -> Result<ReadinessState> {
        let mut state = ReadinessState::default();
        match self.wait_reachable(reach_url).await {
            Ok(attempts) => state.attempts = attempts,
            Err(e) => {
                state.attempts = self.config.max_attempts;
                state.last_error = Some(e.to_string());
                return Err(e);
            }
        }
        state.url = self.server_url(instance_name).await;
        state.token = state.url.as_deref().and_then(extract_token);
        Ok(state)
    }
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(https?://[^\s]+)").expect("static regex"))
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"token=([a-f0-9-][^\s&]*)").expect("static regex"))
}

/// First URL embedded in a log line, if any.
pub fn extract_url(line: &str) -> Option<String> {
    url_regex()
        .captures(line)
        .map(|caps| caps[1].to_string())
}

/// Access token from a `token=` query parameter.
pub fn extract_token(url: &str) -> Option<String> {
    token_regex()
        .captures(url)
        .map(|caps| caps[1].to_string())
}

/// Leading scheme of the URL.
pub fn extract_protocol(url: &str) -> Option<&'static str> {
    if url.starts_with("https:") {
        Some("https")
    } else if url.starts_with("http:") {
        Some("http")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerSpec, ExecOutput};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct SilentRuntime;

    #[async_trait]
    impl ContainerRuntime for SilentRuntime {
        async fn container_exists(&self, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn create_container(&self, _: &ContainerSpec) -> Result<()> {
            Ok(())
        }
        async fn start_container(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn stop_container(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_container(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn exec(&self, _: &str, cmd: &[&str]) -> Result<ExecOutput> {
            // Only the oldest listing command answers, on stderr.
            if cmd == ["jupyter", "notebook", "list"] {
                Ok(ExecOutput {
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: "Currently running servers:\nhttp://0.0.0.0:8888/lab?token=abc123 :: /home/jovyan/work\n".to_string(),
                })
            } else {
                Err(DatalabError::Runtime("unknown command".to_string()))
            }
        }
        async fn host_port_for(&self, _: &str, _: u16) -> Result<Option<u16>> {
            Ok(Some(8888))
        }
        async fn container_labels(&self, _: &str) -> Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }
        async fn ensure_volume(&self, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn remove_volume(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn pull_image(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn extracts_url_token_and_protocol() {
        let line = "http://0.0.0.0:8888/lab?token=abc123 ::";
        let url = extract_url(line).unwrap();
        assert_eq!(url, "http://0.0.0.0:8888/lab?token=abc123");
        assert_eq!(extract_token(&url).unwrap(), "abc123");
        assert_eq!(extract_protocol(&url), Some("http"));
    }

    #[test]
    fn url_without_token_yields_no_token() {
        let line = "    https://0.0.0.0:8888/lab :: /home/jovyan/work";
        let url = extract_url(line).unwrap();
        assert_eq!(url, "https://0.0.0.0:8888/lab");
        assert!(extract_token(&url).is_none());
        assert_eq!(extract_protocol(&url), Some("https"));
    }

    #[test]
    fn non_url_lines_yield_nothing() {
        assert!(extract_url("Currently running servers:").is_none());
        assert_eq!(extract_protocol("ftp://host"), None);
    }

    #[tokio::test]
    async fn scrape_falls_through_failing_commands() {
        let prober = ReadinessProber::new(Arc::new(SilentRuntime));
        let url = prober.server_url("unit").await.unwrap();
        assert_eq!(url, "http://0.0.0.0:8888/lab?token=abc123");
    }

    #[tokio::test]
    async fn reachability_succeeds_on_a_live_listener() {
        // A plain TCP listener is enough: reqwest gets a (broken) response
        // channel rather than a refused connection only if something answers
        // HTTP, so serve one minimal response.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                use tokio::io::AsyncWriteExt;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await;
            }
        });

        let prober = ReadinessProber::with_config(
            Arc::new(SilentRuntime),
            ProbeConfig {
                max_attempts: 3,
                delay: Duration::from_millis(10),
            },
        );
        let attempts = prober
            .wait_reachable(&format!("http://{addr}/"))
            .await
            .unwrap();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn reachability_retries_until_the_listener_appears() {
        // Reserve a port, then only start serving on it after the first
        // attempt has already failed.
        let (port, addr) = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            (addr.port(), addr)
        };
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                use tokio::io::AsyncWriteExt;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await;
            }
        });

        let prober = ReadinessProber::with_config(
            Arc::new(SilentRuntime),
            ProbeConfig {
                max_attempts: 30,
                delay: Duration::from_millis(50),
            },
        );
        let attempts = prober
            .wait_reachable(&format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap();
        assert!(attempts > 1, "expected at least one retry, got {attempts}");
    }

    #[tokio::test]
    async fn reachability_fails_after_attempt_budget() {
        // Bind then drop to find a port that refuses connections.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let prober = ReadinessProber::with_config(
            Arc::new(SilentRuntime),
            ProbeConfig {
                max_attempts: 3,
                delay: Duration::from_millis(10),
            },
        );
        let err = prober
            .wait_reachable(&format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("after 3 attempts"), "{message}");
    }
}
