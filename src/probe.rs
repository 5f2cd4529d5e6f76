//! Bounded-time reachability checks against the file server.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method};

use crate::error::{Error, Result};

/// Which endpoint a probe hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTarget {
    /// `GET /api/files`
    Files,
    /// `HEAD /api/status`
    Status,
}

impl ProbeTarget {
    fn method(self) -> Method {
        match self {
            ProbeTarget::Files => Method::GET,
            ProbeTarget::Status => Method::HEAD,
        }
    }

    fn path(self) -> &'static str {
        match self {
            ProbeTarget::Files => "/api/files",
            ProbeTarget::Status => "/api/status",
        }
    }
}

/// Last known reachability of a server. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEndpoint {
    pub base_url: String,
    pub reachable: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

impl ServerEndpoint {
    pub fn new(base_url: impl Into<String>) -> ServerEndpoint {
        ServerEndpoint {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            reachable: false,
            last_checked: None,
        }
    }

    pub fn record(&mut self, reachable: bool) {
        if reachable != self.reachable {
            tracing::info!(
                "{} is now {}",
                self.base_url,
                if reachable { "reachable" } else { "unreachable" }
            );
        }
        self.reachable = reachable;
        self.last_checked = Some(Utc::now());
    }
}

#[derive(Debug, Clone)]
pub struct Prober {
    client: Client,
    target: ProbeTarget,
}

impl Prober {
    pub fn new(target: ProbeTarget) -> Result<Prober> {
        Ok(Prober {
            client: Client::builder().build()?,
            target,
        })
    }

    pub fn target(&self) -> ProbeTarget {
        self.target
    }

    /// Returns whether the server answered 2xx within `timeout`. Never fails.
    pub async fn probe(&self, endpoint: &mut ServerEndpoint, timeout: Duration) -> bool {
        let reachable = match self.check(&endpoint.base_url, timeout).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!("probe {} failed: {}", endpoint.base_url, err);
                false
            }
        };
        endpoint.record(reachable);
        reachable
    }

    async fn check(&self, base_url: &str, timeout: Duration) -> Result<()> {
        let url = format!("{}{}", base_url, self.target.path());
        let request = self
            .client
            .request(self.target.method(), url)
            .timeout(timeout)
            .send();
        let res = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(Error::Transport {
                operation: "probe",
                status: res.status(),
                text: String::new(),
            })
        }
    }

    /// Probe up to `attempts` times, `interval` apart, until the server answers.
    pub async fn wait_until_reachable(
        &self,
        endpoint: &mut ServerEndpoint,
        timeout: Duration,
        attempts: u32,
        interval: Duration,
    ) -> Result<()> {
        for attempt in 1..=attempts {
            if self.probe(endpoint, timeout).await {
                tracing::info!("{} up after {} attempt(s)", endpoint.base_url, attempt);
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(Error::Unreachable {
            server: endpoint.base_url.clone(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::net::TcpListener;

    use super::*;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let port = closed_port().await;
        let prober = Prober::new(ProbeTarget::Files).unwrap();
        let mut endpoint = ServerEndpoint::new(format!("http://127.0.0.1:{}", port));

        let started = Instant::now();
        assert!(!prober.probe(&mut endpoint, Duration::from_millis(2000)).await);
        assert!(started.elapsed() < Duration::from_millis(2500));
        assert!(!endpoint.reachable);
        assert!(endpoint.last_checked.is_some());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let prober = Prober::new(ProbeTarget::Status).unwrap();
        let mut endpoint = ServerEndpoint::new(format!("http://{}", addr));
        let timeout = Duration::from_millis(300);

        let started = Instant::now();
        assert!(!prober.probe(&mut endpoint, timeout).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "{:?}", elapsed);
        assert!(elapsed < timeout + Duration::from_millis(500), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn wait_succeeds_once_server_comes_up() {
        let port = closed_port().await;
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let late_start = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            crate::server::spawn(([127, 0, 0, 1], port).into(), root)
                .await
                .unwrap()
        });

        let prober = Prober::new(ProbeTarget::Files).unwrap();
        let mut endpoint = ServerEndpoint::new(format!("http://127.0.0.1:{}", port));
        assert!(!prober.probe(&mut endpoint, Duration::from_millis(200)).await);

        let started = Instant::now();
        prober
            .wait_until_reachable(
                &mut endpoint,
                Duration::from_millis(200),
                20,
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(endpoint.reachable);
        assert!(started.elapsed() < Duration::from_secs(5));
        late_start.await.unwrap();
    }

    #[tokio::test]
    async fn wait_gives_up_after_attempts() {
        let port = closed_port().await;
        let prober = Prober::new(ProbeTarget::Files).unwrap();
        let mut endpoint = ServerEndpoint::new(format!("http://127.0.0.1:{}", port));

        let err = prober
            .wait_until_reachable(
                &mut endpoint,
                Duration::from_millis(200),
                3,
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable { attempts: 3, .. }));
    }
}
