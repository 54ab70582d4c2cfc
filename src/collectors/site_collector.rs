use crate::error::CollectorError;
use crate::events::{metrics, Observation};
use crate::retry::RetryPolicy;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of probing one site
#[derive(Debug, Clone, PartialEq)]
pub struct SiteStatus {
    pub site: String,
    pub up: bool,
    /// Last HTTP status seen, 0 when no response was received
    pub status: u16,
    pub latency_ms: f64,
    pub attempts: u32,
}

impl SiteStatus {
    /// `site_up`, `site_status` and `site_latency_ms`, all labelled with the site
    pub fn observations(&self) -> Vec<Observation> {
        vec![
            Observation::new(metrics::SITE_UP, if self.up { 1.0 } else { 0.0 }, &self.site),
            Observation::new(metrics::SITE_STATUS, f64::from(self.status), &self.site),
            Observation::new(metrics::SITE_LATENCY_MS, self.latency_ms, &self.site),
        ]
    }
}

/// Why a single probe attempt failed
#[derive(Debug)]
enum ProbeFailure {
    Unreachable(String),
    BadStatus(u16),
}

impl ProbeFailure {
    fn status(&self) -> u16 {
        match self {
            ProbeFailure::Unreachable(_) => 0,
            ProbeFailure::BadStatus(status) => *status,
        }
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Unreachable(reason) => write!(f, "unreachable: {}", reason),
            ProbeFailure::BadStatus(status) => write!(f, "HTTP {}", status),
        }
    }
}

/// Whether `status` is one of the statuses accepted as up
///
/// Only a received response can be healthy; status 0 never is.
pub fn is_healthy_status(status: u16, accepted: &[u16]) -> bool {
    status != 0 && accepted.contains(&status)
}

/// URL probed for a site address; bare hosts are probed over HTTPS
pub fn probe_url(site: &str) -> String {
    if site.starts_with("http://") || site.starts_with("https://") {
        site.to_string()
    } else {
        format!("https://{}", site)
    }
}

/// Probes sites over HTTP(S) with retries
#[derive(Clone)]
pub struct SiteProbe {
    client: reqwest::Client,
    retry: RetryPolicy,
    healthy_statuses: Arc<[u16]>,
}

impl SiteProbe {
    /// # Arguments
    ///
    /// * `timeout` - Per-request timeout
    /// * `retry` - Attempts and fixed delay between them
    /// * `healthy_statuses` - Responses that end the retries with the site up
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::HttpClient` if the HTTP client cannot be built.
    pub fn new(
        timeout: Duration,
        retry: RetryPolicy,
        healthy_statuses: Vec<u16>,
    ) -> Result<Self, CollectorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            retry,
            healthy_statuses: healthy_statuses.into(),
        })
    }

    /// Probe one site, retrying until it answers healthily or the attempts run out
    ///
    /// # Returns
    ///
    /// The site as up with the healthy status and its latency, or as down with the last
    /// status seen (0 when nothing answered) and the time spent on every attempt
    pub async fn probe(&self, site: &str) -> SiteStatus {
        let url = probe_url(site);
        let started = Instant::now();
        let mut attempts = 0;

        let result = self
            .retry
            .execute(|attempt| {
                attempts = attempt;
                let request = self.client.get(&url);
                let accepted = Arc::clone(&self.healthy_statuses);
                async move {
                    let sent = Instant::now();
                    let response = request
                        .send()
                        .await
                        .map_err(|e| ProbeFailure::Unreachable(e.to_string()))?;
                    let status = response.status().as_u16();
                    let latency = sent.elapsed();
                    if is_healthy_status(status, &accepted) {
                        Ok((status, latency))
                    } else {
                        Err(ProbeFailure::BadStatus(status))
                    }
                }
            })
            .await;

        match result {
            Ok((status, latency)) => {
                debug!("{} answered {} in {:?}", site, status, latency);
                SiteStatus {
                    site: site.to_string(),
                    up: true,
                    status,
                    latency_ms: latency.as_secs_f64() * 1000.0,
                    attempts,
                }
            }
            Err(failure) => {
                warn!("{} is down: {}", site, failure);
                SiteStatus {
                    site: site.to_string(),
                    up: false,
                    status: failure.last_error.status(),
                    latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                    attempts: failure.attempts,
                }
            }
        }
    }

    /// Probe every site concurrently and wait for all of them
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::TaskFailed` if a probe task panicked.
    pub async fn probe_all(&self, sites: &[String]) -> Result<Vec<SiteStatus>, CollectorError> {
        info!("Probing {} site(s)", sites.len());
        let handles: Vec<_> = sites
            .iter()
            .cloned()
            .map(|site| {
                let probe = self.clone();
                tokio::spawn(async move { probe.probe(&site).await })
            })
            .collect();

        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            let status = handle
                .await
                .map_err(|e| CollectorError::TaskFailed(e.to_string()))?;
            statuses.push(status);
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer one connection per entry of `statuses`, in order
    async fn serve(statuses: Vec<u16>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for status in statuses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buffer = [0u8; 1024];
                let _ = socket.read(&mut buffer).await;
                let response = format!(
                    "HTTP/1.1 {} Status\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    status
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}", address)
    }

    fn probe_accepting(healthy: &[u16]) -> SiteProbe {
        SiteProbe::new(
            Duration::from_secs(2),
            RetryPolicy::new(3, Duration::from_millis(10)),
            healthy.to_vec(),
        )
        .unwrap()
    }

    fn probe() -> SiteProbe {
        probe_accepting(&[200])
    }

    #[test]
    fn test_probe_url() {
        assert_eq!(probe_url("example.com"), "https://example.com");
        assert_eq!(probe_url("http://example.com:8080"), "http://example.com:8080");
    }

    #[test]
    fn test_only_accepted_statuses_are_healthy() {
        assert!(is_healthy_status(200, &[200]));
        assert!(!is_healthy_status(204, &[200]));
        assert!(!is_healthy_status(301, &[200]));
        assert!(!is_healthy_status(502, &[200]));
        assert!(!is_healthy_status(0, &[200]));
        assert!(is_healthy_status(301, &[200, 301]));
        assert!(!is_healthy_status(0, &[0]));
    }

    #[tokio::test]
    async fn test_redirect_is_retried_and_reported_down() {
        let url = serve(vec![301, 302, 301]).await;
        let status = probe().probe(&url).await;
        assert!(!status.up);
        assert_eq!(status.status, 301);
        assert_eq!(status.attempts, 3);
    }

    #[tokio::test]
    async fn test_configured_status_counts_as_up() {
        let url = serve(vec![204]).await;
        let status = probe_accepting(&[200, 204]).probe(&url).await;
        assert!(status.up);
        assert_eq!(status.attempts, 1);
    }

    #[tokio::test]
    async fn test_healthy_site_is_up_on_first_attempt() {
        let url = serve(vec![200]).await;
        let status = probe().probe(&url).await;
        assert!(status.up);
        assert_eq!(status.status, 200);
        assert_eq!(status.attempts, 1);
    }

    #[tokio::test]
    async fn test_recovers_after_server_errors() {
        let url = serve(vec![503, 503, 200]).await;
        let status = probe().probe(&url).await;
        assert!(status.up);
        assert_eq!(status.attempts, 3);
    }

    #[tokio::test]
    async fn test_persistent_error_reports_last_status() {
        let url = serve(vec![500, 502, 503]).await;
        let status = probe().probe(&url).await;
        assert!(!status.up);
        assert_eq!(status.status, 503);
        assert_eq!(status.attempts, 3);
        let observations = status.observations();
        assert_eq!(observations[0].metric, metrics::SITE_UP);
        assert_eq!(observations[0].value, 0.0);
        assert_eq!(observations[1].value, 503.0);
    }

    #[tokio::test]
    async fn test_unreachable_site_reports_status_zero() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let status = probe().probe(&format!("http://{}", address)).await;
        assert!(!status.up);
        assert_eq!(status.status, 0);
        assert_eq!(status.attempts, 3);
    }

    #[tokio::test]
    async fn test_probe_all_joins_every_site() {
        let first = serve(vec![200]).await;
        let second = serve(vec![204]).await;
        let statuses = probe_accepting(&[200, 204])
            .probe_all(&[first.clone(), second.clone()])
            .await
            .unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].site, first);
        assert_eq!(statuses[1].status, 204);
    }
}
