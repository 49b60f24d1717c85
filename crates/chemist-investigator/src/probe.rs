//! Health probe against a flask's admin endpoint.
//!
//! A single GET over a fresh HTTP/1 connection, bounded by a timeout.

use std::time::Duration;

use tracing::debug;

use chemist_state::Location;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Probe `GET {flask}/health`.
pub async fn probe_flask(location: &Location, timeout: Duration) -> ProbeResult {
    let address = format!("{}:{}", location.host, location.port);
    let uri = format!("{}/health", location.base_url());

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", &address)
            .header("user-agent", "chemist-investigator/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, %uri, "probe request build failed");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(request).await {
            Ok(response) => {
                if response.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %response.status(), %uri, "probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "probe timed out");
            ProbeResult::Failed
        }
    }
}
