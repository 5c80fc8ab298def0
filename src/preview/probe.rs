//! Readiness probes run against a freshly spawned dev server.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::PreviewError;

/// Decides whether the dev server listening on `port` is ready to serve.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, port: u16) -> bool;
}

/// HTTP GET against the dev server. Any HTTP response, including error
/// statuses, means the server is up; only connection failures count as
/// not ready. Both loopback addresses are tried since some dev servers bind
/// only `::1` when told to listen on `localhost`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> Result<Self, PreviewError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| {
                PreviewError::Other(anyhow::Error::new(e).context("Failed to build readiness HTTP client"))
            })?;
        Ok(Self {
            client,
            path: "/".to_string(),
        })
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        self
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self, port: u16) -> bool {
        for host in ["127.0.0.1", "[::1]"] {
            let url = format!("http://{}:{}{}", host, port, self.path);
            match self.client.get(&url).send().await {
                Ok(response) => {
                    tracing::debug!(port, status = %response.status(), "Readiness probe answered");
                    return true;
                }
                Err(e) => tracing::trace!(port, "Readiness probe to {} failed: {}", url, e),
            }
        }
        false
    }
}

/// Plain TCP connect on either loopback address. For dev servers that do
/// not speak HTTP on their root path.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn probe(&self, port: u16) -> bool {
        for ip in [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)] {
            let connect = tokio::net::TcpStream::connect(SocketAddr::new(ip, port));
            if let Ok(Ok(_)) = tokio::time::timeout(self.connect_timeout, connect).await {
                return true;
            }
        }
        false
    }
}
