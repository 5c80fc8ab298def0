//! Port allocation for dev servers.
//!
//! A port is handed out only if it is not leased to another project and
//! nothing answers on it over either loopback address. The lease table lock
//! is held for the whole scan so two concurrent `acquire` calls can never
//! pick the same port between probe and spawn.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::errors::PortError;
use crate::project::ProjectId;

pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 3100..=3999;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// A port reserved for one project's preview process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortLease {
    pub port: u16,
    pub project_id: ProjectId,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    probe_timeout: Duration,
    leases: Mutex<HashMap<u16, PortLease>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, probe_timeout: Duration) -> Result<Self, PortError> {
        validate_range(&range)?;
        Ok(Self {
            range,
            probe_timeout,
            leases: Mutex::new(HashMap::new()),
        })
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// First port in `range` (or the configured range) that is neither leased
    /// nor occupied. Does not reserve it; use [`PortAllocator::acquire`] for that.
    pub async fn find_available_port(
        &self,
        range: Option<RangeInclusive<u16>>,
    ) -> Result<u16, PortError> {
        let range = range.unwrap_or_else(|| self.range.clone());
        validate_range(&range)?;
        let leases = self.leases.lock().await;
        self.scan(&leases, range).await
    }

    /// Reserve a port for `project_id`.
    ///
    /// A `preferred` port is used when it is free; otherwise the configured
    /// range is scanned. Any lease the project still holds is dropped first,
    /// so a project never owns more than one port.
    pub async fn acquire(
        &self,
        project_id: &ProjectId,
        preferred: Option<u16>,
    ) -> Result<PortLease, PortError> {
        let mut leases = self.leases.lock().await;
        leases.retain(|port, lease| {
            if &lease.project_id == project_id {
                tracing::debug!(project_id = %project_id, port, "Dropping stale port lease");
                false
            } else {
                true
            }
        });

        let preferred = match preferred {
            Some(port) if port != 0 && !leases.contains_key(&port) => {
                is_port_free(port, self.probe_timeout).await.then_some(port)
            }
            _ => None,
        };
        let port = match preferred {
            Some(port) => port,
            None => self.scan(&leases, self.range.clone()).await?,
        };

        let lease = PortLease {
            port,
            project_id: project_id.clone(),
            acquired_at: Utc::now(),
        };
        leases.insert(port, lease.clone());
        tracing::debug!(project_id = %project_id, port, "Port leased");
        Ok(lease)
    }

    /// Release a single lease. Returns the removed lease, if any.
    pub async fn release(&self, port: u16) -> Option<PortLease> {
        let removed = self.leases.lock().await.remove(&port);
        if let Some(lease) = &removed {
            tracing::debug!(project_id = %lease.project_id, port, "Port released");
        }
        removed
    }

    /// Release every lease held by `project_id`. Returns how many were removed.
    pub async fn release_project(&self, project_id: &ProjectId) -> usize {
        let mut leases = self.leases.lock().await;
        let before = leases.len();
        leases.retain(|_, lease| &lease.project_id != project_id);
        before - leases.len()
    }

    pub async fn is_leased(&self, port: u16) -> bool {
        self.leases.lock().await.contains_key(&port)
    }

    /// Snapshot of the lease table, ordered by port.
    pub async fn leases(&self) -> Vec<PortLease> {
        let mut leases: Vec<PortLease> = self.leases.lock().await.values().cloned().collect();
        leases.sort_by_key(|lease| lease.port);
        leases
    }

    async fn scan(
        &self,
        leases: &HashMap<u16, PortLease>,
        range: RangeInclusive<u16>,
    ) -> Result<u16, PortError> {
        let (start, end) = (*range.start(), *range.end());
        for port in range {
            if leases.contains_key(&port) {
                continue;
            }
            if is_port_free(port, self.probe_timeout).await {
                return Ok(port);
            }
            tracing::trace!(port, "Port occupied");
        }
        Err(PortError::Exhausted { start, end })
    }
}

fn validate_range(range: &RangeInclusive<u16>) -> Result<(), PortError> {
    if range.is_empty() || *range.start() == 0 {
        return Err(PortError::InvalidRange {
            start: *range.start(),
            end: *range.end(),
        });
    }
    Ok(())
}

/// A port is free when a connection attempt fails on both loopback
/// addresses. A timed-out attempt counts as free.
pub async fn is_port_free(port: u16, timeout: Duration) -> bool {
    let (v4, v6) = tokio::join!(
        answers(IpAddr::V4(Ipv4Addr::LOCALHOST), port, timeout),
        answers(IpAddr::V6(Ipv6Addr::LOCALHOST), port, timeout),
    );
    !v4 && !v6
}

async fn answers(ip: IpAddr, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(SocketAddr::new(ip, port))).await,
        Ok(Ok(_))
    )
}
