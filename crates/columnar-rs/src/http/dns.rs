//! Per-query DNS rotation pool.
//!
//! Resolves the service hostname once, lazily, then hands each attempt
//! a distinct address chosen uniformly at random from the records not
//! yet used by this query. `used` is monotonic within one logical
//! query; exhaustion is terminal, never an implicit refresh. A pool is
//! created per logical query and discarded afterward.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("failed to resolve {hostname}: {message}")]
    Resolve { hostname: String, message: String },
    #[error("no unused DNS records remain for {hostname}")]
    Exhausted { hostname: String },
}

pub struct DnsPool {
    hostname: String,
    port: u16,
    /// `address -> used`, populated on the first
    /// [`maybe_update_and_get`](Self::maybe_update_and_get).
    records: Option<HashMap<SocketAddr, bool>>,
}

impl DnsPool {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            records: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Resolve on first use, then pick an unused address at random.
    /// Later calls within the same query reuse the cached records.
    pub async fn maybe_update_and_get(&mut self) -> Result<SocketAddr, DnsError> {
        if self.records.is_none() {
            let addresses = self.resolve().await?;
            debug!(
                hostname = %self.hostname,
                count = addresses.len(),
                "resolved analytics endpoint"
            );
            self.records = Some(addresses.into_iter().map(|addr| (addr, false)).collect());
        }
        self.get_random()
    }

    /// One hostname resolution, returning the full address list.
    async fn resolve(&self) -> Result<Vec<SocketAddr>, DnsError> {
        let addresses: Vec<SocketAddr> =
            tokio::net::lookup_host((self.hostname.as_str(), self.port))
                .await
                .map_err(|e| DnsError::Resolve {
                    hostname: self.hostname.clone(),
                    message: e.to_string(),
                })?
                .collect();
        if addresses.is_empty() {
            return Err(DnsError::Resolve {
                hostname: self.hostname.clone(),
                message: "resolution returned no addresses".into(),
            });
        }
        Ok(addresses)
    }

    /// Uniform pick from the unused records.
    pub fn get_random(&self) -> Result<SocketAddr, DnsError> {
        let available = self.available_records();
        if available.is_empty() {
            return Err(DnsError::Exhausted {
                hostname: self.hostname.clone(),
            });
        }
        let index = rand::thread_rng().gen_range(0..available.len());
        Ok(available[index])
    }

    /// Mark an address as used by an attempt. Unknown addresses are a
    /// logged no-op.
    pub fn mark_used(&mut self, address: SocketAddr) {
        let Some(records) = self.records.as_mut() else {
            warn!(%address, "mark_used called before resolution");
            return;
        };
        match records.get_mut(&address) {
            Some(used) => *used = true,
            None => warn!(%address, "mark_used called with an unknown address"),
        }
    }

    /// All records not yet used by this query.
    pub fn available_records(&self) -> Vec<SocketAddr> {
        self.records
            .as_ref()
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, used)| !**used)
                    .map(|(addr, _)| *addr)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn with_records(hostname: &str, addresses: &[SocketAddr]) -> Self {
        Self {
            hostname: hostname.into(),
            port: 0,
            records: Some(addresses.iter().map(|addr| (*addr, false)).collect()),
        }
    }
}
