//! HTTP(S) transport layer.
//!
//! [`Transport`] is owned by the cluster-level client and shared
//! across queries: it caches one pooled `reqwest::Client` per resolved
//! target address so keep-alive connections survive between logical
//! queries, while each attempt still dials the exact address its DNS
//! pool handed out (`ClientBuilder::resolve` pins the hostname to the
//! address, keeping the TLS server name correct). [`dns`] rotates the
//! addresses, [`attempt`] runs one POST against one of them.

pub mod attempt;
pub mod dns;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::QUERY_PATH;
use crate::config::SecurityOptions;
use crate::error::{Error, Result};

pub(crate) struct Transport {
    tls: bool,
    hostname: String,
    port: u16,
    connect_timeout: Duration,
    security: SecurityOptions,
    clients: Mutex<HashMap<SocketAddr, reqwest::Client>>,
}

impl Transport {
    pub(crate) fn new(
        tls: bool,
        hostname: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        security: SecurityOptions,
    ) -> Result<Self> {
        security.validate()?;
        Ok(Self {
            tls,
            hostname: hostname.into(),
            port,
            connect_timeout,
            security,
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn hostname(&self) -> &str {
        &self.hostname
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// URL for the query endpoint. The hostname stays in the URL so
    /// TLS verification and SNI see the connection-string name; the
    /// concrete address is pinned per client.
    pub(crate) fn query_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}{QUERY_PATH}", self.hostname, self.port)
    }

    /// The pooled client dialing `address`, built on first use.
    pub(crate) fn client_for(&self, address: SocketAddr) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.lock().unwrap().get(&address) {
            return Ok(client.clone());
        }
        debug!(%address, "building transport client");
        let client = self.build_client(address)?;
        self.clients
            .lock()
            .unwrap()
            .insert(address, client.clone());
        Ok(client)
    }

    fn build_client(&self, address: SocketAddr) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("columnar-rs/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(self.connect_timeout)
            .resolve(&self.hostname, address);

        if self.tls {
            builder = builder
                .use_rustls_tls()
                .min_tls_version(reqwest::tls::Version::TLS_1_3);

            if self.security.disable_server_certificate_verification {
                builder = builder.danger_accept_invalid_certs(true);
            }
            if let Some(path) = &self.security.trust_only_pem_file {
                let pem = std::fs::read(path).map_err(|e| {
                    Error::InvalidArgument(format!(
                        "unable to read trust PEM file {}: {e}",
                        path.display()
                    ))
                })?;
                builder = add_exclusive_roots(builder, &pem)?;
            }
            if let Some(pem) = &self.security.trust_only_pem_string {
                builder = add_exclusive_roots(builder, pem.as_bytes())?;
            }
            if let Some(certificates) = &self.security.trust_only_certificates {
                builder = builder.tls_built_in_root_certs(false);
                for pem in certificates {
                    let certificate =
                        reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|e| {
                            Error::InvalidArgument(format!("invalid trust certificate: {e}"))
                        })?;
                    builder = builder.add_root_certificate(certificate);
                }
            }
            // `trust_only_capella` keeps the built-in root store, which
            // is where the hosted service's CA set ships.
        }

        builder
            .build()
            .map_err(|e| Error::Analytics(format!("failed to build HTTP transport: {e}")))
    }
}

/// Replace the built-in root store with the certificates in `pem`.
fn add_exclusive_roots(
    mut builder: reqwest::ClientBuilder,
    pem: &[u8],
) -> Result<reqwest::ClientBuilder> {
    let certificates = reqwest::Certificate::from_pem_bundle(pem)
        .map_err(|e| Error::InvalidArgument(format!("invalid trust PEM: {e}")))?;
    if certificates.is_empty() {
        return Err(Error::InvalidArgument(
            "no certificates found in trust PEM".into(),
        ));
    }
    builder = builder.tls_built_in_root_certs(false);
    for certificate in certificates {
        builder = builder.add_root_certificate(certificate);
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Transport {
        Transport::new(
            false,
            "analytics.example.com",
            8095,
            Duration::from_secs(10),
            SecurityOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn query_url_carries_scheme_host_port_and_path() {
        assert_eq!(
            transport().query_url(),
            "http://analytics.example.com:8095/api/v1/request"
        );
        let tls = Transport::new(
            true,
            "example.com",
            443,
            Duration::from_secs(10),
            SecurityOptions::default(),
        )
        .unwrap();
        assert_eq!(tls.query_url(), "https://example.com:443/api/v1/request");
    }

    #[tokio::test]
    async fn clients_are_cached_per_address() {
        let transport = transport();
        let address: SocketAddr = "127.0.0.1:8095".parse().unwrap();
        transport.client_for(address).unwrap();
        transport.client_for(address).unwrap();
        assert_eq!(transport.clients.lock().unwrap().len(), 1);
    }

    #[test]
    fn conflicting_trust_sources_are_rejected() {
        let security = SecurityOptions {
            trust_only_capella: true,
            trust_only_pem_string: Some("x".into()),
            ..Default::default()
        };
        assert!(matches!(
            Transport::new(true, "example.com", 443, Duration::from_secs(10), security),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn garbage_pem_string_is_rejected_at_client_build() {
        let security = SecurityOptions {
            trust_only_pem_string: Some("not a pem".into()),
            ..Default::default()
        };
        let transport =
            Transport::new(true, "example.com", 443, Duration::from_secs(10), security).unwrap();
        let address: SocketAddr = "127.0.0.1:443".parse().unwrap();
        assert!(matches!(
            transport.client_for(address),
            Err(Error::InvalidArgument(_))
        ));
    }
}
