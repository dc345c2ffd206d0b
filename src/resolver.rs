use crate::error::ResolveError;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};

/// Hostname to IPv4 lookup used when opening upstream connections.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Ipv4Addr, ResolveError>;
}

/// Resolver backed by the operating system (`getaddrinfo` via tokio).
#[derive(Debug, Default, Clone)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Ipv4Addr, ResolveError> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }

        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|source| ResolveError::Lookup {
                host: host.to_string(),
                source,
            })?;

        addrs
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| ResolveError::NoAddress(host.to_string()))
    }
}
