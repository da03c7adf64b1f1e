//! Abstraction over the `virt` crate's blocking `Connect`/`Domain` handles.
//!
//! The real implementation (feature `qemu`) opens a libvirt connection and
//! runs every call through `spawn_blocking`, since `virt`'s API blocks the
//! calling thread. The mock implementation (always available, default when
//! `qemu` is disabled) keeps an in-memory table of defined domains so the
//! coordination logic above it can be exercised on hosts without
//! `libvirt-dev` installed.

use crate::error::{McVirtError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Shutoff,
}

/// A narrow seam over libvirt domain operations: define/undefine (register
/// semantics), start/stop (power state), and inactive-XML edit-in-place
/// (the primitive every auxiliary device edit builds on).
#[async_trait]
pub trait LibvirtClient: Send + Sync {
    async fn define_xml(&self, name: &str, xml: String) -> Result<()>;
    async fn undefine(&self, name: &str) -> Result<()>;
    async fn domain_exists(&self, name: &str) -> Result<bool>;
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn state(&self, name: &str) -> Result<DomainState>;
    /// Returns the current inactive domain XML, or `None` if undefined.
    async fn get_xml(&self, name: &str) -> Result<Option<String>>;
    async fn list_domains(&self) -> Result<Vec<String>>;
}

/// In-memory fake used whenever the `qemu` feature is disabled (the
/// default), or in tests. Stores the last-defined XML and power state per
/// domain name.
#[derive(Default)]
pub struct MockLibvirtClient {
    domains: DashMap<String, (String, DomainState)>,
}

impl MockLibvirtClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl LibvirtClient for MockLibvirtClient {
    async fn define_xml(&self, name: &str, xml: String) -> Result<()> {
        self.domains
            .entry(name.to_string())
            .and_modify(|(existing_xml, _)| *existing_xml = xml.clone())
            .or_insert((xml, DomainState::Shutoff));
        Ok(())
    }

    async fn undefine(&self, name: &str) -> Result<()> {
        self.domains.remove(name);
        Ok(())
    }

    async fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.domains.contains_key(name))
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut entry = self
            .domains
            .get_mut(name)
            .ok_or_else(|| McVirtError::VMMissing(name.to_string()))?;
        if entry.1 == DomainState::Running {
            return Err(McVirtError::VMRunning(name.to_string()));
        }
        entry.1 = DomainState::Running;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut entry = self
            .domains
            .get_mut(name)
            .ok_or_else(|| McVirtError::VMMissing(name.to_string()))?;
        if entry.1 == DomainState::Shutoff {
            return Err(McVirtError::VMNotRunning(name.to_string()));
        }
        entry.1 = DomainState::Shutoff;
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<DomainState> {
        self.domains
            .get(name)
            .map(|e| e.1)
            .ok_or_else(|| McVirtError::VMMissing(name.to_string()))
    }

    async fn get_xml(&self, name: &str) -> Result<Option<String>> {
        Ok(self.domains.get(name).map(|e| e.0.clone()))
    }

    async fn list_domains(&self) -> Result<Vec<String>> {
        Ok(self.domains.iter().map(|e| e.key().clone()).collect())
    }
}

#[cfg(feature = "qemu")]
pub mod real {
    //! The `virt`-backed client. Every call is dispatched onto
    //! `spawn_blocking` because `virt::connect::Connect` is a synchronous,
    //! blocking handle.

    use super::*;
    use tokio::task;
    use virt::connect::Connect;
    use virt::domain::Domain;

    pub struct RealLibvirtClient {
        uri: String,
    }

    impl RealLibvirtClient {
        pub fn new(uri: impl Into<String>) -> Self {
            RealLibvirtClient { uri: uri.into() }
        }

        fn open(&self) -> Result<Connect> {
            Connect::open(Some(self.uri.as_str()))
                .map_err(|e| McVirtError::Libvirt(e.to_string()))
        }
    }

    #[async_trait]
    impl LibvirtClient for RealLibvirtClient {
        async fn define_xml(&self, name: &str, xml: String) -> Result<()> {
            let uri = self.uri.clone();
            let _name = name.to_string();
            task::spawn_blocking(move || {
                let conn = Connect::open(Some(uri.as_str()))
                    .map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                Domain::define_xml(&conn, &xml).map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                Ok(())
            })
            .await
            .map_err(|e| McVirtError::Internal(e.to_string()))?
        }

        async fn undefine(&self, name: &str) -> Result<()> {
            let uri = self.uri.clone();
            let name = name.to_string();
            task::spawn_blocking(move || {
                let conn = Connect::open(Some(uri.as_str()))
                    .map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                let domain =
                    Domain::lookup_by_name(&conn, &name).map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                domain.undefine().map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                Ok(())
            })
            .await
            .map_err(|e| McVirtError::Internal(e.to_string()))?
        }

        async fn domain_exists(&self, name: &str) -> Result<bool> {
            let uri = self.uri.clone();
            let name = name.to_string();
            task::spawn_blocking(move || {
                let conn = Connect::open(Some(uri.as_str()))
                    .map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                Ok(Domain::lookup_by_name(&conn, &name).is_ok())
            })
            .await
            .map_err(|e| McVirtError::Internal(e.to_string()))?
        }

        async fn start(&self, name: &str) -> Result<()> {
            let uri = self.uri.clone();
            let name = name.to_string();
            task::spawn_blocking(move || {
                let conn = Connect::open(Some(uri.as_str()))
                    .map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                let domain =
                    Domain::lookup_by_name(&conn, &name).map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                domain.create().map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                Ok(())
            })
            .await
            .map_err(|e| McVirtError::Internal(e.to_string()))?
        }

        async fn stop(&self, name: &str) -> Result<()> {
            let uri = self.uri.clone();
            let name = name.to_string();
            task::spawn_blocking(move || {
                let conn = Connect::open(Some(uri.as_str()))
                    .map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                let domain =
                    Domain::lookup_by_name(&conn, &name).map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                domain.destroy().map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                Ok(())
            })
            .await
            .map_err(|e| McVirtError::Internal(e.to_string()))?
        }

        async fn state(&self, name: &str) -> Result<DomainState> {
            let uri = self.uri.clone();
            let name = name.to_string();
            task::spawn_blocking(move || {
                let conn = Connect::open(Some(uri.as_str()))
                    .map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                let domain =
                    Domain::lookup_by_name(&conn, &name).map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                let is_active = domain.is_active().map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                Ok(if is_active {
                    DomainState::Running
                } else {
                    DomainState::Shutoff
                })
            })
            .await
            .map_err(|e| McVirtError::Internal(e.to_string()))?
        }

        async fn get_xml(&self, name: &str) -> Result<Option<String>> {
            let uri = self.uri.clone();
            let name = name.to_string();
            task::spawn_blocking(move || {
                let conn = Connect::open(Some(uri.as_str()))
                    .map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                match Domain::lookup_by_name(&conn, &name) {
                    Ok(domain) => domain
                        .get_xml_desc(0)
                        .map(Some)
                        .map_err(|e| McVirtError::Libvirt(e.to_string())),
                    Err(_) => Ok(None),
                }
            })
            .await
            .map_err(|e| McVirtError::Internal(e.to_string()))?
        }

        async fn list_domains(&self) -> Result<Vec<String>> {
            let uri = self.uri.clone();
            task::spawn_blocking(move || {
                let conn = Connect::open(Some(uri.as_str()))
                    .map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                let domains = conn
                    .list_all_domains(0)
                    .map_err(|e| McVirtError::Libvirt(e.to_string()))?;
                domains
                    .into_iter()
                    .map(|d| d.get_name().map_err(|e| McVirtError::Libvirt(e.to_string())))
                    .collect()
            })
            .await
            .map_err(|e| McVirtError::Internal(e.to_string()))?
        }
    }
}
