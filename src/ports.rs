//! Port assignment for services without an explicit port

use crate::error::PortError;
use crate::service::Service;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::debug;

/// Number of ports above the main port services are assigned from
pub const PORT_RANGE: u16 = 100;

/// Assigns free ports from the range directly above the proxy's port.
///
/// Claims are held in a mutex so that concurrent assignments never hand out
/// the same port twice.
pub struct PortAssigner {
    main_port: u16,
    claimed: Mutex<HashSet<u16>>,
}

impl PortAssigner {
    pub fn new(main_port: u16) -> Self {
        Self {
            main_port,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Candidate ports in ascending order, excluding the main port
    pub fn candidates(&self) -> impl Iterator<Item = u16> {
        let main_port = self.main_port;
        let start = main_port.saturating_add(1);
        let end = main_port.saturating_add(PORT_RANGE);
        (start..=end).filter(move |port| *port != main_port)
    }

    /// Reserve a port so it is never assigned
    pub fn reserve(&self, port: u16) {
        self.claimed.lock().insert(port);
    }

    /// Claim the lowest candidate that is unclaimed and free on loopback
    pub fn claim(&self, service: &str) -> Result<u16, PortError> {
        let mut claimed = self.claimed.lock();
        for port in self.candidates() {
            if claimed.contains(&port) {
                continue;
            }
            if is_port_free(port) {
                claimed.insert(port);
                return Ok(port);
            }
            debug!(port, "Port in use, skipping");
        }

        Err(PortError::RangeExhausted {
            service: service.to_string(),
            start: self.main_port.saturating_add(1),
            end: self.main_port.saturating_add(PORT_RANGE),
        })
    }
}

/// Give every service without a port one from above `main_port`.
///
/// Ports already configured on services are never handed out again.
pub async fn assign_ports(services: &[Arc<Service>], main_port: u16) -> Result<(), PortError> {
    let assigner = Arc::new(PortAssigner::new(main_port));
    for service in services {
        if let Some(port) = service.port() {
            assigner.reserve(port);
        }
    }

    let pending = services
        .iter()
        .filter(|service| service.port().is_none())
        .map(|service| {
            let assigner = Arc::clone(&assigner);
            let service = Arc::clone(service);
            async move {
                let port = assigner.claim(service.name())?;
                debug!(service = %service.name(), port, "Assigned port");
                service.set_port(port);
                Ok::<_, PortError>(())
            }
        });

    futures::future::try_join_all(pending).await?;
    Ok(())
}

fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
