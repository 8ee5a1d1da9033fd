//! Ephemeral port allocation
//!
//! Binds a listener to port 0, reads back the port the OS picked and releases
//! it. Nothing holds the port afterwards, so another process may grab it
//! before the server binds; acceptable for test tooling.

use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

use crate::core::HarnessError;

/// Obtain a currently-free TCP port on the loopback interface
pub fn allocate_port() -> Result<u16, HarnessError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| HarnessError::environment(format!("failed to bind ephemeral port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| HarnessError::environment(format!("failed to read bound port: {}", e)))?
        .port();
    drop(listener);

    debug!(port, "allocated ephemeral port");
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_port_is_bindable() {
        let port = allocate_port().unwrap();
        assert_ne!(port, 0);
        // Released immediately, so we can take it ourselves
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_never_returns_port_held_by_this_process() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let held_port = held.local_addr().unwrap().port();

        for _ in 0..20 {
            assert_ne!(allocate_port().unwrap(), held_port);
        }
    }
}
