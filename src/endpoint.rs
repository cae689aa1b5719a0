//! Opaque endpoint descriptor.
//!
//! The core never inspects the connection details beyond producing a
//! stable, non-reversible fingerprint used to key baselines.

use sha2::{Digest, Sha256};
use std::fmt;

/// Length of the hex fingerprint derived from the connection secret.
const FINGERPRINT_LEN: usize = 16;

/// An opaque descriptor of the service endpoint under diagnosis.
///
/// The connection string may contain credentials; it is handed to injected
/// probe functions verbatim but is never logged, persisted, or exposed by
/// the core. Only the fingerprint leaves this type.
#[derive(Clone)]
pub struct EndpointDescriptor {
    display_name: String,
    connection: String,
}

impl EndpointDescriptor {
    pub fn new(display_name: impl Into<String>, connection: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            connection: connection.into(),
        }
    }

    /// Human-readable label, safe to log.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Raw connection string, consumed by injected probe functions only.
    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Stable, non-reversible fingerprint of the connection string.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.connection.as_bytes());
        let hex = format!("{:x}", digest);
        hex[..FINGERPRINT_LEN].to_string()
    }
}

impl fmt::Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("display_name", &self.display_name)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_redacted() {
        let a = EndpointDescriptor::new("prod", "host=db1;user=sa;password=hunter2");
        let b = EndpointDescriptor::new("other label", "host=db1;user=sa;password=hunter2");

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), FINGERPRINT_LEN);
        assert!(!a.fingerprint().contains("hunter2"));
    }

    #[test]
    fn debug_does_not_leak_connection() {
        let ep = EndpointDescriptor::new("prod", "password=topsecret");
        let rendered = format!("{:?}", ep);
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("prod"));
    }

    #[test]
    fn different_connections_differ() {
        let a = EndpointDescriptor::new("a", "host=db1");
        let b = EndpointDescriptor::new("b", "host=db2");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
