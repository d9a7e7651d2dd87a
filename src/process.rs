//! Process lookup capability
//!
//! `PROCESS-*` and `UID` rules need to know which local process owns a
//! connection. The lookup is platform specific, so the router only consumes
//! it through [`ProcessFinder`].

use std::net::IpAddr;

use crate::metadata::Network;

/// Owner of a local socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Executable path
    pub path: String,
    /// Owning user id, if known
    pub uid: Option<u32>,
}

impl ProcessInfo {
    /// File name component of `path`
    #[must_use]
    pub fn name(&self) -> &str {
        self.path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.path.as_str())
    }
}

/// Finds the process owning a local socket
pub trait ProcessFinder: Send + Sync {
    /// Look up the owner of `(network, src_ip, src_port)`
    fn find_process(&self, network: Network, src_ip: IpAddr, src_port: u16) -> Option<ProcessInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_name() {
        let info = ProcessInfo {
            path: "/usr/bin/curl".into(),
            uid: Some(1000),
        };
        assert_eq!(info.name(), "curl");

        let info = ProcessInfo {
            path: "C:\\Program Files\\app.exe".into(),
            uid: None,
        };
        assert_eq!(info.name(), "app.exe");
    }
}
