//! Linux-specific implementation for rollcall
//!
//! This crate reads network interface link state from sysfs, giving rollcall
//! a cheap connectivity signal that needs no round trip to the server.

#![cfg(target_os = "linux")]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default location of the kernel's network interface directory.
pub const SYSFS_NET_DIR: &str = "/sys/class/net";

/// Link state of a single network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceLink {
    /// Interface name (e.g. `wlan0`).
    pub name: String,
    /// Raw `operstate` value reported by the kernel.
    pub operstate: String,
}

impl InterfaceLink {
    /// Whether the kernel reports this interface as carrying traffic.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.operstate == "up"
    }
}

/// List all non-loopback interfaces under the given sysfs directory.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn interfaces_in(dir: &Path) -> io::Result<Vec<InterfaceLink>> {
    let mut links = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }
        let operstate = fs::read_to_string(entry.path().join("operstate"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        links.push(InterfaceLink { name, operstate });
    }
    links.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(links)
}

/// Whether any non-loopback interface under `dir` has its link up.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn has_active_link_in(dir: &Path) -> io::Result<bool> {
    Ok(interfaces_in(dir)?.iter().any(InterfaceLink::is_up))
}

/// Whether any non-loopback interface on this machine has its link up.
///
/// Unreadable sysfs is treated as "no link".
#[must_use]
pub fn has_active_link() -> bool {
    has_active_link_in(&PathBuf::from(SYSFS_NET_DIR)).unwrap_or(false)
}

/// Get platform name
#[must_use]
pub fn platform_name() -> &'static str {
    "Linux"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_iface(root: &Path, name: &str, state: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("operstate"), format!("{state}\n")).unwrap();
    }

    #[test]
    fn test_platform_name() {
        assert_eq!(platform_name(), "Linux");
    }

    #[test]
    fn test_loopback_is_ignored() {
        let root = tempfile::tempdir().unwrap();
        fake_iface(root.path(), "lo", "unknown");
        fake_iface(root.path(), "eth0", "down");

        let links = interfaces_in(root.path()).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, "eth0");
        assert!(!has_active_link_in(root.path()).unwrap());
    }

    #[test]
    fn test_any_up_interface_counts() {
        let root = tempfile::tempdir().unwrap();
        fake_iface(root.path(), "eth0", "down");
        fake_iface(root.path(), "wlan0", "up");

        assert!(has_active_link_in(root.path()).unwrap());
    }

    #[test]
    fn test_missing_operstate_is_unknown() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("tun0")).unwrap();

        let links = interfaces_in(root.path()).unwrap();
        assert_eq!(links[0].operstate, "unknown");
        assert!(!links[0].is_up());
    }

    #[test]
    fn test_missing_dir_is_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(has_active_link_in(&root.path().join("absent")).is_err());
    }
}
