//! Local control plane for the `termbroker` CLI.
//!
//! ## Overview
//!
//! The control socket speaks newline-delimited JSON: each message is a
//! single [`IpcRequest`] or [`IpcResponse`] object followed by a newline.
//! Terminal traffic does not go through here; it uses the framed RPC socket
//! in [`crate::transport`].
//!
//! ## Socket Paths
//!
//! Both sockets live in one directory:
//! - Primary: `$XDG_RUNTIME_DIR/termbroker/`
//! - Fallback: `/tmp/termbroker-$UID/`
//!
//! `service.socket_dir` in the configuration overrides both.
//!
//! ## Example
//!
//! ```rust,no_run
//! use termbroker::ipc::{get_control_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_control_socket_path(None)).await?;
//!     if client.ping().await? {
//!         println!("Broker is running");
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::{get_daemon_pid, get_pid_file_path};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::{Path, PathBuf};

/// Directory holding the broker's sockets.
///
/// 1. `dir_override` if given
/// 2. `$XDG_RUNTIME_DIR/termbroker`
/// 3. `/tmp/termbroker-$UID`
pub fn get_socket_dir(dir_override: Option<&Path>) -> PathBuf {
    if let Some(dir) = dir_override {
        return dir.to_path_buf();
    }
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => PathBuf::from(runtime_dir).join("termbroker"),
        _ => {
            let uid = nix::unistd::getuid().as_raw();
            PathBuf::from(format!("/tmp/termbroker-{}", uid))
        }
    }
}

/// Path of the framed RPC socket.
pub fn get_broker_socket_path(dir_override: Option<&Path>) -> PathBuf {
    get_socket_dir(dir_override).join("broker.sock")
}

/// Path of the JSON control socket.
pub fn get_control_socket_path(dir_override: Option<&Path>) -> PathBuf {
    get_socket_dir(dir_override).join("control.sock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_socket_dir_with_xdg_runtime_dir() {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();

        // SAFETY: serialized with the other env tests
        unsafe {
            std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        }
        assert_eq!(
            get_broker_socket_path(None),
            PathBuf::from("/run/user/1000/termbroker/broker.sock")
        );
        assert_eq!(
            get_control_socket_path(None),
            PathBuf::from("/run/user/1000/termbroker/control.sock")
        );

        // SAFETY: serialized with the other env tests
        unsafe {
            match original {
                Some(val) => std::env::set_var("XDG_RUNTIME_DIR", val),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_socket_dir_without_xdg_runtime_dir() {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();

        // SAFETY: serialized with the other env tests
        unsafe {
            std::env::remove_var("XDG_RUNTIME_DIR");
        }
        let path = get_broker_socket_path(None);
        assert!(path.to_str().unwrap().starts_with("/tmp/termbroker-"));
        assert!(path.ends_with("broker.sock"));

        // SAFETY: serialized with the other env tests
        unsafe {
            if let Some(val) = original {
                std::env::set_var("XDG_RUNTIME_DIR", val);
            }
        }
    }

    #[test]
    fn test_override_wins() {
        let dir = Path::new("/srv/termbroker");
        assert_eq!(get_socket_dir(Some(dir)), dir);
        assert_eq!(
            get_control_socket_path(Some(dir)),
            PathBuf::from("/srv/termbroker/control.sock")
        );
    }
}
