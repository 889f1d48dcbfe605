//! ADB connection management for local and remote devices.

use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Type of ADB connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionType {
    Usb,
    Wifi,
    Remote,
}

/// Information about a connected device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_id: String,
    pub status: String,
    pub connection_type: ConnectionType,
    pub model: Option<String>,
}

impl DeviceInfo {
    /// Whether the device is authorized and online.
    pub fn is_ready(&self) -> bool {
        self.status == "device"
    }
}

/// ADB errors.
#[derive(Error, Debug)]
pub enum AdbError {
    #[error("adb is not available at '{path}': {reason}")]
    NotAvailable { path: String, reason: String },
    #[error("Failed to run adb: {0}")]
    Spawn(String),
    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },
    #[error("`{command}` failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("No ready device connected")]
    NoDevice,
    #[error("Device not found or not ready: {0}")]
    DeviceNotFound(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Invalid screenshot: {0}")]
    InvalidScreenshot(String),
    #[error("Could not read screen size from: {0:?}")]
    ScreenSize(String),
}

/// Manages ADB connections to Android devices.
///
/// Supports USB, WiFi, and remote TCP/IP connections.
///
/// # Example
/// ```rust,no_run
/// use grid_agent::adb::AdbConnection;
///
/// # async fn run() -> Result<(), grid_agent::adb::AdbError> {
/// let conn = AdbConnection::new();
/// conn.verify().await?;
/// let serial = conn.resolve_device(None).await?;
/// println!("using {}", serial);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AdbConnection {
    adb_path: String,
    timeout: Duration,
}

impl Default for AdbConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl AdbConnection {
    /// Create a connection manager using `adb` from `PATH`.
    pub fn new() -> Self {
        Self {
            adb_path: "adb".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Create a connection manager with a custom adb binary.
    pub fn with_path(adb_path: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
            ..Self::new()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn adb(&self, args: &[&str]) -> Result<String, AdbError> {
        let command = format!("{} {}", self.adb_path, args.join(" "));
        let mut cmd = Command::new(&self.adb_path);
        cmd.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| AdbError::Timeout {
                command: command.clone(),
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(|e| AdbError::NotAvailable {
                path: self.adb_path.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(AdbError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Check that the adb binary runs. Returns its version banner.
    pub async fn verify(&self) -> Result<String, AdbError> {
        let version = self.adb(&["version"]).await?;
        Ok(version.lines().next().unwrap_or_default().trim().to_string())
    }

    /// Connect to a remote device via TCP/IP. Port 5555 is assumed when
    /// `address` has none.
    pub async fn connect(&self, address: &str) -> Result<String, AdbError> {
        let address = remote_address(address);
        let stdout = self.adb(&["connect", &address]).await?;
        if connect_succeeded(&stdout) {
            Ok(address)
        } else {
            Err(AdbError::Connection(stdout.trim().to_string()))
        }
    }

    /// List all known devices, ready or not.
    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, AdbError> {
        let stdout = self.adb(&["devices", "-l"]).await?;
        Ok(parse_device_list(&stdout))
    }

    /// Pick the device to drive.
    ///
    /// With a preferred serial, that device must be listed and ready.
    /// Otherwise the first ready device is used.
    pub async fn resolve_device(&self, preferred: Option<&str>) -> Result<String, AdbError> {
        let devices = self.list_devices().await?;
        match preferred {
            Some(serial) => devices
                .iter()
                .find(|d| d.device_id == serial && d.is_ready())
                .map(|d| d.device_id.clone())
                .ok_or_else(|| AdbError::DeviceNotFound(serial.to_string())),
            None => devices
                .iter()
                .find(|d| d.is_ready())
                .map(|d| d.device_id.clone())
                .ok_or(AdbError::NoDevice),
        }
    }

    /// Human-readable device model, from `ro.product.model`.
    pub async fn device_name(&self, device_id: &str) -> Result<String, AdbError> {
        let stdout = self
            .adb(&["-s", device_id, "shell", "getprop", "ro.product.model"])
            .await?;
        Ok(stdout.trim().to_string())
    }
}

/// `host:port` of a remote device. Port 5555 is assumed when `address` has
/// none.
pub fn remote_address(address: &str) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:5555", address)
    }
}

// adb reports "failed to connect" with a zero exit status.
fn connect_succeeded(stdout: &str) -> bool {
    let lower = stdout.to_lowercase();
    lower.contains("connected") && !lower.contains("failed")
}

/// Parse the output of `adb devices -l`.
pub fn parse_device_list(stdout: &str) -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for line in stdout.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('*') {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let device_id = parts[0].to_string();
        let status = parts[1].to_string();

        let connection_type = if device_id.contains(':') {
            ConnectionType::Remote
        } else if parts.iter().any(|p| p.starts_with("usb:")) {
            ConnectionType::Usb
        } else {
            ConnectionType::Wifi
        };

        let model = parts
            .iter()
            .find_map(|p| p.strip_prefix("model:"))
            .map(str::to_string);

        devices.push(DeviceInfo {
            device_id,
            status,
            connection_type,
            model,
        });
    }

    devices
}

/// Get ADB command prefix with optional device specifier.
pub(crate) fn get_adb_prefix(adb_path: &str, device_id: Option<&str>) -> Vec<String> {
    match device_id {
        Some(id) => vec![adb_path.to_string(), "-s".to_string(), id.to_string()],
        None => vec![adb_path.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adb_connection_new() {
        let conn = AdbConnection::new();
        assert_eq!(conn.adb_path, "adb");
        assert_eq!(AdbConnection::with_path("/opt/adb").adb_path, "/opt/adb");
    }

    #[test]
    fn test_get_adb_prefix() {
        let prefix = get_adb_prefix("adb", None);
        assert_eq!(prefix, vec!["adb"]);

        let prefix_with_device = get_adb_prefix("adb", Some("device123"));
        assert_eq!(prefix_with_device, vec!["adb", "-s", "device123"]);
    }

    #[test]
    fn test_parse_device_list() {
        let stdout = "List of devices attached\n\
            * daemon started successfully\n\
            R58M123ABC     device usb:1-1 product:beyond1 model:SM_G973F device:beyond1\n\
            192.168.1.20:5555 device product:raven model:Pixel_6_Pro\n\
            emulator-5554  unauthorized\n\n";
        let devices = parse_device_list(stdout);
        assert_eq!(devices.len(), 3);

        assert_eq!(devices[0].device_id, "R58M123ABC");
        assert_eq!(devices[0].connection_type, ConnectionType::Usb);
        assert_eq!(devices[0].model.as_deref(), Some("SM_G973F"));
        assert!(devices[0].is_ready());

        assert_eq!(devices[1].connection_type, ConnectionType::Remote);
        assert!(!devices[2].is_ready());
    }

    #[test]
    fn test_remote_address_and_connect_output() {
        assert_eq!(remote_address("192.168.1.20"), "192.168.1.20:5555");
        assert_eq!(remote_address("192.168.1.20:4444"), "192.168.1.20:4444");

        assert!(connect_succeeded("connected to 192.168.1.20:5555\n"));
        assert!(connect_succeeded("already connected to 192.168.1.20:5555\n"));
        assert!(!connect_succeeded(
            "failed to connect to '192.168.1.20:5555': Connection refused\n"
        ));
        assert!(!connect_succeeded(""));
    }
}
