//! Configuration management for the daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including known peers and session parameters.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use bluer::Address;
use log::warn;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   error::{GattError, Result},
   gatt::operation::{MAX_MTU, SessionContext, clamp_mtu},
};

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Adapter name such as `hci0`; the system default when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<SmolStr>,

   #[serde(default)]
   pub known_peers: Vec<KnownPeer>,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_preferred_mtu")]
   pub preferred_mtu: u16,

   #[serde(default = "default_reconnect_delay")]
   pub reconnect_delay_sec: u64,

   /// Enables the stalled-operation watchdog when set.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub operation_timeout_sec: Option<u64>,
}

/// A peer the daemon knows about.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownPeer {
   pub address: SmolStr,
   pub name: SmolStr,
   #[serde(default)]
   pub auto_connect: bool,
}

impl KnownPeer {
   pub fn address(&self) -> Result<Address> {
      self
         .address
         .parse()
         .map_err(|_| GattError::InvalidAddress(self.address.to_string()))
   }
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_preferred_mtu() -> u16 {
   MAX_MTU
}

const fn default_reconnect_delay() -> u64 {
   2
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         known_peers: vec![],
         connect_timeout_sec: default_connect_timeout(),
         preferred_mtu: default_preferred_mtu(),
         reconnect_delay_sec: default_reconnect_delay(),
         operation_timeout_sec: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      fs::write(path, toml::to_string_pretty(self)?)?;
      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("GATTQD_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(GattError::ConfigDirNotFound);
      };

      Ok(config_dir.join("gattqd").join("config.toml"))
   }

   pub fn session_context(&self) -> SessionContext {
      SessionContext {
         connect_timeout: Duration::from_secs(self.connect_timeout_sec),
      }
   }

   pub const fn preferred_mtu(&self) -> u16 {
      clamp_mtu(self.preferred_mtu)
   }

   pub const fn reconnect_delay(&self) -> Duration {
      Duration::from_secs(self.reconnect_delay_sec)
   }

   pub fn operation_timeout(&self) -> Option<Duration> {
      self.operation_timeout_sec.map(Duration::from_secs)
   }

   /// Checks if the given address is a known peer and returns its name.
   pub fn known_peer(&self, address: Address) -> Option<&KnownPeer> {
      self
         .known_peers
         .iter()
         .find(|p| p.address().is_ok_and(|a| a == address))
   }

   /// Addresses of the peers to connect at startup and after a drop.
   ///
   /// Malformed entries are skipped with a warning.
   pub fn auto_connect_peers(&self) -> Vec<Address> {
      self
         .known_peers
         .iter()
         .filter(|p| p.auto_connect)
         .filter_map(|p| match p.address() {
            Ok(address) => Some(address),
            Err(e) => {
               warn!("Skipping known peer {}: {e}", p.name);
               None
            },
         })
         .collect()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_file_writes_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("gattqd").join("config.toml");
      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());
      assert_eq!(Config::load_from(&path).unwrap(), config);
   }

   #[test]
   fn test_partial_file_uses_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         r#"
preferred_mtu = 9000
operation_timeout_sec = 30

[[known_peers]]
address = "AA:BB:CC:00:00:01"
name = "Sensor"
auto_connect = true

[[known_peers]]
address = "not-an-address"
name = "Broken"
auto_connect = true

[[known_peers]]
address = "AA:BB:CC:00:00:02"
name = "Manual"
"#,
      )
      .unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.adapter, None);
      assert_eq!(config.connect_timeout_sec, 10);
      assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
      assert_eq!(config.preferred_mtu(), MAX_MTU);
      assert_eq!(config.operation_timeout(), Some(Duration::from_secs(30)));
      assert_eq!(
         config.session_context().connect_timeout,
         Duration::from_secs(10)
      );

      let sensor = Address::new([0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x01]);
      assert_eq!(config.auto_connect_peers(), vec![sensor]);
      assert_eq!(config.known_peer(sensor).map(|p| p.name.as_str()), Some("Sensor"));
      assert!(!config.known_peers[2].auto_connect);
   }

   #[test]
   fn test_watchdog_disabled_by_default() {
      let config: Config = toml::from_str("").unwrap();
      assert_eq!(config.operation_timeout(), None);
      assert!(!toml::to_string(&config).unwrap().contains("operation_timeout_sec"));
   }

   #[test]
   fn test_invalid_toml_is_an_error() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "preferred_mtu = \"big\"").unwrap();
      assert!(matches!(
         Config::load_from(&path),
         Err(GattError::TomlParse(_))
      ));
   }
}
