use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PortsConfig {
    pub read_only: u16,
    pub regular: u16,
    pub enhanced: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            read_only: 3334,
            regular: 3333,
            enhanced: 3335,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub base_topic: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            base_topic: "ebus".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub serial_port: String,
    pub baud_rate: u32,
    pub address: u8,
    pub ports: PortsConfig,
    pub commands_path: PathBuf,
    pub scan_on_start: bool,
    pub broker: Option<BrokerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 2400,
            address: 0xFF,
            ports: PortsConfig::default(),
            commands_path: Self::config_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("commands.json"),
            scan_on_start: false,
            broker: None,
        }
    }
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("No config directory")?
            .join("ebus-gateway");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            let default = Self::default();
            default.save()?;
            Ok(default)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.baud_rate, 2400);
        assert_eq!(config.address, 0xFF);
        assert_eq!(config.ports.regular, 3333);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.serial_port, deserialized.serial_port);
    }
}
