use crate::core::session::SessionOptions;
use crate::domain::model::{
    NetworkConfig, ReplyChannel, SerialConfig, DEFAULT_BAUD_RATE, DEFAULT_IMAGE_SIDE,
    DEFAULT_TCP_PORT,
};
use crate::utils::error::{DeviceError, Result};
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Device settings file. Every table and key is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub serial: Option<SerialSection>,
    pub network: Option<NetworkSection>,
    pub response: Option<ResponseSection>,
    pub image: Option<ImageSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialSection {
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub read_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connect_timeout_ms: Option<u64>,
    pub reply_channel: Option<ReplyChannel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseSection {
    pub window_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageSection {
    pub side: Option<u32>,
}

impl DeviceConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(DeviceError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| DeviceError::ConfigError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${ESP32_HOST})，未設定的變數保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| DeviceError::ConfigError {
            message: format!("Invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn serial_config(&self) -> SerialConfig {
        let section = self.serial.clone().unwrap_or_default();
        SerialConfig {
            port: section.port.filter(|p| !p.trim().is_empty()),
            baud_rate: section.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
            read_timeout: Duration::from_millis(section.read_timeout_ms.unwrap_or(1000)),
        }
    }

    pub fn network_config(&self) -> NetworkConfig {
        let section = self.network.clone().unwrap_or_default();
        let defaults = NetworkConfig::default();
        NetworkConfig {
            host: section.host.unwrap_or(defaults.host),
            port: section.port.unwrap_or(DEFAULT_TCP_PORT),
            connect_timeout: section
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            reply_channel: section.reply_channel.unwrap_or_default(),
        }
    }

    pub fn response_window(&self) -> Duration {
        self.response
            .as_ref()
            .and_then(|r| r.window_ms)
            .map(Duration::from_millis)
            .unwrap_or(crate::core::response::RESPONSE_WINDOW)
    }

    pub fn image_side(&self) -> u32 {
        self.image
            .as_ref()
            .and_then(|i| i.side)
            .unwrap_or(DEFAULT_IMAGE_SIDE)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            response_window: self.response_window(),
            image_side: self.image_side(),
            reply_serial: self.serial_config(),
        }
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        let serial = self.serial_config();
        validation::validate_positive_number("serial.baud_rate", u64::from(serial.baud_rate), 1)?;
        validation::validate_range(
            "serial.read_timeout_ms",
            serial.read_timeout.as_millis() as u64,
            1,
            60_000,
        )?;

        let network = self.network_config();
        validation::validate_non_empty_string("network.host", &network.host)?;
        validation::validate_positive_number("network.port", u64::from(network.port), 1)?;
        validation::validate_range(
            "network.connect_timeout_ms",
            network.connect_timeout.as_millis() as u64,
            1,
            60_000,
        )?;

        validation::validate_range(
            "response.window_ms",
            self.response_window().as_millis() as u64,
            1,
            600_000,
        )?;
        validation::validate_range("image.side", self.image_side(), 1, 256)?;

        Ok(())
    }
}

impl Validate for DeviceConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DeviceConfig::from_toml_str("").unwrap();

        let serial = config.serial_config();
        assert_eq!(serial.port, None);
        assert_eq!(serial.baud_rate, 115_200);
        assert_eq!(serial.read_timeout, Duration::from_secs(1));

        let network = config.network_config();
        assert_eq!(network.port, 3333);
        assert_eq!(network.connect_timeout, Duration::from_secs(5));
        assert_eq!(network.reply_channel, ReplyChannel::Socket);

        assert_eq!(config.response_window(), Duration::from_secs(3));
        assert_eq!(config.image_side(), 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_content = r#"
[serial]
port = "/dev/ttyUSB0"
baud_rate = 921600
read_timeout_ms = 500

[network]
host = "10.0.0.7"
port = 4444
connect_timeout_ms = 2000
reply_channel = "serial"

[response]
window_ms = 1500

[image]
side = 16
"#;

        let config = DeviceConfig::from_toml_str(toml_content).unwrap();

        assert_eq!(config.serial_config().port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.serial_config().baud_rate, 921_600);
        assert_eq!(config.network_config().address(), "10.0.0.7:4444");
        assert_eq!(config.network_config().reply_channel, ReplyChannel::Serial);
        assert_eq!(config.response_window(), Duration::from_millis(1500));
        assert_eq!(config.session_options().image_side, 16);
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("TIGER_PROBE_TEST_HOST", "192.168.4.1");

        let toml_content = r#"
[network]
host = "${TIGER_PROBE_TEST_HOST}"
"#;

        let config = DeviceConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.network_config().host, "192.168.4.1");

        std::env::remove_var("TIGER_PROBE_TEST_HOST");
    }

    #[test]
    fn test_config_validation() {
        let config = DeviceConfig::from_toml_str("[image]\nside = 0\n").unwrap();
        assert!(config.validate().is_err());

        // a blank value is reported as invalid, absent ones fall back to defaults
        let config = DeviceConfig::from_toml_str("[network]\nhost = \"  \"\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(DeviceError::InvalidConfigValueError { .. })
        ));

        let config = DeviceConfig::from_toml_str("[serial]\nbaud_rate = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = DeviceConfig::from_toml_str("[serial\nport = 1");
        assert!(matches!(result, Err(DeviceError::ConfigError { .. })));
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[serial]\nport = \"COM5\"\n")
            .unwrap();

        let config = DeviceConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.serial_config().port.as_deref(), Some("COM5"));
    }
}
