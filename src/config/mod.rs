pub mod toml_config;

pub use toml_config::DeviceConfig;

#[cfg(feature = "cli")]
pub use cli_args::{CliConfig, Command, Mode, ReplyArg, SendArgs};

#[cfg(feature = "cli")]
mod cli_args {
    use super::DeviceConfig;
    use crate::domain::model::{ReplyChannel, TransportConfig};
    use crate::utils::error::Result;
    use crate::utils::validation::{self, Validate, IMAGE_EXTENSIONS};
    use clap::{Args, Parser, Subcommand, ValueEnum};

    #[derive(Debug, Clone, Parser)]
    #[command(name = "tiger-probe")]
    #[command(about = "Send images to an ESP32 tiger classifier and measure the response")]
    pub struct CliConfig {
        #[command(subcommand)]
        pub command: Command,

        /// Path to TOML device configuration
        #[arg(short, long, global = true)]
        pub config: Option<String>,

        #[arg(short, long, global = true, help = "Enable verbose output")]
        pub verbose: bool,

        /// Emit logs as JSON
        #[arg(long, global = true)]
        pub log_json: bool,
    }

    #[derive(Debug, Clone, Subcommand)]
    pub enum Command {
        /// List serial ports in the order they will be probed
        Ports,
        /// Send one or more images and report telemetry
        Send(SendArgs),
        /// Load and validate the configuration, then print it
        CheckConfig,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
    pub enum Mode {
        Uart,
        Wifi,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
    pub enum ReplyArg {
        Socket,
        Serial,
    }

    impl From<ReplyArg> for ReplyChannel {
        fn from(arg: ReplyArg) -> Self {
            match arg {
                ReplyArg::Socket => ReplyChannel::Socket,
                ReplyArg::Serial => ReplyChannel::Serial,
            }
        }
    }

    #[derive(Debug, Clone, Args)]
    pub struct SendArgs {
        /// Images to send, in order
        #[arg(required = true)]
        pub images: Vec<String>,

        #[arg(long, value_enum, default_value = "uart")]
        pub mode: Mode,

        /// Serial port (tries every port when omitted)
        #[arg(long)]
        pub port: Option<String>,

        #[arg(long)]
        pub baud: Option<u32>,

        /// ESP32 IP address for Wi-Fi mode
        #[arg(long)]
        pub host: Option<String>,

        #[arg(long)]
        pub tcp_port: Option<u16>,

        /// Where Wi-Fi mode reads the device's reply from
        #[arg(long, value_enum)]
        pub reply: Option<ReplyArg>,

        /// Response window in milliseconds
        #[arg(long)]
        pub window_ms: Option<u64>,

        /// Print one JSON report per image
        #[arg(long)]
        pub json: bool,
    }

    impl SendArgs {
        /// 命令列參數覆蓋設定檔
        pub fn apply_to(&self, config: &mut DeviceConfig) {
            let serial = config.serial.get_or_insert_with(Default::default);
            if let Some(port) = &self.port {
                serial.port = Some(port.clone());
            }
            if let Some(baud) = self.baud {
                serial.baud_rate = Some(baud);
            }

            let network = config.network.get_or_insert_with(Default::default);
            if let Some(host) = &self.host {
                network.host = Some(host.clone());
            }
            if let Some(port) = self.tcp_port {
                network.port = Some(port);
            }
            if let Some(reply) = self.reply {
                network.reply_channel = Some(reply.into());
            }

            if let Some(window_ms) = self.window_ms {
                config
                    .response
                    .get_or_insert_with(Default::default)
                    .window_ms = Some(window_ms);
            }
        }

        pub fn transport_config(&self, config: &DeviceConfig) -> TransportConfig {
            match self.mode {
                Mode::Uart => TransportConfig::Serial(config.serial_config()),
                Mode::Wifi => TransportConfig::Network(config.network_config()),
            }
        }
    }

    impl Validate for SendArgs {
        fn validate(&self) -> Result<()> {
            validation::validate_file_extensions("images", &self.images, &IMAGE_EXTENSIONS)?;
            if self.mode == Mode::Wifi {
                if let Some(host) = &self.host {
                    validation::validate_non_empty_string("host", host)?;
                }
            }
            Ok(())
        }
    }

}
