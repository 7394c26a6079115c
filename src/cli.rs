use clap::Parser;

use crate::infrastructure::config::{ConfigOverrides, HandlerKind};

#[derive(Parser, Debug)]
#[command(
    name = "k1s0-storemanager",
    version,
    about = "Supervised Kafka consumer group for asset events"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFIG_PATH")]
    pub config: Option<String>,

    /// Environment-specific overlay merged on top of the configuration file
    #[arg(long)]
    pub env_config: Option<String>,

    /// Number of concurrent consumer workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Claim handler to use (forward, dispatch)
    #[arg(long)]
    pub handler: Option<HandlerKind>,

    /// Run against an in-process broker instead of Kafka
    #[arg(long, default_value_t = false)]
    pub in_memory: bool,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            workers: self.workers,
            handler: self.handler,
            in_memory: self.in_memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_flags() {
        let cli = Cli::try_parse_from([
            "k1s0-storemanager",
            "--config",
            "/etc/storemanager/config.yaml",
            "--env-config",
            "config/config.prod.yaml",
            "--workers",
            "5",
            "--handler",
            "dispatch",
            "--in-memory",
        ])
        .unwrap();

        assert_eq!(cli.config.as_deref(), Some("/etc/storemanager/config.yaml"));
        assert_eq!(cli.env_config.as_deref(), Some("config/config.prod.yaml"));
        let overrides = cli.overrides();
        assert_eq!(overrides.workers, Some(5));
        assert_eq!(overrides.handler, Some(HandlerKind::Dispatch));
        assert!(overrides.in_memory);
    }

    #[test]
    fn test_rejects_unknown_handler() {
        let result = Cli::try_parse_from(["k1s0-storemanager", "--handler", "drop"]);
        assert!(result.is_err());
    }
}
