use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "Selkie IPAM garbage collector", long_about = None)]
pub struct Cli {
    /// Set the path to the configuration file (e.g. "selkie-ipam-gc.yaml").
    #[arg(short, long, value_name = "FILE", env = "SELKIE_GC_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Set the application's log level (e.g. "debug", "warn").
    #[arg(short, long, value_name = "LEVEL", env = "SELKIE_GC_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::env;

    use clap::Parser as _;
    use serial_test::serial;

    use super::Cli;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("SELKIE_GC_CONFIG_PATH");
            env::remove_var("SELKIE_GC_LOG_LEVEL");
        }
    }

    #[test]
    #[serial]
    fn parses_long_flags() {
        clear_env_vars();
        let cli = Cli::parse_from([
            "selkie-ipam-gc",
            "--config",
            "/etc/selkie/gc.yaml",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config.unwrap().to_str(), Some("/etc/selkie/gc.yaml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    #[serial]
    fn env_vars_fill_in() {
        clear_env_vars();
        unsafe {
            env::set_var("SELKIE_GC_LOG_LEVEL", "warn");
        }
        let cli = Cli::parse_from(["selkie-ipam-gc"]);
        assert_eq!(cli.log_level.as_deref(), Some("warn"));
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn defaults_to_unset() {
        clear_env_vars();
        let cli = Cli::parse_from(["selkie-ipam-gc"]);
        assert!(cli.config.is_none());
        assert!(cli.log_level.is_none());
    }
}
