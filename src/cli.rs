use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "chatwork-lark-bridge", version, about = "Bidirectional Chatwork / Lark message bridge")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: String,

    /// Validate the configuration and exit.
    #[arg(long)]
    pub check_config: bool,
}
