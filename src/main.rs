mod viaduct;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "viaduct",
    version,
    about = "Viaduct - outbound HTTP CONNECT tunneling proxy client"
)]
struct Cli {
    /// Path to Viaduct config file (.toml/.yaml/.yml). If omitted, uses VIADUCT_CONFIG; then auto-detects viaduct.toml > viaduct.yaml > viaduct.yml from CWD; then falls back to the OS default config dir.
    #[arg(long, env = "VIADUCT_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    viaduct::run(cli.config).await
}
