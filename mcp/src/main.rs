use clap::Parser;
use iotcloud_mcp_runtime::{McpCommands, run};

/// MCP server for the IoT cloud OpenAPI.
#[derive(Parser)]
#[command(name = "iotcloud-mcp", version, about)]
struct Cli {
    /// Base URL of the vendor OpenAPI gateway
    #[arg(
        long,
        env = "IOTCLOUD_BASE_URL",
        default_value = "https://iot-api.quectelcn.com"
    )]
    base_url: String,

    /// Access key for the accessKey login exchange
    #[arg(long, env = "IOTCLOUD_ACCESS_KEY", default_value = "")]
    access_key: String,

    /// Access secret for the accessKey login exchange
    #[arg(long, env = "IOTCLOUD_ACCESS_SECRET", default_value = "", hide_env_values = true)]
    access_secret: String,

    #[command(subcommand)]
    command: McpCommands,
}

#[tokio::main]
async fn main() {
    // A missing .env is fine; the environment may carry everything already.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let code = run(
        &cli.base_url,
        &cli.access_key,
        &cli.access_secret,
        cli.command,
    )
    .await;
    std::process::exit(code);
}
