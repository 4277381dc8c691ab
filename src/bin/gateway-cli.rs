use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "mcp-gateway-cli")]
#[command(about = "Inspect a running MCP gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Bearer token, for gateways behind an authenticating proxy
    #[arg(short, long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show last activity and mounted servers
    Status,
    /// List mounted server instances only
    Instances,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    if let Some(token) = &cli.token {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))?,
        );
    }

    let res = client
        .get(format!("{}/status", cli.url.trim_end_matches('/')))
        .headers(headers)
        .send()
        .await?;

    match cli.command {
        Commands::Status => print_response(res, None).await?,
        Commands::Instances => print_response(res, Some("server_instances")).await?,
    }
    Ok(())
}

async fn print_response(
    res: reqwest::Response,
    field: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: gateway returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    let shown = match field {
        Some(field) => json.get(field).cloned().unwrap_or(Value::Null),
        None => json,
    };
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}
