use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "bwshaper-cli")]
#[command(about = "Management CLI for the bandwidth shaping server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server status
    Status,
    /// Show the current caps
    Limits,
    /// Change the caps (bytes per second)
    SetLimits {
        /// New aggregate limit
        #[arg(long)]
        aggregate: Option<u64>,
        /// New per-connection limit
        #[arg(long)]
        conn: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let res = match cli.command {
        Commands::Status => {
            client.get(format!("{}/admin/status", cli.url))
                .headers(headers)
                .send()
                .await?
        }
        Commands::Limits => {
            client.get(format!("{}/admin/limits", cli.url))
                .headers(headers)
                .send()
                .await?
        }
        Commands::SetLimits { aggregate, conn } => {
            if aggregate.is_none() && conn.is_none() {
                eprintln!("Error: pass --aggregate and/or --conn");
                return Ok(());
            }
            client.put(format!("{}/admin/limits", cli.url))
                .headers(headers)
                .json(&json!({ "aggregate_limit": aggregate, "conn_limit": conn }))
                .send()
                .await?
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
