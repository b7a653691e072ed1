use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "trace-cli")]
#[command(about = "Query CLI for the trace-mesh store", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8004")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check store health
    Health,
    /// Reconstruct one trace
    Trace { trace_id: String },
    /// Reconstruct one request
    Request { request_id: String },
    /// List spans
    Spans {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// List errors
    Errors {
        #[arg(long)]
        service: Option<String>,
        /// security or technical
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Per-service totals over a look-back window
    Services {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Log volume and error rate
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let request = match cli.command {
        Commands::Health => client.get(format!("{base}/health")),
        Commands::Trace { trace_id } => client.get(format!("{base}/trace/{trace_id}/full")),
        Commands::Request { request_id } => client.get(format!("{base}/request/{request_id}/full")),
        Commands::Spans { service, status, limit } => {
            let mut query = vec![("limit", limit.to_string())];
            query.extend(service.map(|s| ("service", s)));
            query.extend(status.map(|s| ("status", s)));
            client.get(format!("{base}/traces")).query(&query)
        }
        Commands::Errors { service, category, limit } => {
            let mut query = vec![("limit", limit.to_string())];
            query.extend(service.map(|s| ("service", s)));
            query.extend(category.map(|c| ("category", c)));
            client.get(format!("{base}/errors")).query(&query)
        }
        Commands::Services { hours } => client
            .get(format!("{base}/metrics/services/summary"))
            .query(&[("hours", hours)]),
        Commands::Stats => client.get(format!("{base}/stats")),
    };

    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: store returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("{}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
