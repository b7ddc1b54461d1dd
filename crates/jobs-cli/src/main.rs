use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use jobs_core::{EnqueueRequest, EnqueueResponse};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "jobs-cli", version, about = "CLI for the AI job queue")]
struct Cli {
    #[arg(long, env = "JOBS_SERVER_URL", default_value = "http://localhost:8080")]
    server_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a job
    Enqueue {
        /// Job type, e.g. kb.ingest
        #[arg(long = "type")]
        kind: String,

        /// JSON payload string, e.g. '{"doc":"handbook.pdf"}'
        #[arg(long)]
        json: String,

        /// Priority (lower = processed first; default 5)
        #[arg(long)]
        priority: Option<i32>,

        #[arg(long)]
        max_attempts: Option<i32>,

        /// Delay before the job becomes eligible, in milliseconds
        #[arg(long)]
        delay_ms: Option<i64>,
    },

    /// Ping server health endpoint
    Ping,

    /// Show worker and queue status
    Status,

    /// Show one job
    Job { id: String },

    /// Show outbox entries for a job
    Results { id: String },

    /// List failed jobs
    Failed {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Requeue a failed job
    Requeue { id: String },
}

async fn get_json(client: &reqwest::Client, url: String) -> anyhow::Result<Value> {
    let r = client.get(&url).send().await?;
    if !r.status().is_success() {
        let status = r.status();
        let body = r.text().await.unwrap_or_default();
        anyhow::bail!("GET {} failed: {} {}", url, status, body);
    }
    Ok(r.json::<Value>().await?)
}

fn print_json(v: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let base = cli.server_url.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Ping => {
            let url = format!("{}/healthz", base);
            let r = client.get(url).send().await?;
            let text = r.text().await.unwrap_or_default();
            println!("{}", text);
        }

        Commands::Enqueue {
            kind,
            json,
            priority,
            max_attempts,
            delay_ms,
        } => {
            let payload: Value = serde_json::from_str(&json).context("invalid JSON payload")?;

            let mut req = EnqueueRequest::new(kind, payload);
            req.priority = priority;
            req.max_attempts = max_attempts;
            req.scheduled_at =
                delay_ms.map(|ms| Utc::now() + chrono::Duration::milliseconds(ms));

            let url = format!("{}/v1/jobs", base);
            let r = client.post(url).json(&req).send().await?;

            if !r.status().is_success() {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                anyhow::bail!("enqueue failed: {} {}", status, body);
            }

            let body = r.json::<EnqueueResponse>().await?;
            println!("{}", body.job_id);
        }

        Commands::Status => print_json(&get_json(&client, format!("{}/v1/status", base)).await?)?,

        Commands::Job { id } => {
            print_json(&get_json(&client, format!("{}/v1/jobs/{}", base, id)).await?)?
        }

        Commands::Results { id } => print_json(
            &get_json(&client, format!("{}/v1/jobs/{}/outbox", base, id)).await?,
        )?,

        Commands::Failed { limit } => print_json(
            &get_json(&client, format!("{}/v1/admin/failed?limit={}", base, limit)).await?,
        )?,

        Commands::Requeue { id } => {
            let url = format!("{}/v1/admin/jobs/{}/requeue", base, id);
            let r = client.post(&url).send().await?;
            if !r.status().is_success() {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                anyhow::bail!("requeue failed: {} {}", status, body);
            }
            println!("requeued {}", id);
        }
    }

    Ok(())
}
