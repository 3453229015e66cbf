use clap::{Parser, Subcommand};
use common::LeaseInfo;
use reqwest::Client;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Broker base URL
    #[arg(long, default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a challenge box (reuses yours if it is still alive)
    Request,
    /// List all active leases
    List,
}

/// First 12 characters of a container ID, the familiar Docker short form.
/// Cuts on a character boundary so arbitrary store contents cannot panic.
fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((i, _)) => &id[..i],
        None => id,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();

    match cli.command {
        Commands::Request => {
            let resp = client.get(format!("{}/create", cli.server)).send().await?;
            let status = resp.status();
            let body = resp.text().await?;
            if status.is_success() {
                print!("{}", body);
            } else {
                eprintln!("Request failed ({}): {}", status, body.trim());
                std::process::exit(1);
            }
        }
        Commands::List => {
            let resp = client.get(format!("{}/list", cli.server)).send().await?;
            if !resp.status().is_success() {
                eprintln!("List failed: {}", resp.status());
                std::process::exit(1);
            }
            let leases: Vec<LeaseInfo> = resp.json().await?;
            if leases.is_empty() {
                println!("No active leases");
            } else {
                println!(
                    "{:<18} {:<14} {:>8} {:>10}",
                    "IDENTITY", "CONTAINER", "AGE(s)", "LEFT(s)"
                );
                for l in leases {
                    println!(
                        "{:<18} {:<14} {:>8} {:>10}",
                        l.identity,
                        short_id(&l.container_id),
                        l.age_seconds,
                        l.remaining_seconds
                    );
                }
            }
        }
    }

    Ok(())
}
