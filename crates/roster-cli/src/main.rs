use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "roster", about = "roster attendance daemon CLI")]
struct Cli {
    /// Base URL of the rosterd control surface
    #[arg(long, global = true, default_value = "http://127.0.0.1:8000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show host, database and script summary
    Overview,
    /// List managed scripts and their status
    Scripts,
    /// Start a managed script
    Start {
        id: String,
        /// Person name (register_face)
        #[arg(long)]
        name: Option<String>,
        /// Employee id (register_face)
        #[arg(long)]
        employee_id: Option<String>,
    },
    /// Stop a running script
    Stop { id: String },
    /// Print the tail of a script's log
    Logs {
        id: String,
        #[arg(long, default_value_t = 160)]
        tail: usize,
    },
    /// Show recent attendance records
    Recent {
        #[arg(long, default_value_t = 8)]
        limit: usize,
    },
    /// Submit an embedding for recognition
    Identify {
        /// File holding the embedding (JSON array or whitespace-separated numbers)
        #[arg(long)]
        vector: PathBuf,
        #[arg(long)]
        camera: String,
    },
    /// Enroll a new person from an embedding file
    Enroll {
        #[arg(long)]
        name: String,
        #[arg(long)]
        employee_id: Option<String>,
        #[arg(long)]
        vector: PathBuf,
    },
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("is rosterd running at {}?", self.base))?;
        decode(resp).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let resp = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("is rosterd running at {}?", self.base))?;
        decode(resp).await
    }
}

async fn decode(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let body: Value = resp.json().await.context("reading response body")?;
    if !status.is_success() {
        let code = body["code"].as_str().unwrap_or("error");
        let message = body["message"].as_str().unwrap_or("request failed");
        bail!("{status}: {code}: {message}");
    }
    Ok(body)
}

/// Parse an embedding from a JSON array or whitespace/comma separated numbers.
fn parse_vector(text: &str) -> Result<Vec<f32>> {
    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("embedding file is not a JSON array of numbers");
    }
    trimmed
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f32>().with_context(|| format!("bad number {s:?}")))
        .collect()
}

fn read_vector(path: &Path) -> Result<Vec<f32>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let vector = parse_vector(&text)?;
    if vector.is_empty() {
        bail!("{} holds no values", path.display());
    }
    Ok(vector)
}

fn print_script(script: &Value) {
    println!(
        "{:<18} {:<10} {}",
        script["id"].as_str().unwrap_or("?"),
        script["status"].as_str().unwrap_or("?"),
        script["title"].as_str().unwrap_or(""),
    );
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.server);
    tracing::debug!(server = %client.base, "using server");

    match cli.command {
        Commands::Overview => {
            print_json(&client.get("/ui/api/overview").await?)?;
        }
        Commands::Scripts => {
            let body = client.get("/ui/api/scripts").await?;
            for script in body["scripts"].as_array().into_iter().flatten() {
                print_script(script);
            }
        }
        Commands::Start { id, name, employee_id } => {
            let mut params = serde_json::Map::new();
            if let Some(name) = name {
                params.insert("name".into(), json!(name));
            }
            if let Some(employee_id) = employee_id {
                params.insert("employee_id".into(), json!(employee_id));
            }
            let body = client
                .post(&format!("/ui/api/scripts/{id}/start"), Value::Object(params))
                .await?;
            if body["already_running"].as_bool().unwrap_or(false) {
                println!("{id} is already running");
            }
            print_script(&body["script"]);
        }
        Commands::Stop { id } => {
            let body = client.post(&format!("/ui/api/scripts/{id}/stop"), json!({})).await?;
            print_script(&body["script"]);
        }
        Commands::Logs { id, tail } => {
            let body = client.get(&format!("/ui/api/scripts/{id}/logs?tail={tail}")).await?;
            for line in body["logs"].as_array().into_iter().flatten() {
                println!("{}", line.as_str().unwrap_or_default());
            }
        }
        Commands::Recent { limit } => {
            let body = client.get(&format!("/ui/api/attendance/recent?limit={limit}")).await?;
            let records = body["records"].as_array().cloned().unwrap_or_default();
            if records.is_empty() {
                println!("No attendance records");
            }
            for r in &records {
                println!(
                    "{} {}  {:<24} {:<12} {}",
                    r["date"].as_str().unwrap_or(""),
                    r["time"].as_str().unwrap_or(""),
                    r["person_name"].as_str().unwrap_or("?"),
                    r["employee_id"].as_str().unwrap_or("-"),
                    r["method"].as_str().unwrap_or(""),
                );
            }
        }
        Commands::Identify { vector, camera } => {
            let embedding = read_vector(&vector)?;
            let body = client
                .post(
                    "/attendance/identify",
                    json!({ "embedding": embedding, "camera_id": camera }),
                )
                .await?;
            print_json(&body)?;
        }
        Commands::Enroll {
            name,
            employee_id,
            vector,
        } => {
            let embedding = read_vector(&vector)?;
            let body = client
                .post(
                    "/persons/register",
                    json!({ "name": name, "employee_id": employee_id, "embedding": embedding }),
                )
                .await?;
            println!(
                "Enrolled {} (id {})",
                body["name"].as_str().unwrap_or(&name),
                body["id"]
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vector_formats() {
        assert_eq!(parse_vector("[0.5, -1, 2e-1]").unwrap(), vec![0.5, -1.0, 0.2]);
        assert_eq!(parse_vector("0.5 -1\n0.25,1").unwrap(), vec![0.5, -1.0, 0.25, 1.0]);
        assert!(parse_vector("0.5 abc").is_err());
        assert!(parse_vector("[\"x\"]").is_err());
    }

    #[test]
    fn test_read_vector_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, "  \n").unwrap();
        assert!(read_vector(&path).is_err());

        std::fs::write(&path, "[1.0, 0.0]").unwrap();
        assert_eq!(read_vector(&path).unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_client_url_joins_paths() {
        let client = Client::new("http://127.0.0.1:8000/");
        assert_eq!(client.url("/health"), "http://127.0.0.1:8000/health");
    }

    #[test]
    fn test_cli_parses_start_params() {
        let cli = Cli::parse_from(["roster", "start", "register_face", "--name", "Ada", "--employee-id", "E-9"]);
        match cli.command {
            Commands::Start { id, name, employee_id } => {
                assert_eq!(id, "register_face");
                assert_eq!(name.as_deref(), Some("Ada"));
                assert_eq!(employee_id.as_deref(), Some("E-9"));
            }
            _ => panic!("expected start"),
        }
        assert_eq!(cli.server, "http://127.0.0.1:8000");
    }
}
