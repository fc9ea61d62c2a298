//! Administrative CLI — thread CRUD, run start/cancel, operator views.
//!
//! Commands other than `serve` are a thin HTTP client against a running
//! gateway. Exit codes: 0 ok, 1 fail, 2 usage error (clap's default).

use clap::{Parser, Subcommand};
use futures_util::StreamExt;

#[derive(Parser)]
#[command(name = "leon", version, about = "Leon agent runtime")]
pub struct Cli {
    /// Gateway base URL for client commands (default from config).
    #[arg(long, global = true)]
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no command is given).
    Serve,
    /// Thread management.
    #[command(subcommand)]
    Thread(ThreadCommand),
    /// Run control.
    #[command(subcommand)]
    Run(RunCommand),
    /// Operator views.
    #[command(subcommand)]
    Ops(OpsCommand),
}

#[derive(Subcommand)]
pub enum ThreadCommand {
    /// Create a thread bound to a sandbox provider.
    Create {
        #[arg(long, default_value = "mem")]
        sandbox: String,
        #[arg(long)]
        cwd: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        title: Option<String>,
    },
    /// List threads.
    List,
    /// Delete a thread (cascades to runs, events, sessions, instances).
    Delete { thread_id: String },
}

#[derive(Subcommand)]
pub enum RunCommand {
    /// Start a run and stream its events to stdout until it finishes.
    Start {
        thread_id: String,
        message: String,
    },
    /// Cancel the active run on a thread.
    Cancel { thread_id: String },
}

#[derive(Subcommand)]
pub enum OpsCommand {
    /// Instances no lease points at, per provider.
    Orphans,
    /// Every lease with desired/observed state.
    Leases,
    /// Recent reconcile events for a lease.
    Events { lease_id: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Client {
    base: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base: String) -> Self {
        Self {
            base: base.trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
        }
    }

    async fn get_json(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let resp = self.http.get(format!("{}{path}", self.base)).send().await?;
        check(resp).await
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await?;
        check(resp).await
    }

    async fn delete_json(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let resp = self
            .http
            .delete(format!("{}{path}", self.base))
            .send()
            .await?;
        check(resp).await
    }
}

async fn check(resp: reqwest::Response) -> anyhow::Result<serde_json::Value> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        anyhow::bail!(
            "{status}: {}",
            body.get("error").and_then(|e| e.as_str()).unwrap_or("request failed")
        );
    }
    Ok(body)
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_client_command(client: Client, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve => unreachable!("serve is handled by main"),
        Command::Thread(cmd) => thread_command(client, cmd).await,
        Command::Run(cmd) => run_command(client, cmd).await,
        Command::Ops(cmd) => ops_command(client, cmd).await,
    }
}

async fn thread_command(client: Client, cmd: ThreadCommand) -> anyhow::Result<()> {
    match cmd {
        ThreadCommand::Create {
            sandbox,
            cwd,
            agent,
            title,
        } => {
            let body = serde_json::json!({
                "sandbox": sandbox,
                "cwd": cwd,
                "agent": agent,
                "title": title,
            });
            print_json(&client.post_json("/threads", body).await?);
        }
        ThreadCommand::List => print_json(&client.get_json("/threads").await?),
        ThreadCommand::Delete { thread_id } => {
            print_json(&client.delete_json(&format!("/threads/{thread_id}")).await?);
        }
    }
    Ok(())
}

async fn run_command(client: Client, cmd: RunCommand) -> anyhow::Result<()> {
    match cmd {
        RunCommand::Start { thread_id, message } => {
            let started = client
                .post_json(
                    &format!("/threads/{thread_id}/runs"),
                    serde_json::json!({ "message": message }),
                )
                .await?;
            eprintln!("run {} started", started["run_id"]);
            stream_events(&client, &thread_id).await
        }
        RunCommand::Cancel { thread_id } => {
            print_json(
                &client
                    .post_json(&format!("/threads/{thread_id}/runs/cancel"), serde_json::json!({}))
                    .await?,
            );
            Ok(())
        }
    }
}

/// Follow the SSE stream, printing one line per event, until a terminal
/// event closes the run.
async fn stream_events(client: &Client, thread_id: &str) -> anyhow::Result<()> {
    let resp = client
        .http
        .get(format!("{}/threads/{thread_id}/runs/events?after=0", client.base))
        .send()
        .await?;
    anyhow::ensure!(resp.status().is_success(), "event stream failed: {}", resp.status());

    let mut event_name = String::new();
    let mut carry = String::new();
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        carry.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = carry.find('\n') {
            let line = carry[..pos].trim_end_matches('\r').to_owned();
            carry.drain(..=pos);
            if let Some(name) = line.strip_prefix("event:") {
                event_name = name.trim().to_owned();
            } else if let Some(data) = line.strip_prefix("data:") {
                println!("{event_name}\t{}", data.trim());
                if matches!(event_name.as_str(), "done" | "error" | "cancelled") {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

async fn ops_command(client: Client, cmd: OpsCommand) -> anyhow::Result<()> {
    match cmd {
        OpsCommand::Orphans => print_json(&client.get_json("/admin/orphans").await?),
        OpsCommand::Leases => print_json(&client.get_json("/admin/leases").await?),
        OpsCommand::Events { lease_id } => {
            print_json(&client.get_json(&format!("/admin/leases/{lease_id}/events")).await?)
        }
    }
    Ok(())
}
