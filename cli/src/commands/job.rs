//! Operator commands against a running dispatcher: submit, status, cancel,
//! and cluster inspection.

use anyhow::Context;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{map_dispatcher_error, CliError};
use crate::output::{display_cluster_status, display_job, OutputFormat};

/// How often `--follow` polls the job status.
const FOLLOW_POLL: Duration = Duration::from_millis(300);

/// The slice of the submission response the CLI needs.
#[derive(Debug, Deserialize)]
struct SubmittedJob {
    job_id: String,
    status: String,
    estimated_completion: Option<chrono::DateTime<chrono::Utc>>,
}

/// Shared connection flags for operator commands.
#[derive(Debug, Args)]
pub struct ConnectionArgs {
    /// Dispatcher base URL
    #[arg(
        long,
        global = true,
        env = "EDITOR_FLEET_DISPATCHER",
        default_value = "http://127.0.0.1:7400"
    )]
    pub dispatcher: String,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Pretty)]
    pub output: OutputFormat,
}

/// Arguments for `submit`.
#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Job type (e.g. open_file, thumbnail, auto_retouch)
    pub job_type: String,

    /// JSON payload handed to the editor bridge
    #[arg(long, default_value = "{}")]
    pub payload: String,

    /// Priority; higher dispatches first
    #[arg(long, short = 'p', default_value_t = 0)]
    pub priority: i32,

    /// URL to POST the terminal callback to
    #[arg(long)]
    pub callback: Option<String>,

    /// Override the cluster retry cap for this job
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Wait for the job to finish, showing progress
    #[arg(long, short = 'f')]
    pub follow: bool,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Arguments for `status`.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// The job to inspect
    pub job_id: String,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Arguments for `cancel`.
#[derive(Debug, Args)]
pub struct CancelArgs {
    /// The job to cancel
    pub job_id: String,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Arguments for `cluster`.
#[derive(Debug, Args)]
pub struct ClusterArgs {
    /// Include the per-node breakdown
    #[arg(long, short = 'n')]
    pub nodes: bool,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Submit a job, optionally following it to completion.
pub async fn submit(args: SubmitArgs, _verbose: bool) -> Result<(), CliError> {
    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .map_err(|err| CliError::config("invalid --payload JSON", err))?;

    let body = serde_json::json!({
        "job_type": args.job_type,
        "payload": payload,
        "priority": args.priority,
        "callback_url": args.callback,
        "max_retries": args.max_retries,
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/submit_job", args.connection.dispatcher))
        .json(&body)
        .send()
        .await
        .map_err(|err| map_dispatcher_error(&args.connection.dispatcher, err))?;
    let response = check_api_error(response).await?;
    let submitted: SubmittedJob = response.json().await.context("invalid response body")?;
    let job_id = submitted.job_id;

    if !args.follow {
        println!("{} {}", submitted.status, job_id);
        if let Some(eta) = submitted.estimated_completion {
            println!("estimated completion: {eta}");
        }
        return Ok(());
    }

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{msg:12} [{bar:40}] {pos:>3}%")
            .expect("static template")
            .progress_chars("=> "),
    );
    bar.set_message(job_id.clone());

    let job = loop {
        let job: serde_json::Value = client
            .get(format!(
                "{}/job_status/{job_id}",
                args.connection.dispatcher
            ))
            .send()
            .await
            .map_err(|err| map_dispatcher_error(&args.connection.dispatcher, err))?
            .json()
            .await
            .context("invalid job status body")?;

        bar.set_position(job["progress"].as_u64().unwrap_or(0));
        let status = job["status"].as_str().unwrap_or_default();
        if matches!(status, "completed" | "failed" | "cancelled") {
            break job;
        }
        tokio::time::sleep(FOLLOW_POLL).await;
    };
    bar.finish_and_clear();

    display_job(&job, args.connection.output).map_err(CliError::Other)
}

/// Fetch and render a job record.
pub async fn status(args: StatusArgs, _verbose: bool) -> Result<(), CliError> {
    let response = reqwest::Client::new()
        .get(format!(
            "{}/job_status/{}",
            args.connection.dispatcher, args.job_id
        ))
        .send()
        .await
        .map_err(|err| map_dispatcher_error(&args.connection.dispatcher, err))?;
    let response = check_api_error(response).await?;
    let job: serde_json::Value = response.json().await.context("invalid response body")?;
    display_job(&job, args.connection.output).map_err(CliError::Other)
}

/// Cancel a job.
pub async fn cancel(args: CancelArgs, _verbose: bool) -> Result<(), CliError> {
    let response = reqwest::Client::new()
        .post(format!(
            "{}/cancel_job/{}",
            args.connection.dispatcher, args.job_id
        ))
        .send()
        .await
        .map_err(|err| map_dispatcher_error(&args.connection.dispatcher, err))?;
    let response = check_api_error(response).await?;
    let result: serde_json::Value = response.json().await.context("invalid response body")?;
    println!("{}", serde_json::to_string(&result).context("serialize")?);
    Ok(())
}

/// Fetch and render the cluster status.
pub async fn cluster(args: ClusterArgs, _verbose: bool) -> Result<(), CliError> {
    let response = reqwest::Client::new()
        .get(format!(
            "{}/cluster_status?include_nodes={}",
            args.connection.dispatcher, args.nodes
        ))
        .send()
        .await
        .map_err(|err| map_dispatcher_error(&args.connection.dispatcher, err))?;
    let response = check_api_error(response).await?;
    let status: serde_json::Value = response.json().await.context("invalid response body")?;
    display_cluster_status(&status, args.connection.output).map_err(CliError::Other)
}

/// Turn a structured `{kind, message}` error body into a CLI error.
async fn check_api_error(response: reqwest::Response) -> Result<reqwest::Response, CliError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let kind = body["kind"].as_str().unwrap_or("unknown");
    let message = body["message"].as_str().unwrap_or("request failed");
    Err(CliError::Other(anyhow::anyhow!(
        "{status}: {message} (kind: {kind})"
    )))
}
