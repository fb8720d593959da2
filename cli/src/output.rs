//! Output formatting for CLI responses
//!
//! Job and cluster payloads render either as human-readable colored text
//! or as raw JSON for scripting.

use anyhow::Result;
use colored::Colorize;
use serde_json::Value;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable colored output
    #[default]
    Pretty,
    /// Compact JSON output
    Json,
}

/// Render a job record.
pub fn display_job(job: &Value, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(job)?),
        OutputFormat::Pretty => {
            println!();
            println!(
                "{} {}",
                "Job".bright_blue().bold(),
                job["id"].as_str().unwrap_or("?").dimmed()
            );
            println!("{}", "─".repeat(60).dimmed());
            println!("{} {}", "Type:".bright_cyan(), field(job, "job_type"));
            println!(
                "{} {}",
                "Status:".bright_cyan(),
                colored_status(field(job, "status"))
            );
            println!("{} {}", "Priority:".bright_cyan(), job["priority"]);
            println!("{} {}%", "Progress:".bright_cyan(), job["progress"]);
            if let Some(node) = job["assigned_node"].as_str() {
                println!("{} {}", "Node:".bright_cyan(), node);
            }
            if !job["result"].is_null() {
                println!("{} {}", "Result:".bright_cyan(), job["result"]);
            }
            if let Some(error) = job["error_message"].as_str() {
                println!(
                    "{} {} ({})",
                    "Error:".bright_red(),
                    error,
                    field(job, "error_kind")
                );
            }
            if let Some(elapsed) = execution_time(job) {
                println!("{} {}ms", "Duration:".bright_cyan(), elapsed.num_milliseconds());
            }
        }
    }
    Ok(())
}

/// Wall-clock execution time of a finished job.
fn execution_time(job: &Value) -> Option<chrono::Duration> {
    let started: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(job["started_at"].clone()).ok()?;
    let completed: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(job["completed_at"].clone()).ok()?;
    Some(completed.signed_duration_since(started))
}

/// Render a cluster status payload.
pub fn display_cluster_status(status: &Value, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(status)?),
        OutputFormat::Pretty => {
            println!();
            println!(
                "{} {}",
                "Cluster".bright_blue().bold(),
                status["cluster_id"].as_str().unwrap_or("?").dimmed()
            );
            println!("{}", "─".repeat(60).dimmed());
            println!(
                "{} {}",
                "Routing:".bright_cyan(),
                field(status, "routing_strategy")
            );
            println!(
                "{} {} total, {} available",
                "Nodes:".bright_cyan(),
                status["total_nodes"],
                status["available_nodes"]
            );
            println!(
                "{} {} queued, {} active, {} completed, {} failed",
                "Jobs:".bright_cyan(),
                status["queued_jobs"],
                status["active_jobs"],
                status["completed_jobs"],
                status["failed_jobs"]
            );
            println!("{} {}s", "Uptime:".bright_cyan(), status["uptime_seconds"]);

            if let Some(nodes) = status["nodes"].as_array() {
                println!();
                for node in nodes {
                    println!(
                        "  {} {} [{}] {}/{} active, load {:.2}",
                        colored_status(field(node, "status")),
                        node["node_id"].as_str().unwrap_or("?"),
                        field(node, "address"),
                        node["active_jobs"],
                        node["max_concurrent_jobs"],
                        node["load_factor"].as_f64().unwrap_or(0.0)
                    );
                }
            }
        }
    }
    Ok(())
}

/// Render one streaming frame as a progress line.
pub fn display_frame(frame: &Value) {
    let data = &frame["data"];
    match frame["type"].as_str().unwrap_or("") {
        "start" => println!("{} {}", "started".bright_blue().bold(), data),
        "progress" => println!(
            "{:>4}% {} {}",
            data["percent"],
            field(data, "step").bright_cyan(),
            data["message"].as_str().unwrap_or("")
        ),
        "result" => println!("{} {}", "result".bright_cyan().bold(), data),
        "complete" => println!("{} {}", "complete".bright_green().bold(), data),
        "error" => println!(
            "{} {}",
            "error".bright_red().bold(),
            data["message"].as_str().unwrap_or("")
        ),
        other => println!("{other} {data}"),
    }
}

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("?")
}

fn colored_status(status: &str) -> colored::ColoredString {
    match status {
        "completed" | "healthy" => status.bright_green(),
        "running" | "assigned" | "degraded" => status.bright_yellow(),
        "failed" | "unhealthy" => status.bright_red(),
        "cancelled" => status.bright_magenta(),
        other => other.normal(),
    }
}
