use clap::{Parser, Subcommand};
use std::process;

mod commands;
mod error;
mod output;

use commands::{dispatcher, job, node, stream};
use error::CliError;

/// Editor Fleet - cluster dispatcher and worker runtime for image-editing jobs
#[derive(Parser)]
#[command(name = "editor-fleet")]
#[command(author = "Editor Fleet Contributors")]
#[command(version)]
#[command(about = "Distribute image-editing jobs across a fleet of editor nodes", long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cluster dispatcher
    #[command(visible_alias = "d")]
    Dispatcher(dispatcher::DispatcherArgs),

    /// Run a worker node
    #[command(visible_alias = "n")]
    Node(node::NodeArgs),

    /// Submit a job to the cluster
    #[command(visible_alias = "s")]
    Submit(job::SubmitArgs),

    /// Show the status of a job
    Status(job::StatusArgs),

    /// Cancel a job
    Cancel(job::CancelArgs),

    /// Show aggregate cluster status
    Cluster(job::ClusterArgs),

    /// Follow a streaming operation on a node
    Stream(stream::StreamArgs),

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Handle color output
    if cli.no_color {
        colored::control::set_override(false);
    }

    // Execute command
    let result: Result<(), CliError> = match cli.command {
        Commands::Dispatcher(args) => dispatcher::execute(args, cli.verbose).await,
        Commands::Node(args) => node::execute(args, cli.verbose).await,
        Commands::Submit(args) => job::submit(args, cli.verbose).await,
        Commands::Status(args) => job::status(args, cli.verbose).await,
        Commands::Cancel(args) => job::cancel(args, cli.verbose).await,
        Commands::Cluster(args) => job::cluster(args, cli.verbose).await,
        Commands::Stream(args) => stream::execute(args, cli.verbose).await,
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    };

    if let Err(err) = result {
        err.print_error(cli.verbose);
        process::exit(err.exit_code());
    }
}

fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();
    generate(shell, &mut cmd, bin_name, &mut io::stdout());
}
