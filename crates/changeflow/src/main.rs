//! `changeflow` - server and operator CLI.

use anyhow::Result;
use changeflow_logging::{init_logging, LogConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "changeflow", about = "Database change review and rollout")]
struct Cli {
    /// Config file (TOML); defaults to <home>/config.toml
    #[arg(long, global = true, env = "CHANGEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// State store path, overriding the config file
    #[arg(long, global = true, env = "CHANGEFLOW_DB")]
    db: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Email of the user the command acts as
    #[arg(long = "as", global = true, env = "CHANGEFLOW_USER")]
    as_user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the background runners until Ctrl-C
    Serve,

    /// Inspect and review issues
    Issue {
        #[command(subcommand)]
        action: IssueAction,
    },

    /// Manage access grants
    Grant {
        #[command(subcommand)]
        action: GrantAction,
    },

    /// Manage plan-check runs
    PlanCheck {
        #[command(subcommand)]
        action: PlanCheckAction,
    },
}

#[derive(Subcommand, Debug)]
enum IssueAction {
    /// List issues
    List {
        /// Project id; all visible projects when omitted
        #[arg(short, long)]
        project: Option<String>,

        /// Filter expression, e.g. 'status in ["OPEN"]'
        #[arg(short, long, default_value = "")]
        filter: String,

        #[arg(long, default_value = "10")]
        page_size: i32,

        #[arg(long, default_value = "")]
        page_token: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Approve the current approval step
    Approve {
        /// projects/{pid}/issues/{uid}
        name: String,
        #[arg(short, long, default_value = "")]
        comment: String,
    },

    /// Reject the current approval step
    Reject {
        name: String,
        #[arg(short, long, default_value = "")]
        comment: String,
    },

    /// Re-request review after a rejection
    Request {
        name: String,
        #[arg(short, long, default_value = "")]
        comment: String,
    },
}

#[derive(Subcommand, Debug)]
enum GrantAction {
    /// PENDING -> ACTIVE
    Activate {
        /// projects/{pid}/accessGrants/{uid}
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// ACTIVE -> REVOKED
    Revoke {
        name: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PlanCheckAction {
    /// Cancel a RUNNING plan-check run
    Cancel {
        /// projects/{pid}/plans/{uid}/planCheckRuns/{uid}
        name: String,
        #[arg(long)]
        json: bool,
    },
}

async fn run_command(cli: Cli) -> Result<()> {
    let env = cli::Env::open(cli.config.as_deref(), cli.db.as_deref()).await?;
    match cli.command {
        Commands::Serve => env.serve().await,
        Commands::Issue { action } => {
            let ctx = env.context(cli.as_user.as_deref()).await?;
            match action {
                IssueAction::List {
                    project,
                    filter,
                    page_size,
                    page_token,
                    json,
                } => {
                    cli::issue::list(
                        &env,
                        &ctx,
                        cli::issue::ListArgs {
                            project,
                            filter,
                            page_size,
                            page_token,
                            json,
                        },
                    )
                    .await
                }
                IssueAction::Approve { name, comment } => {
                    cli::issue::review(&env, &ctx, cli::issue::Review::Approve, &name, &comment).await
                }
                IssueAction::Reject { name, comment } => {
                    cli::issue::review(&env, &ctx, cli::issue::Review::Reject, &name, &comment).await
                }
                IssueAction::Request { name, comment } => {
                    cli::issue::review(&env, &ctx, cli::issue::Review::Request, &name, &comment).await
                }
            }
        }
        Commands::Grant { action } => {
            let ctx = env.context(cli.as_user.as_deref()).await?;
            match action {
                GrantAction::Activate { name, json } => {
                    cli::grant::activate(&env, &ctx, &name, json).await
                }
                GrantAction::Revoke { name, json } => cli::grant::revoke(&env, &ctx, &name, json).await,
            }
        }
        Commands::PlanCheck { action } => {
            let ctx = env.context(cli.as_user.as_deref()).await?;
            match action {
                PlanCheckAction::Cancel { name, json } => {
                    cli::plan_check::cancel(&env, &ctx, &name, json).await
                }
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        app_name: "changeflow",
        verbose: cli.verbose,
        quiet: cli.quiet,
        log_dir: None,
    }) {
        eprintln!("Warning: failed to initialize logging: {:#}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run_command(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
