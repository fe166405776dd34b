//! Optimize CLI - experiments and activity from the command line
//!
//! Usage:
//!   optimize get applications [NAMES..]      List applications
//!   optimize get experiments [NAMES..]       List experiments
//!   optimize delete experiments NAMES..      Delete experiments
//!   optimize worker --template F --evaluate C  Handle scans and runs from the feed
//!   optimize run SCENARIO --template F --evaluate C  Scan and run one scenario
//!   optimize generate experiment-name        Print a fresh experiment name

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use optimize_api::applications::{
    ApplicationApi, ApplicationItem, ApplicationLister, ApplicationListQuery,
    HttpApplicationApi, Subscription,
};
use optimize_api::experiments::{
    new_experiment_name, ExperimentApi, ExperimentItem, ExperimentLister, ExperimentListQuery,
    HttpExperimentApi,
};
use optimize_api::ApiClient;
use optimize_core::{OptimizeConfig, OptimizeError, Relation};
use optimize_runner::{
    worker_query, ActivityDispatcher, ActivityWorker, CommandEvaluator, FileTemplateGenerator,
    TemplateGenerator, TrialEvaluator, WorkerReport,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "optimize")]
#[command(author, version, about = "Optimize experiments from the command line")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to ~/.config/optimize/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// API server address, overriding configuration
    #[arg(long, global = true, value_name = "URL")]
    address: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display resources
    Get {
        #[command(subcommand)]
        resource: GetCommands,
    },

    /// Delete resources by name
    Delete {
        #[command(subcommand)]
        resource: DeleteCommands,
    },

    /// Handle scan and run activity until interrupted
    Worker {
        /// JSON template pushed to scenarios on scan
        #[arg(long, value_name = "FILE")]
        template: PathBuf,

        /// Command evaluating a trial (assignments on stdin, metrics on stdout)
        #[arg(long, value_name = "CMD")]
        evaluate: String,
    },

    /// Request a scan and a run of one scenario and handle both
    Run {
        /// URL of the scenario
        scenario: String,

        /// JSON template pushed to the scenario on scan
        #[arg(long, value_name = "FILE")]
        template: PathBuf,

        /// Command evaluating a trial (assignments on stdin, metrics on stdout)
        #[arg(long, value_name = "CMD")]
        evaluate: String,
    },

    /// Generate values
    Generate {
        #[command(subcommand)]
        what: GenerateCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum GetCommands {
    /// List applications, or only the named ones
    #[command(alias = "application", alias = "app")]
    Applications {
        names: Vec<String>,

        /// Label selector, e.g. team=checkout
        #[arg(short = 'l', long)]
        selector: Option<String>,

        #[command(flatten)]
        list: ListArgs,
    },

    /// List experiments, or only the named ones
    #[command(alias = "experiment", alias = "exp")]
    Experiments {
        names: Vec<String>,

        /// Label selector, e.g. application=my-app
        #[arg(short = 'l', long)]
        selector: Option<String>,

        #[command(flatten)]
        list: ListArgs,
    },
}

#[derive(clap::Args)]
struct ListArgs {
    /// Page size for listing (0 for the server default)
    #[arg(long, default_value = "0")]
    batch_size: usize,

    /// Skip names that do not exist
    #[arg(long)]
    ignore_not_found: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "name")]
    output: OutputFormat,
}

#[derive(Subcommand)]
enum DeleteCommands {
    /// Delete the named applications
    #[command(alias = "application", alias = "app")]
    Applications {
        #[arg(required = true)]
        names: Vec<String>,

        /// Skip names that do not exist
        #[arg(long)]
        ignore_not_found: bool,
    },

    /// Delete the named experiments
    #[command(alias = "experiment", alias = "exp")]
    Experiments {
        #[arg(required = true)]
        names: Vec<String>,

        /// Skip names that do not exist
        #[arg(long)]
        ignore_not_found: bool,
    },
}

#[derive(Subcommand)]
enum GenerateCommands {
    /// Print a new, time ordered experiment name
    ExperimentName,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the effective configuration to the config file
    Init,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Name,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = OptimizeConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(address) = cli.address {
        config.address = address;
    }

    match cli.command {
        Commands::Get { resource } => cmd_get(&config, resource).await,
        Commands::Delete { resource } => cmd_delete(&config, resource).await,
        Commands::Worker { template, evaluate } => cmd_worker(&config, template, evaluate).await,
        Commands::Run {
            scenario,
            template,
            evaluate,
        } => cmd_run(&config, scenario, template, evaluate).await,
        Commands::Generate { what } => match what {
            GenerateCommands::ExperimentName => {
                println!("{}", new_experiment_name());
                Ok(())
            }
        },
        Commands::Config { action } => cmd_config(&config, cli.config, action),
    }
}

fn client(config: &OptimizeConfig) -> Result<ApiClient> {
    ApiClient::from_config(config)
        .with_context(|| format!("Failed to create client for {}", config.address))
}

fn print_item<T: Serialize>(name: &str, item: &T, output: OutputFormat) -> optimize_core::Result<()> {
    match output {
        OutputFormat::Name => println!("{}", name),
        OutputFormat::Json => println!("{}", serde_json::to_string(item)?),
    }
    Ok(())
}

fn print_application(item: &ApplicationItem, output: OutputFormat) -> optimize_core::Result<()> {
    print_item(item.application.name.as_str(), item, output)
}

fn print_experiment(item: &ExperimentItem, output: OutputFormat) -> optimize_core::Result<()> {
    print_item(item.name.as_str(), item, output)
}

async fn cmd_get(config: &OptimizeConfig, resource: GetCommands) -> Result<()> {
    let client = client(config)?;

    match resource {
        GetCommands::Applications {
            names,
            selector,
            list,
        } => {
            let lister = ApplicationLister::new(HttpApplicationApi::new(client)?)
                .with_batch_size(list.batch_size);
            let output = list.output;
            let visit = |item: ApplicationItem| std::future::ready(print_application(&item, output));

            if names.is_empty() {
                let mut query = ApplicationListQuery::default();
                if let Some(selector) = selector {
                    query.set_label_selector(selector);
                }
                lister.for_each_application(&query, visit).await?;
            } else {
                lister
                    .for_each_named_application(&names, list.ignore_not_found, visit)
                    .await?;
            }
        }
        GetCommands::Experiments {
            names,
            selector,
            list,
        } => {
            let lister = ExperimentLister::new(HttpExperimentApi::new(client)?)
                .with_batch_size(list.batch_size);
            let output = list.output;
            let visit = |item: ExperimentItem| std::future::ready(print_experiment(&item, output));

            if names.is_empty() {
                let mut query = ExperimentListQuery::default();
                if let Some(selector) = selector {
                    query.set_label_selector(selector);
                }
                lister.for_each_experiment(&query, visit).await?;
            } else {
                lister
                    .for_each_named_experiment(&names, list.ignore_not_found, visit)
                    .await?;
            }
        }
    }

    Ok(())
}

async fn cmd_delete(config: &OptimizeConfig, resource: DeleteCommands) -> Result<()> {
    let client = client(config)?;

    match resource {
        DeleteCommands::Applications {
            names,
            ignore_not_found,
        } => {
            let api = HttpApplicationApi::new(client)?;
            let lister = ApplicationLister::new(api.clone());
            lister
                .for_each_named_application(&names, ignore_not_found, |item| {
                    let api = api.clone();
                    async move {
                        let url = item.metadata.require_link(Relation::SelfLink)?;
                        api.delete_application(url).await?;
                        println!("application \"{}\" deleted", item.application.name);
                        Ok::<(), OptimizeError>(())
                    }
                })
                .await?;
        }
        DeleteCommands::Experiments {
            names,
            ignore_not_found,
        } => {
            let api = HttpExperimentApi::new(client)?;
            let lister = ExperimentLister::new(api.clone());
            lister
                .for_each_named_experiment(&names, ignore_not_found, |item| {
                    let api = api.clone();
                    async move {
                        // Nothing to delete without a self link
                        if let Some(url) = item.link(Relation::SelfLink) {
                            api.delete_experiment(url).await?;
                            println!("experiment \"{}\" deleted", item.name);
                        }
                        Ok::<(), OptimizeError>(())
                    }
                })
                .await?;
        }
    }

    Ok(())
}

/// Build a worker talking to the configured server
fn worker(
    config: &OptimizeConfig,
    applications: Arc<HttpApplicationApi>,
    template: PathBuf,
    evaluate: &str,
) -> Result<ActivityWorker<HttpApplicationApi, HttpExperimentApi>> {
    let experiments = HttpExperimentApi::new(applications.client().clone())?;
    let evaluator: Arc<dyn TrialEvaluator> =
        Arc::new(CommandEvaluator::parse(evaluate).context("Invalid --evaluate command")?);
    let generator: Arc<dyn TemplateGenerator> = Arc::new(FileTemplateGenerator::new(template));

    Ok(
        ActivityWorker::new(ActivityDispatcher::new(
            applications,
            experiments,
            generator,
            evaluator,
        ))
        .with_max_parallel_runs(config.activity.max_parallel_runs),
    )
}

async fn subscribe(
    config: &OptimizeConfig,
    applications: Arc<HttpApplicationApi>,
    cancel: CancellationToken,
) -> Result<Subscription<HttpApplicationApi>> {
    Subscription::subscribe_activity(
        applications,
        cancel,
        worker_query(config.activity.batch_size),
        config.poll_interval(),
    )
    .await
    .context("Failed to subscribe to activity")
}

fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work");
            cancel.cancel();
        }
    });
}

fn print_report(report: &WorkerReport) {
    println!(
        "{} scans, {} runs ({} trials), {} failed, {} unacknowledged",
        report.scans, report.runs, report.trials, report.failed, report.unacknowledged
    );
}

async fn cmd_worker(config: &OptimizeConfig, template: PathBuf, evaluate: String) -> Result<()> {
    let applications = Arc::new(HttpApplicationApi::new(client(config)?)?);
    let worker = worker(config, Arc::clone(&applications), template, &evaluate)?;

    let cancel = CancellationToken::new();
    let subscription = subscribe(config, applications, cancel.clone()).await?;
    info!("Handling activity from {}", subscription.feed_url());

    let (tx, rx) = mpsc::channel(16);
    let delivery = subscription.subscribe(tx);
    cancel_on_interrupt(cancel);

    let report = worker.run(rx).await;
    delivery.await.context("Activity delivery task failed")?;
    print_report(&report);
    Ok(())
}

async fn cmd_run(
    config: &OptimizeConfig,
    scenario: String,
    template: PathBuf,
    evaluate: String,
) -> Result<()> {
    let applications = Arc::new(HttpApplicationApi::new(client(config)?)?);
    let worker = Arc::new(worker(config, Arc::clone(&applications), template, &evaluate)?);

    let cancel = CancellationToken::new();
    let subscription = subscribe(config, applications, cancel.clone()).await?;
    cancel_on_interrupt(cancel.clone());

    let report = worker
        .run_scenario(subscription, cancel, &scenario)
        .await
        .with_context(|| format!("Failed to run scenario {}", scenario))?;
    print_report(&report);

    if report.failed > 0 {
        anyhow::bail!("{} activity items failed", report.failed);
    }
    Ok(())
}

fn cmd_config(config: &OptimizeConfig, path: Option<PathBuf>, action: ConfigCommands) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommands::Init => {
            let path = path
                .or_else(OptimizeConfig::default_path)
                .context("No configuration path; pass --config")?;
            config.write(&path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
