use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use vigil_core::app::{App, AppBuilder, ProfileService, ScanService};
use vigil_core::config::Config;
use vigil_core::domain::{
    ConfigProfile, ListQuery, Owner, ScanRequest, ScanTask, SortField, SortOrder, TaskId,
    TaskStatus,
};

#[derive(Debug, Parser)]
#[command(name = "vigil", version, about = "Queue and run container image scans")]
struct Cli {
    /// Identity the tasks belong to. Empty or absent means anonymous.
    #[arg(long, global = true, env = "VIGIL_OWNER")]
    owner: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit images, follow their logs, and wait for them to finish.
    Run(RunArgs),
    /// List the owner's tasks.
    List(ListArgs),
    /// Print one task as JSON.
    Show { id: TaskId },
    /// Print the output a task has recorded so far.
    Logs { id: TaskId },
    /// Cancel a queued task.
    Cancel { id: TaskId },
    /// Delete one task, or everything the owner has with `--all`.
    Delete {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        id: Option<TaskId>,
        #[arg(long)]
        all: bool,
    },
    /// Queue length, estimated wait and per-status counts.
    Queue,
    /// Run one retention pass now.
    Sweep,
    /// Manage saved scan settings.
    #[command(subcommand)]
    Profile(ProfileCommand),
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    /// List saved profiles. The last used one is marked with `*`.
    List,
    Show { name: String },
    /// Save the given scan options under `name`.
    Save {
        name: String,
        /// Prepended to images that do not already start with it.
        #[arg(long)]
        image_prefix: Option<String>,
        #[command(flatten)]
        options: ScanOptions,
    },
    Delete { name: String },
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    #[arg(required = true)]
    images: Vec<String>,
    /// Start from a saved profile; options given here override it.
    #[arg(long)]
    profile: Option<String>,
    #[command(flatten)]
    options: ScanOptions,
}

#[derive(Debug, clap::Args)]
struct ScanOptions {
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Skip TLS verification against the registry.
    #[arg(long)]
    insecure: bool,
    #[arg(long, value_delimiter = ',')]
    severity: Vec<String>,
    #[arg(long)]
    ignore_unfixed: bool,
    #[arg(long, value_delimiter = ',')]
    scanners: Vec<String>,
    #[arg(long)]
    detection_priority: Option<String>,
    #[arg(long, value_delimiter = ',')]
    pkg_types: Vec<String>,
    #[arg(long)]
    format: Option<String>,
}

impl ScanOptions {
    /// Overlay the options that were given on `base`.
    fn apply(&self, mut base: ScanRequest) -> ScanRequest {
        if self.username.is_some() {
            base.username = self.username.clone();
        }
        if self.password.is_some() {
            base.password = self.password.clone();
        }
        if self.insecure {
            base.tls_verify = Some(false);
        }
        if !self.severity.is_empty() {
            base.severity = self.severity.clone();
        }
        base.ignore_unfixed |= self.ignore_unfixed;
        if !self.scanners.is_empty() {
            base.scanners = self.scanners.clone();
        }
        if self.detection_priority.is_some() {
            base.detection_priority = self.detection_priority.clone();
        }
        if !self.pkg_types.is_empty() {
            base.pkg_types = self.pkg_types.clone();
        }
        if self.format.is_some() {
            base.format = self.format.clone();
        }
        base
    }
}

#[derive(Debug, clap::Args)]
struct ListArgs {
    #[arg(long)]
    status: Option<TaskStatus>,
    #[arg(long, default_value_t = 1)]
    page: usize,
    #[arg(long, default_value_t = vigil_core::domain::query::DEFAULT_PAGE_SIZE)]
    page_size: usize,
    /// createdAt or completedAt
    #[arg(long, default_value = "createdAt")]
    sort_by: SortField,
    #[arg(long, default_value = "desc")]
    sort_order: SortOrder,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        return Err(e).context("failed to read .env");
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let owner = Owner::resolve(cli.owner.as_deref());
    let config = Config::from_env().context("invalid VIGIL_* configuration")?;

    match cli.command {
        Command::Run(args) => {
            let app = AppBuilder::new(config).build().await?;
            let outcome = run(&app, &owner, &args).await;
            app.shutdown().await;
            outcome
        }
        command => {
            let app = AppBuilder::new(config).inspect_only().build().await?;
            let outcome = inspect(&app, &owner, command).await;
            app.shutdown().await;
            outcome
        }
    }
}

async fn run(app: &App, owner: &Owner, args: &RunArgs) -> Result<()> {
    let service = app.service();
    let profile = match &args.profile {
        Some(name) => {
            let profile = app
                .profiles()
                .get(owner, name)
                .await
                .with_context(|| format!("failed to load profile {name}"))?;
            app.profiles().set_last_used(owner, name).await?;
            Some(profile)
        }
        None => None,
    };

    let mut ids = Vec::with_capacity(args.images.len());
    for image in &args.images {
        let base = match &profile {
            Some(profile) => profile.request_for(image),
            None => ScanRequest::new(image.as_str()),
        };
        let task = service
            .create_task(owner.clone(), args.options.apply(base))
            .await
            .with_context(|| format!("failed to submit {image}"))?;
        eprintln!("queued {} ({image})", task.id);
        ids.push(task.id);
    }

    let follow = async {
        let mut failed = 0usize;
        for &id in &ids {
            let task = follow_log(service, id).await?;
            println!("{}", serde_json::to_string(&redacted(task.clone()))?);
            if task.status != TaskStatus::Completed {
                failed += 1;
            }
        }
        anyhow::Ok(failed)
    };

    tokio::select! {
        failed = follow => {
            let failed = failed?;
            if failed > 0 {
                bail!("{failed} of {} scans did not complete", ids.len());
            }
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted; waiting for running scans to finish");
            Ok(())
        }
    }
}

/// Print the task's output until it ends, then return its final state.
async fn follow_log(service: &Arc<ScanService>, id: TaskId) -> Result<ScanTask> {
    let mut stream = service.stream_log(id).await?;
    while let Some(line) = stream.next_line().await {
        println!("[{id}] {line}");
    }
    Ok(service.get_task(id).await?)
}

fn redacted(mut task: ScanTask) -> ScanTask {
    if task.config.password.is_some() {
        task.config.password = Some("****".to_string());
    }
    task
}

fn redacted_profile(mut profile: ConfigProfile) -> ConfigProfile {
    if profile.password.is_some() {
        profile.password = Some("****".to_string());
    }
    profile
}

async fn profile_command(
    profiles: &ProfileService,
    owner: &Owner,
    command: ProfileCommand,
) -> Result<()> {
    match command {
        ProfileCommand::List => {
            let last_used = profiles.last_used(owner).await?;
            for name in profiles.list(owner).await? {
                let mark = if last_used.as_deref() == Some(name.as_str()) { "*" } else { " " };
                println!("{mark} {name}");
            }
        }
        ProfileCommand::Show { name } => {
            let profile = profiles.get(owner, &name).await?;
            println!("{}", serde_json::to_string_pretty(&redacted_profile(profile))?);
        }
        ProfileCommand::Save {
            name,
            image_prefix,
            options,
        } => {
            let mut profile = ConfigProfile::from_request(&options.apply(ScanRequest::default()));
            profile.image_prefix = image_prefix;
            let stored = profiles.save(owner, &name, profile).await?;
            if options.password.is_some() && stored.password.is_none() {
                eprintln!("password not saved (VIGIL_PROFILE_ALLOW_PASSWORD is off)");
            }
            eprintln!("saved profile {name}");
        }
        ProfileCommand::Delete { name } => {
            profiles.delete(owner, &name).await?;
            eprintln!("deleted profile {name}");
        }
    }
    Ok(())
}

async fn owned_task(service: &ScanService, owner: &Owner, id: TaskId) -> Result<ScanTask> {
    let task = service.get_task(id).await?;
    if &task.owner != owner {
        bail!("task not found: {id}");
    }
    Ok(task)
}

async fn inspect(app: &App, owner: &Owner, command: Command) -> Result<()> {
    let service = app.service();
    match command {
        Command::Run(_) => bail!("run needs the full runtime"),
        Command::List(args) => {
            let mut query = ListQuery {
                sort_by: args.sort_by,
                sort_order: args.sort_order,
                ..ListQuery::default()
            }
            .page(args.page, args.page_size);
            if let Some(status) = args.status {
                query = query.with_status(status);
            }
            let page = service.list_tasks(owner, query).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Command::Show { id } => {
            let task = owned_task(service, owner, id).await?;
            println!("{}", serde_json::to_string_pretty(&redacted(task))?);
        }
        Command::Logs { id } => {
            // Live lines belong to the process running the scan; print what is stored.
            let task = owned_task(service, owner, id).await?;
            for line in task.output_lines() {
                println!("{line}");
            }
            if !task.status.is_terminal() {
                eprintln!("task is still {}", task.status);
            }
        }
        Command::Cancel { id } => {
            owned_task(service, owner, id).await?;
            let task = service.cancel_task(id).await?;
            println!("{}", serde_json::to_string_pretty(&redacted(task))?);
        }
        Command::Delete { id: Some(id), .. } => {
            owned_task(service, owner, id).await?;
            service.delete_task(id).await?;
            eprintln!("deleted {id}");
        }
        Command::Delete { id: None, .. } => {
            let summary = service.delete_all_tasks(owner).await?;
            eprintln!(
                "deleted {} tasks ({} running tasks skipped)",
                summary.deleted, summary.skipped_running
            );
        }
        Command::Queue => {
            let status = service.queue_status(owner).await?;
            let counts = service.counts(owner).await?;
            let storage = service.storage_usage(owner).await?;
            let report = serde_json::json!({
                "owner": owner.as_str(),
                "queueLength": status.queue_length,
                "estimatedAverageWait": humantime::format_duration(status.estimated_average_wait).to_string(),
                "running": status.running,
                "maxWorkers": status.max_workers,
                "counts": counts,
                "storageBytes": storage,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Profile(command) => profile_command(app.profiles(), owner, command).await?,
        Command::Sweep => {
            let report = app.sweep_now().await?;
            eprintln!("removed {} expired tasks", report.deleted);
            for (id, reason) in &report.failures {
                tracing::warn!(task_id = %id, error = %reason, "could not remove task");
            }
        }
    }
    Ok(())
}
