use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use foreman_core::blacklist::{Blacklist, Rule};
use foreman_core::config::SchedulerConfig;
use foreman_core::job::JobId;
use foreman_core::spec::RepoState;
use foreman_db::job_store::JobStore;
use foreman_db::task_store::TaskStore;
use foreman_scheduler::repo_sync::{GitRepoSyncer, RepoSyncer};
use foreman_scheduler::scheduler::TaskScheduler;
use foreman_scheduler::spec_cache::{GitCfgSource, SpecCache};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod dry_run;

#[derive(Parser)]
#[command(name = "foreman", about = "Continuous-integration task scheduler")]
struct Cli {
    /// Path to foreman.toml configuration.
    #[arg(long, default_value = "foreman.toml")]
    config: PathBuf,

    /// Path to the database file; defaults to <work_dir>/foreman.redb.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Output JSON-structured logs to console.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive scheduling ticks against a dry-run executor that completes
    /// every dispatched task. Validates task configs, mirrors, and
    /// scheduling behavior without real bots.
    Simulate {
        /// JSON file describing the simulated bot fleet.
        #[arg(long)]
        bots_file: PathBuf,
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
    },
    /// Show store-derived status: task counts and unfinished jobs.
    Status,
    /// Create a manually-forced job.
    Trigger {
        repo: String,
        revision: String,
        job_name: String,
    },
    /// Cancel a job by id.
    Cancel { id: i64 },
    /// Manage the blacklist.
    Blacklist {
        #[command(subcommand)]
        action: BlacklistAction,
    },
}

#[derive(Subcommand)]
enum BlacklistAction {
    List,
    Add {
        rule_name: String,
        task_name_regex: String,
        revision_regex: String,
    },
    Remove {
        rule_name: String,
    },
}

fn init_logging(json_logs: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("foreman=info"));
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config = SchedulerConfig::load(&cli.config)
        .context(format!("failed to load {}", cli.config.display()))?;
    std::fs::create_dir_all(&config.work_dir)?;
    let db_path = cli
        .db
        .unwrap_or_else(|| config.work_dir.join("foreman.redb"));
    let db = Arc::new(foreman_db::open_db(&db_path)?);

    match cli.command {
        Commands::Simulate { bots_file, once } => {
            let executor = Arc::new(dry_run::DryRunExecutor::from_file(&bots_file)?);
            let stager = Arc::new(dry_run::DryRunStager::new());

            let mut syncers: HashMap<String, Box<dyn RepoSyncer>> = HashMap::new();
            let mut mirrors = HashMap::new();
            for entry in &config.repo {
                syncers.insert(
                    entry.name.clone(),
                    Box::new(GitRepoSyncer::without_fetch(&entry.mirror)),
                );
                mirrors.insert(
                    entry.name.clone(),
                    (entry.mirror.clone(), entry.cfg_path.clone()),
                );
            }
            if syncers.is_empty() {
                bail!("no [[repo]] entries configured");
            }

            let scheduler = Arc::new(TaskScheduler::new(
                config,
                db,
                executor,
                stager,
                syncers,
                Box::new(GitCfgSource::new(mirrors)),
            )?);

            let cancel = CancellationToken::new();
            if once {
                let dispatched = scheduler.tick(&cancel).await?;
                println!("dispatched {dispatched} tasks");
                return Ok(());
            }

            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    ctrl_c_cancel.cancel();
                }
            });
            scheduler.run(cancel).await;
        }

        Commands::Status => {
            let tasks = TaskStore::new(&db).list()?;
            let mut by_status: HashMap<&str, usize> = HashMap::new();
            for t in &tasks {
                *by_status.entry(t.status.label()).or_insert(0) += 1;
            }
            println!("tasks: {}", tasks.len());
            let mut counts: Vec<_> = by_status.into_iter().collect();
            counts.sort();
            for (status, count) in counts {
                println!("  {status}: {count}");
            }
            let jobs = JobStore::new(&db).list()?;
            let unfinished = jobs.iter().filter(|j| !j.done()).count();
            println!("jobs: {} ({unfinished} unfinished)", jobs.len());
        }

        Commands::Trigger {
            repo,
            revision,
            job_name,
        } => {
            let mut mirrors = HashMap::new();
            for entry in &config.repo {
                mirrors.insert(
                    entry.name.clone(),
                    (entry.mirror.clone(), entry.cfg_path.clone()),
                );
            }
            let specs = SpecCache::new(Box::new(GitCfgSource::new(mirrors)), config.cfg_cache_dir())?;
            let mut job =
                specs.make_job(RepoState::new(repo, revision), &job_name, Utc::now())?;
            job.is_force = true;
            let job = JobStore::new(&db).insert(job)?;
            println!("{}", job.id);
        }

        Commands::Cancel { id } => {
            let store = JobStore::new(&db);
            let mut job = store
                .get(JobId(id))?
                .with_context(|| format!("no such job: job-{id}"))?;
            if job.done() {
                bail!("job-{id} is already finished with status {}", job.status);
            }
            job.status = foreman_core::job::JobStatus::Canceled;
            job.finished = Some(Utc::now());
            store.put_job(&mut job)?;
            println!("canceled {}", job.id);
        }

        Commands::Blacklist { action } => {
            let mut bl = Blacklist::from_file(config.blacklist_path())?;
            match action {
                BlacklistAction::List => {
                    for rule in bl.rules() {
                        println!(
                            "{}: tasks={} revisions={}",
                            rule.rule_name, rule.task_name_regex, rule.revision_regex
                        );
                    }
                }
                BlacklistAction::Add {
                    rule_name,
                    task_name_regex,
                    revision_regex,
                } => {
                    bl.add_rule(Rule {
                        rule_name,
                        task_name_regex,
                        revision_regex,
                    })?;
                    println!("added");
                }
                BlacklistAction::Remove { rule_name } => {
                    if bl.remove_rule(&rule_name)? {
                        println!("removed");
                    } else {
                        bail!("no such rule: {rule_name}");
                    }
                }
            }
        }
    }
    Ok(())
}
