//! CLI entry point (§5's operation surface, §1's "pluggable boundary"
//! caveat notwithstanding — something has to wire the core up to a
//! terminal). Thin: every subcommand parses its arguments, opens the
//! store, and delegates to `batchflow::controller::Controller`.

use std::{path::PathBuf, process::ExitCode};

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use batchflow::{
    bridge::{LocalDirectBridge, NullArchiveBridge},
    channel::TaskRange,
    config::Config,
    controller::Controller,
    declaration::WorkflowDecl,
    error::{DeclError, StoreError},
    ids::{TaskId, WorkflowId},
    key_val_fs::as_key::AsKey,
    load_config_file::LoadConfigFile,
    store::{task::TaskStatus, Store},
    utillib::logging::{set_log_level, LogLevelOpt},
};

#[derive(clap::Parser, Debug)]
#[clap(next_line_help = true)]
/// Build, submit, and inspect batchflow workflows.
struct Opts {
    /// Override the path to the config file.
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(flatten)]
    log_level: LogLevelOpt,

    #[clap(subcommand)]
    subcommand: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Validate a declaration and persist it as a new workflow.
    Make {
        /// JSON5 document matching the workflow declaration shape.
        declaration: PathBuf,
        /// The working directory this workflow's tasks run in.
        working_dir: PathBuf,
    },
    /// Schedule channels, emit jobscripts, and dispatch them.
    Submit {
        workflow_id: String,
        /// Directory jobscripts and variable files are written into.
        jobscripts_dir: PathBuf,
        /// One `start:end:step` range per exec_order=0 channel, comma
        /// separated. Omit to run each channel's full width.
        #[clap(long)]
        ranges: Option<String>,
    },
    /// Runtime-only: resolve variables and write a task's command file.
    WriteCmd {
        workflow_id: String,
        command_group_index: usize,
        task_index: usize,
        out: PathBuf,
    },
    /// Cancel every non-terminal task in a workflow.
    Kill {
        workflow_id: String,
        #[clap(long, default_value = "cancelled by user")]
        reason: String,
    },
    /// Remove a workflow's emitted jobscripts/variable-files directory.
    Clean { jobscripts_dir: PathBuf },
    /// One-line-per-status task count for a workflow.
    Stat { workflow_id: String },
    /// Per-command-group task status breakdown.
    ShowStats { workflow_id: String },
    /// Record an archive operation for one task.
    Archive {
        workflow_id: String,
        task_id: String,
        destination: String,
    },
}

fn parse_workflow_id(s: &str) -> Result<WorkflowId> {
    WorkflowId::try_from_filename_str(s)
        .ok_or_else(|| anyhow!("{s:?} is not a valid workflow id"))
}

fn parse_task_id(s: &str) -> Result<TaskId> {
    TaskId::try_from_filename_str(s).ok_or_else(|| anyhow!("{s:?} is not a valid task id"))
}

/// Parses the `--ranges` flag: `"0:5:1,0:3"` into two `TaskRange`s.
fn parse_ranges(s: &str) -> Result<Vec<TaskRange>> {
    s.split(',')
        .map(|part| {
            let mut fields = part.split(':');
            let start: usize = fields
                .next()
                .ok_or_else(|| anyhow!("empty range"))?
                .parse()
                .context("parsing range start")?;
            let end = match fields.next() {
                Some("") | None => None,
                Some(v) => Some(v.parse().context("parsing range end")?),
            };
            let step = match fields.next() {
                Some("") | None => None,
                Some(v) => Some(v.parse().context("parsing range step")?),
            };
            Ok(TaskRange { start, end, step })
        })
        .collect()
}

fn open_store(config: &Config, create: bool) -> Result<Store> {
    let data_dir = config.data_dir()?;
    if create {
        Ok(Store::create_all(data_dir)?)
    } else {
        Ok(Store::open_existing(data_dir)?)
    }
}

/// §6's exit-code contract: 0 on success, 2 for a declaration
/// validation error, 3 for a store error, 1 for anything else (I/O,
/// scheduler bridge failures, etc.) — mirrors how error.rs's typed
/// enums exist so the CLI can decide on an exit code.
fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code: u8 = if err.downcast_ref::<DeclError>().is_some() {
                2
            } else if err.downcast_ref::<StoreError>().is_some() {
                3
            } else {
                1
            };
            ExitCode::from(code)
        }
    }
}

fn run() -> Result<()> {
    let Opts {
        config,
        log_level,
        subcommand,
    } = Opts::parse();
    set_log_level(log_level.into());

    let config = Config::load_config(config)?;

    match subcommand {
        SubCommand::Make {
            declaration,
            working_dir,
        } => {
            let text = std::fs::read_to_string(&declaration)
                .with_context(|| format!("reading declaration file {declaration:?}"))?;
            let decl: WorkflowDecl = serde_json5::from_str(&text)
                .with_context(|| format!("parsing declaration file {declaration:?}"))?;
            let store = open_store(&config, true)?;
            let bridge = LocalDirectBridge;
            let controller = Controller::new(store, &bridge);
            let workflow_id = controller.make_workflow(decl, working_dir)?;
            println!("{workflow_id}");
        }
        SubCommand::Submit {
            workflow_id,
            jobscripts_dir,
            ranges,
        } => {
            let workflow_id = parse_workflow_id(&workflow_id)?;
            let ranges = ranges.as_deref().map(parse_ranges).transpose()?;
            let store = open_store(&config, true)?;
            let bridge = LocalDirectBridge;
            let controller = Controller::new(store, &bridge);
            let submission_id =
                controller.submit_workflow(workflow_id, ranges, &jobscripts_dir)?;
            println!("{submission_id}");
        }
        SubCommand::WriteCmd {
            workflow_id,
            command_group_index,
            task_index,
            out,
        } => {
            let workflow_id = parse_workflow_id(&workflow_id)?;
            let store = open_store(&config, false)?;
            let bridge = LocalDirectBridge;
            let controller = Controller::new(store, &bridge);
            controller.write_cmd(workflow_id, command_group_index, task_index, &out)?;
        }
        SubCommand::Kill {
            workflow_id,
            reason,
        } => {
            let workflow_id = parse_workflow_id(&workflow_id)?;
            let store = open_store(&config, false)?;
            let bridge = LocalDirectBridge;
            let controller = Controller::new(store, &bridge);
            controller.kill(workflow_id, &reason)?;
        }
        SubCommand::Clean { jobscripts_dir } => {
            let store = open_store(&config, false)?;
            let bridge = LocalDirectBridge;
            let controller = Controller::new(store, &bridge);
            controller.clean(&jobscripts_dir)?;
        }
        SubCommand::Stat { workflow_id } => {
            let workflow_id = parse_workflow_id(&workflow_id)?;
            let store = open_store(&config, false)?;
            print_stat(&store, workflow_id)?;
        }
        SubCommand::ShowStats { workflow_id } => {
            let workflow_id = parse_workflow_id(&workflow_id)?;
            let store = open_store(&config, false)?;
            print_show_stats(&store, workflow_id)?;
        }
        SubCommand::Archive {
            workflow_id,
            task_id,
            destination,
        } => {
            let workflow_id = parse_workflow_id(&workflow_id)?;
            let task_id = parse_task_id(&task_id)?;
            let store = open_store(&config, false)?;
            run_archive(&store, workflow_id, task_id, &destination)?;
        }
    }

    Ok(())
}

fn print_stat(store: &Store, workflow_id: WorkflowId) -> Result<()> {
    let tasks = store.tasks(workflow_id, false)?;
    let mut counts = [0usize; 5];
    for key in tasks.sorted_keys(false, None)? {
        let record = tasks
            .get(&key)?
            .ok_or_else(|| anyhow!("task disappeared while counting"))?;
        counts[record.status as usize] += 1;
    }
    println!("pending\t{}", counts[TaskStatus::Pending as usize]);
    println!("submitted\t{}", counts[TaskStatus::Submitted as usize]);
    println!("running\t{}", counts[TaskStatus::Running as usize]);
    println!("complete\t{}", counts[TaskStatus::Complete as usize]);
    println!("failed\t{}", counts[TaskStatus::Failed as usize]);
    Ok(())
}

fn print_show_stats(store: &Store, workflow_id: WorkflowId) -> Result<()> {
    let workflow = store.get_workflow(workflow_id)?;
    let tasks = store.tasks(workflow_id, false)?;
    let mut by_group: std::collections::BTreeMap<usize, [usize; 5]> =
        std::collections::BTreeMap::new();
    for key in tasks.sorted_keys(false, None)? {
        let record = tasks
            .get(&key)?
            .ok_or_else(|| anyhow!("task disappeared while counting"))?;
        by_group.entry(record.command_group_index).or_default()[record.status as usize] += 1;
    }
    for group in &workflow.command_groups {
        let counts = by_group.get(&group.index).copied().unwrap_or_default();
        println!(
            "group {}\tpending={}\tsubmitted={}\trunning={}\tcomplete={}\tfailed={}",
            group.index, counts[0], counts[1], counts[2], counts[3], counts[4]
        );
    }
    Ok(())
}

fn run_archive(
    store: &Store,
    workflow_id: WorkflowId,
    task_id: TaskId,
    destination: &str,
) -> Result<()> {
    let now = std::time::SystemTime::now();
    let handle = store.start_archive(workflow_id, task_id, Some(destination.to_string()), now)?;
    let working_dir = store.get_workflow(workflow_id)?.working_dir;
    let bridge = NullArchiveBridge;
    let result = match batchflow::bridge::ArchiveBridge::archive(&bridge, &working_dir, destination)
    {
        Ok(()) => Ok(()),
        Err(e) => Err(e.to_string()),
    };
    store.end_archive(workflow_id, task_id, now, result.clone())?;
    drop(handle);
    result.map_err(|e| anyhow!(e))
}
