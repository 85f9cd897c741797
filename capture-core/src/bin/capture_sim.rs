//! Capture Sim CLI - drive the capture engine against a simulated kernel
//!
//! Creates a handful of tasks, arms one trigger, runs a round-robin
//! scheduler for a number of ticks and dumps what was captured.
//!
//! Usage:
//!     capture-sim
//!     capture-sim --tasks 5 --switches 100 --trigger-task T2 --trigger-mode to-any
//!     capture-sim --capacity 256 --json
//!     capture-sim --config capture.json -v

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{debug, info, LevelFilter};
use serde::Serialize;

use capture_core::kernel::sim::{SimKernel, SimThread};
use capture_core::protocol::{event_names, name_from_str, name_to_string, Name, TaskId};
use capture_core::{
    flags, CaptureConfig, CaptureEngine, CaptureError, ControlKey, Thread, ThreadExtension, TriggerKind, TriggerMode,
};

#[derive(Parser, Debug)]
#[command(name = "capture-sim")]
#[command(about = "Run the capture engine against a simulated scheduler")]
#[command(version)]
struct Args {
    /// Buffer size in bytes (overrides the config file)
    #[arg(short, long)]
    capacity: Option<usize>,

    /// Path to a JSON engine configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of worker tasks
    #[arg(short, long, default_value_t = 3)]
    tasks: usize,

    /// Context switches to simulate
    #[arg(short, long, default_value_t = 20)]
    switches: usize,

    /// Task the trigger is keyed on
    #[arg(long, default_value = "T1")]
    trigger_task: String,

    /// to-any, from-any or from-to (from INIT)
    #[arg(long, default_value = "from-any")]
    trigger_mode: TriggerMode,

    #[arg(long, default_value = "switch")]
    trigger_kind: TriggerKind,

    /// Record every task, not only the trigger task
    #[arg(long)]
    watch_all: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output (engine debug log)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct RecordView {
    time: u64,
    task: String,
    id: TaskId,
    real_priority: u32,
    current_priority: u32,
    events: Vec<&'static str>,
}

#[derive(Serialize)]
struct Report {
    triggered: bool,
    overflow: bool,
    flags: u32,
    records: Vec<RecordView>,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Warn })
        .parse_default_env()
        .init();

    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    match run(&args, config) {
        Ok(report) => {
            if args.json {
                output_json(&report);
            } else {
                output_table(&report);
            }
        }
        Err(e) => {
            eprintln!("Error: {} [{}]", e, e.error_code());
            std::process::exit(1);
        }
    }
}

fn load_config(args: &Args) -> Result<CaptureConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
            CaptureConfig::from_json(&content).map_err(|e| e.to_string())?
        }
        None => CaptureConfig::default(),
    };
    if let Some(capacity) = args.capacity {
        config = config.with_capacity(capacity);
    }
    if args.watch_all {
        config = config.with_global_watch(true);
    }
    Ok(config)
}

fn task_name(s: &str) -> Result<Name, CaptureError> {
    name_from_str(s).ok_or_else(|| CaptureError::InternalError {
        reason: format!("'{}' is not a task name", s),
    })
}

fn run(args: &Args, config: CaptureConfig) -> Result<Report, CaptureError> {
    let kernel = Arc::new(SimKernel::new());
    let engine = CaptureEngine::with_config(Arc::clone(&kernel), config);
    engine.open_default()?;

    let init = kernel.spawn(task_name("INIT")?, 1);
    kernel.set_executing(init.id());

    let trigger_name = task_name(&args.trigger_task)?;
    let (from, to) = match args.trigger_mode {
        TriggerMode::ToAny => (ControlKey::by_name(trigger_name), ControlKey::default()),
        TriggerMode::FromAny => (ControlKey::default(), ControlKey::by_name(trigger_name)),
        TriggerMode::FromTo => (ControlKey::by_name(init.name()), ControlKey::by_name(trigger_name)),
    };
    engine.set_trigger(from, to, args.trigger_mode, args.trigger_kind)?;
    engine.watch_add(trigger_name, 0)?;
    engine.watch_ctrl(trigger_name, 0, true)?;

    let mut workers: Vec<Arc<SimThread>> = Vec::with_capacity(args.tasks);
    for i in 0..args.tasks {
        let name = task_name(&format!("T{}", i))?;
        let priority = 10 + i as u32;
        let task = kernel.spawn(name, priority);
        engine.thread_create(&init, &task);
        engine.thread_start(&init, &task);
        workers.push(task);
    }

    engine.set_enabled(true)?;
    let mut current = Arc::clone(&init);
    for n in 0..args.switches {
        let Some(heir) = workers.get(n % workers.len().max(1)).cloned() else {
            break;
        };
        kernel.tick(1);
        if n < workers.len() {
            engine.thread_begin(&heir);
        }
        engine.thread_switch(&current, &heir);
        kernel.set_executing(heir.id());
        current = heir;
    }
    engine.set_enabled(false)?;
    info!("simulated {} switches over {} tasks", args.switches, workers.len());

    let engine_flags = engine.flags();
    let batch = engine.read(0, Duration::ZERO)?;
    let mut names: HashMap<TaskId, Name> = HashMap::new();
    let mut records = Vec::with_capacity(batch.len());
    for record in batch.iter() {
        if let Some(task) = record.task() {
            names.insert(record.header.task_id, task.name);
            continue;
        }
        records.push(RecordView {
            time: record.header.time,
            task: names
                .get(&record.header.task_id)
                .map_or_else(|| "?".to_string(), |n| name_to_string(*n)),
            id: record.header.task_id,
            real_priority: record.header.real_priority(),
            current_priority: record.header.current_priority(),
            events: event_names(record.header.events).collect(),
        });
    }
    let total = batch.len();
    let released = batch.release(total)?;
    debug!("released {} records", released);

    engine.close()?;

    Ok(Report {
        triggered: engine_flags & flags::TRIGGERED != 0,
        overflow: engine_flags & flags::OVERFLOW != 0,
        flags: engine_flags,
        records,
    })
}

fn output_json(report: &Report) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing report: {}", e),
    }
}

fn output_table(report: &Report) {
    println!(
        "triggered: {}  overflow: {}  flags: {:#06x}",
        report.triggered, report.overflow, report.flags
    );
    println!("{:>14}  {:<6} {:>10}  {:>3}/{:<3}  events", "time(ns)", "task", "id", "rp", "cp");
    for r in &report.records {
        println!(
            "{:>14}  {:<6} {:>#10x}  {:>3}/{:<3}  {}",
            r.time,
            r.task,
            r.id,
            r.real_priority,
            r.current_priority,
            r.events.join(" ")
        );
    }
}
