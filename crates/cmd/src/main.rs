// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand};
use snafu::{ResultExt, Whatever, whatever};
use spool_common_telemetry::{LoggingOptions, init_global_logging, set_panic_hook};
use spool_queue::{Queue, QueueBuilder, ReclaimPolicy, ShutdownHook, SnapshotRegistry};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

mod build_info;

const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

#[derive(Debug, Parser)]
#[clap(
name = "spool",
about = "Inspect and operate fixed-capacity spool queues",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION)]
struct Cli {
    /// Log filter directives, e.g. `info` or `spool_queue=debug`
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Push(PushArgs),
    Pop(PopArgs),
    Stat(StatArgs),
    Dump(DumpArgs),
    Hold(HoldArgs),
}

/// A file-backed queue. File queues always use the compaction policy.
#[derive(Debug, Clone, Args)]
struct FileQueueArgs {
    /// Arena file; created and zero-filled if missing
    #[arg(long)]
    file: PathBuf,

    /// Arena size in bytes; must match an existing file
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: u64,
}

impl FileQueueArgs {
    fn open(&self) -> Result<Queue, Whatever> {
        let name = self
            .file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("spool")
            .to_string();

        QueueBuilder::new(name)
            .capacity(self.capacity)
            .file(&self.file)
            .policy(ReclaimPolicy::compaction())
            .build()
            .with_whatever_context(|_| format!("failed to open queue at {}", self.file.display()))
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Appends each payload as one record.
Examples:

spool push --file orders.arena --capacity 4096 o-1 o-2

")]
struct PushArgs {
    #[command(flatten)]
    queue: FileQueueArgs,

    #[arg(required = true)]
    payloads: Vec<String>,
}

impl PushArgs {
    fn run(&self) -> Result<(), Whatever> {
        let queue = self.queue.open()?;
        for payload in &self.payloads {
            let pushed = queue
                .push(payload.as_bytes())
                .with_whatever_context(|_| format!("failed to push {payload:?}"))?;
            if !pushed {
                whatever!(
                    "queue is full: {} of {} bytes used, {payload:?} not pushed",
                    queue.used_space(),
                    queue.capacity()
                );
            }
        }
        queue.close().whatever_context("failed to close queue")?;
        println!("pushed {}", self.payloads.len());
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Removes records from the front and prints them, one per line.
Examples:

spool pop --file orders.arena --capacity 4096 --count 2

")]
struct PopArgs {
    #[command(flatten)]
    queue: FileQueueArgs,

    #[arg(long, default_value_t = 1)]
    count: usize,
}

impl PopArgs {
    fn run(&self) -> Result<(), Whatever> {
        let queue = self.queue.open()?;
        for _ in 0..self.count {
            match queue.pop().whatever_context("failed to pop")? {
                Some(payload) => println!("{}", String::from_utf8_lossy(&payload)),
                None => break,
            }
        }
        queue.close().whatever_context("failed to close queue")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Recovers the queue and prints its cursor state.
Examples:

spool stat --file orders.arena --capacity 4096

")]
struct StatArgs {
    #[command(flatten)]
    queue: FileQueueArgs,
}

impl StatArgs {
    fn run(&self) -> Result<(), Whatever> {
        let queue = self.queue.open()?;
        let state = queue.state();
        println!("name:          {}", queue.name());
        println!("policy:        {:?}", queue.policy());
        println!("capacity:      {}", state.capacity());
        println!("items:         {}", state.item_count());
        println!("read_offset:   {}", state.read_offset());
        println!("write_offset:  {}", state.write_offset());
        println!("wrap_boundary: {}", state.wrap_boundary());
        println!("used:          {}", state.used_space());
        println!("free:          {}", queue.free_space());
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Writes a snapshot of the queue into a directory.
Examples:

spool dump --file orders.arena --capacity 4096 --out ./snapshots

")]
struct DumpArgs {
    #[command(flatten)]
    queue: FileQueueArgs,

    #[arg(long)]
    out: PathBuf,
}

impl DumpArgs {
    fn run(&self) -> Result<(), Whatever> {
        let queue = self.queue.open()?;
        let path = queue
            .save_snapshot(&self.out)
            .with_whatever_context(|_| format!("failed to snapshot into {}", self.out.display()))?;
        println!("{}", path.display());
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Holds a memory queue fed from stdin, one record per line. The queue is
restored from the snapshot directory on start and snapshotted back on EOF,
Ctrl-C or SIGTERM.
Examples:

tail -f events.log | spool hold --name events --snapshot-dir ./snapshots

")]
struct HoldArgs {
    #[arg(long)]
    name: String,

    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: u64,

    #[arg(long)]
    snapshot_dir: PathBuf,
}

impl HoldArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let queue = Arc::new(
            QueueBuilder::new(&self.name)
                .capacity(self.capacity)
                .memory()
                .snapshot_dir(&self.snapshot_dir)
                .build()
                .with_whatever_context(|_| format!("failed to open queue {}", self.name))?,
        );
        info!(queue = %self.name, items = queue.len(), "Holding queue");

        let registry = Arc::new(SnapshotRegistry::new(&self.snapshot_dir));
        registry.register(Arc::clone(&queue));
        let hook = ShutdownHook::install(registry);
        let shutdown = hook.token();
        let producer = hook.producer();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                line = lines.next_line() => line.whatever_context("failed to read stdin")?,
            };
            let Some(line) = line else {
                hook.trigger();
                break;
            };
            if line.is_empty() {
                continue;
            }
            match queue.push(line.as_bytes()) {
                Ok(true) => {}
                Ok(false) => warn!(queue = %self.name, "Queue full, line dropped"),
                Err(e) => warn!(queue = %self.name, error = %e, "Line rejected"),
            }
        }

        drop(producer);

        let saved = hook.wait().await.whatever_context("failed to snapshot on exit")?;
        println!("held {} records, {saved} snapshot(s) written", queue.len());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();

    let opts = LoggingOptions {
        level: Some(cli.log_level.clone()),
        ..Default::default()
    };
    let _guards = init_global_logging("spool", &opts);
    set_panic_hook();

    match cli.commands {
        Commands::Push(args) => args.run(),
        Commands::Pop(args) => args.run(),
        Commands::Stat(args) => args.run(),
        Commands::Dump(args) => args.run(),
        Commands::Hold(args) => args.run().await,
    }
}
