//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "probe-plane",
    about = "Drive the probe runtime control plane with synthetic probe traffic",
    after_help = "\
EXAMPLES:
    probe-plane                                   4 threads, 1000 probe hits each
    probe-plane --threads 16 --queue-capacity 8   Provoke backpressure drops
    probe-plane --speculative --export out.jsonl  Commit/discard batches, keep the stream
    probe-plane --arg period=5                    Override the timer period (ms)"
)]
pub struct Args {
    /// Client name (made unique with a $N suffix if taken)
    #[arg(long, default_value = "demo")]
    pub client: String,

    /// Outbound command queue capacity [default: $PROBE_PLANE_CMD_QUEUE_LIMIT or 100]
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Client argument as KEY=VALUE (repeatable)
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    pub args: Vec<String>,

    /// Producer threads
    #[arg(long, default_value = "4")]
    pub threads: usize,

    /// Probe hits per producer thread
    #[arg(long, default_value = "1000")]
    pub events: usize,

    /// Buffer probe output speculatively, committing every other batch
    #[arg(long)]
    pub speculative: bool,

    /// Timer handler period in milliseconds (overridden by --arg period=N)
    #[arg(long, default_value = "10")]
    pub timer_ms: u64,

    /// Export delivered commands as JSON lines
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
