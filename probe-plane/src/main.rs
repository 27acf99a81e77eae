//! # probe-plane - Headless Driver
//!
//! Attaches one client to a fresh registry, hammers it from several producer
//! threads through the full plane (guard, optional speculation, channel,
//! delivery), fires a timer and an inbound event, then exits the client and
//! prints what the observer received.

use std::io;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use probe_plane::cli::Args;
use probe_plane::config::{ClientArgs, RuntimeConfig};
use probe_plane::counters::PerfValue;
use probe_plane::domain::{ConfigError, RuntimeError};
use probe_plane::export::{CollectingSink, JsonLinesSink};
use probe_plane::handlers::{HandlerDescriptor, HandlerRegistry};
use probe_plane::runtime::{ClientRegistry, RuntimeInstance, RuntimeStats};
use probe_plane_common::{Command, CommandKind, CommandListener};
use serde::Serialize;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

const PROBE_HITS: &str = "probe.hits";
const BATCH: usize = 10;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let usage = err.chain().any(|cause| {
        cause.is::<ConfigError>()
            || matches!(cause.downcast_ref::<RuntimeError>(), Some(RuntimeError::Config(_)))
    });
    if usage {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[derive(Serialize)]
struct Summary {
    client: String,
    elapsed_ms: f64,
    probe_hits: i64,
    delivered: usize,
    messages: usize,
    timer_ticks: usize,
    drop_notices: usize,
    errors: usize,
    runtime: RuntimeStats,
}

fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let mut config = RuntimeConfig::new(args.client.clone())
        .with_args(ClientArgs::from_arg_line(&args.args))
        .with_message_timestamps(true);
    if let Some(capacity) = args.queue_capacity {
        config = config.with_queue_capacity(capacity);
    }
    config.validate()?;

    // Handlers are declared before the instance exists
    let slot: Arc<OnceLock<Weak<RuntimeInstance>>> = Arc::new(OnceLock::new());
    let handlers = demo_handlers(&slot, args.timer_ms);

    let collected = CollectingSink::new();
    let listener = tee(&args, collected.clone())?;

    let registry = ClientRegistry::new();
    let runtime = registry.attach(config, handlers, listener).context("Failed to attach client")?;
    let _ = slot.set(Arc::downgrade(&runtime));
    runtime.counters().declare(PROBE_HITS, PerfValue::Long(0), "Probe bodies executed")?;

    if !quiet {
        println!("probe-plane v{}", env!("CARGO_PKG_VERSION"));
        println!(
            "client {} | {} threads x {} hits | speculative: {}",
            runtime.client_name(),
            args.threads,
            args.events,
            args.speculative
        );
    }

    runtime.start().context("Failed to start client")?;
    let started = Instant::now();

    thread::scope(|scope| -> Result<()> {
        let producers: Vec<_> = (0..args.threads)
            .map(|idx| {
                let runtime = &runtime;
                let (events, speculative) = (args.events, args.speculative);
                thread::Builder::new()
                    .name(format!("producer-{idx}"))
                    .spawn_scoped(scope, move || produce(runtime, idx, events, speculative))
            })
            .collect::<io::Result<_>>()
            .context("Failed to spawn producer thread")?;
        for producer in producers {
            producer
                .join()
                .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
        }
        Ok(())
    })?;

    // Give the timer a chance to fire at least once on short runs
    let min_run = Duration::from_millis(args.timer_ms.saturating_mul(2));
    if let Some(rest) = min_run.checked_sub(started.elapsed()) {
        thread::sleep(rest);
    }

    runtime.on_inbound(Command::event(Some("dump")));
    let probe_hits = runtime.counters().get_long(PROBE_HITS)?;
    let detached = registry.shutdown(0);
    debug!("Detached {detached} clients");

    let messages = collected.messages();
    let summary = Summary {
        client: runtime.client_name().to_string(),
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        probe_hits,
        delivered: collected.len(),
        messages: messages.len(),
        timer_ticks: messages.iter().filter(|m| m.as_str() == "tick").count(),
        drop_notices: messages.iter().filter(|m| m.starts_with("Dropped ")).count(),
        errors: collected.count(CommandKind::Error),
        runtime: runtime.stats(),
    };
    info!("Run finished: {} commands delivered", summary.delivered);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if !quiet {
        print_summary(&summary);
    }
    if let Some(path) = &args.export {
        if !quiet {
            println!("exported {} commands to {}", summary.delivered, path.display());
        }
    }
    Ok(())
}

/// Timer, event and exit handlers that talk back through the instance in `slot`
fn demo_handlers(slot: &Arc<OnceLock<Weak<RuntimeInstance>>>, timer_ms: u64) -> HandlerRegistry {
    let runtime = |slot: &Arc<OnceLock<Weak<RuntimeInstance>>>| {
        let slot = Arc::clone(slot);
        move || slot.get().and_then(Weak::upgrade)
    };

    let tick = runtime(slot);
    let dump = runtime(slot);
    let bye = runtime(slot);

    HandlerRegistry::new()
        .with(
            HandlerDescriptor::timer("tick", Duration::from_millis(timer_ms), move || {
                if let Some(rt) = tick() {
                    rt.send_message("tick");
                }
                Ok(())
            })
            .with_period_arg("${period}"),
        )
        .with(HandlerDescriptor::on_event("dump", "dump", move || {
            if let Some(rt) = dump() {
                for (name, value) in rt.counters().snapshot() {
                    rt.send_message(format!("{name} = {value:?}"));
                }
            }
            Ok(())
        }))
        .with(HandlerDescriptor::on_exit("farewell", move |code| {
            if let Some(rt) = bye() {
                rt.send_message(format!("client exiting with code {code}"));
            }
            Ok(())
        }))
}

/// Deliver to the collector and, with `--export`, to a JSON-lines file
fn tee(args: &Args, mut collected: CollectingSink) -> Result<impl CommandListener + 'static> {
    let mut export = match &args.export {
        Some(path) => Some(
            JsonLinesSink::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => None,
    };
    Ok(move |cmd: Command| -> io::Result<()> {
        if let Some(sink) = export.as_mut() {
            sink.on_command(cmd.clone())?;
        }
        collected.on_command(cmd)
    })
}

fn produce(runtime: &RuntimeInstance, thread: usize, events: usize, speculative: bool) -> Result<()> {
    for (batch, start) in (0..events).step_by(BATCH).enumerate() {
        let speculation = if speculative { runtime.speculate() } else { None };
        if let Some(id) = speculation {
            runtime.activate(id)?;
        }
        for hit in start..(start + BATCH).min(events) {
            runtime.probe(|| {
                runtime.send_message(format!("thread {thread} hit {hit}"));
                runtime.counters().add_long(PROBE_HITS, 1)?;
                Ok(())
            });
        }
        if let Some(id) = speculation {
            if batch % 2 == 0 {
                runtime.commit(id)?;
            } else {
                runtime.discard(id)?;
            }
        }
    }
    Ok(())
}

fn print_summary(summary: &Summary) {
    let channel = &summary.runtime.channel;
    println!();
    println!("client          {}", summary.client);
    println!("state           {}", summary.runtime.state);
    println!("elapsed         {:.1} ms", summary.elapsed_ms);
    println!("probe hits      {}", summary.probe_hits);
    println!("delivered       {} ({} messages, {} errors)", summary.delivered, summary.messages, summary.errors);
    println!("timer ticks     {}", summary.timer_ticks);
    println!("dropped         {} ({} notices)", channel.dropped_total, summary.drop_notices);
    println!(
        "queue           capacity {}, enqueued {}, delivered {}",
        channel.capacity, channel.enqueued, channel.delivered
    );
    println!(
        "speculation     {} live buffers, {} overflows",
        summary.runtime.live_speculations, summary.runtime.speculative_overflows
    );
}
