//! # Runtime Instance
//!
//! One instance per attached probe client. It owns the outbound channel and
//! its delivery thread, the speculation manager, the handler tables, the perf
//! counters and the lifecycle state.
//!
//! ```text
//!  instrumented threads                     instance-owned threads
//!  ────────────────────                     ──────────────────────
//!  probe(|| ..)                              timer scheduler ──┐
//!    enter ─▶ send(cmd) ─▶ speculation ─┐    threshold listener │ fire(handler)
//!    leave        │          buffer     │      └─▶ callback worker ┘   under enter/leave
//!                 └──────────────▶ EventChannel ─▶ delivery thread ─▶ CommandListener
//! ```
//!
//! Lifecycle: `Created → Started → Running → Exiting → Terminated`. The
//! delivery thread runs from construction, so commands sent before `start()`
//! are delivered. `exit()` is the only orderly way out and runs at most once.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::anyhow;
use log::{debug, info, warn};
use parking_lot::Mutex;
use probe_plane_common::{Command, CommandListener, ALL_EVENTS};
use serde::Serialize;

use crate::channel::{self, ChannelStats, EventChannel, SendOutcome};
use crate::config::{ClientArgs, RuntimeConfig};
use crate::counters::PerfCounters;
use crate::domain::{ExitRequested, InstanceId, LifecycleState, RuntimeError, SpeculationId};
use crate::guard::{self, ProbeScope};
use crate::handlers::worker::join_unless_current;
use crate::handlers::{
    ArmedThreshold, CallbackWorker, HandlerRegistry, ResourceMonitor, ThresholdListener,
    TimerScheduler,
};
use crate::speculation::SpeculativeBufferManager;

/// Threads started by `start()` and stopped by `exit()`
#[derive(Default)]
struct Services {
    scheduler: Option<TimerScheduler>,
    listener: Option<ThresholdListener>,
    worker: Option<CallbackWorker>,
}

impl Services {
    fn shutdown(mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.cancel();
        }
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

/// Point-in-time view of an instance, for summaries and diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub client: String,
    pub instance: u64,
    pub state: String,
    pub level: i32,
    pub channel: ChannelStats,
    pub live_speculations: usize,
    pub speculative_overflows: u64,
}

pub struct RuntimeInstance {
    id: InstanceId,
    config: RuntimeConfig,
    created: Instant,
    channel: EventChannel,
    speculation: SpeculativeBufferManager,
    handlers: HandlerRegistry,
    counters: PerfCounters,
    state: AtomicU8,
    exiting: AtomicBool,
    disabled: AtomicBool,
    level: AtomicI32,
    delivery: Mutex<Option<JoinHandle<()>>>,
    services: Mutex<Services>,
    weak_self: Weak<RuntimeInstance>,
}

impl RuntimeInstance {
    /// Create an instance delivering to `listener`
    ///
    /// The delivery thread starts immediately; handlers stay inert until
    /// [`start`](Self::start).
    ///
    /// # Errors
    /// Returns [`RuntimeError::Config`] for an invalid configuration and
    /// [`RuntimeError::ThreadSpawn`] if the delivery thread can not be started
    pub fn new<L>(
        config: RuntimeConfig,
        handlers: HandlerRegistry,
        listener: L,
    ) -> Result<Arc<Self>, RuntimeError>
    where
        L: CommandListener + 'static,
    {
        config.validate()?;
        let id = InstanceId::next();
        let (channel, mut consumer) = channel::bounded(config.queue_capacity, config.backoff);
        let wait = config.wait;
        let client = config.client_name.clone();

        let delivery = thread::Builder::new()
            .name(format!("probe-plane-delivery-{}", id.0))
            .spawn(move || {
                let mut listener = listener;
                let reason = consumer.drain(&mut listener, &wait, || true);
                let flushed = consumer.close(&mut listener);
                debug!("Delivery for {client} finished ({reason:?}, {flushed} flushed on close)");
            })
            .map_err(|source| RuntimeError::ThreadSpawn { thread: "delivery", source })?;

        let level = config.instrumentation_level().unwrap_or(0);
        info!(
            "Created runtime {id} for client {} (queue capacity {}, {} handlers)",
            config.client_name,
            config.queue_capacity,
            handlers.len()
        );

        Ok(Arc::new_cyclic(|weak_self| Self {
            id,
            speculation: SpeculativeBufferManager::new(config.speculation),
            config,
            created: Instant::now(),
            channel,
            handlers,
            counters: PerfCounters::new(),
            state: AtomicU8::new(LifecycleState::Created.as_u8()),
            exiting: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            level: AtomicI32::new(level),
            delivery: Mutex::new(Some(delivery)),
            services: Mutex::new(Services::default()),
            weak_self: weak_self.clone(),
        }))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn client_name(&self) -> &str {
        &self.config.client_name
    }

    pub fn args(&self) -> &ClientArgs {
        &self.config.args
    }

    pub fn counters(&self) -> &PerfCounters {
        &self.counters
    }

    pub fn speculation(&self) -> &SpeculativeBufferManager {
        &self.speculation
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn level(&self) -> i32 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn set_level(&self, level: i32) {
        self.level.store(level, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            client: self.config.client_name.clone(),
            instance: self.id.0,
            state: self.state().to_string(),
            level: self.level(),
            channel: self.channel.stats(),
            live_speculations: self.speculation.live_buffers(),
            speculative_overflows: self.speculation.overflow_count(),
        }
    }

    // ========================================================================
    // Guard
    // ========================================================================

    /// Claim the calling thread for this instance; refused while disabled or
    /// when the thread is already inside a probe
    #[inline]
    pub fn enter(&self) -> bool {
        !self.is_disabled() && guard::enter(self.id)
    }

    #[inline]
    pub fn leave(&self) {
        guard::leave();
    }

    pub fn scope(&self) -> Option<ProbeScope> {
        if self.is_disabled() {
            return None;
        }
        ProbeScope::try_enter(self.id)
    }

    pub fn escape<T>(&self, body: impl FnOnce() -> T) -> T {
        guard::escape(body)
    }

    /// Run generated probe code: enter, run `body`, report failures, leave
    ///
    /// Returns false when the probe was skipped because the thread was already
    /// inside one or the instance is disabled.
    pub fn probe(&self, body: impl FnOnce() -> anyhow::Result<()>) -> bool {
        let Some(_scope) = self.scope() else {
            return false;
        };
        match catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.handle_exception(err),
            Err(panic) => self.handle_exception(anyhow!("probe panicked: {}", panic_message(&*panic))),
        }
        true
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Route `cmd` through the calling thread's speculative buffer, or
    /// straight into the channel
    ///
    /// Refused with [`SendOutcome::Closed`] once the instance is disabled.
    pub fn send(&self, cmd: Command) -> SendOutcome {
        if self.is_disabled() {
            return SendOutcome::Closed;
        }
        match self.speculation.route(cmd) {
            Ok(()) => SendOutcome::Buffered,
            Err(cmd) if cmd.is_exit() => self.channel.send_reliable(cmd),
            Err(cmd) => self.channel.send(cmd),
        }
    }

    pub fn send_message(&self, text: impl Into<String>) -> SendOutcome {
        let timestamp = if self.config.message_timestamps {
            u64::try_from(self.created.elapsed().as_nanos()).unwrap_or(u64::MAX)
        } else {
            0
        };
        self.send(Command::message_at(text, timestamp))
    }

    pub fn speculate(&self) -> Option<SpeculationId> {
        self.speculation.begin()
    }

    pub fn activate(&self, id: SpeculationId) -> Result<(), RuntimeError> {
        Ok(self.speculation.activate(id)?)
    }

    pub fn commit(&self, id: SpeculationId) -> Result<SendOutcome, RuntimeError> {
        Ok(self.speculation.commit(id, &self.channel)?)
    }

    pub fn discard(&self, id: SpeculationId) -> Result<usize, RuntimeError> {
        Ok(self.speculation.discard(id)?)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Arm timer handlers
    ///
    /// # Errors
    /// [`RuntimeError::InvalidTransition`] unless the instance is freshly
    /// created, [`RuntimeError::ThreadSpawn`] if a handler thread can not start
    pub fn start(&self) -> Result<(), RuntimeError> {
        self.start_inner(None)
    }

    /// Arm timer handlers and threshold handlers against `monitor`
    ///
    /// # Errors
    /// As for [`start`](Self::start)
    pub fn start_with_resources(&self, monitor: Arc<dyn ResourceMonitor>) -> Result<(), RuntimeError> {
        self.start_inner(Some(monitor))
    }

    fn start_inner(&self, monitor: Option<Arc<dyn ResourceMonitor>>) -> Result<(), RuntimeError> {
        self.transition(LifecycleState::Created, LifecycleState::Started)
            .map_err(|state| RuntimeError::InvalidTransition { action: "start", state })?;

        let mut services = self.services.lock();
        if self.exiting.load(Ordering::Acquire) {
            return Err(RuntimeError::InvalidTransition { action: "start", state: self.state() });
        }

        let timers = self.handlers.resolve_timers(&self.config.args);
        if !timers.is_empty() {
            debug!("{self}: scheduling {} timer handlers", timers.len());
            let weak = self.weak_self.clone();
            services.scheduler = Some(TimerScheduler::spawn(self.thread_name("timer"), timers, move |task| {
                if let Some(runtime) = weak.upgrade() {
                    runtime.fire("timer", &task.name, || (task.callback)());
                }
            })?);
        }

        if let Some(monitor) = monitor {
            self.arm_thresholds(&mut services, monitor)?;
        }
        drop(services);

        if self.transition(LifecycleState::Started, LifecycleState::Running).is_ok() {
            info!("{self} running");
        }
        Ok(())
    }

    fn arm_thresholds(
        &self,
        services: &mut Services,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Result<(), RuntimeError> {
        let pools = monitor.pools();
        let mut levels: HashMap<String, u64> = HashMap::new();
        let mut armed = Vec::new();

        for handler in self.handlers.resolve_thresholds(&self.config.args) {
            let capable = pools.iter().any(|p| p.name == handler.pool && p.supports_threshold);
            if !capable {
                debug!("Threshold handler {} has no usable pool {}", handler.name, handler.pool);
                continue;
            }
            levels
                .entry(handler.pool.clone())
                .and_modify(|level| *level = (*level).min(handler.threshold))
                .or_insert(handler.threshold);
            armed.push(ArmedThreshold {
                name: handler.name,
                pool: handler.pool,
                threshold: handler.threshold,
                track_usage: handler.track_usage,
                callback: handler.callback,
            });
        }
        if armed.is_empty() {
            return Ok(());
        }
        for (pool, level) in &levels {
            if monitor.set_usage_threshold(pool, *level) {
                debug!("{self}: pool {pool} armed at {level}");
            }
        }

        let worker = CallbackWorker::spawn(self.thread_name("worker"))?;
        let jobs = worker.handle();
        services.worker = Some(worker);

        let weak = self.weak_self.clone();
        services.listener = Some(ThresholdListener::spawn(
            self.thread_name("threshold"),
            monitor,
            armed,
            move |handler, usage| {
                let weak = weak.clone();
                let handler = handler.clone();
                jobs.submit(move || {
                    if let Some(runtime) = weak.upgrade() {
                        let argument = handler.argument(usage);
                        runtime.fire("threshold", &handler.name, || (handler.callback)(argument.as_ref()));
                    }
                });
            },
        )?);
        Ok(())
    }

    /// Tear the instance down and send `Exit(code)` to the observer
    ///
    /// Runs once; returns false for every call after the first. Safe to call
    /// from any thread, including handler threads of this instance and the
    /// delivery thread (from inside the listener).
    pub fn exit(&self, code: i32) -> bool {
        if self.exiting.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            debug!("{self}: exit({code}) ignored, already exiting");
            return false;
        }
        info!("{self} exiting with code {code}");
        self.state.store(LifecycleState::Exiting.as_u8(), Ordering::Release);

        let services = std::mem::take(&mut *self.services.lock());
        services.shutdown();

        for handler in self.handlers.exit_handlers() {
            self.escaped_probe(|| {
                if let Some(err) = self.run_handler("exit", &handler.name, || (handler.callback)(code)) {
                    warn!("Exit handler {} failed: {err:#}", handler.name);
                }
            });
        }

        if self.channel.send_reliable(Command::exit(code)) == SendOutcome::Closed {
            warn!("{self}: channel closed before exit({code}) was queued");
        }
        self.disabled.store(true, Ordering::Release);
        self.speculation.clear();
        self.state.store(LifecycleState::Terminated.as_u8(), Ordering::Release);

        let delivery = self.delivery.lock().take();
        if let Some(handle) = delivery {
            join_unless_current(handle, "delivery");
        }
        info!("{self} terminated");
        true
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Commands from the observer
    pub fn on_inbound(&self, cmd: Command) {
        match cmd {
            Command::Event { name } => self.handle_event(name.as_deref().unwrap_or(ALL_EVENTS)),
            Command::Exit { code } => {
                self.exit(code);
            }
            other => debug!("{self}: ignoring inbound {:?}", other.kind()),
        }
    }

    /// Run the handlers for event `name`, or the catch-all handlers
    pub fn handle_event(&self, name: &str) {
        let handlers = self.handlers.event_handlers(name, &self.config.args);
        if handlers.is_empty() {
            debug!("{self}: no handler for event {name}");
            return;
        }
        guard::escape(|| {
            guard::preserve_fault(|| {
                for handler in handlers {
                    self.fire("event", &handler.name, || (handler.callback)());
                }
            });
        });
    }

    /// Report a probe failure
    ///
    /// Ignored while another failure is being reported on this thread. An
    /// [`ExitRequested`] turns into `exit(code)`. Otherwise the error
    /// handlers run, or, without any, an `Error` command goes straight to the
    /// channel.
    pub fn handle_exception(&self, err: anyhow::Error) {
        let Some(_fault) = guard::begin_fault() else {
            debug!("{self}: dropping nested fault: {err:#}");
            return;
        };
        if let Some(&ExitRequested(code)) = err.downcast_ref::<ExitRequested>() {
            self.exit(code);
            return;
        }

        let handlers = self.handlers.error_handlers();
        if handlers.is_empty() {
            if self.channel.send(Command::error(format!("{err:#}"))) == SendOutcome::Dropped {
                debug!("{self}: error report dropped under backpressure");
            }
            return;
        }
        for handler in handlers {
            self.escaped_probe(|| {
                if let Some(failure) = self.run_handler("error", &handler.name, || (handler.callback)(&err)) {
                    warn!("Error handler {} failed: {failure:#}", handler.name);
                }
            });
        }
    }

    /// Run a handler under this thread's guard slot; failures are reported
    fn fire(&self, kind: &str, name: &str, body: impl FnOnce() -> anyhow::Result<()>) {
        let Some(_scope) = self.scope() else {
            debug!("{self}: skipping {kind} handler {name}, thread busy or instance disabled");
            return;
        };
        if let Some(err) = self.run_handler(kind, name, body) {
            if err.downcast_ref::<ExitRequested>().is_none() {
                warn!("{kind} handler {name} failed: {err:#}");
            }
            self.handle_exception(err);
        }
    }

    /// Run `body` with the slot vacated and re-entered for this instance
    fn escaped_probe(&self, body: impl FnOnce()) {
        guard::escape(|| {
            if let Some(_scope) = self.scope() {
                body();
            }
        });
    }

    /// Call a handler body, turning panics into logged failures
    fn run_handler(
        &self,
        kind: &str,
        name: &str,
        body: impl FnOnce() -> anyhow::Result<()>,
    ) -> Option<anyhow::Error> {
        match catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(panic) => {
                warn!("{kind} handler {name} panicked: {}", panic_message(&*panic));
                None
            }
        }
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<(), LifecycleState> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LifecycleState::from_u8)
    }

    fn thread_name(&self, role: &str) -> String {
        format!("probe-plane-{role}-{}", self.id.0)
    }
}

impl fmt::Display for RuntimeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.config.client_name, self.id)
    }
}

impl Drop for RuntimeInstance {
    fn drop(&mut self) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("{self} dropped without exit, tearing down");
        self.disabled.store(true, Ordering::Release);
        std::mem::take(self.services.get_mut()).shutdown();
        self.channel.request_stop();
        self.state.store(LifecycleState::Terminated.as_u8(), Ordering::Release);
        if let Some(handle) = self.delivery.get_mut().take() {
            join_unless_current(handle, "delivery");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
