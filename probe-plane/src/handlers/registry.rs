//! Handler tables
//!
//! Handlers are registered while the client is being set up and the
//! registry is frozen once the runtime owns it. Arguments (timer periods,
//! pool names) are resolved against the client arguments at `start()`. The
//! event table is only built the first time an event arrives, with its keys
//! resolved against the client arguments.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use log::{debug, warn};
use probe_plane_common::ALL_EVENTS;

use super::descriptor::{ErrorHandler, EventHandler, ExitHandler, HandlerDescriptor, ThresholdHandler, TimerHandler};
use super::scheduler::TimerTask;
use crate::config::ClientArgs;

#[derive(Default)]
pub struct HandlerRegistry {
    timers: Vec<TimerHandler>,
    events: Vec<EventHandler>,
    thresholds: Vec<ThresholdHandler>,
    errors: Vec<ErrorHandler>,
    exits: Vec<ExitHandler>,
    /// Event key to indexes into `events`
    event_table: OnceLock<HashMap<String, Vec<usize>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: HandlerDescriptor) -> &mut Self {
        debug!("Registering {} handler {}", descriptor.kind(), descriptor.name());
        match descriptor {
            HandlerDescriptor::Timer(h) => self.timers.push(h),
            HandlerDescriptor::Event(h) => {
                self.events.push(h);
                self.event_table = OnceLock::new();
            }
            HandlerDescriptor::ResourceThreshold(h) => self.thresholds.push(h),
            HandlerDescriptor::Error(h) => self.errors.push(h),
            HandlerDescriptor::Exit(h) => self.exits.push(h),
        }
        self
    }

    #[must_use]
    pub fn with(mut self, descriptor: HandlerDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn len(&self) -> usize {
        self.timers.len() + self.events.len() + self.thresholds.len() + self.errors.len() + self.exits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timer tasks with their periods resolved against `args`
    ///
    /// A period argument is parsed as milliseconds and falls back to the
    /// declared period when it does not parse. Zero periods are left out.
    pub fn resolve_timers(&self, args: &ClientArgs) -> Vec<TimerTask> {
        self.timers
            .iter()
            .filter_map(|timer| {
                let period = resolve_period(timer, args);
                if period.is_zero() {
                    warn!("Timer handler {} has a zero period and is disabled", timer.name);
                    return None;
                }
                Some(TimerTask { name: timer.name.clone(), period, callback: timer.callback.clone() })
            })
            .collect()
    }

    /// Threshold handlers with pool names resolved against `args`
    pub fn resolve_thresholds(&self, args: &ClientArgs) -> Vec<ThresholdHandler> {
        self.thresholds
            .iter()
            .map(|handler| ThresholdHandler { pool: args.template(&handler.pool), ..handler.clone() })
            .collect()
    }

    /// Handlers for event `name`, or the catch-all handlers if none match
    ///
    /// `args` only matter for the first call, which builds the table.
    pub fn event_handlers(&self, name: &str, args: &ClientArgs) -> Vec<&EventHandler> {
        let table = self.event_table.get_or_init(|| {
            let mut table: HashMap<String, Vec<usize>> = HashMap::new();
            for (idx, handler) in self.events.iter().enumerate() {
                table.entry(args.template(handler.selector.key())).or_default().push(idx);
            }
            debug!("Built event table with {} keys", table.len());
            table
        });
        table
            .get(name)
            .or_else(|| table.get(ALL_EVENTS))
            .map(|idxs| idxs.iter().map(|&i| &self.events[i]).collect())
            .unwrap_or_default()
    }

    pub fn error_handlers(&self) -> &[ErrorHandler] {
        &self.errors
    }

    pub fn exit_handlers(&self) -> &[ExitHandler] {
        &self.exits
    }

    pub fn has_thresholds(&self) -> bool {
        !self.thresholds.is_empty()
    }
}

fn resolve_period(timer: &TimerHandler, args: &ClientArgs) -> Duration {
    let Some(arg) = &timer.period_arg else {
        return timer.period;
    };
    let resolved = args.template(arg);
    match resolved.trim().parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(_) => {
            debug!(
                "Timer {} period argument {arg:?} resolved to {resolved:?}, using {:?}",
                timer.name, timer.period
            );
            timer.period
        }
    }
}
