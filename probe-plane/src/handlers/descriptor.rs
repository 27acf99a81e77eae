//! Handler declarations
//!
//! A probe client declares its callbacks up front. Each variant carries a
//! statically typed callable: no argument, or exactly the one argument its
//! trigger supplies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use probe_plane_common::ALL_EVENTS;

use super::resources::PoolUsage;

pub type Callback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
pub type UsageCallback = Arc<dyn Fn(Option<&PoolUsage>) -> anyhow::Result<()> + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&anyhow::Error) -> anyhow::Result<()> + Send + Sync>;
pub type ExitCallback = Arc<dyn Fn(i32) -> anyhow::Result<()> + Send + Sync>;

/// Which inbound events an event handler answers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventSelector {
    Named(String),
    All,
}

impl EventSelector {
    /// Table key: the event name, or the catch-all name
    pub fn key(&self) -> &str {
        match self {
            EventSelector::Named(name) => name,
            EventSelector::All => ALL_EVENTS,
        }
    }
}

#[derive(Clone)]
pub struct TimerHandler {
    pub name: String,
    pub period: Duration,
    /// Optional `${arg}`-style override of `period`, in milliseconds
    pub period_arg: Option<String>,
    pub callback: Callback,
}

#[derive(Clone)]
pub struct EventHandler {
    pub name: String,
    pub selector: EventSelector,
    pub callback: Callback,
}

#[derive(Clone)]
pub struct ThresholdHandler {
    pub name: String,
    /// Pool name; may contain `${arg}` placeholders
    pub pool: String,
    pub threshold: u64,
    /// Pass the pool usage to the callback
    pub track_usage: bool,
    pub callback: UsageCallback,
}

#[derive(Clone)]
pub struct ErrorHandler {
    pub name: String,
    pub callback: ErrorCallback,
}

#[derive(Clone)]
pub struct ExitHandler {
    pub name: String,
    pub callback: ExitCallback,
}

#[derive(Clone)]
pub enum HandlerDescriptor {
    Timer(TimerHandler),
    Event(EventHandler),
    ResourceThreshold(ThresholdHandler),
    Error(ErrorHandler),
    Exit(ExitHandler),
}

impl HandlerDescriptor {
    pub fn timer<F>(name: impl Into<String>, period: Duration, callback: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        HandlerDescriptor::Timer(TimerHandler {
            name: name.into(),
            period,
            period_arg: None,
            callback: Arc::new(callback),
        })
    }

    pub fn on_event<F>(name: impl Into<String>, event: impl Into<String>, callback: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let event = event.into();
        let selector = if event == ALL_EVENTS {
            EventSelector::All
        } else {
            EventSelector::Named(event)
        };
        HandlerDescriptor::Event(EventHandler { name: name.into(), selector, callback: Arc::new(callback) })
    }

    pub fn on_all_events<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        HandlerDescriptor::Event(EventHandler {
            name: name.into(),
            selector: EventSelector::All,
            callback: Arc::new(callback),
        })
    }

    pub fn resource_threshold<F>(
        name: impl Into<String>,
        pool: impl Into<String>,
        threshold: u64,
        callback: F,
    ) -> Self
    where
        F: Fn(Option<&PoolUsage>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        HandlerDescriptor::ResourceThreshold(ThresholdHandler {
            name: name.into(),
            pool: pool.into(),
            threshold,
            track_usage: false,
            callback: Arc::new(callback),
        })
    }

    pub fn on_error<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&anyhow::Error) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        HandlerDescriptor::Error(ErrorHandler { name: name.into(), callback: Arc::new(callback) })
    }

    pub fn on_exit<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(i32) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        HandlerDescriptor::Exit(ExitHandler { name: name.into(), callback: Arc::new(callback) })
    }

    /// Let the client argument named by `arg` (a `${name}` template) override
    /// a timer's period; ignored for other handler kinds
    #[must_use]
    pub fn with_period_arg(mut self, arg: impl Into<String>) -> Self {
        if let HandlerDescriptor::Timer(timer) = &mut self {
            timer.period_arg = Some(arg.into());
        }
        self
    }

    /// Hand the pool usage to a threshold callback; ignored for other kinds
    #[must_use]
    pub fn tracking_usage(mut self) -> Self {
        if let HandlerDescriptor::ResourceThreshold(handler) = &mut self {
            handler.track_usage = true;
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            HandlerDescriptor::Timer(h) => &h.name,
            HandlerDescriptor::Event(h) => &h.name,
            HandlerDescriptor::ResourceThreshold(h) => &h.name,
            HandlerDescriptor::Error(h) => &h.name,
            HandlerDescriptor::Exit(h) => &h.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HandlerDescriptor::Timer(_) => "timer",
            HandlerDescriptor::Event(_) => "event",
            HandlerDescriptor::ResourceThreshold(_) => "threshold",
            HandlerDescriptor::Error(_) => "error",
            HandlerDescriptor::Exit(_) => "exit",
        }
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("HandlerDescriptor");
        out.field("kind", &self.kind()).field("name", &self.name());
        match self {
            HandlerDescriptor::Timer(h) => out.field("period", &h.period).field("period_arg", &h.period_arg),
            HandlerDescriptor::Event(h) => out.field("selector", &h.selector),
            HandlerDescriptor::ResourceThreshold(h) => out
                .field("pool", &h.pool)
                .field("threshold", &h.threshold)
                .field("track_usage", &h.track_usage),
            HandlerDescriptor::Error(_) | HandlerDescriptor::Exit(_) => &mut out,
        };
        out.finish_non_exhaustive()
    }
}
