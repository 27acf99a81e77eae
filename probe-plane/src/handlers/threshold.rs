//! Resource threshold listener
//!
//! Owns a monitor subscription and a thread waiting on it. Every usage sample
//! is checked against each armed handler for that pool; a handler fires when
//! usage rises to its own threshold and re-arms once usage falls below it.
//! Firing hands the handler to a dispatch function, which the runtime points
//! at its callback worker.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Sender};
use log::debug;

use super::descriptor::UsageCallback;
use super::resources::{PoolUsage, ResourceMonitor, SubscriptionId, ThresholdNotification};
use super::worker::join_unless_current;
use crate::domain::RuntimeError;

/// A threshold handler bound to a pool the monitor accepted
#[derive(Clone)]
pub struct ArmedThreshold {
    pub name: String,
    pub pool: String,
    pub threshold: u64,
    pub track_usage: bool,
    pub callback: UsageCallback,
}

impl ArmedThreshold {
    /// Whether `notification` should trigger this handler
    pub fn matches(&self, notification: &ThresholdNotification) -> bool {
        self.pool == notification.pool && notification.usage.used >= self.threshold
    }

    /// The argument handed to the callback
    pub fn argument(&self, usage: PoolUsage) -> Option<PoolUsage> {
        self.track_usage.then_some(usage)
    }
}

/// Rising-edge detection per handler over a stream of usage samples
struct Crossings {
    reached: Vec<bool>,
}

impl Crossings {
    fn new(handlers: &[ArmedThreshold]) -> Self {
        Self { reached: vec![false; handlers.len()] }
    }

    /// Handlers whose threshold `notification` reaches for the first time
    /// since usage was last below it
    fn fired<'a>(
        &mut self,
        handlers: &'a [ArmedThreshold],
        notification: &ThresholdNotification,
    ) -> Vec<&'a ArmedThreshold> {
        let mut fired = Vec::new();
        for (handler, reached) in handlers.iter().zip(self.reached.iter_mut()) {
            if handler.pool != notification.pool {
                continue;
            }
            let now = handler.matches(notification);
            if now && !*reached {
                fired.push(handler);
            }
            *reached = now;
        }
        fired
    }
}

pub struct ThresholdListener {
    monitor: Arc<dyn ResourceMonitor>,
    subscription: SubscriptionId,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ThresholdListener {
    /// Subscribe to `monitor` and dispatch matching notifications
    pub fn spawn<D>(
        thread_name: String,
        monitor: Arc<dyn ResourceMonitor>,
        handlers: Vec<ArmedThreshold>,
        dispatch: D,
    ) -> Result<Self, RuntimeError>
    where
        D: Fn(&ArmedThreshold, PoolUsage) + Send + 'static,
    {
        let subscription = monitor.subscribe();
        let id = subscription.id;
        let notifications = subscription.notifications;
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let spawned = thread::Builder::new().name(thread_name).spawn(move || {
            let mut crossings = Crossings::new(&handlers);
            loop {
                select! {
                    recv(notifications) -> msg => {
                        let Ok(notification) = msg else { break };
                        for handler in crossings.fired(&handlers, &notification) {
                            debug!(
                                "Pool {} reached {} for handler {} ({} used)",
                                notification.pool, handler.threshold, handler.name, notification.usage.used
                            );
                            dispatch(handler, notification.usage);
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
        });

        match spawned {
            Ok(handle) => Ok(Self {
                monitor,
                subscription: id,
                stop: Some(stop_tx),
                handle: Some(handle),
            }),
            Err(source) => {
                monitor.unsubscribe(id);
                Err(RuntimeError::ThreadSpawn { thread: "threshold listener", source })
            }
        }
    }

    /// Drop the subscription and stop the listener thread
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            self.monitor.unsubscribe(self.subscription);
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            join_unless_current(handle, "threshold listener");
        }
    }
}

impl Drop for ThresholdListener {
    fn drop(&mut self) {
        self.stop();
    }
}
