//! Probe client handlers: declarations, tables and the threads that fire them

pub mod descriptor;
pub mod registry;
pub mod resources;
pub mod scheduler;
pub mod threshold;
pub mod worker;

pub use descriptor::{
    Callback, ErrorCallback, ErrorHandler, EventHandler, EventSelector, ExitCallback, ExitHandler,
    HandlerDescriptor, ThresholdHandler, TimerHandler, UsageCallback,
};
pub use registry::HandlerRegistry;
pub use resources::{
    PoolInfo, PoolUsage, ResourceMonitor, ResourcePools, Subscription, SubscriptionId,
    ThresholdNotification,
};
pub use scheduler::{TimerScheduler, TimerTask};
pub use threshold::{ArmedThreshold, ThresholdListener};
pub use worker::{CallbackWorker, WorkerHandle};
