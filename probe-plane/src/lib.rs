//! # probe-plane - Runtime Control Plane for Injected Probes
//!
//! Every call an injected probe makes at trace time passes through this
//! crate. It keeps probe code from re-entering itself, moves the commands
//! probes produce to a single delivery thread without ever blocking the traced
//! thread for long, lets probes buffer output tentatively, and drives the
//! periodic, event, resource-threshold, error and exit handlers a probe client
//! declares.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Instrumented Application                      │
//! │         (any thread may hit an injected probe call site)        │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ probe(|| ..) / enter, send, leave
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  RuntimeInstance (one per client)               │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │    Guard     │──▶│ Speculation  │──▶│ EventChannel │         │
//! │  │ (per thread) │   │  (buffers)   │   │  (bounded)   │         │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘         │
//! │                                               │ drain           │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────▼───────┐         │
//! │  │   Handlers   │   │   Counters   │   │   Delivery   │         │
//! │  │ timer/event/ │   │   (perf)     │   │    thread    │         │
//! │  │ threshold/.. │   └──────────────┘   └──────┬───────┘         │
//! │  └──────────────┘                             │                 │
//! └───────────────────────────────────────────────┼─────────────────┘
//!                                                 │ on_command
//!                                                 ▼
//!                                  CommandListener (transport / sink)
//! ```
//!
//! ## Module Structure
//!
//! - [`guard`]: per-thread reentrancy slot, `escape`, fault-in-flight flag
//! - [`channel`]: bounded MPSC command queue with back-off and drop notices
//! - [`speculation`]: per-thread transactional buffers, commit or discard
//! - [`handlers`]: handler declarations, tables, timer scheduler, resource
//!   monitor seam, threshold listener and callback worker
//! - [`runtime`]: [`RuntimeInstance`](runtime::RuntimeInstance) lifecycle and
//!   the [`ClientRegistry`](runtime::ClientRegistry)
//! - [`config`]: runtime configuration and client arguments
//! - [`counters`]: per-client perf counters
//! - [`probe_local`]: factory-seeded per-thread probe variables
//! - [`export`]: JSON-lines and in-memory command sinks
//! - [`cli`]: arguments of the headless driver
//! - [`domain`]: identities, lifecycle states and error types
//!
//! ## Lifecycle
//!
//! `Created → Started → Running → Exiting → Terminated`
//!
//! Commands may be sent from creation on. `start()` arms timers and
//! thresholds; `exit(code)` tears everything down once, runs the exit
//! handlers and delivers `Exit(code)` as the final command.

pub mod channel;
pub mod cli;
pub mod config;
pub mod counters;
pub mod domain;
pub mod export;
pub mod guard;
pub mod handlers;
pub mod probe_local;
pub mod runtime;
pub mod speculation;
