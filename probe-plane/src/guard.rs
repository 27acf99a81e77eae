//! # Reentrancy Guard
//!
//! Every instrumented call site brackets its probe logic with [`enter`] and
//! [`leave`]. The calling thread owns a single slot; while it is occupied any
//! further `enter` on that thread is refused, whichever instance asks. This is
//! what stops a probe that calls into instrumented code (its own or another
//! client's) from recursing back into probe logic.
//!
//! The slot stores only the [`InstanceId`], in a `Cell`, so the hot path does
//! no allocation and takes no lock.
//!
//! [`escape`] temporarily vacates the slot for work that must not be mistaken
//! for a reentrant probe call (event handlers, privileged initialization) and
//! restores it afterwards, including when the body panics.
//!
//! A second per-thread flag tracks whether a probe fault is being handled on
//! this thread, so that a failure raised while reporting a failure is dropped
//! instead of cascading.

use std::cell::Cell;
use std::marker::PhantomData;

use crate::domain::InstanceId;

thread_local! {
    static CURRENT: Cell<Option<InstanceId>> = const { Cell::new(None) };
    static FAULT_IN_FLIGHT: Cell<bool> = const { Cell::new(false) };
}

/// Claim the calling thread's slot for `instance`
///
/// Returns `false` if the slot is already occupied, including by `instance`
/// itself; the caller must then skip its probe logic.
#[inline]
pub fn enter(instance: InstanceId) -> bool {
    CURRENT.with(|slot| {
        if slot.get().is_some() {
            return false;
        }
        slot.set(Some(instance));
        true
    })
}

/// Clear the calling thread's slot unconditionally
#[inline]
pub fn leave() {
    CURRENT.with(|slot| slot.set(None));
}

/// Instance currently occupying the calling thread's slot
#[inline]
pub fn current() -> Option<InstanceId> {
    CURRENT.with(Cell::get)
}

/// Run `body` with the slot vacated, then restore the previous occupant
///
/// The previous value is restored by a drop guard, so a panicking body still
/// leaves the slot exactly as it found it.
pub fn escape<T>(body: impl FnOnce() -> T) -> T {
    let _restore = SlotRestore { previous: CURRENT.with(|slot| slot.replace(None)) };
    body()
}

struct SlotRestore {
    previous: Option<InstanceId>,
}

impl Drop for SlotRestore {
    fn drop(&mut self) {
        CURRENT.with(|slot| slot.set(self.previous));
    }
}

/// RAII form of a successful [`enter`]; dropping it calls [`leave`]
///
/// Not `Send`: the slot it clears belongs to the thread that created it.
#[must_use = "dropping the scope immediately leaves the probe"]
pub struct ProbeScope {
    _thread_bound: PhantomData<*const ()>,
}

impl ProbeScope {
    /// Enter `instance` and wrap the claim, or `None` if the slot is taken
    pub fn try_enter(instance: InstanceId) -> Option<Self> {
        enter(instance).then(|| ProbeScope { _thread_bound: PhantomData })
    }
}

impl Drop for ProbeScope {
    fn drop(&mut self) {
        leave();
    }
}

/// Mark a fault as being handled on this thread
///
/// Returns `None` when one is already in flight; the returned marker clears the
/// flag when dropped.
pub(crate) fn begin_fault() -> Option<FaultMarker> {
    FAULT_IN_FLIGHT.with(|flag| {
        if flag.replace(true) {
            None
        } else {
            Some(FaultMarker { _thread_bound: PhantomData })
        }
    })
}

/// True while a fault is being handled on this thread
pub fn fault_in_flight() -> bool {
    FAULT_IN_FLIGHT.with(Cell::get)
}

/// Run `body` and put the fault flag back the way it was
///
/// Handlers invoked from inside fault handling must not clear the outer
/// fault, nor leak one of their own.
pub(crate) fn preserve_fault<T>(body: impl FnOnce() -> T) -> T {
    let _restore = FaultRestore { previous: FAULT_IN_FLIGHT.with(Cell::get) };
    body()
}

struct FaultRestore {
    previous: bool,
}

impl Drop for FaultRestore {
    fn drop(&mut self) {
        FAULT_IN_FLIGHT.with(|flag| flag.set(self.previous));
    }
}

pub(crate) struct FaultMarker {
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for FaultMarker {
    fn drop(&mut self) {
        FAULT_IN_FLIGHT.with(|flag| flag.set(false));
    }
}
