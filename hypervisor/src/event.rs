//! The generic event bus joining otherwise-unrelated modules (§4, Design
//! Notes: "cross-cutting notifications").
//!
//! `EVENT_GPM_SET`, `EVENT_EPT_VIOLATION`, `EVENT_SET_CR2` and
//! `EVENT_RESUME_FROM_S3` are all instances of the same shape: a fixed,
//! small set of subscribers registered once at init time, invoked
//! synchronously in registration order, any one of which may veto further
//! dispatch. Resolved Open Question: `EVENT_SET_CR2`'s "first write wins"
//! semantics are implemented as first-subscriber-veto-wins, i.e. the first
//! subscriber to return `Handled::Stop` ends the dispatch for that event.

use crate::config::MAX_CR_WRITE_HANDLERS;
use crate::sync::Mutex;
use heapless_list::FixedList;

/// What a subscriber tells the bus to do after handling one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Handled {
    /// Let the remaining, later-registered subscribers also see this event.
    Continue,
    /// No further subscriber sees this event (the veto case).
    Stop,
}

/// A minimal fixed-capacity list, since this no-heap-growth monitor never
/// needs `Vec`'s reallocation for a handler table bounded at init time.
mod heapless_list {
    #[derive(Clone, Copy)]
    pub(crate) struct FixedList<T: Copy, const N: usize> {
        items: [Option<T>; N],
        len: usize,
    }

    impl<T: Copy, const N: usize> FixedList<T, N> {
        pub(crate) const fn new() -> Self {
            Self { items: [None; N], len: 0 }
        }

        pub(crate) fn push(&mut self, item: T) -> bool {
            if self.len >= N {
                return false;
            }
            self.items[self.len] = Some(item);
            self.len += 1;
            true
        }

        pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
            self.items[..self.len].iter().filter_map(|o| o.as_ref())
        }
    }
}

/// One subscription to an event bus: a plain function pointer, since every
/// subscriber known at compile time is a module-level handler, never a
/// closure capturing per-call state.
pub(crate) type Subscriber<Payload> = fn(&Payload) -> Handled;

/// A fixed-capacity, registration-ordered event bus.
pub(crate) struct EventBus<Payload: 'static, const N: usize> {
    subscribers: FixedList<Subscriber<Payload>, N>,
}

impl<Payload, const N: usize> EventBus<Payload, N> {
    pub(crate) const fn new() -> Self {
        Self { subscribers: FixedList::new() }
    }

    /// Registers a subscriber. Returns `false` if the bus's fixed capacity
    /// is already exhausted (a monitor misconfiguration caught at init
    /// time, not runtime).
    pub(crate) fn subscribe(&mut self, handler: Subscriber<Payload>) -> bool {
        self.subscribers.push(handler)
    }

    /// Dispatches `payload` to every subscriber in registration order until
    /// one returns `Handled::Stop`, which it then returns to the caller so a
    /// veto can change the caller's own behavior (e.g. `EVENT_SET_CR2`'s
    /// first-subscriber-veto-wins rule).
    pub(crate) fn dispatch(&self, payload: &Payload) -> Handled {
        for handler in self.subscribers.iter() {
            if handler(payload) == Handled::Stop {
                return Handled::Stop;
            }
        }
        Handled::Continue
    }
}

/// Payload for `EVENT_GPM_SET`: a guest-physical range just gained or lost a
/// backing HPA mapping.
#[derive(Clone, Copy, Debug)]
pub(crate) struct GpmSetEvent {
    pub(crate) guest_id: u32,
    pub(crate) gpa: u64,
    pub(crate) size: u64,
}

/// Payload for `EVENT_EPT_VIOLATION`: an EPT violation VMExit the dispatcher
/// is about to resolve through the usual GPM-backed demand path.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EptViolationEvent {
    pub(crate) guest_id: u32,
    pub(crate) gpa: u64,
    pub(crate) read: bool,
    pub(crate) write: bool,
    pub(crate) execute: bool,
}

/// Payload for `EVENT_SET_CR2`: the monitor is about to write CR2 in
/// response to an injected or passthrough #PF.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SetCr2Event {
    pub(crate) guest_id: u32,
    pub(crate) value: u64,
}

/// Payload for `EVENT_RESUME_FROM_S3`: the platform just resumed from an
/// ACPI S3 sleep (§4.M).
#[derive(Clone, Copy, Debug)]
pub(crate) struct ResumeFromS3Event {
    pub(crate) waking_vector: u32,
}

pub(crate) static GPM_SET_BUS: Mutex<EventBus<GpmSetEvent, MAX_CR_WRITE_HANDLERS>> =
    Mutex::new(EventBus::new());
pub(crate) static EPT_VIOLATION_BUS: Mutex<EventBus<EptViolationEvent, MAX_CR_WRITE_HANDLERS>> =
    Mutex::new(EventBus::new());
pub(crate) static SET_CR2_BUS: Mutex<EventBus<SetCr2Event, MAX_CR_WRITE_HANDLERS>> =
    Mutex::new(EventBus::new());
pub(crate) static RESUME_FROM_S3_BUS: Mutex<EventBus<ResumeFromS3Event, MAX_CR_WRITE_HANDLERS>> =
    Mutex::new(EventBus::new());

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static CALLS: AtomicU32 = AtomicU32::new(0);

    fn first(_e: &SetCr2Event) -> Handled {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Handled::Stop
    }

    fn second(_e: &SetCr2Event) -> Handled {
        CALLS.fetch_add(100, Ordering::SeqCst);
        Handled::Continue
    }

    #[test]
    fn first_subscriber_veto_wins() {
        CALLS.store(0, Ordering::SeqCst);
        let mut bus: EventBus<SetCr2Event, 4> = EventBus::new();
        assert!(bus.subscribe(first));
        assert!(bus.subscribe(second));
        bus.dispatch(&SetCr2Event { guest_id: 0, value: 0 });
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_order_is_preserved_when_all_continue() {
        static ORDER: spin::Mutex<[i32; 2]> = spin::Mutex::new([0, 0]);
        static IDX: AtomicU32 = AtomicU32::new(0);
        fn a(_e: &GpmSetEvent) -> Handled {
            ORDER.lock()[IDX.fetch_add(1, Ordering::SeqCst) as usize] = 1;
            Handled::Continue
        }
        fn b(_e: &GpmSetEvent) -> Handled {
            ORDER.lock()[IDX.fetch_add(1, Ordering::SeqCst) as usize] = 2;
            Handled::Continue
        }
        IDX.store(0, Ordering::SeqCst);
        let mut bus: EventBus<GpmSetEvent, 4> = EventBus::new();
        bus.subscribe(a);
        bus.subscribe(b);
        bus.dispatch(&GpmSetEvent { guest_id: 0, gpa: 0, size: 0 });
        assert_eq!(*ORDER.lock(), [1, 2]);
    }

    #[test]
    fn capacity_exhaustion_is_reported_to_caller() {
        let mut bus: EventBus<SetCr2Event, 1> = EventBus::new();
        assert!(bus.subscribe(first));
        assert!(!bus.subscribe(second));
    }
}
