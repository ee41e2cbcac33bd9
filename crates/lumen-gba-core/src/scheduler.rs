//! Discrete-event scheduler driving all emulated time.
//!
//! The scheduler owns the master cycle counter and an ordered store of future
//! work units. Components schedule events keyed by an absolute cycle count;
//! the run loop repeatedly consumes the earliest pending event, advances the
//! counter to its fire time and dispatches its handler.

/// Sentinel for "no event handle held".
pub const EVENT_HANDLE_NONE: u32 = u32::MAX;

/// Discriminates the handler invoked when an event fires.
///
/// The numeric values are part of the quicksave wire format and must never be
/// reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    HDraw = 0,
    HBlank = 1,
    TimerOverflow = 2,
    DmaFire = 3,
    ApuSample = 4,
    ApuFifoRefill = 5,
    IrqLine = 6,
    /// Unwinds a long `run_until` so the run loop can service an exit request.
    Quit = 7,
}

impl EventKind {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::HDraw,
            1 => Self::HBlank,
            2 => Self::TimerOverflow,
            3 => Self::DmaFire,
            4 => Self::ApuSample,
            5 => Self::ApuFifoRefill,
            6 => Self::IrqLine,
            7 => Self::Quit,
            _ => return None,
        })
    }
}

/// A deferred unit of work keyed by an absolute cycle count.
///
/// The argument payload is a single inline word (timer index, DMA channel,
/// FIFO index); handlers needing more context derive it from their module
/// state.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub kind: EventKind,
    pub active: bool,
    pub repeat: bool,
    pub at: u64,
    pub period: u64,
    pub arg: u32,
    /// Insertion stamp used to break ties between events at the same cycle.
    pub(crate) seq: u64,
}

impl Event {
    /// A one-shot event firing at the absolute cycle `at`.
    pub fn once(kind: EventKind, at: u64) -> Self {
        Self {
            kind,
            active: true,
            repeat: false,
            at,
            period: 0,
            arg: 0,
            seq: 0,
        }
    }

    /// An event firing at `at` and re-arming itself every `period` cycles.
    pub fn repeating(kind: EventKind, at: u64, period: u64) -> Self {
        Self {
            kind,
            active: true,
            repeat: true,
            at,
            period,
            arg: 0,
            seq: 0,
        }
    }

    pub fn with_arg(mut self, arg: u32) -> Self {
        self.arg = arg;
        self
    }
}

pub struct Scheduler {
    cycles: u64,
    /// Cached `min(e.at)` over active events; `u64::MAX` when none are armed.
    next_event: u64,
    events: Vec<Event>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            cycles: 0,
            next_event: u64::MAX,
            events: Vec::new(),
            next_seq: 0,
        }
    }

    /// Current value of the master cycle counter.
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Cycle of the earliest armed event, `u64::MAX` if none.
    #[inline]
    pub fn next_event(&self) -> u64 {
        self.next_event
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Insert an event, reusing an inactive slot when one exists.
    ///
    /// Returns a stable handle the caller can use to cancel or re-arm the
    /// event. Scheduling an event at or before the current cycle is a caller
    /// bug and aborts.
    pub fn add(&mut self, mut event: Event) -> u32 {
        assert!(
            event.at > self.cycles,
            "event {:?} scheduled at cycle {} which is not in the future (cycles={})",
            event.kind,
            event.at,
            self.cycles,
        );

        event.active = true;
        event.seq = self.next_seq;
        self.next_seq += 1;
        self.next_event = self.next_event.min(event.at);

        if let Some(idx) = self.events.iter().position(|e| !e.active) {
            self.events[idx] = event;
            idx as u32
        } else {
            self.events.push(event);
            (self.events.len() - 1) as u32
        }
    }

    /// Disarm the event behind `handle`. The slot becomes reusable; the
    /// cached `next_event` is refreshed lazily on the next consume.
    pub fn cancel(&mut self, handle: u32) {
        if let Some(event) = self.events.get_mut(handle as usize) {
            event.active = false;
        }
    }

    /// Move the event behind `handle` to a new fire cycle.
    pub fn reschedule(&mut self, handle: u32, at: u64) {
        assert!(at >= self.cycles);
        let event = &mut self.events[handle as usize];
        event.at = at;
        if event.active {
            self.next_event = self.next_event.min(at);
        }
    }

    /// Consume the earliest active event with `at <= horizon`, advancing the
    /// cycle counter to its fire time. Repeating events are re-armed with
    /// `at += period`; one-shots are disarmed. Ties fire in insertion order.
    pub fn take_next(&mut self, horizon: u64) -> Option<Event> {
        if self.next_event > horizon {
            return None;
        }

        let mut best: Option<usize> = None;
        for (idx, event) in self.events.iter().enumerate() {
            if !event.active || event.at > horizon {
                continue;
            }
            best = match best {
                None => Some(idx),
                Some(prev) => {
                    let p = &self.events[prev];
                    if event.at < p.at || (event.at == p.at && event.seq < p.seq) {
                        Some(idx)
                    } else {
                        Some(prev)
                    }
                }
            };
        }

        let Some(idx) = best else {
            // Stale cache (a cancel since the last consume); refresh and bail.
            self.next_event = self.recompute_next_event();
            return None;
        };

        let event = self.events[idx];
        assert!(
            event.at >= self.cycles,
            "event {:?} fires at cycle {} but time is already at {}",
            event.kind,
            event.at,
            self.cycles,
        );
        self.cycles = event.at;

        if event.repeat {
            self.events[idx].at = event.at + event.period;
        } else {
            self.events[idx].active = false;
        }
        self.next_event = self.recompute_next_event();

        Some(event)
    }

    /// Advance the counter to `target` once no more events fit the budget.
    pub fn advance_to(&mut self, target: u64) {
        debug_assert!(target >= self.cycles);
        self.cycles = self.cycles.max(target);
    }

    fn recompute_next_event(&self) -> u64 {
        self.events
            .iter()
            .filter(|e| e.active)
            .map(|e| e.at)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Drop every event. Used by the quicksave loader before committing a
    /// restored event store.
    pub fn clear_events(&mut self) {
        self.events.clear();
        self.next_event = u64::MAX;
        self.next_seq = 0;
    }

    /// Install a restored state wholesale. Insertion stamps are rebuilt from
    /// array order, which is how the events were written out.
    pub fn restore(&mut self, cycles: u64, next_event: u64, mut events: Vec<Event>) {
        for (idx, event) in events.iter_mut().enumerate() {
            event.seq = idx as u64;
        }
        self.next_seq = events.len() as u64;
        self.cycles = cycles;
        self.next_event = next_event;
        self.events = events;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_reused_after_a_one_shot_fires() {
        let mut sched = Scheduler::new();
        let a = sched.add(Event::once(EventKind::IrqLine, 10));
        let b = sched.add(Event::once(EventKind::IrqLine, 20));
        assert_ne!(a, b);

        assert!(sched.take_next(10).is_some());
        let c = sched.add(Event::once(EventKind::IrqLine, 30));
        assert_eq!(c, a);
        // The still-armed event keeps its slot.
        assert_eq!(sched.events()[b as usize].at, 20);
    }

    #[test]
    fn cancel_refreshes_the_cached_next_event() {
        let mut sched = Scheduler::new();
        let a = sched.add(Event::once(EventKind::HDraw, 10));
        sched.add(Event::once(EventKind::HBlank, 50));
        sched.cancel(a);

        let ev = sched.take_next(100).unwrap();
        assert_eq!(ev.kind, EventKind::HBlank);
        assert_eq!(sched.cycles(), 50);
    }

    #[test]
    fn repeating_events_rearm_once_per_fire() {
        let mut sched = Scheduler::new();
        sched.add(Event::repeating(EventKind::ApuSample, 100, 100));

        for expected in [100u64, 200, 300] {
            let ev = sched.take_next(1_000).unwrap();
            assert_eq!(ev.at, expected);
            assert_eq!(sched.cycles(), expected);
        }
    }

    #[test]
    #[should_panic]
    fn scheduling_in_the_past_is_a_caller_bug() {
        let mut sched = Scheduler::new();
        sched.add(Event::once(EventKind::HDraw, 100));
        sched.take_next(100);
        sched.add(Event::once(EventKind::HDraw, 100));
    }
}
