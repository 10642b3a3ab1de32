//! Fixed-capacity slot tables for polled descriptors and scheduled tasks.
//!
//! Both tables are allocated once by [`Runtime::init`] and never grow: a
//! registration claims the lowest free slot or fails with
//! [`RuntimeError::OutOfCapacity`]. A callback is moved out of its slot while
//! it runs so that it can register or remove entries itself; a per-slot
//! generation detects whether the slot was released or reused meanwhile.
//!
//! [`Runtime::init`]: crate::Runtime::init

use std::fmt;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::poll::PollFlags;
use udaemon_core::Interest;

use crate::error::{invalid, RuntimeError};
use crate::runtime::Runtime;

pub(crate) type EventCallback<C> = Box<dyn FnMut(&Runtime<C>, &mut PollEvent) -> Dispatch>;
pub(crate) type TaskCallback<C> = Box<dyn FnMut(&Runtime<C>, Duration) -> TaskStatus>;

/// Descriptor value marking an empty handler slot.
const EMPTY_FD: RawFd = -1;

/// Slot of the internal signal dispatcher.
pub(crate) const RESERVED_SLOT: usize = 0;

/// Deadline offset used when `now + interval` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Handler ids and dispatch records
// ---------------------------------------------------------------------------

/// Handle of a registered event handler: the index of its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HandlerId(usize);

impl HandlerId {
    /// Never issued to a registration.
    pub const INVALID: Self = Self(RESERVED_SLOT);

    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != RESERVED_SLOT
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Readiness record handed to an event callback.
///
/// Changes to `events` persist into the slot, so a callback can stop
/// polling for a condition (e.g. readability after end-of-file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub fd: RawFd,
    pub events: Interest,
    pub revents: Interest,
}

impl PollEvent {
    pub fn is_readable(&self) -> bool {
        self.revents.contains(PollFlags::POLLIN)
    }

    pub fn is_writable(&self) -> bool {
        self.revents.contains(PollFlags::POLLOUT)
    }

    /// Hang-up, error or invalid-descriptor condition.
    pub fn is_hangup(&self) -> bool {
        self.revents
            .intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
    }
}

/// What the loop does with a descriptor after its callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    /// Hard failure: close the descriptor and free its slot.
    Close,
}

/// Return value of a task callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Finished normally; the slot is freed.
    Complete,
    /// Finished abnormally; the slot is freed.
    Abort,
    /// Run again after the given interval, which becomes the new interval.
    Reschedule(Duration),
}

impl TaskStatus {
    /// Maps the numeric task contract: `0` completes, negative aborts and a
    /// positive value reschedules after that many seconds.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Complete,
            c if c < 0 => Self::Abort,
            c => Self::Reschedule(Duration::from_secs(c.unsigned_abs())),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler table
// ---------------------------------------------------------------------------

struct HandlerSlot<C> {
    fd: RawFd,
    events: Interest,
    callback: Option<EventCallback<C>>,
    generation: u64,
}

impl<C> HandlerSlot<C> {
    fn empty() -> Self {
        Self {
            fd: EMPTY_FD,
            events: Interest::empty(),
            callback: None,
            generation: 0,
        }
    }

    fn is_occupied(&self) -> bool {
        self.fd != EMPTY_FD
    }

    fn fill(&mut self, fd: RawFd, events: Interest, callback: EventCallback<C>) {
        self.fd = fd;
        self.events = events;
        self.callback = Some(callback);
        self.generation += 1;
    }

    fn clear(&mut self) {
        self.fd = EMPTY_FD;
        self.events = Interest::empty();
        self.callback = None;
        self.generation += 1;
    }
}

/// A callback moved out of its slot for the duration of one dispatch.
pub(crate) struct InFlight<C> {
    pub(crate) callback: EventCallback<C>,
    pub(crate) event: PollEvent,
    generation: u64,
}

pub(crate) struct HandlerTable<C> {
    slots: Vec<HandlerSlot<C>>,
}

impl<C> HandlerTable<C> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| HandlerSlot::empty()).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_occupied()).count()
    }

    #[cfg(test)]
    pub(crate) fn is_occupied(&self, id: HandlerId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(HandlerSlot::is_occupied)
    }

    pub(crate) fn install_reserved(
        &mut self,
        fd: RawFd,
        events: Interest,
        callback: EventCallback<C>,
    ) {
        self.slots[RESERVED_SLOT].fill(fd, events, callback);
    }

    pub(crate) fn clear_reserved(&mut self) {
        self.slots[RESERVED_SLOT].clear();
    }

    /// Claim the lowest free application slot.
    pub(crate) fn claim(
        &mut self,
        fd: RawFd,
        events: Interest,
        callback: EventCallback<C>,
    ) -> Result<HandlerId, RuntimeError> {
        if fd < 0 {
            return Err(invalid(format!("cannot poll descriptor {fd}")));
        }
        let capacity = self.capacity();
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .skip(RESERVED_SLOT + 1)
            .find(|(_, slot)| !slot.is_occupied())
            .ok_or(RuntimeError::OutOfCapacity {
                table: "event handler",
                capacity,
            })?;
        slot.fill(fd, events, callback);
        Ok(HandlerId(index))
    }

    /// Free an application slot. The descriptor is left open.
    pub(crate) fn release(&mut self, id: HandlerId) -> Result<RawFd, RuntimeError> {
        if !id.is_valid() {
            return Err(invalid("event handler id 0 is reserved"));
        }
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.is_occupied())
            .ok_or_else(|| invalid(format!("no event handler registered at {id}")))?;
        let fd = slot.fd;
        slot.clear();
        Ok(fd)
    }

    /// Rebuild the poll set, one entry per slot; empty slots carry a negative
    /// descriptor, which poll ignores.
    pub(crate) fn fill_poll_set(
        &self,
        pollfds: &mut Vec<libc::pollfd>,
        generations: &mut Vec<u64>,
    ) {
        pollfds.clear();
        generations.clear();
        for slot in &self.slots {
            pollfds.push(libc::pollfd {
                fd: slot.fd,
                events: slot.events.bits(),
                revents: 0,
            });
            generations.push(slot.generation);
        }
    }

    /// Take the callback of `index` if the slot still holds the registration
    /// that was polled.
    pub(crate) fn begin_dispatch(
        &mut self,
        index: usize,
        generation: u64,
        revents: Interest,
    ) -> Option<InFlight<C>> {
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation || !slot.is_occupied() {
            return None;
        }
        let callback = slot.callback.take()?;
        Some(InFlight {
            callback,
            event: PollEvent {
                fd: slot.fd,
                events: slot.events,
                revents,
            },
            generation,
        })
    }

    /// Return a callback after it ran. Yields the descriptor to close when
    /// the callback asked for it and its registration is still current.
    pub(crate) fn end_dispatch(
        &mut self,
        index: usize,
        in_flight: InFlight<C>,
        dispatch: Dispatch,
    ) -> Option<RawFd> {
        let slot = self.slots.get_mut(index)?;
        if slot.generation != in_flight.generation {
            // Removed, and possibly reused, by its own callback.
            return None;
        }
        match dispatch {
            Dispatch::Continue => {
                slot.events = in_flight.event.events;
                slot.callback = Some(in_flight.callback);
                None
            }
            Dispatch::Close => {
                let fd = slot.fd;
                slot.clear();
                Some(fd)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task table
// ---------------------------------------------------------------------------

enum TaskEntry<C> {
    Vacant,
    Scheduled(TaskCallback<C>),
    /// Callback is executing; the slot stays claimed.
    Running,
}

struct TaskSlot<C> {
    entry: TaskEntry<C>,
    interval: Duration,
    next_deadline: Instant,
}

impl<C> TaskSlot<C> {
    fn vacant(now: Instant) -> Self {
        Self {
            entry: TaskEntry::Vacant,
            interval: Duration::ZERO,
            next_deadline: now,
        }
    }

    fn is_occupied(&self) -> bool {
        !matches!(self.entry, TaskEntry::Vacant)
    }
}

pub(crate) struct TaskTable<C> {
    slots: Vec<TaskSlot<C>>,
}

impl<C> TaskTable<C> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            slots: (0..capacity).map(|_| TaskSlot::vacant(now)).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_occupied()).count()
    }

    /// Claim the lowest free slot; the task becomes due at `now + interval`.
    pub(crate) fn schedule(
        &mut self,
        interval: Duration,
        callback: TaskCallback<C>,
        now: Instant,
    ) -> Result<usize, RuntimeError> {
        let capacity = self.capacity();
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| !slot.is_occupied())
            .ok_or(RuntimeError::OutOfCapacity {
                table: "task",
                capacity,
            })?;
        slot.entry = TaskEntry::Scheduled(callback);
        slot.interval = interval;
        slot.next_deadline = deadline(now, interval);
        Ok(index)
    }

    #[cfg(test)]
    pub(crate) fn next_deadline(&self, index: usize) -> Option<Instant> {
        self.slots
            .get(index)
            .filter(|slot| slot.is_occupied())
            .map(|slot| slot.next_deadline)
    }

    /// Take the callback of `index` if it is due at `now`.
    pub(crate) fn take_due(
        &mut self,
        index: usize,
        now: Instant,
    ) -> Option<(TaskCallback<C>, Duration)> {
        let slot = self.slots.get_mut(index)?;
        if !matches!(slot.entry, TaskEntry::Scheduled(_)) || slot.next_deadline > now {
            return None;
        }
        match std::mem::replace(&mut slot.entry, TaskEntry::Running) {
            TaskEntry::Scheduled(callback) => Some((callback, slot.interval)),
            _ => None,
        }
    }

    /// Apply a task's return value.
    pub(crate) fn finish(
        &mut self,
        index: usize,
        callback: TaskCallback<C>,
        status: TaskStatus,
        now: Instant,
    ) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        match status {
            TaskStatus::Complete | TaskStatus::Abort => {
                slot.entry = TaskEntry::Vacant;
            }
            TaskStatus::Reschedule(interval) => {
                slot.entry = TaskEntry::Scheduled(callback);
                slot.interval = interval;
                slot.next_deadline = deadline(now, interval);
            }
        }
    }
}

fn deadline(now: Instant, interval: Duration) -> Instant {
    now.checked_add(interval)
        .unwrap_or_else(|| now + FAR_FUTURE)
}
