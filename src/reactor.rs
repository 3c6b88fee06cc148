// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! The reactor: a single-threaded cooperative scheduler multiplexing timers,
//! level-triggered stream readiness and deferred immediate callbacks.
//!
//! Every watcher is registered here and identified by a [`WatcherId`].
//! Callbacks run inline on the owning thread and may re-enter the registry
//! freely: registering, cancelling, disabling or enabling any watcher,
//! including the one currently firing.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeSet,
    fmt, mem,
    os::unix::io::{AsRawFd, RawFd},
    rc::Rc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ahash::AHashMap;
use log::{debug, trace};
use scopeguard::defer;
use smallvec::SmallVec;

use crate::{
    error::{EddyError, Result},
    sys::{Clock, Multiplexer, SelectMultiplexer, WallClock},
    Watch,
};

/// Blocking budget used when no timer bounds the wait. Only reachable while
/// I/O interest is non-empty; a reactor with neither timers nor interest
/// stops instead.
const IDLE_SELECT_MICROS: u64 = 1_000_000;

type SimpleCallback = Rc<RefCell<dyn FnMut(&Reactor, WatcherId) -> Result<()>>>;
type StreamCallback = Rc<RefCell<dyn FnMut(&Reactor, WatcherId, RawFd) -> Result<()>>>;

/// An opaque identifier for a registered watcher.
///
/// Identifiers are allocated in strictly increasing order for the lifetime
/// of a reactor instance and are never reused, even after cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatcherId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

struct TimerState {
    callback: SimpleCallback,
    /// Absolute expiry in microseconds since the epoch. `None` until the
    /// timer is armed: timers registered while the reactor is stopped get
    /// their deadline at the next run entry (or at enable time).
    deadline: Option<u64>,
    interval: u64,
    repeating: bool,
}

struct IoState {
    fd: RawFd,
    callback: StreamCallback,
}

enum Watcher {
    Timer(TimerState),
    Readable(IoState),
    Writable(IoState),
    Immediate { callback: SimpleCallback },
}

/// A live watcher. `parked` marks the disabled state: the entry keeps its
/// reconstruction data but is absent from every scheduling queue.
struct Entry {
    watcher: Watcher,
    parked: bool,
}

/// An ordered index of armed timers.
///
/// Keys are `(deadline, id)` so timers fire in ascending deadline order with
/// ties broken by registration order.
#[derive(Debug, Default)]
struct Timers {
    ordered: BTreeSet<(u64, WatcherId)>,
}

impl Timers {
    fn insert(&mut self, deadline: u64, id: WatcherId) {
        self.ordered.insert((deadline, id));
    }

    fn remove(&mut self, deadline: u64, id: WatcherId) {
        self.ordered.remove(&(deadline, id));
    }

    fn next_deadline(&self) -> Option<u64> {
        self.ordered.iter().next().map(|&(deadline, _)| deadline)
    }

    fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Splits off and returns every entry with `deadline <= now`, in firing
    /// order. Entries re-inserted while the harvest is being drained land in
    /// the live set and wait for the next iteration.
    fn take_due(&mut self, now: u64) -> Vec<(u64, WatcherId)> {
        let pending = self.ordered.split_off(&(now + 1, WatcherId(0)));
        mem::replace(&mut self.ordered, pending).into_iter().collect()
    }
}

/// The reactor.
///
/// One instance owns four registries (timers, readable and writable stream
/// buckets, immediates) and the loop driver that drains them. All methods
/// take `&self`; interior mutability is what lets callbacks invoked by the
/// loop mutate the very registries being drained.
///
/// # Examples
///
/// ```
/// use eddy::Reactor;
/// use std::time::Duration;
///
/// let reactor = Reactor::new();
/// reactor.once(
///     |_reactor, _id| {
///         println!("fired");
///         Ok(())
///     },
///     Duration::from_millis(10),
/// );
/// reactor.run().unwrap();
/// ```
pub struct Reactor {
    clock: Box<dyn Clock>,
    multiplexer: RefCell<Box<dyn Multiplexer>>,

    next_id: Cell<u64>,
    running: Cell<bool>,

    /// Every live watcher, parked or not, keyed by id.
    watchers: RefCell<AHashMap<WatcherId, Entry>>,

    timers: RefCell<Timers>,
    readers: RefCell<AHashMap<RawFd, Vec<WatcherId>>>,
    writers: RefCell<AHashMap<RawFd, Vec<WatcherId>>>,
    immediates: RefCell<Vec<WatcherId>>,
}

impl Reactor {
    /// Creates a reactor bound to the process clock and `select(2)`.
    pub fn new() -> Reactor {
        Reactor::with_parts(Box::new(WallClock), Box::<SelectMultiplexer>::default())
    }

    /// Creates a reactor over caller-supplied collaborators. This is the
    /// seam tests use to substitute a deterministic clock and a scripted
    /// readiness source.
    pub fn with_parts(clock: Box<dyn Clock>, multiplexer: Box<dyn Multiplexer>) -> Reactor {
        Reactor {
            clock,
            multiplexer: RefCell::new(multiplexer),
            next_id: Cell::new(0),
            running: Cell::new(false),
            watchers: RefCell::new(AHashMap::new()),
            timers: RefCell::new(Timers::default()),
            readers: RefCell::new(AHashMap::new()),
            writers: RefCell::new(AHashMap::new()),
            immediates: RefCell::new(Vec::new()),
        }
    }

    /// Whether the reactor is inside [`run`](Reactor::run).
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Number of live watchers, parked ones included.
    pub fn watcher_count(&self) -> usize {
        self.watchers.borrow().len()
    }

    /// Takes program control and iterates [`tick`](Reactor::tick) until
    /// [`stop`](Reactor::stop) is observed or a callback fails.
    ///
    /// Returns immediately if the reactor is already running. Timers
    /// registered while the reactor was stopped have their deadlines set to
    /// `now + interval` on entry. A reactor left with no timers and no
    /// stream interest stops on its own, since nothing could ever wake it.
    pub fn run(&self) -> Result<()> {
        self.run_inner(None)
    }

    /// As [`run`](Reactor::run), with `on_start` scheduled as an immediate
    /// so it executes at the top of the first iteration.
    ///
    /// # Examples
    ///
    /// ```
    /// use eddy::Reactor;
    ///
    /// let reactor = Reactor::new();
    /// reactor
    ///     .run_with(|reactor, _id| {
    ///         reactor.stop();
    ///         Ok(())
    ///     })
    ///     .unwrap();
    /// ```
    pub fn run_with<F>(&self, on_start: F) -> Result<()>
    where
        F: FnMut(&Reactor, WatcherId) -> Result<()> + 'static,
    {
        self.run_inner(Some(Rc::new(RefCell::new(on_start))))
    }

    fn run_inner(&self, on_start: Option<SimpleCallback>) -> Result<()> {
        if self.running.replace(true) {
            return Ok(());
        }
        debug!("reactor loop starting");
        defer! {
            self.running.set(false);
        }
        if let Some(callback) = on_start {
            self.enqueue_immediate(callback);
        }
        self.arm_unset_timers();
        while self.running.get() {
            self.tick()?;
        }
        debug!("reactor loop stopped");
        Ok(())
    }

    /// Requests loop exit. The current iteration completes; the outer loop
    /// then returns. Safe to call from inside a callback; a no-op when the
    /// reactor is not running.
    pub fn stop(&self) {
        self.running.set(false);
    }

    /// Executes exactly one iteration: drains immediates, waits for stream
    /// readiness or the next deadline, dispatches ready streams (readables
    /// before writables), then fires expired timers in `(deadline, id)`
    /// order.
    ///
    /// Supported without [`run`](Reactor::run): a standalone tick first arms
    /// any timers still waiting for a deadline.
    pub fn tick(&self) -> Result<()> {
        if !self.running.get() {
            self.arm_unset_timers();
        }
        self.drain_immediates()?;

        let now = self.now_micros();
        let timeout = match self.timers.borrow().next_deadline() {
            Some(deadline) => round_timeout(deadline.saturating_sub(now)),
            None => IDLE_SELECT_MICROS,
        };

        let read_set: Vec<RawFd> = self.readers.borrow().keys().copied().collect();
        let write_set: Vec<RawFd> = self.writers.borrow().keys().copied().collect();

        if !read_set.is_empty() || !write_set.is_empty() {
            let (ready_read, ready_write) = self
                .multiplexer
                .borrow_mut()
                .select(&read_set, &write_set, timeout as f64 / 1e6)?;
            self.dispatch_io(&ready_read, &ready_write)?;
        } else if self.timers.borrow().is_empty() {
            // Nothing armed and nothing watched: no event can ever arrive.
            debug!("no timers or stream interest left; stopping");
            self.stop();
            return Ok(());
        } else if timeout > 0 {
            self.clock.sleep(Duration::from_micros(timeout));
        }

        if !self.timers.borrow().is_empty() {
            self.fire_due_timers()?;
        }
        Ok(())
    }

    /// Schedules `callback` to run at the top of the next iteration.
    ///
    /// Immediates registered while a batch is being drained wait for the
    /// iteration after it.
    pub fn immediately<F>(&self, callback: F) -> WatcherId
    where
        F: FnMut(&Reactor, WatcherId) -> Result<()> + 'static,
    {
        self.enqueue_immediate(Rc::new(RefCell::new(callback)))
    }

    /// Registers a one-shot timer firing `delay` from now.
    ///
    /// While the reactor is stopped the deadline stays unset; it becomes
    /// `now + delay` when [`run`](Reactor::run) (or a standalone
    /// [`tick`](Reactor::tick), or [`enable`](Reactor::enable) of a parked
    /// timer) next arms it.
    ///
    /// # Examples
    ///
    /// ```
    /// use eddy::Reactor;
    /// use std::time::Duration;
    ///
    /// let reactor = Reactor::new();
    /// reactor.once(|_, _| Ok(()), Duration::from_millis(5));
    /// reactor.run().unwrap(); // fires once, then stops on its own
    /// ```
    pub fn once<F>(&self, callback: F, delay: Duration) -> WatcherId
    where
        F: FnMut(&Reactor, WatcherId) -> Result<()> + 'static,
    {
        self.insert_timer(Rc::new(RefCell::new(callback)), delay, false)
    }

    /// Registers a periodic timer.
    ///
    /// Rescheduling is fixed-rate: each deadline is the previous deadline
    /// plus `interval`, regardless of when the callback actually ran. A
    /// reactor that falls behind fires the timer once per iteration until
    /// the cadence catches up; missed deadlines are never batched into a
    /// burst within one iteration.
    ///
    /// # Examples
    ///
    /// ```
    /// use eddy::Reactor;
    /// use std::time::Duration;
    ///
    /// let reactor = Reactor::new();
    /// let mut left = 3;
    /// reactor.repeat(
    ///     move |reactor, id| {
    ///         left -= 1;
    ///         if left == 0 {
    ///             reactor.cancel(id);
    ///         }
    ///         Ok(())
    ///     },
    ///     Duration::from_millis(2),
    /// );
    /// reactor.run().unwrap();
    /// ```
    pub fn repeat<F>(&self, callback: F, interval: Duration) -> WatcherId
    where
        F: FnMut(&Reactor, WatcherId) -> Result<()> + 'static,
    {
        self.insert_timer(Rc::new(RefCell::new(callback)), interval, true)
    }

    /// Registers a one-shot timer firing at the absolute wall-clock time
    /// `when`.
    ///
    /// Fails with [`EddyError::InvalidTime`] unless the target is strictly
    /// later than the whole-second clock reading; on failure no watcher is
    /// registered and no identifier is consumed.
    pub fn at<F>(&self, callback: F, when: SystemTime) -> Result<WatcherId>
    where
        F: FnMut(&Reactor, WatcherId) -> Result<()> + 'static,
    {
        let target = match when.duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_secs_f64(),
            Err(before) => -before.duration().as_secs_f64(),
        };
        self.at_timestamp(callback, target)
    }

    /// As [`at`](Reactor::at), with the target given directly in seconds
    /// since the UNIX epoch.
    pub fn at_timestamp<F>(&self, callback: F, target: f64) -> Result<WatcherId>
    where
        F: FnMut(&Reactor, WatcherId) -> Result<()> + 'static,
    {
        let now = self.clock.now();
        if !target.is_finite() || target <= now.floor() {
            return Err(EddyError::InvalidTime { target, now });
        }
        let delay = Duration::from_secs_f64((target - now).max(0.0));
        Ok(self.insert_timer(Rc::new(RefCell::new(callback)), delay, false))
    }

    /// Watches `stream` for read readiness. The callback receives the
    /// reactor, the watcher id and the ready descriptor, and keeps firing on
    /// every iteration that finds the stream readable until the watcher is
    /// cancelled or disabled (the multiplexer is level-triggered).
    ///
    /// With `enable_now` false the watcher starts parked and joins the
    /// interest set only once [`enable`](Reactor::enable)d. The reactor
    /// borrows the descriptor for the watcher's lifetime and never closes
    /// it.
    pub fn on_readable<S, F>(&self, stream: &S, callback: F, enable_now: bool) -> WatcherId
    where
        S: AsRawFd + ?Sized,
        F: FnMut(&Reactor, WatcherId, RawFd) -> Result<()> + 'static,
    {
        self.insert_io(
            stream.as_raw_fd(),
            Rc::new(RefCell::new(callback)),
            Direction::Read,
            enable_now,
        )
    }

    /// Watches `stream` for write readiness. Symmetric with
    /// [`on_readable`](Reactor::on_readable).
    pub fn on_writable<S, F>(&self, stream: &S, callback: F, enable_now: bool) -> WatcherId
    where
        S: AsRawFd + ?Sized,
        F: FnMut(&Reactor, WatcherId, RawFd) -> Result<()> + 'static,
    {
        self.insert_io(
            stream.as_raw_fd(),
            Rc::new(RefCell::new(callback)),
            Direction::Write,
            enable_now,
        )
    }

    /// Combined registration: one callback watching `stream` in every
    /// direction named by `flags`.
    ///
    /// [`Watch::READ`] registers a readable watcher and [`Watch::WRITE`] a
    /// writable one, both sharing the callback; the returned ids are in that
    /// order. [`Watch::NOW`] enables the watchers immediately, otherwise
    /// they start parked. Flags selecting neither direction fail with
    /// [`EddyError::NoInterest`].
    pub fn watch_stream<S, F>(
        &self,
        stream: &S,
        callback: F,
        flags: Watch,
    ) -> Result<SmallVec<[WatcherId; 2]>>
    where
        S: AsRawFd + ?Sized,
        F: FnMut(&Reactor, WatcherId, RawFd) -> Result<()> + 'static,
    {
        if !flags.intersects(Watch::READ | Watch::WRITE) {
            return Err(EddyError::NoInterest { flags });
        }
        let enable_now = flags.contains(Watch::NOW);
        let callback: StreamCallback = Rc::new(RefCell::new(callback));
        let fd = stream.as_raw_fd();
        let mut ids = SmallVec::new();
        if flags.contains(Watch::READ) {
            ids.push(self.insert_io(fd, callback.clone(), Direction::Read, enable_now));
        }
        if flags.contains(Watch::WRITE) {
            ids.push(self.insert_io(fd, callback, Direction::Write, enable_now));
        }
        Ok(ids)
    }

    /// Removes the watcher from whichever registry holds it.
    ///
    /// Idempotent, and a no-op for unknown identifiers. Synchronous: once
    /// this returns the watcher cannot fire again, including the pending
    /// reschedule of a repeating timer cancelling itself from its own
    /// callback. An invocation already in progress is not aborted.
    pub fn cancel(&self, id: WatcherId) {
        let removed = self.watchers.borrow_mut().remove(&id);
        if let Some(entry) = removed {
            if !entry.parked {
                self.detach_from_queue(id, &entry.watcher);
            }
        }
    }

    /// Parks the watcher: it keeps its identifier and reconstruction state
    /// but leaves every scheduling queue, so it cannot fire until
    /// [`enable`](Reactor::enable)d. A parked timer keeps its deadline as it
    /// was, so a disable/enable round trip before the deadline does not push
    /// it back. No-op if already parked or unknown.
    pub fn disable(&self, id: WatcherId) {
        let mut watchers = self.watchers.borrow_mut();
        let Some(entry) = watchers.get_mut(&id) else {
            return;
        };
        if entry.parked {
            return;
        }
        entry.parked = true;
        self.detach_from_queue(id, &entry.watcher);
    }

    /// Restores a parked watcher to its registry: a timer rejoins the timer
    /// index (an unset deadline is resolved to `now + interval` here), a
    /// stream watcher rejoins its bucket, an immediate is re-enqueued for
    /// the next iteration. No-op unless the watcher is parked.
    pub fn enable(&self, id: WatcherId) {
        let now = self.now_micros();
        let mut watchers = self.watchers.borrow_mut();
        let Some(entry) = watchers.get_mut(&id) else {
            return;
        };
        if !entry.parked {
            return;
        }
        entry.parked = false;
        match &mut entry.watcher {
            Watcher::Timer(timer) => {
                let deadline = *timer.deadline.get_or_insert(now + timer.interval);
                self.timers.borrow_mut().insert(deadline, id);
            }
            Watcher::Readable(io) => {
                self.readers.borrow_mut().entry(io.fd).or_default().push(id)
            }
            Watcher::Writable(io) => {
                self.writers.borrow_mut().entry(io.fd).or_default().push(id)
            }
            Watcher::Immediate { .. } => self.immediates.borrow_mut().push(id),
        }
    }

    fn alloc_id(&self) -> WatcherId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        WatcherId(id)
    }

    fn now_micros(&self) -> u64 {
        (self.clock.now() * 1e6).round() as u64
    }

    fn enqueue_immediate(&self, callback: SimpleCallback) -> WatcherId {
        let id = self.alloc_id();
        self.watchers.borrow_mut().insert(
            id,
            Entry {
                watcher: Watcher::Immediate { callback },
                parked: false,
            },
        );
        self.immediates.borrow_mut().push(id);
        id
    }

    fn insert_timer(&self, callback: SimpleCallback, interval: Duration, repeating: bool) -> WatcherId {
        let id = self.alloc_id();
        let interval = interval.as_micros() as u64;
        let deadline = self.running.get().then(|| self.now_micros() + interval);
        if let Some(deadline) = deadline {
            self.timers.borrow_mut().insert(deadline, id);
        }
        self.watchers.borrow_mut().insert(
            id,
            Entry {
                watcher: Watcher::Timer(TimerState {
                    callback,
                    deadline,
                    interval,
                    repeating,
                }),
                parked: false,
            },
        );
        id
    }

    fn insert_io(
        &self,
        fd: RawFd,
        callback: StreamCallback,
        direction: Direction,
        enable_now: bool,
    ) -> WatcherId {
        let id = self.alloc_id();
        let state = IoState { fd, callback };
        let watcher = match direction {
            Direction::Read => Watcher::Readable(state),
            Direction::Write => Watcher::Writable(state),
        };
        self.watchers.borrow_mut().insert(
            id,
            Entry {
                watcher,
                parked: !enable_now,
            },
        );
        if enable_now {
            let buckets = match direction {
                Direction::Read => &self.readers,
                Direction::Write => &self.writers,
            };
            buckets.borrow_mut().entry(fd).or_default().push(id);
        }
        id
    }

    /// Gives every unarmed timer its deadline. Called at run entry and at
    /// the top of a standalone tick; while running, registration arms
    /// timers directly, so nothing here can be unarmed.
    fn arm_unset_timers(&self) {
        let now = self.now_micros();
        let mut watchers = self.watchers.borrow_mut();
        let mut timers = self.timers.borrow_mut();
        for (&id, entry) in watchers.iter_mut() {
            if entry.parked {
                continue;
            }
            if let Watcher::Timer(timer) = &mut entry.watcher {
                if timer.deadline.is_none() {
                    let deadline = now + timer.interval;
                    timer.deadline = Some(deadline);
                    timers.insert(deadline, id);
                }
            }
        }
    }

    /// Snapshots the immediates queue and invokes the batch in insertion
    /// order. Each id is re-checked against the watcher table right before
    /// firing, so an immediate cancelled (skip and forget) or disabled (skip
    /// and keep) by an earlier callback in the same batch never runs. On a
    /// callback failure the un-run tail is spliced back at the front of the
    /// live queue before the error propagates; tail entries an earlier
    /// callback invalidated are dropped rather than resurrected.
    fn drain_immediates(&self) -> Result<()> {
        let batch = mem::take(&mut *self.immediates.borrow_mut());
        for (pos, &id) in batch.iter().enumerate() {
            let callback = {
                let mut watchers = self.watchers.borrow_mut();
                match watchers.remove(&id) {
                    Some(Entry {
                        parked: false,
                        watcher: Watcher::Immediate { callback },
                    }) => Some(callback),
                    Some(entry) => {
                        watchers.insert(id, entry);
                        None
                    }
                    None => None,
                }
            };
            let Some(callback) = callback else {
                continue;
            };
            let result = (&mut *callback.borrow_mut())(self, id);
            if let Err(err) = result {
                let watchers = self.watchers.borrow();
                let mut live = self.immediates.borrow_mut();
                let mut restored: Vec<WatcherId> = batch[pos + 1..]
                    .iter()
                    .copied()
                    .filter(|queued| {
                        !live.contains(queued)
                            && matches!(
                                watchers.get(queued),
                                Some(Entry {
                                    parked: false,
                                    watcher: Watcher::Immediate { .. }
                                })
                            )
                    })
                    .collect();
                restored.append(&mut live);
                *live = restored;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Dispatches one tick's ready streams: every ready read bucket, then
    /// every ready write bucket, each bucket in insertion order. The plan is
    /// snapshotted up front, so interest added by a callback waits for the
    /// next iteration; each entry is presence-checked right before its
    /// callback, so watchers cancelled or disabled earlier in the same
    /// dispatch are skipped.
    fn dispatch_io(&self, ready_read: &[RawFd], ready_write: &[RawFd]) -> Result<()> {
        let mut plan: Vec<(WatcherId, RawFd, Direction)> = Vec::new();
        {
            let readers = self.readers.borrow();
            for &fd in ready_read {
                if let Some(bucket) = readers.get(&fd) {
                    plan.extend(bucket.iter().map(|&id| (id, fd, Direction::Read)));
                }
            }
        }
        {
            let writers = self.writers.borrow();
            for &fd in ready_write {
                if let Some(bucket) = writers.get(&fd) {
                    plan.extend(bucket.iter().map(|&id| (id, fd, Direction::Write)));
                }
            }
        }
        if plan.is_empty() {
            return Ok(());
        }
        trace!("dispatching {} ready stream callbacks", plan.len());
        for (id, fd, direction) in plan {
            let callback = {
                let watchers = self.watchers.borrow();
                match watchers.get(&id) {
                    Some(Entry {
                        parked: false,
                        watcher: Watcher::Readable(io),
                    }) if direction == Direction::Read && io.fd == fd => {
                        Some(io.callback.clone())
                    }
                    Some(Entry {
                        parked: false,
                        watcher: Watcher::Writable(io),
                    }) if direction == Direction::Write && io.fd == fd => {
                        Some(io.callback.clone())
                    }
                    _ => None,
                }
            };
            if let Some(callback) = callback {
                (&mut *callback.borrow_mut())(self, id, fd)?;
            }
        }
        Ok(())
    }

    /// Fires every timer whose deadline has passed, in `(deadline, id)`
    /// order. The due set is harvested before anything runs; each entry is
    /// then re-checked against the watcher table, so cancellation, parking
    /// or re-arming by an earlier callback is honoured. A repeating timer is
    /// advanced and re-indexed *before* its callback runs: self-cancellation
    /// removes the fresh index entry like any other, and the freshly armed
    /// entry cannot fire again within this iteration because the harvest is
    /// already closed. On a callback failure the un-run tail of the harvest
    /// is re-indexed before the error propagates.
    fn fire_due_timers(&self) -> Result<()> {
        let now = self.now_micros();
        let due = self.timers.borrow_mut().take_due(now);
        for (pos, &(deadline, id)) in due.iter().enumerate() {
            let fired = {
                let mut watchers = self.watchers.borrow_mut();
                let decision = match watchers.get_mut(&id) {
                    Some(Entry {
                        parked: false,
                        watcher: Watcher::Timer(timer),
                    }) if timer.deadline == Some(deadline) => {
                        let callback = timer.callback.clone();
                        if timer.repeating {
                            let next = deadline + timer.interval;
                            timer.deadline = Some(next);
                            Some((callback, Some(next)))
                        } else {
                            Some((callback, None))
                        }
                    }
                    _ => None,
                };
                if let Some((_, None)) = decision {
                    // One-shot completion releases the record.
                    watchers.remove(&id);
                }
                decision
            };
            let result = match fired {
                Some((callback, Some(next))) => {
                    self.timers.borrow_mut().insert(next, id);
                    (&mut *callback.borrow_mut())(self, id)
                }
                Some((callback, None)) => (&mut *callback.borrow_mut())(self, id),
                None => Ok(()),
            };
            if let Err(err) = result {
                self.restore_due(&due[pos + 1..]);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Puts harvested due entries whose callbacks never got their turn back
    /// into the timer index after a mid-batch failure, so they fire on a
    /// later tick instead of being stranded outside every queue. Entries an
    /// earlier callback invalidated (cancelled, parked or re-armed) are
    /// dropped rather than resurrected.
    fn restore_due(&self, tail: &[(u64, WatcherId)]) {
        let watchers = self.watchers.borrow();
        let mut timers = self.timers.borrow_mut();
        for &(deadline, id) in tail {
            let still_armed = matches!(
                watchers.get(&id),
                Some(Entry {
                    parked: false,
                    watcher: Watcher::Timer(timer),
                }) if timer.deadline == Some(deadline)
            );
            if still_armed {
                timers.insert(deadline, id);
            }
        }
    }

    fn detach_from_queue(&self, id: WatcherId, watcher: &Watcher) {
        match watcher {
            Watcher::Timer(timer) => {
                if let Some(deadline) = timer.deadline {
                    self.timers.borrow_mut().remove(deadline, id);
                }
            }
            Watcher::Readable(io) => unhook(&mut self.readers.borrow_mut(), io.fd, id),
            Watcher::Writable(io) => unhook(&mut self.writers.borrow_mut(), io.fd, id),
            Watcher::Immediate { .. } => {
                self.immediates.borrow_mut().retain(|&queued| queued != id)
            }
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let watchers = self.watchers.borrow();
        let timers = self.timers.borrow();
        let readers = self.readers.borrow();
        let writers = self.writers.borrow();
        let immediates = self.immediates.borrow();

        for &(deadline, id) in &timers.ordered {
            match watchers.get(&id) {
                Some(Entry {
                    parked: false,
                    watcher: Watcher::Timer(timer),
                }) => assert_eq!(timer.deadline, Some(deadline), "stale index for {id:?}"),
                _ => panic!("timer index entry {id:?} has no live record"),
            }
        }
        for (buckets, direction) in [(&*readers, Direction::Read), (&*writers, Direction::Write)] {
            for (&fd, bucket) in buckets.iter() {
                assert!(!bucket.is_empty(), "empty bucket left behind for fd {fd}");
                for &id in bucket {
                    let holds = match (watchers.get(&id), direction) {
                        (
                            Some(Entry {
                                parked: false,
                                watcher: Watcher::Readable(io),
                            }),
                            Direction::Read,
                        )
                        | (
                            Some(Entry {
                                parked: false,
                                watcher: Watcher::Writable(io),
                            }),
                            Direction::Write,
                        ) => io.fd == fd,
                        _ => false,
                    };
                    assert!(holds, "bucket entry {id:?} for fd {fd} is stale");
                }
            }
        }
        for &id in immediates.iter() {
            assert!(
                matches!(
                    watchers.get(&id),
                    Some(Entry {
                        parked: false,
                        watcher: Watcher::Immediate { .. }
                    })
                ),
                "queued immediate {id:?} is stale"
            );
        }
        for (&id, entry) in watchers.iter() {
            let in_readers = readers.values().any(|bucket| bucket.contains(&id));
            let in_writers = writers.values().any(|bucket| bucket.contains(&id));
            let in_immediates = immediates.contains(&id);
            let in_timers = match &entry.watcher {
                Watcher::Timer(timer) => timer
                    .deadline
                    .map_or(false, |deadline| timers.ordered.contains(&(deadline, id))),
                _ => false,
            };
            let memberships =
                [in_readers, in_writers, in_immediates, in_timers].iter().filter(|&&m| m).count();
            if entry.parked {
                assert_eq!(memberships, 0, "parked watcher {id:?} still queued");
            } else {
                let expects_queue = !matches!(
                    &entry.watcher,
                    Watcher::Timer(TimerState { deadline: None, .. })
                );
                assert_eq!(
                    memberships,
                    usize::from(expects_queue),
                    "watcher {id:?} not in exactly one queue"
                );
            }
        }
    }
}

impl Default for Reactor {
    fn default() -> Reactor {
        Reactor::new()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("running", &self.running.get())
            .field("watchers", &self.watchers.borrow().len())
            .finish_non_exhaustive()
    }
}

fn unhook(buckets: &mut AHashMap<RawFd, Vec<WatcherId>>, fd: RawFd, id: WatcherId) {
    if let Some(bucket) = buckets.get_mut(&fd) {
        bucket.retain(|&held| held != id);
        if bucket.is_empty() {
            buckets.remove(&fd);
        }
    }
}

/// Rounds a blocking budget to whole tenths of a millisecond, matching the
/// four-decimal-place resolution the multiplexer timeout is quoted in.
fn round_timeout(micros: u64) -> u64 {
    (micros + 50) / 100 * 100
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{collections::VecDeque, io};

    const T0: f64 = 1_000.0;

    #[derive(Debug, Clone)]
    struct TestClock {
        now: Rc<Cell<f64>>,
    }

    impl TestClock {
        fn new(start: f64) -> TestClock {
            TestClock {
                now: Rc::new(Cell::new(start)),
            }
        }

        fn get(&self) -> f64 {
            self.now.get()
        }

        fn advance(&self, secs: f64) {
            self.now.set(self.now.get() + secs);
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> f64 {
            self.now.get()
        }

        fn sleep(&self, dur: Duration) {
            self.advance(dur.as_secs_f64());
        }
    }

    /// Multiplexer fed a script of ready sets. An exhausted script behaves
    /// like a timeout and burns the blocking budget on the clock.
    #[derive(Debug)]
    struct ScriptedMux {
        clock: TestClock,
        script: VecDeque<(Vec<RawFd>, Vec<RawFd>)>,
    }

    impl Multiplexer for ScriptedMux {
        fn select(
            &mut self,
            read: &[RawFd],
            write: &[RawFd],
            timeout: f64,
        ) -> io::Result<(Vec<RawFd>, Vec<RawFd>)> {
            match self.script.pop_front() {
                Some((ready_read, ready_write)) => Ok((
                    ready_read.into_iter().filter(|fd| read.contains(fd)).collect(),
                    ready_write
                        .into_iter()
                        .filter(|fd| write.contains(fd))
                        .collect(),
                )),
                None => {
                    self.clock.advance(timeout);
                    Ok((Vec::new(), Vec::new()))
                }
            }
        }
    }

    struct FakeStream(RawFd);

    impl AsRawFd for FakeStream {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    fn scripted_reactor(
        start: f64,
        script: Vec<(Vec<RawFd>, Vec<RawFd>)>,
    ) -> (Reactor, TestClock) {
        let clock = TestClock::new(start);
        let mux = ScriptedMux {
            clock: clock.clone(),
            script: script.into(),
        };
        (
            Reactor::with_parts(Box::new(clock.clone()), Box::new(mux)),
            clock,
        )
    }

    fn timed_reactor(start: f64) -> (Reactor, TestClock) {
        scripted_reactor(start, Vec::new())
    }

    #[test]
    fn ids_are_strictly_increasing_across_kinds() {
        let (reactor, _clock) = timed_reactor(T0);
        let a = reactor.immediately(|_, _| Ok(()));
        let b = reactor.once(|_, _| Ok(()), Duration::from_millis(5));
        let c = reactor.on_readable(&FakeStream(7), |_, _, _| Ok(()), true);
        let d = reactor.repeat(|_, _| Ok(()), Duration::from_millis(5));
        assert!(a < b && b < c && c < d);
        reactor.check_invariants();
    }

    #[test]
    fn immediate_only_run_stops() {
        let (reactor, clock) = timed_reactor(T0);
        let fired = Rc::new(Cell::new(0));
        let observed = fired.clone();
        reactor
            .run_with(move |reactor, _| {
                observed.set(observed.get() + 1);
                reactor.stop();
                Ok(())
            })
            .unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(reactor.watcher_count(), 0);
        assert_eq!(clock.get(), T0);
        reactor.check_invariants();
    }

    #[test]
    fn one_shot_timer_fires_at_its_deadline() {
        let (reactor, clock) = timed_reactor(T0);
        let fired = Rc::new(RefCell::new(Vec::new()));
        let observed = fired.clone();
        let sample = clock.clone();
        reactor.once(
            move |_, _| {
                observed.borrow_mut().push(sample.get());
                Ok(())
            },
            Duration::from_millis(50),
        );
        reactor.run().unwrap();
        let fired = fired.borrow();
        assert_eq!(fired.len(), 1);
        assert!((fired[0] - (T0 + 0.05)).abs() < 1e-6);
        assert_eq!(reactor.watcher_count(), 0);
    }

    #[test]
    fn repeating_timer_keeps_fixed_rate_and_honours_self_cancel() {
        let (reactor, clock) = timed_reactor(T0);
        let fired = Rc::new(RefCell::new(Vec::new()));
        let observed = fired.clone();
        let sample = clock.clone();
        reactor.repeat(
            move |reactor, id| {
                observed.borrow_mut().push(sample.get());
                if observed.borrow().len() == 3 {
                    reactor.cancel(id);
                }
                Ok(())
            },
            Duration::from_millis(20),
        );
        reactor.run().unwrap();
        let fired = fired.borrow();
        assert_eq!(fired.len(), 3);
        for (k, &when) in fired.iter().enumerate() {
            let expected = T0 + 0.02 * (k + 1) as f64;
            assert!((when - expected).abs() < 1e-6, "firing {k} at {when}");
        }
        assert_eq!(reactor.watcher_count(), 0);
    }

    #[test]
    fn repeating_timer_fires_once_per_tick_when_behind() {
        let (reactor, clock) = timed_reactor(T0);
        let count = Rc::new(Cell::new(0));
        let observed = count.clone();
        reactor.repeat(
            move |_, _| {
                observed.set(observed.get() + 1);
                Ok(())
            },
            Duration::from_millis(10),
        );
        reactor.tick().unwrap();
        assert_eq!(count.get(), 1);

        // Fall five intervals behind: still exactly one firing per tick.
        clock.advance(0.05);
        reactor.tick().unwrap();
        assert_eq!(count.get(), 2);
        reactor.tick().unwrap();
        assert_eq!(count.get(), 3);
        reactor.check_invariants();
    }

    #[test]
    fn equal_deadlines_fire_in_id_order_and_honour_mid_scan_cancel() {
        let (reactor, _clock) = timed_reactor(T0);
        let fired = Rc::new(RefCell::new(Vec::new()));
        let victim = Rc::new(Cell::new(None));

        let observed = fired.clone();
        let doomed = victim.clone();
        reactor.once(
            move |reactor, _| {
                observed.borrow_mut().push("first");
                if let Some(id) = doomed.get() {
                    reactor.cancel(id);
                }
                Ok(())
            },
            Duration::from_millis(10),
        );
        let observed = fired.clone();
        let second = reactor.once(
            move |_, _| {
                observed.borrow_mut().push("second");
                Ok(())
            },
            Duration::from_millis(10),
        );
        victim.set(Some(second));

        reactor.tick().unwrap();
        assert_eq!(*fired.borrow(), vec!["first"]);
        assert_eq!(reactor.watcher_count(), 0);
    }

    #[test]
    fn disable_preserves_the_deadline_across_a_miss() {
        let (reactor, clock) = timed_reactor(T0);
        let fired = Rc::new(RefCell::new(Vec::new()));
        let target_id = Rc::new(Cell::new(None));

        let observed = fired.clone();
        let sample = clock.clone();
        let target = reactor.once(
            move |_, _| {
                observed.borrow_mut().push(sample.get());
                Ok(())
            },
            Duration::from_millis(10),
        );
        target_id.set(Some(target));

        let parked = target_id.clone();
        reactor.once(
            move |reactor, _| {
                reactor.disable(parked.get().unwrap());
                Ok(())
            },
            Duration::from_millis(5),
        );
        let parked = target_id;
        reactor.once(
            move |reactor, _| {
                reactor.enable(parked.get().unwrap());
                Ok(())
            },
            Duration::from_millis(30),
        );

        reactor.run().unwrap();
        let fired = fired.borrow();
        assert_eq!(fired.len(), 1, "exactly one firing after re-enable");
        assert!((fired[0] - (T0 + 0.03)).abs() < 1e-6);
    }

    #[test]
    fn reenabled_immediate_runs_on_the_next_tick() {
        let (reactor, _clock) = timed_reactor(T0);
        let count = Rc::new(Cell::new(0));
        let observed = count.clone();
        let id = reactor.immediately(move |_, _| {
            observed.set(observed.get() + 1);
            Ok(())
        });
        reactor.disable(id);
        reactor.tick().unwrap();
        assert_eq!(count.get(), 0);

        reactor.enable(id);
        reactor.check_invariants();
        reactor.tick().unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(reactor.watcher_count(), 0);
    }

    #[test]
    fn ready_streams_dispatch_reads_before_writes_and_skip_cancelled() {
        let (reactor, _clock) = scripted_reactor(T0, vec![(vec![5], vec![6])]);
        let events = Rc::new(RefCell::new(Vec::new()));
        let victim = Rc::new(Cell::new(None));

        let observed = events.clone();
        let doomed = victim.clone();
        reactor.on_readable(
            &FakeStream(5),
            move |reactor, _, fd| {
                observed.borrow_mut().push(format!("read:{fd}"));
                reactor.cancel(doomed.get().unwrap());
                Ok(())
            },
            true,
        );
        let observed = events.clone();
        let second = reactor.on_readable(
            &FakeStream(5),
            move |_, _, _| {
                observed.borrow_mut().push("read:cancelled".to_string());
                Ok(())
            },
            true,
        );
        victim.set(Some(second));
        let observed = events.clone();
        reactor.on_writable(
            &FakeStream(6),
            move |_, _, fd| {
                observed.borrow_mut().push(format!("write:{fd}"));
                Ok(())
            },
            true,
        );

        reactor.tick().unwrap();
        assert_eq!(
            *events.borrow(),
            vec!["read:5".to_string(), "write:6".to_string()]
        );
        reactor.check_invariants();
    }

    #[test]
    fn io_registered_inside_a_callback_waits_for_the_next_tick() {
        let (reactor, _clock) =
            scripted_reactor(T0, vec![(vec![5], vec![]), (vec![5], vec![])]);
        let events = Rc::new(RefCell::new(Vec::new()));
        let observed = events.clone();
        let chained = events.clone();
        reactor.on_readable(
            &FakeStream(5),
            move |reactor, id, _| {
                observed.borrow_mut().push("outer");
                reactor.cancel(id);
                let inner = chained.clone();
                reactor.on_readable(
                    &FakeStream(5),
                    move |reactor, id, _| {
                        inner.borrow_mut().push("inner");
                        reactor.cancel(id);
                        Ok(())
                    },
                    true,
                );
                Ok(())
            },
            true,
        );

        reactor.tick().unwrap();
        assert_eq!(*events.borrow(), vec!["outer"]);
        reactor.tick().unwrap();
        assert_eq!(*events.borrow(), vec!["outer", "inner"]);
        assert_eq!(reactor.watcher_count(), 0);
    }

    #[test]
    fn run_exits_when_an_immediate_cancels_the_last_timer() {
        let (reactor, clock) = timed_reactor(T0);
        let timer = reactor.once(
            |_, _| panic!("cancelled timer must not fire"),
            Duration::from_secs(3600),
        );
        reactor
            .run_with(move |reactor, _| {
                reactor.cancel(timer);
                Ok(())
            })
            .unwrap();
        assert_eq!(clock.get(), T0, "idle exit must not wait out the hour");
        assert_eq!(reactor.watcher_count(), 0);
    }

    #[test]
    fn past_targets_are_rejected_without_consuming_an_id() {
        let (reactor, _clock) = timed_reactor(T0);
        let before = reactor.immediately(|_, _| Ok(()));

        let err = reactor.at_timestamp(|_, _| Ok(()), T0 - 1.0).unwrap_err();
        assert!(matches!(err, EddyError::InvalidTime { .. }));
        // The whole-second boundary itself is not "strictly in the future".
        let err = reactor.at_timestamp(|_, _| Ok(()), T0).unwrap_err();
        assert!(matches!(err, EddyError::InvalidTime { .. }));

        let after = reactor.immediately(|_, _| Ok(()));
        assert_eq!(after.0, before.0 + 1);
    }

    #[test]
    fn absolute_targets_fire_at_that_time() {
        let (reactor, clock) = timed_reactor(T0 + 0.25);
        let fired = Rc::new(RefCell::new(Vec::new()));
        let observed = fired.clone();
        let sample = clock.clone();
        reactor
            .at_timestamp(
                move |_, _| {
                    observed.borrow_mut().push(sample.get());
                    Ok(())
                },
                T0 + 2.0,
            )
            .unwrap();
        reactor.run().unwrap();
        let fired = fired.borrow();
        assert_eq!(fired.len(), 1);
        assert!((fired[0] - (T0 + 2.0)).abs() < 1e-4);
    }

    #[test]
    fn system_time_targets_resolve_against_the_epoch() {
        let (reactor, _clock) = timed_reactor(T0);
        let err = reactor.at(|_, _| Ok(()), UNIX_EPOCH).unwrap_err();
        assert!(matches!(err, EddyError::InvalidTime { .. }));
        let id = reactor.at(
            |_, _| Ok(()),
            UNIX_EPOCH + Duration::from_secs_f64(T0 + 5.0),
        );
        assert!(id.is_ok());
        reactor.check_invariants();
    }

    #[test]
    fn callback_errors_abort_the_run_and_allow_restart() {
        let (reactor, _clock) = timed_reactor(T0);
        reactor.immediately(|_, _| {
            Err(EddyError::callback(io::Error::new(
                io::ErrorKind::Other,
                "boom",
            )))
        });
        let err = reactor.run().unwrap_err();
        assert!(matches!(err, EddyError::Callback(_)));
        assert!(!reactor.is_running());

        let recovered = Rc::new(Cell::new(false));
        let observed = recovered.clone();
        reactor
            .run_with(move |reactor, _| {
                observed.set(true);
                reactor.stop();
                Ok(())
            })
            .unwrap();
        assert!(recovered.get());
    }

    #[test]
    fn failed_immediate_keeps_the_rest_of_the_batch() {
        let (reactor, _clock) = timed_reactor(T0);
        let fired = Rc::new(Cell::new(false));
        reactor.immediately(|_, _| {
            Err(EddyError::callback(io::Error::new(
                io::ErrorKind::Other,
                "boom",
            )))
        });
        let observed = fired.clone();
        reactor.immediately(move |_, _| {
            observed.set(true);
            Ok(())
        });

        assert!(reactor.tick().is_err());
        assert!(!fired.get());
        reactor.check_invariants();

        reactor.tick().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn failed_timer_callback_keeps_the_rest_of_the_due_batch() {
        let (reactor, _clock) = timed_reactor(T0);
        let fired = Rc::new(Cell::new(false));
        reactor.once(
            |_, _| {
                Err(EddyError::callback(io::Error::new(
                    io::ErrorKind::Other,
                    "boom",
                )))
            },
            Duration::from_millis(10),
        );
        let observed = fired.clone();
        reactor.once(
            move |_, _| {
                observed.set(true);
                Ok(())
            },
            Duration::from_millis(10),
        );

        // Both timers share a deadline; the first one's failure must not
        // strand the second outside the timer index.
        assert!(reactor.tick().is_err());
        assert!(!fired.get());
        reactor.check_invariants();

        reactor.tick().unwrap();
        assert!(fired.get());
        assert_eq!(reactor.watcher_count(), 0);
        reactor.check_invariants();
    }

    #[test]
    fn run_inside_a_callback_returns_immediately() {
        let (reactor, _clock) = timed_reactor(T0);
        let entered = Rc::new(Cell::new(0));
        let observed = entered.clone();
        reactor
            .run_with(move |reactor, _| {
                observed.set(observed.get() + 1);
                reactor.run()?;
                reactor.stop();
                Ok(())
            })
            .unwrap();
        assert_eq!(entered.get(), 1);
    }

    #[test]
    fn watch_stream_requires_read_or_write() {
        let (reactor, _clock) = timed_reactor(T0);
        let err = reactor
            .watch_stream(&FakeStream(4), |_, _, _| Ok(()), Watch::NOW)
            .unwrap_err();
        assert!(matches!(err, EddyError::NoInterest { .. }));
        assert_eq!(reactor.watcher_count(), 0);
    }

    #[test]
    fn watch_stream_registers_per_direction_and_parks_without_now() {
        let (reactor, _clock) = scripted_reactor(T0, vec![(vec![9], vec![9])]);
        let events = Rc::new(RefCell::new(Vec::new()));
        let observed = events.clone();
        let ids = reactor
            .watch_stream(
                &FakeStream(9),
                move |reactor, id, fd| {
                    observed.borrow_mut().push(fd);
                    reactor.cancel(id);
                    Ok(())
                },
                Watch::READ | Watch::WRITE,
            )
            .unwrap();
        assert_eq!(ids.len(), 2);
        reactor.check_invariants();

        // Parked: no interest set, so the scripted readiness stays unread.
        reactor.tick().unwrap();
        assert!(events.borrow().is_empty());

        for &id in &ids {
            reactor.enable(id);
        }
        reactor.check_invariants();
        reactor.tick().unwrap();
        assert_eq!(*events.borrow(), vec![9, 9]);
        assert_eq!(reactor.watcher_count(), 0);
    }

    #[test]
    fn cancel_is_idempotent_for_unknown_and_repeated_ids() {
        let (reactor, _clock) = timed_reactor(T0);
        let id = reactor.once(|_, _| Ok(()), Duration::from_millis(1));
        reactor.cancel(id);
        reactor.cancel(id);
        reactor.cancel(WatcherId(9_999));
        reactor.disable(WatcherId(9_999));
        reactor.enable(WatcherId(9_999));
        assert_eq!(reactor.watcher_count(), 0);
        reactor.check_invariants();
    }

    #[test]
    fn tick_without_run_arms_and_fires_pending_timers() {
        let (reactor, clock) = timed_reactor(T0);
        let fired = Rc::new(Cell::new(false));
        let observed = fired.clone();
        reactor.once(
            move |_, _| {
                observed.set(true);
                Ok(())
            },
            Duration::from_millis(5),
        );
        reactor.tick().unwrap();
        assert!(fired.get());
        assert!((clock.get() - (T0 + 0.005)).abs() < 1e-9);
    }

    #[test]
    fn disable_and_enable_are_noops_in_the_wrong_state() {
        let (reactor, _clock) = timed_reactor(T0);
        let count = Rc::new(Cell::new(0));
        let observed = count.clone();
        let id = reactor.once(
            move |_, _| {
                observed.set(observed.get() + 1);
                Ok(())
            },
            Duration::from_millis(5),
        );
        reactor.enable(id); // already active
        reactor.disable(id);
        reactor.disable(id); // already parked
        reactor.check_invariants();
        reactor.enable(id);
        reactor.run().unwrap();
        assert_eq!(count.get(), 1);
    }
}
