//! Deferred Procedure Calls
//!
//! A DPC queue owns one kernel thread that runs queued callbacks in order.
//! Code that must not sleep or do heavy work inline (interrupt handlers,
//! sections holding the scheduler lock) hands the work to the queue.
//!
//! A callback is pending, in progress, or done. `cancel` removes a pending
//! callback; a callback that already started always runs to completion,
//! and `cancel` waits for it.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::kern::sched_prim::ConditionVariable;
use crate::kern::thread::{current_thread, spawn_kernel_thread, thread_yield};
use crate::types::ThreadId;

/// Thread value of a closed queue
const NO_THREAD: u64 = u64::MAX;

/// Work to be run on a DPC thread
pub trait DpcCallback: Send + Sync {
    fn do_dpc(&self, queue: &DpcQueue);
}

/// Argument handed to a queued function
pub type DpcArgument = Option<Arc<dyn Any + Send + Sync>>;

/// Plain function queued through [`DpcQueue::add_function`]
pub type DpcFunction = fn(DpcArgument);

/// Whether the caller already holds the scheduler lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Caller is inside a scheduler critical section and must not yield
    Locked,
    /// Caller may yield to let the DPC thread run
    Unlocked,
}

/// Recyclable wrapper queuing a function and argument
pub struct FunctionDpcCallback {
    call: Mutex<Option<(DpcFunction, DpcArgument)>>,
}

impl FunctionDpcCallback {
    fn new() -> Self {
        Self {
            call: Mutex::new(None),
        }
    }

    fn set_to(&self, function: DpcFunction, argument: DpcArgument) {
        *self.call.lock() = Some((function, argument));
    }

    fn clear(&self) {
        *self.call.lock() = None;
    }
}

impl DpcCallback for FunctionDpcCallback {
    fn do_dpc(&self, _queue: &DpcQueue) {
        let call = self.call.lock().take();
        if let Some((function, argument)) = call {
            function(argument);
        }
    }
}

enum Queued {
    Callback(Arc<dyn DpcCallback>),
    Function(Arc<FunctionDpcCallback>),
}

impl Queued {
    fn callback(&self) -> Arc<dyn DpcCallback> {
        match self {
            Queued::Callback(callback) => callback.clone(),
            Queued::Function(function) => function.clone(),
        }
    }

    fn address(&self) -> *const u8 {
        match self {
            Queued::Callback(callback) => Arc::as_ptr(callback) as *const u8,
            Queued::Function(function) => Arc::as_ptr(function) as *const u8,
        }
    }
}

struct DpcQueueInner {
    pending: VecDeque<Queued>,
    in_progress: Option<*const u8>,
    closing: bool,
}

// The in-progress marker is only compared, never dereferenced.
unsafe impl Send for DpcQueueInner {}

/// A queue of callbacks drained by a dedicated thread
pub struct DpcQueue {
    name: &'static str,
    inner: Mutex<DpcQueueInner>,
    pending_condition: ConditionVariable,
    done_condition: ConditionVariable,
    thread: AtomicU64,
    exited: AtomicBool,
    unused_functions: Mutex<Vec<Arc<FunctionDpcCallback>>>,
}

impl DpcQueue {
    fn new(name: &'static str, function_callbacks: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(DpcQueueInner {
                pending: VecDeque::new(),
                in_progress: None,
                closing: false,
            }),
            pending_condition: ConditionVariable::new("dpc pending"),
            done_condition: ConditionVariable::new("dpc done"),
            thread: AtomicU64::new(NO_THREAD),
            exited: AtomicBool::new(false),
            unused_functions: Mutex::new(
                (0..function_callbacks)
                    .map(|_| Arc::new(FunctionDpcCallback::new()))
                    .collect(),
            ),
        }
    }

    /// Create a queue and start its worker thread
    pub fn init(name: &'static str, function_callbacks: usize) -> Result<Arc<Self>> {
        let queue = Arc::new(Self::new(name, function_callbacks));
        let worker = queue.clone();
        let thread = spawn_kernel_thread(name, Box::new(move || worker.run()))?;
        queue.thread.store(thread.0, Ordering::Release);
        log::info!("dpc queue {:?} running on thread {}", name, thread.0);
        Ok(queue)
    }

    /// Queue name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The worker thread, or `None` once closed
    pub fn thread(&self) -> Option<ThreadId> {
        match self.thread.load(Ordering::Acquire) {
            NO_THREAD => None,
            id => Some(ThreadId(id)),
        }
    }

    /// Has the queue been closed?
    pub fn is_closed(&self) -> bool {
        self.thread().is_none()
    }

    /// Callbacks waiting to run
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Function wrappers available for `add_function`
    pub fn unused_function_count(&self) -> usize {
        self.unused_functions.lock().len()
    }

    /// Queue a callback
    ///
    /// Adding a callback that is already pending does nothing.
    pub fn add(&self, callback: Arc<dyn DpcCallback>, state: SchedulerState) -> Result<()> {
        self.enqueue(Queued::Callback(callback), state)
    }

    /// Queue `function(argument)` using a pooled wrapper
    pub fn add_function(
        &self,
        function: DpcFunction,
        argument: DpcArgument,
        state: SchedulerState,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let callback = self.unused_functions.lock().pop().ok_or(Error::NoMemory)?;
        callback.set_to(function, argument);
        if let Err(error) = self.enqueue(Queued::Function(callback.clone()), state) {
            self.recycle(callback);
            return Err(error);
        }
        Ok(())
    }

    fn enqueue(&self, queued: Queued, state: SchedulerState) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.closing || self.is_closed() {
                return Err(Error::Closed);
            }
            let address = queued.address();
            if inner.pending.iter().any(|q| q.address() == address) {
                return Ok(());
            }
            inner.pending.push_back(queued);
        }
        self.pending_condition.notify_all();

        if state == SchedulerState::Unlocked {
            thread_yield();
        }
        Ok(())
    }

    /// Remove a pending callback
    ///
    /// Returns `true` if the callback was still pending. If it is running,
    /// waits for it to finish (unless called from the DPC thread) and
    /// returns `false`.
    pub fn cancel<C: DpcCallback + ?Sized>(&self, callback: &Arc<C>) -> bool {
        let address = Arc::as_ptr(callback) as *const u8;

        let mut inner = self.inner.lock();
        if let Some(index) = inner.pending.iter().position(|q| q.address() == address) {
            let removed = inner.pending.remove(index);
            drop(inner);
            if let Some(Queued::Function(function)) = removed {
                self.recycle(function);
            }
            return true;
        }

        if self.thread.load(Ordering::Acquire) == current_thread().0 {
            return false;
        }

        while inner.in_progress == Some(address) {
            let entry = self.done_condition.add();
            drop(inner);
            entry.wait();
            inner = self.inner.lock();
        }
        false
    }

    /// Stop the worker thread
    ///
    /// With `cancel_pending` the queued callbacks are dropped; otherwise
    /// the worker runs them before exiting. Unless called from the worker
    /// itself, waits until the worker has exited.
    pub fn close(&self, cancel_pending: bool) {
        let thread = self.thread.swap(NO_THREAD, Ordering::AcqRel);
        if thread == NO_THREAD {
            return;
        }

        let cancelled: Vec<Queued> = {
            let mut inner = self.inner.lock();
            inner.closing = true;
            if cancel_pending {
                inner.pending.drain(..).collect()
            } else {
                Vec::new()
            }
        };
        for queued in cancelled {
            if let Queued::Function(function) = queued {
                self.recycle(function);
            }
        }
        self.pending_condition.notify_all();

        if current_thread().0 != thread {
            while !self.exited.load(Ordering::Acquire) {
                let entry = self.done_condition.add();
                if self.exited.load(Ordering::Acquire) {
                    break;
                }
                entry.wait();
            }
        }
        log::info!("dpc queue {:?} closed", self.name);
    }

    fn recycle(&self, function: Arc<FunctionDpcCallback>) {
        function.clear();
        self.unused_functions.lock().push(function);
    }

    /// Worker loop
    fn run(&self) {
        loop {
            let mut inner = self.inner.lock();
            let queued = loop {
                if let Some(queued) = inner.pending.pop_front() {
                    break queued;
                }
                if inner.closing {
                    drop(inner);
                    self.exited.store(true, Ordering::Release);
                    self.done_condition.notify_all();
                    return;
                }
                let entry = self.pending_condition.add();
                drop(inner);
                entry.wait();
                inner = self.inner.lock();
            };
            inner.in_progress = Some(queued.address());
            drop(inner);

            queued.callback().do_dpc(self);

            self.inner.lock().in_progress = None;
            if let Queued::Function(function) = queued {
                self.recycle(function);
            }
            self.done_condition.notify_all();
        }
    }
}

// ============================================================================
// Default Queue
// ============================================================================

static DEFAULT_QUEUE: spin::Once<Arc<DpcQueue>> = spin::Once::new();

/// Start the kernel-wide DPC queue
pub fn init(config: &KernelConfig) -> Result<()> {
    DEFAULT_QUEUE.try_call_once(|| DpcQueue::init("dpc: default", config.dpc_function_callbacks))?;
    Ok(())
}

/// The kernel-wide DPC queue, once initialized
pub fn default_queue() -> Option<&'static Arc<DpcQueue>> {
    DEFAULT_QUEUE.get()
}
