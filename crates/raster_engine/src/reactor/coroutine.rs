//! Coroutine support for staged code emission
//!
//! A [`Coroutine`] is a JIT'd generator body: inside the body,
//! [`CoroutineBuilder::yield_value`] emits a call back into the host that
//! parks the body until the consumer asks for the next value. Two
//! interchangeable runtimes host the body — a dedicated OS thread (the
//! portable equivalent of a private-stack fiber) or a task on the shared
//! worker scheduler. Both satisfy the same instance contract:
//! `start → { suspend | resume | is_done }* → stop`.
//!
//! The active runtime is a process-global selector; switching it while any
//! coroutine is live is a programmer error and panics.

use super::backend::{self, BuildError, BuildOptions};
use super::builder::FunctionBuilder;
use super::ir::{CmpOp, Type, Value};
use super::routine::Routine;
use crate::task::{Event, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Which runtime hosts coroutine bodies
#[derive(Clone)]
pub enum RuntimeKind {
    /// One OS thread per coroutine, paired-event handoff
    Thread,
    /// Coroutine bodies run as tasks on the given scheduler
    Task(Arc<Scheduler>),
}

impl std::fmt::Debug for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Thread => write!(f, "Thread"),
            RuntimeKind::Task(_) => write!(f, "Task"),
        }
    }
}

static ACTIVE_RUNTIME: Mutex<Option<RuntimeKind>> = Mutex::new(None);
static LIVE_COROUTINES: AtomicUsize = AtomicUsize::new(0);

/// Selects the process-global coroutine runtime.
///
/// Panics if any coroutine stream is currently live.
pub fn set_runtime(kind: RuntimeKind) {
    assert_eq!(
        LIVE_COROUTINES.load(Ordering::SeqCst),
        0,
        "cannot switch the coroutine runtime while coroutines are live"
    );
    *ACTIVE_RUNTIME.lock().unwrap() = Some(kind);
}

fn active_runtime() -> RuntimeKind {
    ACTIVE_RUNTIME
        .lock()
        .unwrap()
        .clone()
        .unwrap_or(RuntimeKind::Thread)
}

/// Handoff state shared between a coroutine body and its consumer.
///
/// The generated body receives a pointer to this state as its only argument
/// and reports yields through [`yield_hook`].
struct SharedState {
    /// The body has yielded or terminated
    suspended: Event,
    /// The consumer wants the next value
    resumed: Event,
    /// The body has returned
    done: Event,
    /// Stop requested; the next yield returns instead of continuing
    stop: Event,
    /// The most recent yielded value (the coroutine's promise)
    promise: Mutex<Option<i32>>,
}

impl SharedState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            suspended: Event::new(),
            resumed: Event::new(),
            done: Event::new(),
            stop: Event::new(),
            promise: Mutex::new(None),
        })
    }

    fn set_promise(&self, value: i32) {
        *self.promise.lock().unwrap() = Some(value);
    }

    fn take_promise(&self) -> Option<i32> {
        self.promise.lock().unwrap().take()
    }

    /// Parks the body at a yield point. Returns whether the body should keep
    /// running.
    fn suspend(&self) -> bool {
        self.suspended.signal();
        self.resumed.wait();
        self.resumed.clear();
        !self.stop.test()
    }

    /// Wakes the body and waits until it suspends again or terminates
    fn resume(&self) {
        self.resumed.signal();
        self.suspended.wait();
        self.suspended.clear();
    }

    fn is_done(&self) -> bool {
        self.done.test()
    }
}

/// Called by generated code at each yield point. Returns 1 to continue the
/// body, 0 when the consumer requested a stop.
extern "C" fn yield_hook(state: *const SharedState, value: i32) -> i32 {
    // SAFETY: the stream keeps the shared state alive until the body has
    // terminated; generated code only receives valid handles.
    let state = unsafe { &*state };
    state.set_promise(value);
    i32::from(state.suspend())
}

/// Emits a yield of an `Int` value inside a coroutine body. `state` must be
/// the body's state parameter. If the consumer has requested a stop, the body
/// returns here.
pub fn emit_yield(b: &mut FunctionBuilder, state: Value, value: Value) {
    let hook = b.const_ptr(yield_hook as *const u8);
    let keep_going = b.call_ptr(hook, &[state, value], Type::Int);
    let zero = b.const_int(0);
    let stop = b.icmp(CmpOp::Eq, keep_going, zero);
    b.if_then(stop, |b| b.ret(None));
}

/// Builds a coroutine body function: `(state_ptr) → void` with yield points
pub struct CoroutineBuilder {
    builder: FunctionBuilder,
}

impl Default for CoroutineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoroutineBuilder {
    /// Begins a coroutine body
    pub fn new() -> Self {
        Self {
            builder: FunctionBuilder::new(&[Type::Ptr], Type::Void),
        }
    }

    /// The underlying function builder for the body's computation
    pub fn builder(&mut self) -> &mut FunctionBuilder {
        &mut self.builder
    }

    /// The hidden state parameter, needed to yield inside nested control flow
    pub fn state_param(&self) -> Value {
        self.builder.param(0)
    }

    /// Emits a yield of an `Int` value at the top level of the body
    pub fn yield_value(&mut self, value: Value) {
        let state = self.builder.param(0);
        emit_yield(&mut self.builder, state, value);
    }

    /// Finalizes and compiles the body
    pub fn finish(self, name: &str, options: &BuildOptions) -> Result<Coroutine, BuildError> {
        let func = self.builder.finish();
        let routine = backend::build(&func, name, options)?;
        Ok(Coroutine { routine })
    }
}

/// A compiled coroutine body; `start` instantiates a stream
pub struct Coroutine {
    routine: Arc<Routine>,
}

impl Coroutine {
    /// Starts the body on the active runtime and runs it to its first yield
    pub fn start(&self) -> Stream {
        let state = SharedState::new();
        let entry = self.routine.entry(0) as usize;
        let routine = Arc::clone(&self.routine);
        let body_state = Arc::clone(&state);

        let body = move || {
            let f: extern "C" fn(*const SharedState) = unsafe { std::mem::transmute(entry) };
            f(Arc::as_ptr(&body_state));
            // Keep the routine mapped for the whole run.
            drop(routine);
            body_state.done.signal();
            body_state.suspended.signal();
        };

        LIVE_COROUTINES.fetch_add(1, Ordering::SeqCst);
        let runtime = active_runtime();
        match &runtime {
            RuntimeKind::Thread => {
                std::thread::Builder::new()
                    .name("raster-coroutine".into())
                    .spawn(body)
                    .expect("failed to spawn coroutine thread");
            }
            RuntimeKind::Task(scheduler) => scheduler.spawn(body),
        }

        // Block until the first yield or completion.
        state.suspended.wait();
        state.suspended.clear();

        Stream { state }
    }
}

/// Consumer side of a started coroutine
pub struct Stream {
    state: Arc<SharedState>,
}

impl Stream {
    /// Returns the next yielded value, or `None` once the body has returned
    pub fn next(&mut self) -> Option<i32> {
        loop {
            if let Some(value) = self.state.take_promise() {
                return Some(value);
            }
            if self.state.is_done() {
                return None;
            }
            self.state.resume();
        }
    }

    /// Whether the body has terminated
    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.state.is_done() {
            self.state.stop.signal();
            self.state.resume();
            self.state.done.wait();
        }
        LIVE_COROUTINES.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The runtime selector is process-global; serialize these tests.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    /// yield 0; yield 1; loop { yield next; (current, next) = (next, current + next) }
    fn build_fibonacci() -> Coroutine {
        let mut c = CoroutineBuilder::new();
        let state = c.state_param();

        let zero = c.builder().const_int(0);
        c.yield_value(zero);
        let one = c.builder().const_int(1);
        c.yield_value(one);

        let b = c.builder();
        let one = b.const_int(1);
        let current = b.var_init(one);
        let one = b.const_int(1);
        let next = b.var_init(one);

        b.while_loop(
            |b| b.const_bool(true),
            |b| {
                let n = b.get(&next);
                emit_yield(b, state, n);
                let cur = b.get(&current);
                let n = b.get(&next);
                let sum = b.add(cur, n);
                b.set(&current, n);
                b.set(&next, sum);
            },
        );

        c.finish("fibonacci", &BuildOptions::default()).unwrap()
    }

    #[test]
    fn test_fibonacci_stream_both_runtimes() {
        let _guard = TEST_LOCK.lock().unwrap();
        let runtimes: Vec<RuntimeKind> =
            vec![RuntimeKind::Thread, RuntimeKind::Task(Scheduler::new(2))];
        for runtime in runtimes {
            set_runtime(runtime);
            let coroutine = build_fibonacci();
            let mut stream = coroutine.start();
            let got: Vec<i32> = (0..8).map(|_| stream.next().unwrap()).collect();
            assert_eq!(got, vec![0, 1, 1, 2, 3, 5, 8, 13]);
            drop(stream); // stop mid-generator
        }
        set_runtime(RuntimeKind::Thread);
    }

    #[test]
    fn test_finite_body_drains_to_none() {
        let _guard = TEST_LOCK.lock().unwrap();
        let mut c = CoroutineBuilder::new();
        let v = c.builder().const_int(7);
        c.yield_value(v);
        let v = c.builder().const_int(8);
        c.yield_value(v);
        let coroutine = c.finish("short", &BuildOptions::default()).unwrap();

        let mut stream = coroutine.start();
        assert_eq!(stream.next(), Some(7));
        assert_eq!(stream.next(), Some(8));
        assert_eq!(stream.next(), None);
        assert!(stream.is_done());
    }

    #[test]
    fn test_stop_terminates_cleanly() {
        let _guard = TEST_LOCK.lock().unwrap();
        let mut c = CoroutineBuilder::new();
        let state = c.state_param();
        let b = c.builder();
        let zero = b.const_int(0);
        let counter = b.var_init(zero);
        b.while_loop(
            |b| b.const_bool(true),
            |b| {
                let v = b.get(&counter);
                emit_yield(b, state, v);
                let v = b.get(&counter);
                let one = b.const_int(1);
                let v = b.add(v, one);
                b.set(&counter, v);
            },
        );
        let coroutine = c.finish("counter", &BuildOptions::default()).unwrap();

        let mut stream = coroutine.start();
        assert_eq!(stream.next(), Some(0));
        assert_eq!(stream.next(), Some(1));
        drop(stream); // requests a stop; the body exits at its next yield
    }
}
