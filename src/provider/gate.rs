//! Multi-flag readiness barrier.
//!
//! Work submitted through [`ReadinessGate::call`] is queued until every flag
//! is set, then released in submission order. Clearing a flag closes the gate
//! again; anything still queued stays queued. There is no timeout.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use asupersync::Cx;
use asupersync::channel::oneshot;

use super::ProviderError;

type Task = Box<dyn FnOnce() + Send>;

struct GateState {
    flags: Vec<bool>,
    tasks: VecDeque<Task>,
    draining: bool,
}

impl GateState {
    fn is_open(&self) -> bool {
        self.flags.iter().all(|flag| *flag)
    }
}

#[derive(Clone)]
pub struct ReadinessGate {
    state: Arc<StdMutex<GateState>>,
}

impl std::fmt::Debug for ReadinessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("gate mutex poisoned");
        f.debug_struct("ReadinessGate")
            .field("flags", &state.flags)
            .field("queued", &state.tasks.len())
            .finish()
    }
}

impl ReadinessGate {
    #[must_use]
    pub fn new(arity: usize) -> Self {
        Self {
            state: Arc::new(StdMutex::new(GateState {
                flags: vec![false; arity],
                tasks: VecDeque::new(),
                draining: false,
            })),
        }
    }

    /// Sets flag `index` (1-based) and releases queued work if the gate is
    /// now open.
    pub fn check(&self, index: usize) {
        if self.set_flag(index, true) {
            self.proceed();
        }
    }

    /// Clears flag `index` (1-based). Does not touch the queue.
    pub fn uncheck(&self, index: usize) {
        let _ = self.set_flag(index, false);
    }

    /// Convenience for flags driven by an external boolean signal.
    pub fn set(&self, index: usize, value: bool) {
        if value {
            self.check(index);
        } else {
            self.uncheck(index);
        }
    }

    #[must_use]
    pub fn is_checked(&self, index: usize) -> bool {
        let state = self.state.lock().expect("gate mutex poisoned");
        index
            .checked_sub(1)
            .and_then(|slot| state.flags.get(slot).copied())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().expect("gate mutex poisoned").is_open()
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().expect("gate mutex poisoned").tasks.len()
    }

    /// Queues `task` and returns a ticket for its result. If the gate is
    /// open and nothing is ahead of it, `task` runs before this returns.
    pub fn call<T, F>(&self, task: F) -> GateTicket<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Task = Box::new(move || {
            let value = task();
            let cx = Cx::for_request();
            let _ = tx.send(&cx, value);
        });
        self.state
            .lock()
            .expect("gate mutex poisoned")
            .tasks
            .push_back(wrapped);
        self.proceed();
        GateTicket { rx }
    }

    fn set_flag(&self, index: usize, value: bool) -> bool {
        let mut state = self.state.lock().expect("gate mutex poisoned");
        let arity = state.flags.len();
        match index.checked_sub(1).and_then(|slot| state.flags.get_mut(slot)) {
            Some(flag) => {
                *flag = value;
                true
            }
            None => {
                tracing::warn!(index, arity, "ignoring out-of-range readiness flag");
                false
            }
        }
    }

    fn proceed(&self) {
        {
            let mut state = self.state.lock().expect("gate mutex poisoned");
            if state.draining {
                // The active drain loop picks up whatever was just queued.
                return;
            }
            state.draining = true;
        }

        let mut guard = DrainGuard {
            state: &self.state,
            armed: true,
        };
        loop {
            let task = {
                let mut state = self.state.lock().expect("gate mutex poisoned");
                let next = if state.is_open() {
                    state.tasks.pop_front()
                } else {
                    None
                };
                if next.is_none() {
                    state.draining = false;
                    guard.armed = false;
                }
                next
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }
}

/// Clears the draining marker if a task unwinds mid-drain.
struct DrainGuard<'a> {
    state: &'a StdMutex<GateState>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut state) = self.state.lock() {
                state.draining = false;
            }
        }
    }
}

/// Pending result of a gated task.
#[must_use = "a gate ticket does nothing unless awaited"]
pub struct GateTicket<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> std::fmt::Debug for GateTicket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateTicket").finish_non_exhaustive()
    }
}

impl<T> GateTicket<T> {
    /// Resolves once the task has run. Fails only if the gate was dropped
    /// with the task still queued.
    pub async fn wait(mut self) -> Result<T, ProviderError> {
        let cx = Cx::for_request();
        self.rx
            .recv(&cx)
            .await
            .map_err(|_| ProviderError::Disconnected)
    }
}
