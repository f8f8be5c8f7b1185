//! Thread plumbing shared by the source and sink engines

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Cooperative stop flag with a broadcast wake for interruptible sleeps.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    shared: Arc<StopShared>,
}

#[derive(Debug, Default)]
struct StopShared {
    stopping: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        // Taken so a sleeper between its check and its wait cannot miss us.
        let _guard = self.shared.mutex.lock();
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
    }

    pub fn reset(&self) {
        self.shared.stopping.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Sleep up to `timeout`; returns `true` if stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.shared.mutex.lock();
        if self.is_stopped() {
            return true;
        }
        self.shared.condvar.wait_for(&mut guard, timeout);
        self.is_stopped()
    }
}

/// Spawn a named engine thread, optionally pinned to one CPU core.
pub fn spawn_named<F>(name: String, cpu_core: Option<usize>, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            if let Some(core) = cpu_core {
                pin_current_thread(&name, core);
            }
            body();
        })
        .map_err(|e| PipelineError::Thread(e.to_string()))
}

fn pin_current_thread(thread_name: &str, core: usize) {
    let Some(ids) = core_affinity::get_core_ids() else {
        warn!(thread = thread_name, "cpu affinity unavailable on this platform");
        return;
    };
    match ids.into_iter().find(|id| id.id == core) {
        Some(id) if core_affinity::set_for_current(id) => {
            debug!(thread = thread_name, core, "thread pinned");
        }
        _ => warn!(thread = thread_name, core, "failed to pin thread"),
    }
}

/// Join an engine thread, logging rather than propagating a panic payload.
pub fn join_logged(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
    if let Err(payload) = handle.join() {
        warn!(thread = %name, panic = %panic_message(&payload), "engine thread panicked");
    }
}

pub fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
