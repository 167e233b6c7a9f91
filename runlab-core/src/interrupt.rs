//! Deferred interrupts.
//!
//! An [`InterruptHub`] is the single receiver of operator interrupts
//! (Ctrl-C). While at least one [`InterruptGuard`] is armed, an interrupt is
//! only recorded on the innermost guard; the guard acts on it when it drops,
//! by cancelling its token, which makes the surrounding
//! [`StepLoop`](crate::tracker::StepLoop) stop after the current iteration.
//! With no guard armed the hub runs its fallback, which by default exits the
//! process with status 130.
//!
//! Delivery only flips an atomic flag, so it is safe from any thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio_util::sync::CancellationToken;

type Fallback = Box<dyn Fn() + Send + Sync>;

/// What happened to a delivered interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Captured by an armed guard.
    Deferred,
    /// No guard was armed; the fallback ran.
    Fallback,
}

struct Slot {
    id: u64,
    captured: Arc<AtomicBool>,
}

/// Stack of armed interrupt handlers.
pub struct InterruptHub {
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
    fallback: Fallback,
}

impl std::fmt::Debug for InterruptHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHub")
            .field("armed", &self.armed())
            .finish()
    }
}

impl Default for InterruptHub {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptHub {
    /// A hub whose fallback terminates the process like an unhandled Ctrl-C.
    pub fn new() -> Self {
        Self::with_fallback(|| {
            tracing::warn!("Interrupted outside a guarded region, exiting");
            std::process::exit(130);
        })
    }

    pub fn with_fallback(fallback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            fallback: Box::new(fallback),
        }
    }

    /// Process-wide hub used by the binary's signal listener.
    pub fn global() -> Arc<InterruptHub> {
        static GLOBAL: OnceLock<Arc<InterruptHub>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(InterruptHub::new())).clone()
    }

    /// Number of guards currently armed.
    pub fn armed(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver one interrupt.
    pub fn deliver(&self) -> Delivery {
        let captured = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.last().map(|slot| slot.captured.clone())
        };
        match captured {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                tracing::info!("Interrupt received, finishing the current iteration");
                Delivery::Deferred
            }
            None => {
                (self.fallback)();
                Delivery::Fallback
            }
        }
    }

    /// Forward every Ctrl-C to [`InterruptHub::deliver`] until the runtime
    /// shuts down.
    pub fn spawn_ctrl_c_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                    return;
                }
                hub.deliver();
            }
        })
    }

    fn arm(&self) -> (u64, Arc<AtomicBool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let captured = Arc::new(AtomicBool::new(false));
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Slot {
                id,
                captured: captured.clone(),
            });
        (id, captured)
    }

    fn disarm(&self, id: u64) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|slot| slot.id != id);
    }
}

/// Defers interrupts for its lifetime.
///
/// Dropping the guard restores the previous handler, also during a panic,
/// and cancels `token` if an interrupt was captured.
#[must_use = "interrupts are only deferred while the guard is alive"]
pub struct InterruptGuard {
    hub: Arc<InterruptHub>,
    id: u64,
    captured: Arc<AtomicBool>,
    token: CancellationToken,
    released: bool,
}

impl InterruptGuard {
    pub fn arm(hub: &Arc<InterruptHub>, token: CancellationToken) -> Self {
        let (id, captured) = hub.arm();
        Self {
            hub: Arc::clone(hub),
            id,
            captured,
            token,
            released: false,
        }
    }

    /// Whether an interrupt arrived while the guard was armed.
    pub fn is_interrupted(&self) -> bool {
        self.captured.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Disarm now; returns whether an interrupt was captured.
    pub fn release(mut self) -> bool {
        self.disarm()
    }

    fn disarm(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.hub.disarm(self.id);
        let interrupted = self.is_interrupted();
        if interrupted {
            self.token.cancel();
        }
        interrupted
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.disarm();
    }
}
