use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Stop request shared by the controller engine loop and the agent loop.
/// Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownLatch {
    requested: Arc<AtomicBool>,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Sleeps for `duration` in slices of at most `step`, waking early on a
    /// stop request. Returns `false` if shutdown was requested.
    pub fn pause(&self, duration: Duration, step: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(step.min(deadline - now));
        }
    }
}

/// SIGINT/SIGTERM handlers wired to a [`ShutdownLatch`]. Dropping the hooks
/// unregisters the handlers.
pub struct ShutdownHooks {
    latch: ShutdownLatch,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let latch = ShutdownLatch::new();

        #[cfg(unix)]
        {
            let sig_ids = [SIGINT, SIGTERM]
                .into_iter()
                .map(|signal| flag::register(signal, Arc::clone(&latch.requested)))
                .collect::<io::Result<Vec<SigId>>>()?;
            Ok(Self { latch, sig_ids })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { latch })
        }
    }

    pub fn latch(&self) -> ShutdownLatch {
        self.latch.clone()
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}
