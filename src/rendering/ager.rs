//! Background pixel ageing for interactive renderings.
//!
//! A 10 Hz task takes the rendering's buffer mutex and applies the
//! fade/zero rules from the accumulation module. Only spawned for
//! renderings owned by this rank when the caller opts into asynchronous
//! mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::rendering::Rendering;

const TICK: Duration = Duration::from_millis(100);

/// Handle to a running ager thread; stops and joins on drop.
pub struct Ager {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ager {
    /// Start ageing `rendering` with the given content lifetime and
    /// fade-out window.
    pub fn start(rendering: Arc<Rendering>, max_age: Duration, fadeout: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let handle = std::thread::Builder::new()
            .name(format!("ager-{}", rendering.key()))
            .spawn(move || {
                while !stop2.load(Ordering::Relaxed) {
                    std::thread::sleep(TICK);
                    let _ = rendering.with_buffer_mut(|fb| {
                        fb.age_tick(max_age, fadeout, Instant::now());
                    });
                }
            })
            .expect("spawn ager thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Ager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
