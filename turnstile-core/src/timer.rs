use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One-shot, rearmable deadline thread. `schedule` arms (or pulls in) the
/// deadline; once it passes, the callback runs on the timer thread with no
/// timer lock held, so it may re-arm. Deadlines track the operating-system
/// clock: a parked thread must actually wake, whatever clock the tables
/// age entries with.
pub(crate) struct GcTimer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

#[derive(Default)]
struct State {
    deadline: Option<Instant>,
    shutdown: bool,
}

/// Handed to the callback so a pass can chain the next one.
pub(crate) struct Rearm<'a> {
    shared: &'a Shared,
}

impl Rearm<'_> {
    pub(crate) fn rearm(&self, delay: Duration) {
        self.shared.arm(delay);
    }
}

impl GcTimer {
    pub(crate) fn spawn<F>(callback: F) -> Self
    where
        F: Fn(Rearm<'_>) + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let thread = thread::Builder::new()
            .name("ratelimit-gc".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run(&shared, callback)
            })
            .expect("spawn rate limit gc thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Arm the timer `delay` from now. An earlier pending deadline wins.
    pub(crate) fn schedule(&self, delay: Duration) {
        self.shared.arm(delay);
    }

    /// Disarm and stop the thread. No callback runs after this returns.
    pub(crate) fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.deadline = None;
            self.shared.wake.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn arm(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        if state.deadline.map_or(true, |current| deadline < current) {
            state.deadline = Some(deadline);
            self.wake.notify_one();
        }
    }
}

fn run<F>(shared: &Shared, callback: F)
where
    F: Fn(Rearm<'_>),
{
    loop {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.deadline {
                None => {
                    shared.wake.wait(&mut state);
                }
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        state.deadline = None;
                        break;
                    }
                    shared.wake.wait_until(&mut state, deadline);
                }
            }
        }
        drop(state);
        callback(Rearm { shared });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn fires_once_per_arm() {
        let count = Arc::new(AtomicUsize::new(0));
        let timer = GcTimer::spawn({
            let count = Arc::clone(&count);
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        timer.schedule(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        timer.schedule(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_cancels_a_pending_deadline() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut timer = GcTimer::spawn({
            let count = Arc::clone(&count);
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        timer.schedule(Duration::from_millis(50));
        timer.stop();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
