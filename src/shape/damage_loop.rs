use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    PerchError, Result,
    shape::{LoopControl, ShapeEngine, ShapeTarget},
};

/// Background thread feeding window events into a [`ShapeEngine`].
///
/// The loop drains every pending event, then sleeps for the poll interval.
/// It ends on its own when the window is destroyed or the connection drops.
pub struct DamageLoop {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DamageLoop {
    pub fn spawn<T: ShapeTarget>(engine: Arc<ShapeEngine<T>>, poll_interval: Duration) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("perch-damage".to_owned())
            .spawn(move || run(&engine, &flag, poll_interval))
            .map_err(|err| PerchError::EventLoop(format!("failed to spawn damage thread: {err}")))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Asks the loop to exit and waits for it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("damage thread panicked");
        }
    }
}

impl Drop for DamageLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<T: ShapeTarget>(engine: &ShapeEngine<T>, running: &AtomicBool, poll_interval: Duration) {
    tracing::debug!(interval = ?poll_interval, "damage loop started");

    while running.load(Ordering::Acquire) {
        match engine.pump_one() {
            Ok(Some(LoopControl::Continue)) => {}
            Ok(Some(LoopControl::Stop)) => break,
            Ok(None) => thread::sleep(poll_interval),
            Err(PerchError::Closed) => break,
            Err(err) => {
                tracing::error!("damage loop stopping: {err}");
                break;
            }
        }
    }

    running.store(false, Ordering::Release);
    tracing::debug!("damage loop finished");
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Instant};

    use super::*;
    use crate::{
        backend::DamageHandle,
        geometry::Size,
        shape::{ShapeEvent, testing::RecordingTarget},
    };

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn loop_exits_after_destroy() {
        let target = Arc::new(RecordingTarget::default());
        let engine = Arc::new(ShapeEngine::new(
            Arc::clone(&target),
            Arc::new(AtomicBool::new(false)),
        ));
        engine.activate(Size::new(4, 4)).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        engine.on_window_destroyed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        target.push_event(ShapeEvent::Damaged(DamageHandle(3)));
        target.push_event(ShapeEvent::Destroyed);
        let damage_loop = DamageLoop::spawn(Arc::clone(&engine), Duration::from_millis(1)).unwrap();

        wait_until(|| !damage_loop.is_running());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*target.acknowledged.lock().unwrap(), vec![DamageHandle(3)]);
    }

    #[test]
    fn stop_joins_idle_loop() {
        let target = Arc::new(RecordingTarget::default());
        let engine = Arc::new(ShapeEngine::new(target, Arc::new(AtomicBool::new(false))));
        let mut damage_loop = DamageLoop::spawn(engine, Duration::from_millis(1)).unwrap();
        assert!(damage_loop.is_running());
        damage_loop.stop();
        assert!(!damage_loop.is_running());
    }
}
