//! Click-through shaping.
//!
//! The engine keeps the window's input region equal to its non-transparent
//! pixels. Protocol work is delegated to a [`ShapeTarget`]; the engine owns
//! the state machine, the drag backpressure flag, resize ordering and the
//! destroy handler table.

pub mod damage_loop;
pub mod mask;
pub mod x11;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::{
    Result,
    backend::{DamageHandle, WindowHandle},
    geometry::{Point, Size},
};
use mask::{BitmapFormat, Frame, MaskError, PixelMask};

pub use damage_loop::DamageLoop;
pub use x11::X11ShapeTarget;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeState {
    Disabled,
    Enabling,
    Active,
    /// The window is gone. Terminal.
    Stopped,
}

/// Window-system notifications the damage loop reacts to. Only events for
/// the shaped window are reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeEvent {
    Resized(Size),
    Damaged(DamageHandle),
    Destroyed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskOutcome {
    Applied { accepting: usize },
    SkippedDragging,
    Discarded(MaskError),
    CaptureFailed,
    Inactive,
}

/// Protocol side of shaping for one window.
pub trait ShapeTarget: Send + Sync + 'static {
    fn window(&self) -> WindowHandle;
    fn bitmap_format(&self) -> BitmapFormat;
    fn capture_frame(&self, size: Size) -> Result<Frame>;
    fn apply_bounding_rect(&self, size: Size) -> Result<()>;
    fn apply_input_mask(&self, mask: &PixelMask) -> Result<()>;
    /// Returns at most one pending event without blocking.
    fn poll_event(&self) -> Result<Option<ShapeEvent>>;
    fn acknowledge_damage(&self, damage: DamageHandle) -> Result<()>;
    /// Drops the damage subscription. `window_gone` means the server already
    /// freed it along with the window.
    fn release(&self, window_gone: bool);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

type DestroyHandler = Box<dyn Fn(WindowHandle) + Send + Sync>;

pub struct ShapeEngine<T: ShapeTarget> {
    target: T,
    state: Mutex<ShapeState>,
    dragging: Arc<AtomicBool>,
    latest_size: Mutex<Size>,
    /// What the server currently uses as the input shape.
    applied_mask: Mutex<Option<PixelMask>>,
    handlers: Mutex<HashMap<HandlerId, DestroyHandler>>,
    next_handler: AtomicU64,
    discarded: AtomicU64,
}

impl<T: ShapeTarget> ShapeEngine<T> {
    pub fn new(target: T, dragging: Arc<AtomicBool>) -> Self {
        Self {
            target,
            state: Mutex::new(ShapeState::Disabled),
            dragging,
            latest_size: Mutex::new(Size::default()),
            applied_mask: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn state(&self) -> ShapeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ShapeState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == ShapeState::Active
    }

    pub fn latest_size(&self) -> Size {
        *self.latest_size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the newest known window size. Masks captured for any other
    /// size are dropped.
    pub fn note_resize(&self, size: Size) {
        *self.latest_size.lock().unwrap_or_else(PoisonError::into_inner) = size;
    }

    /// Number of captures thrown away because they raced a resize or came
    /// back malformed.
    pub fn discarded_masks(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Applies the first bounding and input shapes and moves to `Active`.
    pub fn activate(&self, size: Size) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ShapeState::Disabled {
                tracing::debug!(state = ?*state, "shape engine already enabled");
                return Ok(());
            }
            *state = ShapeState::Enabling;
        }

        self.note_resize(size);
        if let Err(err) = self.target.apply_bounding_rect(size) {
            self.set_state(ShapeState::Disabled);
            return Err(err);
        }
        self.set_state(ShapeState::Active);

        let outcome = self.recompute_input_mask(size);
        tracing::info!(window = %self.target.window(), %size, ?outcome, "click-through shaping active");
        Ok(())
    }

    /// Makes the whole `size` rectangle paintable. Calling it again with the
    /// same size changes nothing.
    pub fn apply_full_bounding_mask(&self, size: Size) {
        if !self.is_active() || size.is_empty() {
            return;
        }
        if let Err(err) = self.target.apply_bounding_rect(size) {
            tracing::warn!(%size, "failed to apply bounding shape: {err}");
        }
    }

    /// Rebuilds the input shape from the window's current pixels.
    pub fn recompute_input_mask(&self, size: Size) -> MaskOutcome {
        if !self.is_active() {
            return MaskOutcome::Inactive;
        }
        if self.dragging.load(Ordering::Acquire) {
            return MaskOutcome::SkippedDragging;
        }

        let frame = match self.target.capture_frame(size) {
            Ok(frame) => frame,
            Err(err) => {
                // Usually a resize shrank the window under us.
                tracing::trace!(%size, "capture failed: {err}");
                self.discarded.fetch_add(1, Ordering::Relaxed);
                return MaskOutcome::CaptureFailed;
            }
        };

        let mask = match PixelMask::from_frame(&frame, self.latest_size(), self.target.bitmap_format()) {
            Ok(mask) => mask,
            Err(err) => {
                tracing::trace!("discarding input mask: {err}");
                self.discarded.fetch_add(1, Ordering::Relaxed);
                return MaskOutcome::Discarded(err);
            }
        };

        if let Err(err) = self.target.apply_input_mask(&mask) {
            tracing::warn!(size = %mask.size(), "failed to apply input shape: {err}");
            return MaskOutcome::CaptureFailed;
        }

        if mask.is_fully_transparent() {
            tracing::trace!(size = %mask.size(), "frame fully transparent; window is click-through");
        }
        let accepting = mask.accepting_pixels();
        *self.applied_mask.lock().unwrap_or_else(PoisonError::into_inner) = Some(mask);
        MaskOutcome::Applied { accepting }
    }

    /// Whether a press at `local` (window coordinates) lands on the window
    /// rather than passing through to whatever is below. Before the first
    /// input mask is applied the whole window accepts input.
    pub fn accepts_input(&self, local: Point) -> bool {
        let (Ok(x), Ok(y)) = (usize::try_from(local.x), usize::try_from(local.y)) else {
            return false;
        };
        match &*self.applied_mask.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(mask) => mask.get(x, y),
            None => true,
        }
    }

    pub fn handle_event(&self, event: ShapeEvent) -> LoopControl {
        match event {
            ShapeEvent::Resized(size) => {
                if size.is_empty() {
                    return LoopControl::Continue;
                }
                tracing::debug!(%size, "shaped window resized");
                self.note_resize(size);
                self.apply_full_bounding_mask(size);
                self.recompute_input_mask(size);
                LoopControl::Continue
            }
            ShapeEvent::Damaged(damage) => {
                if let Err(err) = self.target.acknowledge_damage(damage) {
                    tracing::debug!(damage = %damage, "failed to subtract damage: {err}");
                }
                self.recompute_input_mask(self.latest_size());
                LoopControl::Continue
            }
            ShapeEvent::Destroyed => {
                self.window_destroyed();
                LoopControl::Stop
            }
        }
    }

    /// Polls and handles one event. `None` means the queue was empty.
    pub fn pump_one(&self) -> Result<Option<LoopControl>> {
        match self.target.poll_event()? {
            Some(event) => Ok(Some(self.handle_event(event))),
            None => Ok(None),
        }
    }

    fn window_destroyed(&self) {
        let window = self.target.window();
        tracing::info!(window = %window, "shaped window destroyed; shaping stopped");
        self.set_state(ShapeState::Stopped);
        self.target.release(true);

        let handlers = std::mem::take(
            &mut *self.handlers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut handlers: Vec<_> = handlers.into_iter().collect();
        handlers.sort_by_key(|(id, _)| *id);
        for (_, handler) in handlers {
            handler(window);
        }
    }

    /// Registers a closure to run once when the shaped window is destroyed.
    pub fn on_window_destroyed<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(WindowHandle) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Box::new(handler));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Tears down the damage subscription. The engine does not restart.
    pub fn shutdown(&self) {
        let was_active = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let was_active = *state == ShapeState::Active;
            if *state != ShapeState::Disabled {
                *state = ShapeState::Stopped;
            }
            was_active
        };
        if was_active {
            self.target.release(false);
            tracing::debug!(window = %self.target.window(), "shape engine shut down");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`ShapeTarget`] used by the engine and loop tests.

    use std::{collections::VecDeque, sync::Mutex};

    use super::*;
    use crate::shape::mask::ByteOrder;

    #[derive(Default)]
    pub struct RecordingTarget {
        pub frames: Mutex<VecDeque<Frame>>,
        pub events: Mutex<VecDeque<ShapeEvent>>,
        pub bounding: Mutex<Vec<Size>>,
        pub input: Mutex<Vec<PixelMask>>,
        pub acknowledged: Mutex<Vec<DamageHandle>>,
        pub released: Mutex<Vec<bool>>,
        pub captures: Mutex<Vec<Size>>,
    }

    impl RecordingTarget {
        pub fn push_frame(&self, frame: Frame) {
            self.frames.lock().unwrap().push_back(frame);
        }

        pub fn push_event(&self, event: ShapeEvent) {
            self.events.lock().unwrap().push_back(event);
        }

        pub fn opaque_frame(size: Size) -> Frame {
            Frame::new(size, ByteOrder::LsbFirst, vec![0xff; Frame::expected_len(size)])
        }
    }

    impl ShapeTarget for RecordingTarget {
        fn window(&self) -> WindowHandle {
            WindowHandle(0x2a)
        }

        fn bitmap_format(&self) -> BitmapFormat {
            BitmapFormat::default()
        }

        fn capture_frame(&self, size: Size) -> Result<Frame> {
            self.captures.lock().unwrap().push(size);
            Ok(self
                .frames
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Self::opaque_frame(size)))
        }

        fn apply_bounding_rect(&self, size: Size) -> Result<()> {
            self.bounding.lock().unwrap().push(size);
            Ok(())
        }

        fn apply_input_mask(&self, mask: &PixelMask) -> Result<()> {
            self.input.lock().unwrap().push(mask.clone());
            Ok(())
        }

        fn poll_event(&self) -> Result<Option<ShapeEvent>> {
            Ok(self.events.lock().unwrap().pop_front())
        }

        fn acknowledge_damage(&self, damage: DamageHandle) -> Result<()> {
            self.acknowledged.lock().unwrap().push(damage);
            Ok(())
        }

        fn release(&self, window_gone: bool) {
            self.released.lock().unwrap().push(window_gone);
        }
    }

    impl ShapeTarget for Arc<RecordingTarget> {
        fn window(&self) -> WindowHandle {
            self.as_ref().window()
        }
        fn bitmap_format(&self) -> BitmapFormat {
            self.as_ref().bitmap_format()
        }
        fn capture_frame(&self, size: Size) -> Result<Frame> {
            self.as_ref().capture_frame(size)
        }
        fn apply_bounding_rect(&self, size: Size) -> Result<()> {
            self.as_ref().apply_bounding_rect(size)
        }
        fn apply_input_mask(&self, mask: &PixelMask) -> Result<()> {
            self.as_ref().apply_input_mask(mask)
        }
        fn poll_event(&self) -> Result<Option<ShapeEvent>> {
            self.as_ref().poll_event()
        }
        fn acknowledge_damage(&self, damage: DamageHandle) -> Result<()> {
            self.as_ref().acknowledge_damage(damage)
        }
        fn release(&self, window_gone: bool) {
            self.as_ref().release(window_gone)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::testing::RecordingTarget;
    use super::*;
    use crate::shape::mask::ByteOrder;

    fn active_engine(size: Size) -> (Arc<RecordingTarget>, ShapeEngine<Arc<RecordingTarget>>, Arc<AtomicBool>) {
        let target = Arc::new(RecordingTarget::default());
        let dragging = Arc::new(AtomicBool::new(false));
        let engine = ShapeEngine::new(Arc::clone(&target), Arc::clone(&dragging));
        engine.activate(size).unwrap();
        (target, engine, dragging)
    }

    #[test]
    fn activation_applies_both_shapes() {
        let size = Size::new(64, 48);
        let (target, engine, _) = active_engine(size);
        assert_eq!(engine.state(), ShapeState::Active);
        assert_eq!(*target.bounding.lock().unwrap(), vec![size]);
        assert_eq!(target.input.lock().unwrap().len(), 1);
    }

    #[test]
    fn mismatched_buffer_never_reaches_shape_call() {
        let size = Size::new(8, 8);
        let (target, engine, _) = active_engine(size);
        target.push_frame(Frame::new(size, ByteOrder::LsbFirst, vec![0xff; 8 * 8 * 4 - 1]));

        let outcome = engine.recompute_input_mask(size);

        assert!(matches!(
            outcome,
            MaskOutcome::Discarded(MaskError::LengthMismatch { .. })
        ));
        assert_eq!(target.input.lock().unwrap().len(), 1);
        assert_eq!(engine.discarded_masks(), 1);
    }

    #[test]
    fn every_applied_mask_matches_window_size() {
        let size = Size::new(8, 8);
        let (target, engine, _) = active_engine(size);
        engine.handle_event(ShapeEvent::Resized(Size::new(12, 6)));
        engine.handle_event(ShapeEvent::Damaged(DamageHandle(7)));

        let input = target.input.lock().unwrap();
        assert_eq!(input.len(), 3);
        assert_eq!(input[0].size(), size);
        assert_eq!(input[1].size(), Size::new(12, 6));
        assert_eq!(input[2].size(), Size::new(12, 6));
        assert_eq!(*target.acknowledged.lock().unwrap(), vec![DamageHandle(7)]);
    }

    #[test]
    fn capture_racing_a_resize_is_dropped() {
        let size = Size::new(8, 8);
        let (target, engine, _) = active_engine(size);
        engine.note_resize(Size::new(10, 10));

        let outcome = engine.recompute_input_mask(size);

        assert!(matches!(
            outcome,
            MaskOutcome::Discarded(MaskError::SizeMismatch { .. })
        ));
        assert_eq!(target.input.lock().unwrap().len(), 1);
    }

    #[test]
    fn transparent_frame_makes_window_click_through() {
        let size = Size::new(4, 4);
        let (target, engine, _) = active_engine(size);
        target.push_frame(Frame::new(size, ByteOrder::LsbFirst, vec![0; 64]));

        assert_eq!(
            engine.recompute_input_mask(size),
            MaskOutcome::Applied { accepting: 0 }
        );
        assert!(target.input.lock().unwrap()[1].is_fully_transparent());
        assert!(!engine.accepts_input(Point::new(1, 1)));
    }

    #[test]
    fn presses_only_land_on_opaque_pixels() {
        let target = Arc::new(RecordingTarget::default());
        let engine = ShapeEngine::new(Arc::clone(&target), Arc::new(AtomicBool::new(false)));
        // No input shape yet: the whole window takes input.
        assert!(engine.accepts_input(Point::new(3, 3)));

        let size = Size::new(4, 4);
        let mut data = vec![0; 64];
        data[3] = 0xff;
        target.push_frame(Frame::new(size, ByteOrder::LsbFirst, data));
        engine.activate(size).unwrap();

        assert!(engine.accepts_input(Point::new(0, 0)));
        assert!(!engine.accepts_input(Point::new(1, 0)));
        assert!(!engine.accepts_input(Point::new(-1, 0)));
        assert!(!engine.accepts_input(Point::new(4, 4)));
    }

    #[test]
    fn dragging_skips_recompute() {
        let size = Size::new(4, 4);
        let (target, engine, dragging) = active_engine(size);
        dragging.store(true, Ordering::Release);

        assert_eq!(engine.recompute_input_mask(size), MaskOutcome::SkippedDragging);
        assert_eq!(target.captures.lock().unwrap().len(), 1);
    }

    #[test]
    fn bounding_mask_is_idempotent() {
        let size = Size::new(30, 20);
        let (target, engine, _) = active_engine(size);
        engine.apply_full_bounding_mask(size);
        let once = *target.bounding.lock().unwrap().last().unwrap();
        engine.apply_full_bounding_mask(size);
        let twice = *target.bounding.lock().unwrap().last().unwrap();
        assert_eq!(once, twice);
        assert_eq!(engine.state(), ShapeState::Active);
    }

    #[test]
    fn destroy_fires_handlers_once_and_stops() {
        let size = Size::new(4, 4);
        let (target, engine, _) = active_engine(size);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        engine.on_window_destroyed(move |window| {
            assert_eq!(window, WindowHandle(0x2a));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let removed = engine.on_window_destroyed(|_| panic!("removed handler ran"));
        assert!(engine.remove_handler(removed));

        assert_eq!(engine.handle_event(ShapeEvent::Destroyed), LoopControl::Stop);
        assert_eq!(engine.handle_event(ShapeEvent::Destroyed), LoopControl::Stop);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(), ShapeState::Stopped);
        assert_eq!(engine.recompute_input_mask(size), MaskOutcome::Inactive);
        assert!(target.released.lock().unwrap()[0]);
    }

    #[test]
    fn shutdown_releases_only_when_active() {
        let target = Arc::new(RecordingTarget::default());
        let engine = ShapeEngine::new(Arc::clone(&target), Arc::new(AtomicBool::new(false)));
        engine.shutdown();
        assert!(target.released.lock().unwrap().is_empty());
        assert_eq!(engine.state(), ShapeState::Disabled);

        engine.activate(Size::new(2, 2)).unwrap();
        engine.shutdown();
        engine.shutdown();
        assert_eq!(*target.released.lock().unwrap(), vec![false]);
        assert_eq!(engine.state(), ShapeState::Stopped);
    }
}
