use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{
    backend::WindowSystem,
    geometry::Point,
};

/// Moves the pet with the pointer while the primary button is held.
///
/// The shared `dragging` flag tells the shape engine to stop recomputing
/// input masks until the drag ends.
pub struct DragController {
    dragging: Arc<AtomicBool>,
    start_pointer: Point,
    start_window: Point,
    /// Eased position; only differs from the target when smoothing is on.
    current: (f32, f32),
    was_held: bool,
}

impl DragController {
    pub fn new(dragging: Arc<AtomicBool>) -> Self {
        Self {
            dragging,
            start_pointer: Point::default(),
            start_window: Point::default(),
            current: (0.0, 0.0),
            was_held: false,
        }
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.dragging)
    }

    pub fn is_dragging(&self) -> bool {
        self.dragging.load(Ordering::Acquire)
    }

    /// Starts a drag from the current pointer and window positions.
    pub fn begin<W: WindowSystem + ?Sized>(&mut self, ws: &W) -> bool {
        let Some(pet) = ws.self_window() else {
            return false;
        };
        let (Some(pointer), Some(window)) = (ws.mouse_position(), ws.window_position(pet)) else {
            return false;
        };
        self.start_pointer = pointer;
        self.start_window = window;
        self.current = (window.x as f32, window.y as f32);
        self.dragging.store(true, Ordering::Release);
        tracing::trace!(%pointer, %window, "drag started");
        true
    }

    pub fn end(&mut self) {
        if self.dragging.swap(false, Ordering::AcqRel) {
            tracing::trace!("drag ended");
        }
    }

    /// Follows the primary button: a press on the pet starts a drag, a
    /// release ends it.
    ///
    /// The button state is global, so `accepts_input` decides whether a press
    /// at a window-local point hit the pet or went through its input shape.
    pub fn poll_pointer<W, F>(&mut self, ws: &W, accepts_input: F)
    where
        W: WindowSystem + ?Sized,
        F: Fn(Point) -> bool,
    {
        let held = ws.primary_button_held();
        if held && !self.was_held && !self.is_dragging() && pointer_on_pet(ws, accepts_input) {
            self.begin(ws);
        } else if !held && self.is_dragging() {
            self.end();
        }
        self.was_held = held;
    }

    /// Moves the pet for this frame. `smoothing` in `0.0..1.0` is the share of
    /// the remaining distance left for later frames.
    pub fn update<W: WindowSystem + ?Sized>(&mut self, ws: &W, smoothing: f32) {
        if !self.is_dragging() {
            return;
        }
        let (Some(pet), Some(pointer)) = (ws.self_window(), ws.mouse_position()) else {
            return;
        };

        let target = self.start_window + (pointer - self.start_pointer);
        let follow = 1.0 - smoothing.clamp(0.0, 0.99);
        self.current.0 += (target.x as f32 - self.current.0) * follow;
        self.current.1 += (target.y as f32 - self.current.1) * follow;

        let next = Point::new(self.current.0.round() as i32, self.current.1.round() as i32);
        if ws.window_position(pet) != Some(next) {
            ws.set_window_position(pet, next);
        }
    }
}

fn pointer_on_pet<W, F>(ws: &W, accepts_input: F) -> bool
where
    W: WindowSystem + ?Sized,
    F: Fn(Point) -> bool,
{
    let Some(pet) = ws.self_window() else {
        return false;
    };
    let (Some(pointer), Some(rect)) = (ws.mouse_position(), ws.window_rect(pet)) else {
        return false;
    };
    let inside = pointer.x >= rect.x
        && pointer.x < rect.right()
        && pointer.y >= rect.y
        && pointer.y < rect.bottom();
    inside && accepts_input(pointer - rect.position())
}
