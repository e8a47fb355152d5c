//! Window-system access.
//!
//! [`WindowSystem`] is the geometry query facade every controller talks to.
//! The X11 implementation lives in [`x11`]; tests substitute an in-memory one.

pub mod session;
pub mod x11;

use std::fmt;

use bitflags::bitflags;

use crate::geometry::{Point, Rect, Size};

pub use session::Session;
pub use x11::X11Backend;

/// Allowed slack between a window and the screen when guessing fullscreen.
/// Window managers round borders, so exact matches are rare.
pub const FULLSCREEN_TOLERANCE: u32 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowHandle(pub u32);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DamageHandle(pub u32);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PixmapHandle(pub u32);

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for DamageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

bitflags! {
    /// Subset of `_NET_WM_STATE` we care about.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct WmStates: u8 {
        const ABOVE = 1 << 0;
        const MAXIMIZED_HORZ = 1 << 1;
        const MAXIMIZED_VERT = 1 << 2;
        const FULLSCREEN = 1 << 3;
        const HIDDEN = 1 << 4;
    }
}

bitflags! {
    /// Subset of `_NET_WM_WINDOW_TYPE` we care about.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct WindowTypes: u8 {
        const DOCK = 1 << 0;
        const DESKTOP = 1 << 1;
    }
}

impl WmStates {
    pub fn is_maximized(self) -> bool {
        self.contains(WmStates::MAXIMIZED_HORZ | WmStates::MAXIMIZED_VERT)
    }
}

/// True when `window` covers `screen` within [`FULLSCREEN_TOLERANCE`] on both axes.
pub fn covers_screen(window: Size, screen: Size) -> bool {
    window.width.abs_diff(screen.width) <= FULLSCREEN_TOLERANCE
        && window.height.abs_diff(screen.height) <= FULLSCREEN_TOLERANCE
}

/// Read/write access to desktop windows.
///
/// Every method is infallible from the caller's point of view: a stale handle
/// or a failed request yields `None`, `false` or an empty value.
pub trait WindowSystem {
    /// The process's own top-level window, if it was resolved.
    fn self_window(&self) -> Option<WindowHandle>;

    fn window_position(&self, window: WindowHandle) -> Option<Point>;
    fn set_window_position(&self, window: WindowHandle, position: Point);
    fn window_size(&self, window: WindowHandle) -> Option<Size>;
    fn set_window_size(&self, window: WindowHandle, size: Size);

    /// Pointer position in root coordinates.
    fn mouse_position(&self) -> Option<Point>;
    fn primary_button_held(&self) -> bool;

    /// Toggles `_NET_WM_STATE_ABOVE` through the window manager.
    fn set_topmost(&self, window: WindowHandle, topmost: bool);
    /// Restacks `window` directly above `sibling`.
    fn restack_above(&self, window: WindowHandle, sibling: WindowHandle);

    fn is_visible(&self, window: WindowHandle) -> bool;
    fn wm_states(&self, window: WindowHandle) -> WmStates;
    fn window_types(&self, window: WindowHandle) -> WindowTypes;
    fn class_name(&self, window: WindowHandle) -> String;

    fn top_level_windows(&self) -> Vec<WindowHandle>;
    fn parent_of(&self, window: WindowHandle) -> Option<WindowHandle>;
    fn screen_size(&self) -> Size;

    /// Discards queued events and asynchronous errors when nothing else
    /// reads them. Returns how many were dropped.
    fn drain_events(&self) -> usize {
        0
    }

    fn window_rect(&self, window: WindowHandle) -> Option<Rect> {
        let position = self.window_position(window)?;
        let size = self.window_size(window)?;
        Some(Rect::from_parts(position, size))
    }

    fn is_maximized(&self, window: WindowHandle) -> bool {
        self.wm_states(window).is_maximized()
    }

    fn is_fullscreen(&self, window: WindowHandle) -> bool {
        if self.wm_states(window).contains(WmStates::FULLSCREEN) {
            return true;
        }
        self.window_size(window)
            .is_some_and(|size| covers_screen(size, self.screen_size()))
    }

    fn is_dock(&self, window: WindowHandle) -> bool {
        self.window_types(window).contains(WindowTypes::DOCK)
    }

    fn is_desktop(&self, window: WindowHandle) -> bool {
        self.window_types(window).contains(WindowTypes::DESKTOP)
    }

    /// Walks up the tree until the parent is the root.
    fn top_level_parent(&self, window: WindowHandle) -> WindowHandle {
        let top_level = self.top_level_windows();
        let mut current = window;
        // Bounded so a corrupt tree cannot spin forever.
        for _ in 0..64 {
            if top_level.contains(&current) {
                break;
            }
            match self.parent_of(current) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fullscreen_tolerance_boundaries() {
        let screen = Size::new(1920, 1080);
        assert!(covers_screen(Size::new(1920, 1080), screen));
        assert!(covers_screen(Size::new(1921, 1079), screen));
        assert!(covers_screen(Size::new(1919, 1081), screen));
        assert!(!covers_screen(Size::new(1923, 1080), screen));
        assert!(!covers_screen(Size::new(1920, 1077), screen));
    }

    #[test]
    fn maximized_needs_both_axes() {
        assert!(!WmStates::MAXIMIZED_HORZ.is_maximized());
        assert!(!WmStates::MAXIMIZED_VERT.is_maximized());
        assert!((WmStates::MAXIMIZED_HORZ | WmStates::MAXIMIZED_VERT).is_maximized());
    }
}
