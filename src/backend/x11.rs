use std::sync::Arc;

use x11rb::{
    connection::Connection,
    protocol::{
        Event,
        xproto::{
            AtomEnum, ClientMessageEvent, ConfigureWindowAux, ConnectionExt as _, EventMask,
            KeyButMask, MapState, StackMode,
        },
    },
};

use crate::{
    Result,
    backend::{Session, WindowHandle, WindowSystem, WindowTypes, WmStates},
    geometry::{Point, Size},
};

const NET_WM_STATE_REMOVE: u32 = 0;
const NET_WM_STATE_ADD: u32 = 1;
/// Source indication "normal application" for EWMH client messages.
const SOURCE_APPLICATION: u32 = 1;

/// [`WindowSystem`] over a live X11 session.
#[derive(Clone)]
pub struct X11Backend {
    session: Arc<Session>,
}

impl X11Backend {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn try_position(&self, window: WindowHandle) -> Result<Point> {
        let conn = self.session.lock()?;
        let reply = conn
            .translate_coordinates(window.0, self.session.root().0, 0, 0)?
            .reply()?;
        Ok(Point::new(i32::from(reply.dst_x), i32::from(reply.dst_y)))
    }

    fn try_size(&self, window: WindowHandle) -> Result<Size> {
        let conn = self.session.lock()?;
        let reply = conn.get_geometry(window.0)?.reply()?;
        Ok(Size::new(u32::from(reply.width), u32::from(reply.height)))
    }

    fn try_configure(&self, window: WindowHandle, aux: &ConfigureWindowAux) -> Result<()> {
        let conn = self.session.lock()?;
        conn.configure_window(window.0, aux)?;
        conn.flush()?;
        Ok(())
    }

    fn try_atoms(&self, window: WindowHandle, property: u32) -> Result<Vec<u32>> {
        let conn = self.session.lock()?;
        let reply = conn
            .get_property(false, window.0, property, AtomEnum::ATOM, 0, 1024)?
            .reply()?;
        Ok(reply
            .value32()
            .map(|values| values.collect())
            .unwrap_or_default())
    }

    fn try_class_name(&self, window: WindowHandle) -> Result<String> {
        let conn = self.session.lock()?;
        let reply = conn
            .get_property(false, window.0, AtomEnum::WM_CLASS, AtomEnum::STRING, 0, 1024)?
            .reply()?;
        Ok(parse_wm_class(&reply.value).unwrap_or_default())
    }

    fn try_restack(&self, window: WindowHandle, sibling: WindowHandle) -> Result<()> {
        let aux = ConfigureWindowAux::new()
            .sibling(sibling.0)
            .stack_mode(StackMode::ABOVE);
        let conn = self.session.lock()?;
        // Checked so an expected BadMatch comes back here instead of piling
        // up in the event queue.
        conn.configure_window(window.0, &aux)?.check()?;
        Ok(())
    }

    fn try_set_topmost(&self, window: WindowHandle, topmost: bool) -> Result<()> {
        let atoms = self.session.atoms();
        let action = if topmost {
            NET_WM_STATE_ADD
        } else {
            NET_WM_STATE_REMOVE
        };
        let event = ClientMessageEvent::new(
            32,
            window.0,
            atoms._NET_WM_STATE,
            [action, atoms._NET_WM_STATE_ABOVE, 0, SOURCE_APPLICATION, 0],
        );

        let conn = self.session.lock()?;
        conn.send_event(
            false,
            self.session.root().0,
            EventMask::SUBSTRUCTURE_REDIRECT | EventMask::SUBSTRUCTURE_NOTIFY,
            event,
        )?;
        conn.flush()?;
        Ok(())
    }
}

impl WindowSystem for X11Backend {
    fn self_window(&self) -> Option<WindowHandle> {
        self.session.self_window()
    }

    fn window_position(&self, window: WindowHandle) -> Option<Point> {
        self.try_position(window)
            .inspect_err(|err| tracing::trace!(window = %window, "position query failed: {err}"))
            .ok()
    }

    fn set_window_position(&self, window: WindowHandle, position: Point) {
        let aux = ConfigureWindowAux::new().x(position.x).y(position.y);
        if let Err(err) = self.try_configure(window, &aux) {
            tracing::debug!(window = %window, %position, "move failed: {err}");
        }
    }

    fn window_size(&self, window: WindowHandle) -> Option<Size> {
        self.try_size(window)
            .inspect_err(|err| tracing::trace!(window = %window, "size query failed: {err}"))
            .ok()
    }

    fn set_window_size(&self, window: WindowHandle, size: Size) {
        if size.is_empty() {
            tracing::debug!(window = %window, %size, "ignoring resize to an empty size");
            return;
        }
        let aux = ConfigureWindowAux::new()
            .width(size.width)
            .height(size.height);
        if let Err(err) = self.try_configure(window, &aux) {
            tracing::debug!(window = %window, %size, "resize failed: {err}");
        }
    }

    fn mouse_position(&self) -> Option<Point> {
        let conn = self.session.lock().ok()?;
        let reply = conn.query_pointer(self.session.root().0).ok()?.reply().ok()?;
        Some(Point::new(i32::from(reply.root_x), i32::from(reply.root_y)))
    }

    fn primary_button_held(&self) -> bool {
        let Ok(conn) = self.session.lock() else {
            return false;
        };
        conn.query_pointer(self.session.root().0)
            .ok()
            .and_then(|cookie| cookie.reply().ok())
            .is_some_and(|reply| u16::from(reply.mask) & u16::from(KeyButMask::BUTTON1) != 0)
    }

    fn set_topmost(&self, window: WindowHandle, topmost: bool) {
        match self.try_set_topmost(window, topmost) {
            Ok(()) => tracing::debug!(window = %window, topmost, "requested always-on-top change"),
            Err(err) => tracing::warn!(window = %window, topmost, "failed to change always-on-top: {err}"),
        }
    }

    fn restack_above(&self, window: WindowHandle, sibling: WindowHandle) {
        if let Err(err) = self.try_restack(window, sibling) {
            // Managed windows are usually not siblings of their frames' peers;
            // the window manager rejects that with BadMatch.
            tracing::debug!(window = %window, sibling = %sibling, "restack failed: {err}");
        }
    }

    fn is_visible(&self, window: WindowHandle) -> bool {
        let Ok(conn) = self.session.lock() else {
            return false;
        };
        conn.get_window_attributes(window.0)
            .ok()
            .and_then(|cookie| cookie.reply().ok())
            .is_some_and(|attrs| attrs.map_state == MapState::VIEWABLE)
    }

    fn wm_states(&self, window: WindowHandle) -> WmStates {
        let atoms = self.session.atoms();
        let values = self.try_atoms(window, atoms._NET_WM_STATE).unwrap_or_default();
        values.iter().fold(WmStates::empty(), |states, &atom| {
            states
                | match atom {
                    a if a == atoms._NET_WM_STATE_ABOVE => WmStates::ABOVE,
                    a if a == atoms._NET_WM_STATE_MAXIMIZED_HORZ => WmStates::MAXIMIZED_HORZ,
                    a if a == atoms._NET_WM_STATE_MAXIMIZED_VERT => WmStates::MAXIMIZED_VERT,
                    a if a == atoms._NET_WM_STATE_FULLSCREEN => WmStates::FULLSCREEN,
                    a if a == atoms._NET_WM_STATE_HIDDEN => WmStates::HIDDEN,
                    _ => WmStates::empty(),
                }
        })
    }

    fn window_types(&self, window: WindowHandle) -> WindowTypes {
        let atoms = self.session.atoms();
        let values = self
            .try_atoms(window, atoms._NET_WM_WINDOW_TYPE)
            .unwrap_or_default();
        values.iter().fold(WindowTypes::empty(), |types, &atom| {
            if atom == atoms._NET_WM_WINDOW_TYPE_DOCK {
                types | WindowTypes::DOCK
            } else if atom == atoms._NET_WM_WINDOW_TYPE_DESKTOP {
                types | WindowTypes::DESKTOP
            } else {
                types
            }
        })
    }

    fn class_name(&self, window: WindowHandle) -> String {
        self.try_class_name(window).unwrap_or_default()
    }

    fn top_level_windows(&self) -> Vec<WindowHandle> {
        let Ok(conn) = self.session.lock() else {
            return Vec::new();
        };
        conn.query_tree(self.session.root().0)
            .ok()
            .and_then(|cookie| cookie.reply().ok())
            .map(|tree| tree.children.into_iter().map(WindowHandle).collect())
            .unwrap_or_default()
    }

    fn parent_of(&self, window: WindowHandle) -> Option<WindowHandle> {
        let conn = self.session.lock().ok()?;
        let tree = conn.query_tree(window.0).ok()?.reply().ok()?;
        (tree.parent != x11rb::NONE && tree.parent != tree.root).then_some(WindowHandle(tree.parent))
    }

    fn screen_size(&self) -> Size {
        self.session.screen_size()
    }

    fn drain_events(&self) -> usize {
        let Ok(conn) = self.session.lock() else {
            return 0;
        };
        let mut dropped = 0;
        while let Ok(Some(event)) = conn.poll_for_event() {
            if let Event::Error(err) = event {
                tracing::trace!("asynchronous x11 error: {err:?}");
            }
            dropped += 1;
        }
        dropped
    }
}

/// `WM_CLASS` holds two NUL-terminated strings: instance, then class.
pub fn parse_wm_class(value: &[u8]) -> Option<String> {
    let mut parts = value.split(|&b| b == 0);
    let _instance = parts.next()?;
    let class = parts.next()?;
    if class.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(class).into_owned())
}
