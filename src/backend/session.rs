use std::{
    collections::VecDeque,
    ops::Deref,
    sync::{Mutex, MutexGuard, OnceLock, PoisonError},
};

use x11rb::{
    connection::Connection,
    protocol::xproto::{AtomEnum, ConnectionExt as _, ImageOrder, Window},
    rust_connection::RustConnection,
    wrapper::ConnectionExt as _,
};

use crate::{
    PerchError, Result,
    backend::WindowHandle,
    geometry::Size,
    shape::mask::{BitmapFormat, ByteOrder},
};

/// Reparenting window managers nest clients under frames; we never need to
/// look deeper than this.
const MAX_SEARCH_DEPTH: usize = 4;

x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        _NET_WM_PID,
        _NET_WM_STATE,
        _NET_WM_STATE_ABOVE,
        _NET_WM_STATE_MAXIMIZED_HORZ,
        _NET_WM_STATE_MAXIMIZED_VERT,
        _NET_WM_STATE_FULLSCREEN,
        _NET_WM_STATE_HIDDEN,
        _NET_WM_WINDOW_TYPE,
        _NET_WM_WINDOW_TYPE_DOCK,
        _NET_WM_WINDOW_TYPE_DESKTOP,
    }
}

/// Exclusive owner of the X11 connection.
///
/// All requests go through [`Session::lock`], which serializes the per-frame
/// path against the damage thread.
pub struct Session {
    conn: Mutex<Option<RustConnection>>,
    root: WindowHandle,
    screen_size: Size,
    atoms: Atoms,
    image_byte_order: ByteOrder,
    bitmap_format: BitmapFormat,
    self_window: OnceLock<WindowHandle>,
}

/// Locked access to an open connection.
pub struct ConnectionGuard<'a>(MutexGuard<'a, Option<RustConnection>>);

impl Deref for ConnectionGuard<'_> {
    type Target = RustConnection;

    fn deref(&self) -> &RustConnection {
        match self.0.as_ref() {
            Some(conn) => conn,
            None => unreachable!("connection guard is only built for an open session"),
        }
    }
}

impl Session {
    pub fn open() -> Result<Self> {
        let (conn, screen_num) = x11rb::connect(None)?;

        let setup = conn.setup();
        let screen = setup.roots.get(screen_num).ok_or_else(|| {
            PerchError::Connection(format!("screen {screen_num} missing from setup"))
        })?;
        let root = WindowHandle(screen.root);
        let screen_size = Size::new(
            u32::from(screen.width_in_pixels),
            u32::from(screen.height_in_pixels),
        );
        let image_byte_order = byte_order(setup.image_byte_order);
        let bitmap_format = BitmapFormat {
            scanline_pad: u32::from(setup.bitmap_format_scanline_pad),
            bit_order: byte_order(setup.bitmap_format_bit_order),
        };

        let atoms = Atoms::new(&conn)?.reply()?;

        tracing::info!(
            screen = screen_num,
            root = %root,
            size = %screen_size,
            "connected to X server"
        );

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            root,
            screen_size,
            atoms,
            image_byte_order,
            bitmap_format,
            self_window: OnceLock::new(),
        })
    }

    pub fn lock(&self) -> Result<ConnectionGuard<'_>> {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            return Err(PerchError::Closed);
        }
        Ok(ConnectionGuard(guard))
    }

    pub fn is_open(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn root(&self) -> WindowHandle {
        self.root
    }

    pub fn screen_size(&self) -> Size {
        self.screen_size
    }

    pub fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    pub fn image_byte_order(&self) -> ByteOrder {
        self.image_byte_order
    }

    pub fn bitmap_format(&self) -> BitmapFormat {
        self.bitmap_format
    }

    pub fn self_window(&self) -> Option<WindowHandle> {
        self.self_window.get().copied()
    }

    /// Pins the self window to an explicit handle. Has no effect once a
    /// window has been resolved.
    pub fn adopt_window(&self, window: WindowHandle) -> WindowHandle {
        *self.self_window.get_or_init(|| window)
    }

    /// Finds the first window whose `_NET_WM_PID` equals `pid`.
    ///
    /// Direct children of the root are checked first, then their descendants
    /// level by level. The first hit is cached for the session lifetime.
    pub fn resolve_self_window(&self, pid: u32) -> Option<WindowHandle> {
        if let Some(window) = self.self_window() {
            return Some(window);
        }

        let found = match self.find_window_by_pid(pid) {
            Ok(found) => found,
            Err(err) => {
                tracing::error!(pid, "failed to enumerate windows: {err}");
                return None;
            }
        };

        match found {
            Some(window) => {
                let window = self.adopt_window(window);
                tracing::info!(pid, window = %window, "resolved own window");
                Some(window)
            }
            None => {
                tracing::error!(pid, "no window carries a matching _NET_WM_PID");
                None
            }
        }
    }

    fn find_window_by_pid(&self, pid: u32) -> Result<Option<WindowHandle>> {
        let conn = self.lock()?;
        let mut level: VecDeque<Window> = conn.query_tree(self.root.0)?.reply()?.children.into();

        for depth in 0..MAX_SEARCH_DEPTH {
            let mut next = VecDeque::new();
            while let Some(window) = level.pop_front() {
                if window_pid(&conn, self.atoms._NET_WM_PID, window) == Some(pid) {
                    return Ok(Some(WindowHandle(window)));
                }
                if depth + 1 < MAX_SEARCH_DEPTH
                    && let Ok(tree) = conn.query_tree(window)?.reply()
                {
                    next.extend(tree.children);
                }
            }
            if next.is_empty() {
                break;
            }
            level = next;
        }

        Ok(None)
    }

    /// Releases the connection. Safe to call more than once; only the first
    /// call does anything.
    pub fn close(&self) {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(conn) = conn else {
            return;
        };
        if let Err(err) = conn.sync() {
            tracing::warn!("failed to sync before closing x11 connection: {err}");
        }
        drop(conn);
        tracing::info!("x11 connection closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn window_pid(conn: &RustConnection, pid_atom: u32, window: Window) -> Option<u32> {
    let reply = conn
        .get_property(false, window, pid_atom, AtomEnum::CARDINAL, 0, 1)
        .ok()?
        .reply()
        .ok()?;
    reply.value32()?.next()
}

fn byte_order(order: ImageOrder) -> ByteOrder {
    if order == ImageOrder::MSB_FIRST {
        ByteOrder::MsbFirst
    } else {
        ByteOrder::LsbFirst
    }
}
