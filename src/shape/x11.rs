use std::sync::{Arc, Mutex, PoisonError};

use x11rb::{
    connection::Connection,
    protocol::{
        Event,
        damage::{self, ConnectionExt as _, ReportLevel},
        render::{self, ConnectionExt as _, PictType},
        shape::{self, ConnectionExt as _, SK, SO},
        xfixes::{self, ConnectionExt as _},
        xproto::{
            ChangeWindowAttributesAux, ClipOrdering, ConnectionExt as _, CreateGCAux, EventMask,
            ImageFormat, Rectangle,
        },
    },
};

use crate::{
    PerchError, Result,
    backend::{DamageHandle, PixmapHandle, Session, WindowHandle},
    geometry::Size,
    shape::{
        ShapeEvent, ShapeTarget,
        mask::{BitmapFormat, Frame, PixelMask},
    },
};

const ALPHA_DEPTH: u8 = 32;
/// Mask rows are addressed with signed 16-bit offsets on the wire.
const MAX_WIRE_EXTENT: u16 = i16::MAX as u16;

/// Shapes one of our own windows through SHAPE and DAMAGE.
pub struct X11ShapeTarget {
    session: Arc<Session>,
    window: WindowHandle,
    damage: Mutex<Option<DamageHandle>>,
    last_size: Mutex<Size>,
}

impl X11ShapeTarget {
    /// Checks the display can do per-pixel click-through for `window`, then
    /// subscribes to its structure and damage events.
    ///
    /// Returns the window's current size alongside the target.
    pub fn enable(session: Arc<Session>, window: WindowHandle) -> Result<(Self, Size)> {
        let size = {
            let conn = session.lock()?;
            require_extensions(&*conn)?;
            let size = require_alpha_visual(&*conn, window)?;

            conn.change_window_attributes(
                window.0,
                &ChangeWindowAttributesAux::new().event_mask(EventMask::STRUCTURE_NOTIFY),
            )?;
            size
        };

        let damage = {
            let conn = session.lock()?;
            let id = conn.generate_id()?;
            conn.damage_create(id, window.0, ReportLevel::NON_EMPTY)?;
            conn.flush()?;
            DamageHandle(id)
        };
        tracing::debug!(window = %window, damage = %damage, "subscribed to damage");

        Ok((
            Self {
                session,
                window,
                damage: Mutex::new(Some(damage)),
                last_size: Mutex::new(size),
            },
            size,
        ))
    }

    pub fn damage(&self) -> Option<DamageHandle> {
        *self.damage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn translate(&self, event: Event) -> Option<ShapeEvent> {
        match event {
            Event::ConfigureNotify(ev) if ev.window == self.window.0 => {
                let size = Size::new(u32::from(ev.width), u32::from(ev.height));
                let mut last = self.last_size.lock().unwrap_or_else(PoisonError::into_inner);
                // Moves also produce ConfigureNotify; only size changes matter.
                if *last == size {
                    return None;
                }
                *last = size;
                Some(ShapeEvent::Resized(size))
            }
            Event::DestroyNotify(ev) if ev.window == self.window.0 => Some(ShapeEvent::Destroyed),
            Event::DamageNotify(ev) if Some(DamageHandle(ev.damage)) == self.damage() => {
                Some(ShapeEvent::Damaged(DamageHandle(ev.damage)))
            }
            Event::Error(err) => {
                tracing::trace!("asynchronous x11 error: {err:?}");
                None
            }
            _ => None,
        }
    }

    fn upload_mask(&self, conn: &impl Connection, mask: &PixelMask) -> Result<PixmapHandle> {
        let size = mask.size();
        let (width, height) = wire_size(size)?;
        let root = self.session.root().0;

        let pixmap = PixmapHandle(conn.generate_id()?);
        conn.create_pixmap(1, pixmap.0, root, width, height)?;

        let gc = conn.generate_id()?;
        conn.create_gc(gc, pixmap.0, &CreateGCAux::new().foreground(1).background(0))?;

        // Leave headroom for the PutImage header.
        let max_bytes = conn.maximum_request_bytes().saturating_sub(64);
        for (first_row, rows, data) in mask.row_chunks(max_bytes) {
            conn.put_image(
                ImageFormat::XY_PIXMAP,
                pixmap.0,
                gc,
                width,
                rows as u16,
                0,
                first_row as i16,
                0,
                1,
                data,
            )?;
        }
        conn.free_gc(gc)?;
        Ok(pixmap)
    }
}

impl ShapeTarget for X11ShapeTarget {
    fn window(&self) -> WindowHandle {
        self.window
    }

    fn bitmap_format(&self) -> BitmapFormat {
        self.session.bitmap_format()
    }

    fn capture_frame(&self, size: Size) -> Result<Frame> {
        let (width, height) = wire_size(size)?;
        let conn = self.session.lock()?;
        let reply = conn
            .get_image(ImageFormat::Z_PIXMAP, self.window.0, 0, 0, width, height, !0)?
            .reply()?;
        if reply.depth != ALPHA_DEPTH {
            return Err(PerchError::Protocol(format!(
                "captured depth {} instead of {ALPHA_DEPTH}",
                reply.depth
            )));
        }
        Ok(Frame::new(size, self.session.image_byte_order(), reply.data))
    }

    fn apply_bounding_rect(&self, size: Size) -> Result<()> {
        let (width, height) = wire_size(size)?;
        let conn = self.session.lock()?;
        conn.shape_rectangles(
            SO::SET,
            SK::BOUNDING,
            ClipOrdering::UNSORTED,
            self.window.0,
            0,
            0,
            &[Rectangle {
                x: 0,
                y: 0,
                width,
                height,
            }],
        )?;
        conn.flush()?;
        Ok(())
    }

    fn apply_input_mask(&self, mask: &PixelMask) -> Result<()> {
        let conn = self.session.lock()?;
        let pixmap = self.upload_mask(&*conn, mask)?;
        let applied = conn.shape_mask(SO::SET, SK::INPUT, self.window.0, 0, 0, pixmap.0);
        conn.free_pixmap(pixmap.0)?;
        applied?;
        conn.flush()?;
        Ok(())
    }

    fn poll_event(&self) -> Result<Option<ShapeEvent>> {
        loop {
            let event = {
                let conn = self.session.lock()?;
                conn.poll_for_event()?
            };
            match event {
                Some(event) => {
                    if let Some(event) = self.translate(event) {
                        return Ok(Some(event));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn acknowledge_damage(&self, damage: DamageHandle) -> Result<()> {
        let conn = self.session.lock()?;
        conn.damage_subtract(damage.0, x11rb::NONE, x11rb::NONE)?;
        conn.flush()?;
        Ok(())
    }

    fn release(&self, window_gone: bool) {
        let Some(damage) = self
            .damage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        // The server frees damage objects together with their drawable.
        if window_gone {
            return;
        }
        let result = self.session.lock().and_then(|conn| {
            conn.damage_destroy(damage.0)?;
            conn.flush()?;
            Ok(())
        });
        if let Err(err) = result {
            tracing::debug!(damage = %damage, "failed to destroy damage object: {err}");
        }
    }
}

fn wire_size(size: Size) -> Result<(u16, u16)> {
    match (u16::try_from(size.width), u16::try_from(size.height)) {
        (Ok(width), Ok(height))
            if (1..=MAX_WIRE_EXTENT).contains(&width) && (1..=MAX_WIRE_EXTENT).contains(&height) =>
        {
            Ok((width, height))
        }
        _ => Err(PerchError::Protocol(format!("window size {size} out of range"))),
    }
}

fn require_extensions(conn: &impl Connection) -> Result<()> {
    for name in [
        shape::X11_EXTENSION_NAME,
        damage::X11_EXTENSION_NAME,
        xfixes::X11_EXTENSION_NAME,
        render::X11_EXTENSION_NAME,
    ] {
        if conn.extension_information(name)?.is_none() {
            return Err(PerchError::Unsupported(format!("{name} extension missing")));
        }
    }

    // DAMAGE needs XFIXES regions negotiated first.
    conn.xfixes_query_version(2, 0)?.reply()?;
    conn.damage_query_version(1, 1)?.reply()?;
    let version = conn.shape_query_version()?.reply()?;
    if (version.major_version, version.minor_version) < (1, 1) {
        return Err(PerchError::Unsupported(format!(
            "SHAPE {}.{} lacks input shapes",
            version.major_version, version.minor_version
        )));
    }
    Ok(())
}

/// Succeeds when `window` is 32 bits deep and its visual carries alpha.
fn require_alpha_visual(conn: &impl Connection, window: WindowHandle) -> Result<Size> {
    let geometry = conn.get_geometry(window.0)?.reply()?;
    if geometry.depth != ALPHA_DEPTH {
        return Err(PerchError::Unsupported(format!(
            "window {window} is {} bits deep, click-through needs an alpha visual",
            geometry.depth
        )));
    }

    let visual = conn.get_window_attributes(window.0)?.reply()?.visual;
    let formats = conn.render_query_pict_formats()?.reply()?;
    let format = formats
        .screens
        .iter()
        .flat_map(|screen| &screen.depths)
        .flat_map(|depth| &depth.visuals)
        .find(|candidate| candidate.visual == visual)
        .map(|candidate| candidate.format);
    let has_alpha = format.is_some_and(|format| {
        formats.formats.iter().any(|info| {
            info.id == format && info.type_ == PictType::DIRECT && info.direct.alpha_mask != 0
        })
    });
    if !has_alpha {
        return Err(PerchError::Unsupported(format!(
            "visual 0x{visual:x} of window {window} has no alpha channel"
        )));
    }

    Ok(Size::new(
        u32::from(geometry.width),
        u32::from(geometry.height),
    ))
}
