use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use crate::{
    PerchError, Result,
    backend::{Session, WindowHandle, WindowSystem, X11Backend},
    config::RuntimeConfig,
    drag::DragController,
    geometry::{Point, Size},
    shape::{DamageLoop, HandlerId, ShapeEngine, ShapeState, ShapeTarget, X11ShapeTarget},
    snap::{FrameInput, SnapController, SnapSettings, SnapState, WindowEntry},
};

/// Which window the session should drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attach {
    /// First window whose `_NET_WM_PID` matches.
    Pid(u32),
    Window(WindowHandle),
}

/// The desktop-pet window core: shaping, snapping and dragging for one window.
pub struct Perch<W: WindowSystem = X11Backend, T: ShapeTarget = X11ShapeTarget> {
    config: RuntimeConfig,
    settings: SnapSettings,
    backend: W,
    session: Option<Arc<Session>>,
    shape: Option<Arc<ShapeEngine<T>>>,
    damage_loop: Option<DamageLoop>,
    shape_unsupported: bool,
    dragging: Arc<AtomicBool>,
    drag: DragController,
    snap: SnapController,
}

impl Perch {
    /// Connects to the X server, finds the pet window and turns on
    /// click-through shaping when the display supports it.
    pub fn new(config: RuntimeConfig, attach: Attach) -> Result<Self> {
        let session = Arc::new(Session::open()?);
        let window = match attach {
            Attach::Pid(pid) => session.resolve_self_window(pid),
            Attach::Window(window) => Some(session.adopt_window(window)),
        };

        let backend = X11Backend::new(Arc::clone(&session));
        let mut perch = Self::from_parts(config, backend);
        perch.session = Some(Arc::clone(&session));

        let Some(window) = window else {
            tracing::error!("pet window not found; shaping, snapping and dragging are disabled");
            return Ok(perch);
        };

        if perch.config.transparent_input {
            perch.enable_transparent_input_with(|| X11ShapeTarget::enable(session, window));
        } else {
            tracing::info!("transparent input disabled by config");
        }
        Ok(perch)
    }
}

impl<W: WindowSystem, T: ShapeTarget> Perch<W, T> {
    /// Builds a core over an existing window system. Shaping stays off until
    /// [`Perch::enable_transparent_input_with`] succeeds.
    pub fn from_parts(config: RuntimeConfig, backend: W) -> Self {
        let dragging = Arc::new(AtomicBool::new(false));
        Self {
            settings: SnapSettings::from_config(&config),
            config,
            backend,
            session: None,
            shape: None,
            damage_loop: None,
            shape_unsupported: false,
            drag: DragController::new(Arc::clone(&dragging)),
            dragging,
            snap: SnapController::new(true),
        }
    }

    /// Activates click-through shaping with the target `enable` produces and
    /// starts the damage loop. A failure disables shaping for the rest of the
    /// session.
    pub fn enable_transparent_input_with<F>(&mut self, enable: F) -> ShapeState
    where
        F: FnOnce() -> Result<(T, Size)>,
    {
        if self.shape_unsupported || self.shape.is_some() {
            return self.shape_state();
        }

        let (target, size) = match enable() {
            Ok(enabled) => enabled,
            Err(PerchError::Unsupported(reason)) => {
                tracing::warn!("click-through shaping unavailable: {reason}");
                self.shape_unsupported = true;
                return ShapeState::Disabled;
            }
            Err(err) => {
                tracing::warn!("failed to enable click-through shaping: {err}");
                self.shape_unsupported = true;
                return ShapeState::Disabled;
            }
        };

        let engine = Arc::new(ShapeEngine::new(target, Arc::clone(&self.dragging)));
        if let Err(err) = engine.activate(size) {
            tracing::warn!("failed to apply initial shapes: {err}");
            engine.shutdown();
            self.shape_unsupported = true;
            return ShapeState::Disabled;
        }

        match DamageLoop::spawn(Arc::clone(&engine), self.config.damage_poll_interval()) {
            Ok(damage_loop) => self.damage_loop = Some(damage_loop),
            Err(err) => tracing::error!("shaping active but damage loop failed to start: {err}"),
        }
        self.shape = Some(engine);
        self.shape_state()
    }

    pub fn shape_state(&self) -> ShapeState {
        self.shape
            .as_ref()
            .map_or(ShapeState::Disabled, |engine| engine.state())
    }

    pub fn shape_engine(&self) -> Option<&Arc<ShapeEngine<T>>> {
        self.shape.as_ref()
    }

    pub fn backend(&self) -> &W {
        &self.backend
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn self_window(&self) -> Option<WindowHandle> {
        self.backend.self_window()
    }

    /// Runs one frame: pointer dragging first, then snapping.
    pub fn frame(&mut self, input: FrameInput) -> SnapState {
        if self.backend.self_window().is_none() {
            return self.snap.state();
        }

        // Without a damage loop nobody else reads the event queue.
        if !self.damage_loop.as_ref().is_some_and(DamageLoop::is_running) {
            self.backend.drain_events();
        }

        let shape = self.shape.as_deref();
        self.drag.poll_pointer(&self.backend, |local| {
            shape.is_none_or(|engine| engine.accepts_input(local))
        });
        self.drag.update(&self.backend, self.config.drag_smoothing);

        let input = FrameInput {
            dragging: input.dragging || self.drag.is_dragging(),
            ..input
        };
        self.snap.update(&self.backend, &self.settings, input)
    }

    pub fn begin_drag(&mut self) -> bool {
        self.drag.begin(&self.backend)
    }

    pub fn end_drag(&mut self) {
        self.drag.end();
    }

    pub fn is_dragging(&self) -> bool {
        self.dragging.load(Ordering::Acquire)
    }

    pub fn snap_state(&self) -> SnapState {
        self.snap.state()
    }

    pub fn is_topmost(&self) -> bool {
        self.snap.is_topmost()
    }

    pub fn window_position(&self) -> Option<Point> {
        self.backend
            .self_window()
            .and_then(|window| self.backend.window_position(window))
    }

    pub fn window_size(&self) -> Option<Size> {
        self.backend
            .self_window()
            .and_then(|window| self.backend.window_size(window))
    }

    pub fn mouse_position(&self) -> Option<Point> {
        self.backend.mouse_position()
    }

    pub fn set_window_position(&self, position: Point) {
        if let Some(window) = self.backend.self_window() {
            self.backend.set_window_position(window, position);
        }
    }

    pub fn set_window_size(&self, size: Size) {
        let Some(window) = self.backend.self_window() else {
            return;
        };
        if size.is_empty() {
            tracing::debug!(%size, "ignoring resize to an empty size");
            return;
        }
        if let Some(engine) = &self.shape {
            engine.note_resize(size);
        }
        self.backend.set_window_size(window, size);
    }

    pub fn set_topmost(&mut self, topmost: bool) {
        self.snap.set_topmost(&self.backend, topmost);
    }

    pub fn force_exit_snap(&mut self) {
        self.snap.force_exit(&self.backend);
    }

    /// Registers a closure that runs once when the pet window is destroyed.
    /// Returns `None` when shaping is off, since destruction is only observed
    /// by the damage loop.
    pub fn on_window_destroyed<F>(&self, handler: F) -> Option<HandlerId>
    where
        F: Fn(WindowHandle) + Send + Sync + 'static,
    {
        match &self.shape {
            Some(engine) => Some(engine.on_window_destroyed(handler)),
            None => {
                tracing::debug!("destroy handler not registered: shaping is off");
                None
            }
        }
    }

    pub fn remove_destroy_handler(&self, id: HandlerId) -> bool {
        self.shape
            .as_ref()
            .is_some_and(|engine| engine.remove_handler(id))
    }

    /// Current snap candidates, rebuilt now.
    pub fn candidates(&mut self) -> Vec<WindowEntry> {
        self.snap
            .refresh_candidates(&self.backend, Instant::now())
            .to_vec()
    }

    /// Swaps in a new config. Snap, drag and timing values apply from the next
    /// frame; toggling transparent input needs a restart.
    pub fn reload_config(&mut self, config: RuntimeConfig) {
        if config.transparent_input != self.config.transparent_input {
            tracing::info!(
                enabled = config.transparent_input,
                "transparent_input change takes effect on restart"
            );
        }
        if !config.window_sitting && self.snap.is_snapped() {
            self.snap.force_exit(&self.backend);
        }
        self.settings = SnapSettings::from_config(&config);
        self.config = config;
        tracing::info!("config reloaded");
    }

    /// Stops the damage loop, releases shaping resources and closes the
    /// connection. Idempotent.
    pub fn shutdown(&mut self) {
        self.drag.end();
        if let Some(mut damage_loop) = self.damage_loop.take() {
            damage_loop.stop();
        }
        if let Some(engine) = &self.shape {
            engine.shutdown();
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
}

impl<W: WindowSystem, T: ShapeTarget> Drop for Perch<W, T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
