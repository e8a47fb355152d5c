#![allow(dead_code)]

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use perch::{
    Result,
    backend::{DamageHandle, WindowHandle, WindowSystem, WindowTypes, WmStates},
    geometry::{Point, Rect, Size},
    shape::{
        ShapeEvent, ShapeTarget,
        mask::{BitmapFormat, ByteOrder, Frame, PixelMask},
    },
};

#[derive(Clone, Debug)]
pub struct MockWindow {
    pub rect: Rect,
    pub class: String,
    pub visible: bool,
    pub states: WmStates,
    pub types: WindowTypes,
    pub topmost: Option<bool>,
}

#[derive(Default)]
struct DesktopState {
    windows: BTreeMap<WindowHandle, MockWindow>,
    self_window: Option<WindowHandle>,
    mouse: Point,
    held: bool,
    drains: usize,
}

/// Desktop with a handful of windows and no window manager.
pub struct MockDesktop {
    screen: Size,
    state: Mutex<DesktopState>,
}

impl MockDesktop {
    pub fn new(screen: Size) -> Self {
        Self {
            screen,
            state: Mutex::new(DesktopState::default()),
        }
    }

    pub fn add(&self, handle: WindowHandle, rect: Rect, class: &str) {
        self.state.lock().unwrap().windows.insert(
            handle,
            MockWindow {
                rect,
                class: class.to_owned(),
                visible: true,
                states: WmStates::empty(),
                types: WindowTypes::empty(),
                topmost: None,
            },
        );
    }

    pub fn set_self(&self, handle: WindowHandle) {
        self.state.lock().unwrap().self_window = Some(handle);
    }

    pub fn update(&self, handle: WindowHandle, f: impl FnOnce(&mut MockWindow)) {
        if let Some(window) = self.state.lock().unwrap().windows.get_mut(&handle) {
            f(window);
        }
    }

    pub fn window(&self, handle: WindowHandle) -> MockWindow {
        self.state.lock().unwrap().windows[&handle].clone()
    }

    pub fn set_pointer(&self, position: Point, held: bool) {
        let mut state = self.state.lock().unwrap();
        state.mouse = position;
        state.held = held;
    }

    /// How many times the core drained the event queue.
    pub fn drains(&self) -> usize {
        self.state.lock().unwrap().drains
    }

    fn get<R>(&self, handle: WindowHandle, f: impl FnOnce(&MockWindow) -> R) -> Option<R> {
        self.state.lock().unwrap().windows.get(&handle).map(f)
    }
}

impl WindowSystem for MockDesktop {
    fn self_window(&self) -> Option<WindowHandle> {
        self.state.lock().unwrap().self_window
    }

    fn window_position(&self, window: WindowHandle) -> Option<Point> {
        self.get(window, |w| w.rect.position())
    }

    fn set_window_position(&self, window: WindowHandle, position: Point) {
        self.update(window, |w| {
            w.rect.x = position.x;
            w.rect.y = position.y;
        });
    }

    fn window_size(&self, window: WindowHandle) -> Option<Size> {
        self.get(window, |w| w.rect.size())
    }

    fn set_window_size(&self, window: WindowHandle, size: Size) {
        self.update(window, |w| {
            w.rect.width = size.width;
            w.rect.height = size.height;
        });
    }

    fn mouse_position(&self) -> Option<Point> {
        Some(self.state.lock().unwrap().mouse)
    }

    fn primary_button_held(&self) -> bool {
        self.state.lock().unwrap().held
    }

    fn set_topmost(&self, window: WindowHandle, topmost: bool) {
        self.update(window, |w| w.topmost = Some(topmost));
    }

    fn restack_above(&self, _window: WindowHandle, _sibling: WindowHandle) {}

    fn is_visible(&self, window: WindowHandle) -> bool {
        self.get(window, |w| w.visible).unwrap_or(false)
    }

    fn wm_states(&self, window: WindowHandle) -> WmStates {
        self.get(window, |w| w.states).unwrap_or_default()
    }

    fn window_types(&self, window: WindowHandle) -> WindowTypes {
        self.get(window, |w| w.types).unwrap_or_default()
    }

    fn class_name(&self, window: WindowHandle) -> String {
        self.get(window, |w| w.class.clone()).unwrap_or_default()
    }

    fn top_level_windows(&self) -> Vec<WindowHandle> {
        self.state.lock().unwrap().windows.keys().copied().collect()
    }

    fn parent_of(&self, _window: WindowHandle) -> Option<WindowHandle> {
        None
    }

    fn screen_size(&self) -> Size {
        self.screen
    }

    fn drain_events(&self) -> usize {
        self.state.lock().unwrap().drains += 1;
        0
    }
}

/// Shape target that renders every frame fully opaque, or fully transparent
/// once `transparent` is set, and records what it was asked to apply.
#[derive(Default)]
pub struct MockShapeTarget {
    pub transparent: AtomicBool,
    pub events: Mutex<VecDeque<ShapeEvent>>,
    pub bounding: Mutex<Vec<Size>>,
    pub masks: Mutex<Vec<Size>>,
    pub acknowledged: Mutex<Vec<DamageHandle>>,
    pub released: Mutex<Vec<bool>>,
}

impl MockShapeTarget {
    pub fn push(&self, event: ShapeEvent) {
        self.events.lock().unwrap().push_back(event);
    }
}

#[derive(Clone, Default)]
pub struct SharedTarget(pub Arc<MockShapeTarget>);

impl ShapeTarget for SharedTarget {
    fn window(&self) -> WindowHandle {
        WindowHandle(1)
    }

    fn bitmap_format(&self) -> BitmapFormat {
        BitmapFormat::default()
    }

    fn capture_frame(&self, size: Size) -> Result<Frame> {
        let alpha = if self.0.transparent.load(Ordering::Acquire) {
            0
        } else {
            0xff
        };
        Ok(Frame::new(
            size,
            ByteOrder::LsbFirst,
            vec![alpha; Frame::expected_len(size)],
        ))
    }

    fn apply_bounding_rect(&self, size: Size) -> Result<()> {
        self.0.bounding.lock().unwrap().push(size);
        Ok(())
    }

    fn apply_input_mask(&self, mask: &PixelMask) -> Result<()> {
        self.0.masks.lock().unwrap().push(mask.size());
        Ok(())
    }

    fn poll_event(&self) -> Result<Option<ShapeEvent>> {
        Ok(self.0.events.lock().unwrap().pop_front())
    }

    fn acknowledge_damage(&self, damage: DamageHandle) -> Result<()> {
        self.0.acknowledged.lock().unwrap().push(damage);
        Ok(())
    }

    fn release(&self, window_gone: bool) {
        self.0.released.lock().unwrap().push(window_gone);
    }
}
