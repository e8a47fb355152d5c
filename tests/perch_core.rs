mod common;

use std::{
    cell::Cell,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use common::{MockDesktop, SharedTarget};
use perch::{
    Perch, PerchError,
    backend::{DamageHandle, WindowHandle, WmStates},
    config::RuntimeConfig,
    geometry::{Point, Rect, Size},
    shape::{ShapeEvent, ShapeState},
    snap::{FrameInput, SnapState},
};

const PET: WindowHandle = WindowHandle(1);
const EDITOR: WindowHandle = WindowHandle(2);

fn desktop() -> MockDesktop {
    let desktop = MockDesktop::new(Size::new(1920, 1080));
    desktop.add(PET, Rect::new(250, -193, 200, 300), "Pet");
    desktop.set_self(PET);
    desktop.add(EDITOR, Rect::new(100, 100, 500, 140), "Editor");
    desktop
}

fn perch() -> Perch<MockDesktop, SharedTarget> {
    Perch::from_parts(RuntimeConfig::default(), desktop())
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for damage loop");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn pet_sits_on_title_bar_and_follows_after_release() {
    let mut perch = perch();
    let now = Instant::now();

    let state = perch.frame(FrameInput::new(now).dragging(true));
    assert_eq!(
        state,
        SnapState::Snapped {
            target: EDITOR,
            horizontal_fraction: 0.5
        }
    );
    assert!(!perch.is_topmost());

    perch.frame(FrameInput::new(now));
    assert_eq!(perch.window_position(), Some(Point::new(250, -200)));

    perch.backend().update(EDITOR, |w| {
        w.rect.x = 300;
        w.rect.y = 400;
    });
    perch.frame(FrameInput::new(now));

    assert_eq!(perch.window_position(), Some(Point::new(450, 100)));
    assert_eq!(
        perch.snap_state(),
        SnapState::Snapped {
            target: EDITOR,
            horizontal_fraction: 0.5
        }
    );
}

#[test]
fn maximized_target_sends_pet_home() {
    let mut perch = perch();
    let now = Instant::now();
    perch.frame(FrameInput::new(now).dragging(true));
    perch.frame(FrameInput::new(now));

    perch.backend().update(EDITOR, |w| {
        w.states = WmStates::MAXIMIZED_HORZ | WmStates::MAXIMIZED_VERT;
    });
    perch.frame(FrameInput::new(now));

    assert_eq!(perch.snap_state(), SnapState::Free);
    assert!(perch.is_topmost());
    assert_eq!(perch.backend().window(PET).topmost, Some(true));
    assert_eq!(perch.window_position(), Some(Point::new(250, -193)));
}

#[test]
fn force_exit_detaches() {
    let mut perch = perch();
    perch.frame(FrameInput::new(Instant::now()).dragging(true));
    perch.force_exit_snap();
    assert_eq!(perch.snap_state(), SnapState::Free);
    assert!(perch.is_topmost());
}

#[test]
fn disabled_sitting_never_snaps() {
    let config = RuntimeConfig {
        window_sitting: false,
        ..RuntimeConfig::default()
    };
    let mut perch: Perch<MockDesktop, SharedTarget> = Perch::from_parts(config, desktop());
    let state = perch.frame(FrameInput::new(Instant::now()).dragging(true));
    assert_eq!(state, SnapState::Free);
}

#[test]
fn pointer_drag_moves_pet() {
    let mut perch = perch();
    let now = Instant::now();
    perch.backend().set_pointer(Point::new(300, 0), true);
    perch.frame(FrameInput::new(now));
    assert!(perch.is_dragging());

    perch.backend().set_pointer(Point::new(320, -100), true);
    perch.frame(FrameInput::new(now));
    assert_eq!(perch.window_position(), Some(Point::new(270, -293)));

    perch.backend().set_pointer(Point::new(320, -100), false);
    perch.frame(FrameInput::new(now));
    assert!(!perch.is_dragging());
}

#[test]
fn shaping_follows_resizes_until_window_is_destroyed() {
    let target = SharedTarget::default();
    let mut perch = perch();

    let state = perch.enable_transparent_input_with(|| Ok((target.clone(), Size::new(200, 300))));
    assert_eq!(state, ShapeState::Active);
    assert_eq!(*target.0.bounding.lock().unwrap(), vec![Size::new(200, 300)]);
    assert_eq!(*target.0.masks.lock().unwrap(), vec![Size::new(200, 300)]);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    perch
        .on_window_destroyed(move |window| {
            assert_eq!(window, PET);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("shaping is active");

    perch.set_window_size(Size::new(220, 310));
    assert_eq!(
        perch.shape_engine().unwrap().latest_size(),
        Size::new(220, 310)
    );

    target.0.push(ShapeEvent::Resized(Size::new(220, 310)));
    target.0.push(ShapeEvent::Damaged(DamageHandle(9)));
    target.0.push(ShapeEvent::Destroyed);

    wait_until(|| fired.load(Ordering::SeqCst) == 1);
    assert_eq!(perch.shape_state(), ShapeState::Stopped);
    assert_eq!(*target.0.acknowledged.lock().unwrap(), vec![DamageHandle(9)]);
    assert!(
        target
            .0
            .masks
            .lock()
            .unwrap()
            .iter()
            .skip(1)
            .all(|size| *size == Size::new(220, 310))
    );

    perch.shutdown();
    assert_eq!(*target.0.released.lock().unwrap(), vec![true]);
}

#[test]
fn drag_holds_back_mask_updates() {
    let target = SharedTarget::default();
    let mut perch = perch();
    perch.enable_transparent_input_with(|| Ok((target.clone(), Size::new(200, 300))));

    perch.backend().set_pointer(Point::new(300, 0), true);
    assert!(perch.begin_drag());
    target.0.push(ShapeEvent::Damaged(DamageHandle(4)));
    wait_until(|| !target.0.acknowledged.lock().unwrap().is_empty());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(target.0.masks.lock().unwrap().len(), 1);

    perch.end_drag();
    target.0.push(ShapeEvent::Damaged(DamageHandle(5)));
    wait_until(|| target.0.masks.lock().unwrap().len() == 2);

    perch.shutdown();
    assert_eq!(*target.0.released.lock().unwrap(), vec![false]);
}

#[test]
fn unsupported_display_disables_shaping_for_good() {
    let mut perch = perch();
    let state = perch.enable_transparent_input_with(|| {
        Err(PerchError::Unsupported("no 32-bit alpha visual".to_owned()))
    });
    assert_eq!(state, ShapeState::Disabled);

    let retried = Cell::new(false);
    perch.enable_transparent_input_with(|| {
        retried.set(true);
        Ok((SharedTarget::default(), Size::new(1, 1)))
    });
    assert!(!retried.get());
    assert!(perch.on_window_destroyed(|_| {}).is_none());
}

#[test]
fn press_on_transparent_pixels_passes_through() {
    let target = SharedTarget::default();
    target.0.transparent.store(true, Ordering::Release);
    let mut perch = perch();
    perch.enable_transparent_input_with(|| Ok((target.clone(), Size::new(200, 300))));
    let now = Instant::now();

    perch.backend().set_pointer(Point::new(300, 0), true);
    perch.frame(FrameInput::new(now));
    perch.backend().set_pointer(Point::new(450, 0), true);
    perch.frame(FrameInput::new(now));

    assert!(!perch.is_dragging());
    assert_eq!(perch.window_position(), Some(Point::new(250, -193)));
}

#[test]
fn event_queue_is_drained_while_no_damage_loop_runs() {
    let mut perch = perch();
    perch.frame(FrameInput::new(Instant::now()));
    assert_eq!(perch.backend().drains(), 1);

    let target = SharedTarget::default();
    perch.enable_transparent_input_with(|| Ok((target.clone(), Size::new(200, 300))));
    perch.frame(FrameInput::new(Instant::now()));
    assert_eq!(perch.backend().drains(), 1);
}
