//! Sitting on other windows.
//!
//! While the pet is dragged, a small anchor zone under it is tested against
//! the top strip of every candidate window. A hit snaps the pet onto that
//! window; from then on it follows the window until it is dragged away, the
//! window goes away or covers the screen, or a higher-level mode forces it off.

use std::time::{Duration, Instant};

use crate::{
    backend::{WindowHandle, WindowSystem},
    config::RuntimeConfig,
    geometry::{Point, Rect, RectF},
};

/// Height of the title-bar strip the anchor zone has to touch.
pub const TOP_STRIP_HEIGHT: f32 = 5.0;
/// Candidates smaller than this on either axis are ignored, docks excepted.
pub const MIN_CANDIDATE_SIZE: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SnapSettings {
    pub enabled: bool,
    pub zone_offset_x: f32,
    pub zone_offset_y: f32,
    pub zone_width: f32,
    pub zone_height: f32,
    pub sit_y_offset: f32,
    pub vertical_offset: i32,
    pub base_offset: f32,
    pub base_scale: f32,
    pub cache_cooldown: Duration,
}

impl SnapSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            enabled: config.window_sitting,
            zone_offset_x: config.snap_zone.offset_x,
            zone_offset_y: config.snap_zone.offset_y,
            zone_width: config.snap_zone.width,
            zone_height: config.snap_zone.height,
            sit_y_offset: config.sit_y_offset,
            vertical_offset: config.vertical_offset,
            base_offset: config.base_offset,
            base_scale: config.base_scale,
            cache_cooldown: config.cache_cooldown(),
        }
    }
}

impl Default for SnapSettings {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

/// What the animation layer reports for the current frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameInput {
    pub dragging: bool,
    /// The pet is playing a sitting animation of its own; no new snaps.
    pub sitting: bool,
    pub pet_scale: f32,
    pub alarm_active: bool,
    pub now: Instant,
}

impl FrameInput {
    pub fn new(now: Instant) -> Self {
        Self {
            dragging: false,
            sitting: false,
            pet_scale: 1.0,
            alarm_active: false,
            now,
        }
    }

    pub fn dragging(mut self, dragging: bool) -> Self {
        self.dragging = dragging;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SnapState {
    Free,
    Snapped {
        target: WindowHandle,
        /// Pet centre along the target's width, 0.0 at its left edge.
        horizontal_fraction: f32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowEntry {
    pub handle: WindowHandle,
    pub rect: Rect,
}

/// Anchor zone for a pet occupying `pet`.
pub fn anchor_zone(pet: Rect, settings: &SnapSettings) -> RectF {
    let center_x = pet.center_x() + settings.zone_offset_x;
    let top = pet.bottom() as f32 + settings.zone_offset_y;
    RectF::new(
        center_x - settings.zone_width * 0.5,
        top,
        settings.zone_width,
        settings.zone_height,
    )
}

/// Returns the window as a snap candidate if it passes the filters.
pub fn candidate_entry<W: WindowSystem + ?Sized>(ws: &W, window: WindowHandle) -> Option<WindowEntry> {
    if !ws.is_visible(window) {
        return None;
    }
    let rect = ws.window_rect(window)?;
    if !ws.is_dock(window) {
        if rect.width < MIN_CANDIDATE_SIZE || rect.height < MIN_CANDIDATE_SIZE {
            return None;
        }
        if ws.class_name(window).is_empty() || ws.is_desktop(window) {
            return None;
        }
    }
    Some(WindowEntry {
        handle: window,
        rect,
    })
}

#[derive(Debug, Default)]
struct CandidateCache {
    entries: Vec<WindowEntry>,
    built_at: Option<Instant>,
}

impl CandidateCache {
    fn is_stale(&self, now: Instant, cooldown: Duration) -> bool {
        self.built_at
            .is_none_or(|built| now.saturating_duration_since(built) >= cooldown)
    }

    fn rebuild<W: WindowSystem + ?Sized>(&mut self, ws: &W, exclude: &[WindowHandle], now: Instant) {
        self.entries = ws
            .top_level_windows()
            .into_iter()
            .filter(|window| !exclude.contains(window))
            .filter_map(|window| candidate_entry(ws, window))
            .collect();
        self.built_at = Some(now);
        tracing::trace!(count = self.entries.len(), "rebuilt snap candidates");
    }
}

pub struct SnapController {
    state: SnapState,
    last_desktop_position: Option<Point>,
    is_topmost: bool,
    topmost_before_snap: bool,
    cache: CandidateCache,
}

impl SnapController {
    pub fn new(is_topmost: bool) -> Self {
        Self {
            state: SnapState::Free,
            last_desktop_position: None,
            is_topmost,
            topmost_before_snap: is_topmost,
            cache: CandidateCache::default(),
        }
    }

    pub fn state(&self) -> SnapState {
        self.state
    }

    pub fn is_snapped(&self) -> bool {
        matches!(self.state, SnapState::Snapped { .. })
    }

    pub fn target(&self) -> Option<WindowHandle> {
        match self.state {
            SnapState::Snapped { target, .. } => Some(target),
            SnapState::Free => None,
        }
    }

    pub fn horizontal_fraction(&self) -> Option<f32> {
        match self.state {
            SnapState::Snapped {
                horizontal_fraction,
                ..
            } => Some(horizontal_fraction),
            SnapState::Free => None,
        }
    }

    pub fn is_topmost(&self) -> bool {
        self.is_topmost
    }

    /// Where the pet was just before it last snapped.
    pub fn last_desktop_position(&self) -> Option<Point> {
        self.last_desktop_position
    }

    pub fn candidates(&self) -> &[WindowEntry] {
        &self.cache.entries
    }

    pub fn set_topmost<W: WindowSystem + ?Sized>(&mut self, ws: &W, topmost: bool) {
        self.is_topmost = topmost;
        if let Some(pet) = ws.self_window() {
            ws.set_topmost(pet, topmost);
        }
    }

    /// Rebuilds the candidate list regardless of the cooldown.
    pub fn refresh_candidates<W: WindowSystem + ?Sized>(&mut self, ws: &W, now: Instant) -> &[WindowEntry] {
        let exclude = self_handles(ws);
        self.cache.rebuild(ws, &exclude, now);
        &self.cache.entries
    }

    /// Detaches unconditionally and puts the pet back on top.
    pub fn force_exit<W: WindowSystem + ?Sized>(&mut self, ws: &W) {
        if let SnapState::Snapped { target, .. } = self.state {
            tracing::debug!(window = %target, "forced off snapped window");
        } else if self.is_topmost {
            return;
        }
        self.state = SnapState::Free;
        self.set_topmost(ws, true);
    }

    /// Advances the state machine by one frame and returns the new state.
    pub fn update<W: WindowSystem + ?Sized>(
        &mut self,
        ws: &W,
        settings: &SnapSettings,
        input: FrameInput,
    ) -> SnapState {
        if input.alarm_active {
            self.force_exit(ws);
            return self.state;
        }
        if !settings.enabled {
            if self.is_snapped() {
                self.detach(ws, false);
            }
            return self.state;
        }
        let Some(pet) = ws.self_window() else {
            return self.state;
        };
        let Some(pet_rect) = ws.window_rect(pet) else {
            return self.state;
        };
        let zone = anchor_zone(pet_rect, settings);

        match self.state {
            SnapState::Free => {
                if input.dragging && !input.sitting {
                    self.try_snap(ws, settings, pet, pet_rect, zone, input.now);
                }
            }
            SnapState::Snapped {
                target,
                horizontal_fraction,
            } => {
                if ws.is_maximized(target) || ws.is_fullscreen(target) {
                    tracing::debug!(window = %target, "snapped window covers the screen; detaching");
                    self.detach(ws, true);
                    return self.state;
                }

                let target_rect = if ws.is_visible(target) {
                    ws.window_rect(target)
                } else {
                    None
                };
                let Some(target_rect) = target_rect else {
                    tracing::debug!(window = %target, "snapped window went away; detaching");
                    self.detach(ws, !input.dragging);
                    return self.state;
                };

                if input.dragging {
                    if !zone.overlaps(&target_rect.top_strip(TOP_STRIP_HEIGHT)) {
                        tracing::debug!(window = %target, "dragged off snapped window");
                        self.detach(ws, false);
                        return self.state;
                    }
                    let fraction = fraction_along(pet_rect, target_rect);
                    self.state = SnapState::Snapped {
                        target,
                        horizontal_fraction: fraction,
                    };
                    self.place(ws, settings, pet, pet_rect, target_rect, fraction, input.pet_scale);
                } else {
                    self.place(
                        ws,
                        settings,
                        pet,
                        pet_rect,
                        target_rect,
                        horizontal_fraction,
                        input.pet_scale,
                    );
                }
            }
        }

        self.state
    }

    fn try_snap<W: WindowSystem + ?Sized>(
        &mut self,
        ws: &W,
        settings: &SnapSettings,
        pet: WindowHandle,
        pet_rect: Rect,
        zone: RectF,
        now: Instant,
    ) {
        if self.cache.is_stale(now, settings.cache_cooldown) {
            let exclude = self_handles(ws);
            self.cache.rebuild(ws, &exclude, now);
        }

        let Some(entry) = self
            .cache
            .entries
            .iter()
            .find(|entry| zone.overlaps(&entry.rect.top_strip(TOP_STRIP_HEIGHT)))
            .copied()
        else {
            return;
        };

        let fraction = fraction_along(pet_rect, entry.rect);
        self.last_desktop_position = Some(pet_rect.position());
        self.topmost_before_snap = self.is_topmost;
        self.state = SnapState::Snapped {
            target: entry.handle,
            horizontal_fraction: fraction,
        };
        tracing::info!(window = %entry.handle, rect = %entry.rect, fraction, "snapped onto window");

        self.set_topmost(ws, false);
        ws.restack_above(ws.top_level_parent(pet), entry.handle);
    }

    #[allow(clippy::too_many_arguments)]
    fn place<W: WindowSystem + ?Sized>(
        &self,
        ws: &W,
        settings: &SnapSettings,
        pet: WindowHandle,
        pet_rect: Rect,
        target_rect: Rect,
        fraction: f32,
        pet_scale: f32,
    ) {
        let position = sitting_position(settings, pet_rect, target_rect, fraction, pet_scale);
        if position != pet_rect.position() {
            ws.set_window_position(pet, position);
        }
    }

    fn detach<W: WindowSystem + ?Sized>(&mut self, ws: &W, restore_position: bool) {
        self.state = SnapState::Free;
        if restore_position
            && let (Some(pet), Some(position)) = (ws.self_window(), self.last_desktop_position)
        {
            ws.set_window_position(pet, position);
        }
        self.set_topmost(ws, self.topmost_before_snap);
    }
}

/// Where the pet's centre falls along `target`, as a fraction of its width.
pub fn fraction_along(pet: Rect, target: Rect) -> f32 {
    if target.width == 0 {
        return 0.5;
    }
    (pet.center_x() - target.x as f32) / target.width as f32
}

/// Top-left corner that seats a pet of `pet`'s size on `target`.
pub fn sitting_position(
    settings: &SnapSettings,
    pet: Rect,
    target: Rect,
    fraction: f32,
    pet_scale: f32,
) -> Point {
    let pet_width = pet.width as f32;
    let pet_height = pet.height as f32;

    let center_x = target.x as f32 + fraction * target.width as f32;
    let x = (center_x - pet_width * 0.5).round() as i32;

    let lift = pet_height + settings.zone_offset_y + settings.zone_height * 0.5;
    let scale_lift = (settings.base_scale - pet_scale) * settings.base_offset;
    let trim = (settings.sit_y_offset * pet_height).round() as i32;
    let y = target.y - (lift + scale_lift).trunc() as i32 + settings.vertical_offset + trim;

    Point::new(x, y)
}

fn self_handles<W: WindowSystem + ?Sized>(ws: &W) -> Vec<WindowHandle> {
    match ws.self_window() {
        Some(pet) => {
            let top = ws.top_level_parent(pet);
            if top == pet { vec![pet] } else { vec![pet, top] }
        }
        None => Vec::new(),
    }
}
