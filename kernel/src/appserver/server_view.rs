//! Server-side view tree
//!
//! One `ServerView` per client view, arranged in a tree rooted at the
//! screen. The tree owns the visibility computation: each view's full and
//! visible regions are rebuilt top-down when geometry changes, the
//! difference to the previous visible region becomes damage, and sibling
//! moves are translated into hardware block moves instead of repaints.
//!
//! Regions are kept in view-local coordinates (origin at the frame's
//! top-left, unscrolled). Drawing coordinates arrive in the view's logical
//! (scrolled) space and are shifted by the scroll offset, clipped, then
//! shifted to screen space.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use embedded_graphics_core::pixelcolor::Rgb565;

use crate::drivers::ra8875::{color_from_raw, GfxBackend};
use crate::math::{IPoint, IRect, Point, Rect};
use crate::region::Region;

use super::protocol::{view_flags, ViewHandle, INVALID_HANDLE};

/// Identifies the application owning a view (0 = server itself)
pub type AppId = u32;

pub struct ServerView {
    pub handle: ViewHandle,
    pub app: AppId,
    pub parent: Option<ViewHandle>,
    /// Front of the list is topmost
    pub children: Vec<ViewHandle>,
    pub name: String,

    pub frame: Rect,
    pub i_frame: IRect,
    pub scroll_offset: Point,
    pub i_scroll_offset: IPoint,
    pub flags: u32,
    pub hide_count: i32,
    /// Cached screen position of the frame's top-left
    pub screen_pos: IPoint,

    pub fg_color: Rgb565,
    pub bg_color: Rgb565,
    pub erase_color: Rgb565,
    pub pen_pos: Point,
    pub pen_width: f32,

    // Visibility bookkeeping
    pub full: Option<Region>,
    pub visible: Option<Region>,
    pub prev_full: Option<Region>,
    pub prev_visible: Option<Region>,
    pub damage: Option<Region>,
    pub active_damage: Option<Region>,
    /// Cached effective clip; dropped whenever inputs change
    draw_region: Option<Region>,
    pub draw_constraint: Option<Region>,
    pub shape_constraint: Option<Region>,
    pub has_invalid_regs: bool,
    pub is_updating: bool,
    pub delta_move: IPoint,
    pub delta_size: IPoint,
    /// Debug overlay bits (`protocol::debug_draw_flags`)
    pub debug_draw: u32,
    pub debug_color: Rgb565,
}

impl ServerView {
    fn new(handle: ViewHandle, app: AppId, name: String, frame: Rect, flags: u32) -> Self {
        Self {
            handle,
            app,
            parent: None,
            children: Vec::new(),
            name,
            frame,
            i_frame: IRect::from(frame),
            scroll_offset: Point::default(),
            i_scroll_offset: IPoint::default(),
            flags,
            hide_count: 0,
            screen_pos: IPoint::default(),
            fg_color: Rgb565::new(0, 0, 0),
            bg_color: Rgb565::new(31, 63, 31),
            erase_color: Rgb565::new(31, 63, 31),
            pen_pos: Point::default(),
            pen_width: 1.0,
            full: None,
            visible: None,
            prev_full: None,
            prev_visible: None,
            damage: None,
            active_damage: None,
            draw_region: None,
            draw_constraint: None,
            shape_constraint: None,
            has_invalid_regs: true,
            is_updating: false,
            delta_move: IPoint::default(),
            delta_size: IPoint::default(),
            debug_draw: 0,
            debug_color: Rgb565::new(31, 0, 31),
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    fn is_attached(&self) -> bool {
        self.has_flag(view_flags::IS_ATTACHED_TO_SCREEN)
    }

    pub fn bounds(&self) -> IRect {
        IRect::from_size(self.i_frame.width(), self.i_frame.height())
    }

    fn drop_regions(&mut self) {
        self.full = None;
        self.visible = None;
        self.prev_full = None;
        self.prev_visible = None;
        self.draw_region = None;
        self.damage = None;
        self.active_damage = None;
    }

    /// Add a rectangle (local coordinates) to the damage region.
    pub fn invalidate_rect(&mut self, rect: IRect) {
        if self.hide_count > 0 || !rect.is_valid() {
            return;
        }
        match &mut self.damage {
            Some(damage) => damage.include(rect),
            None => self.damage = Some(Region::from_rect(rect)),
        }
    }
}

/// Rectangle queued for an accelerated move
struct BlitRect {
    bounds: IRect,
    delta: IPoint,
}

pub struct ViewTree {
    views: BTreeMap<ViewHandle, ServerView>,
    next_handle: ViewHandle,
    pub root: ViewHandle,
}

impl ViewTree {
    pub fn new(screen_size: IPoint) -> Self {
        let mut views = BTreeMap::new();
        let mut root = ServerView::new(
            1,
            0,
            String::from("screen"),
            Rect::new(0.0, 0.0, screen_size.x as f32, screen_size.y as f32),
            view_flags::IS_ATTACHED_TO_SCREEN,
        );
        root.has_invalid_regs = true;
        views.insert(1, root);
        Self { views, next_handle: 2, root: 1 }
    }

    pub fn view(&self, handle: ViewHandle) -> Option<&ServerView> {
        self.views.get(&handle)
    }

    pub fn view_mut(&mut self, handle: ViewHandle) -> Option<&mut ServerView> {
        self.views.get_mut(&handle)
    }

    pub fn contains(&self, handle: ViewHandle) -> bool {
        self.views.contains_key(&handle)
    }

    // ========================================================================
    // Structure
    // ========================================================================

    /// Insert a new view as the topmost child of `parent`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_view(
        &mut self,
        app: AppId,
        parent: ViewHandle,
        name: &str,
        frame: Rect,
        scroll_offset: Point,
        flags: u32,
        hide_count: i32,
        erase_color: u16,
        bg_color: u16,
        fg_color: u16,
    ) -> ViewHandle {
        if !self.views.contains_key(&parent) {
            crate::log_error!("[appserver] create_view: no parent {}", parent);
            return INVALID_HANDLE;
        }
        if flags & view_flags::EAVESDROPPER != 0 {
            // Reserved: mirror views of foreign server views are not
            // supported.
            crate::log_warn!("[appserver] create_view '{}': eavesdropper refused", name);
            return INVALID_HANDLE;
        }
        let handle = self.next_handle;
        self.next_handle += 1;

        let mut view = ServerView::new(handle, app, String::from(name), frame, flags);
        view.parent = Some(parent);
        view.hide_count = hide_count;
        view.scroll_offset = scroll_offset;
        view.i_scroll_offset = IPoint::from(scroll_offset);
        view.erase_color = color_from_raw(erase_color);
        view.bg_color = color_from_raw(bg_color);
        view.fg_color = color_from_raw(fg_color);
        view.flags |= view_flags::IS_ATTACHED_TO_SCREEN;
        self.views.insert(handle, view);

        let parent_view = self.views.get_mut(&parent).unwrap();
        parent_view.children.insert(0, handle); // topmost
        parent_view.has_invalid_regs = true;
        self.set_dirty_flags(handle);
        self.update_screen_pos(handle);
        handle
    }

    /// Remove a view and its subtree. The uncovered area becomes parent
    /// damage through the normal region rebuild.
    pub fn delete_view(&mut self, handle: ViewHandle) {
        if handle == self.root {
            return;
        }
        let Some(view) = self.views.get(&handle) else { return };
        let parent = view.parent;
        let children = view.children.clone();
        for child in children {
            self.delete_view(child);
        }
        self.views.remove(&handle);
        if let Some(parent) = parent {
            if let Some(parent_view) = self.views.get_mut(&parent) {
                parent_view.children.retain(|&c| c != handle);
                parent_view.has_invalid_regs = true;
            }
            self.set_dirty_flags(parent);
        }
    }

    /// All views belonging to an application, for teardown.
    pub fn views_of_app(&self, app: AppId) -> Vec<ViewHandle> {
        self.views
            .values()
            .filter(|v| v.app == app && v.parent == Some(self.root))
            .map(|v| v.handle)
            .collect()
    }

    fn set_dirty_flags(&mut self, handle: ViewHandle) {
        let Some(view) = self.views.get_mut(&handle) else { return };
        view.has_invalid_regs = true;
        let children = view.children.clone();
        for child in children {
            self.set_dirty_flags(child);
        }
    }

    /// Propagate dirty flags into every child intersecting `rect` (parent
    /// coordinates of `handle`).
    fn mark_modified(&mut self, handle: ViewHandle, rect: IRect) {
        let Some(view) = self.views.get_mut(&handle) else { return };
        if !view.bounds().intersects(&rect) {
            return;
        }
        view.has_invalid_regs = true;
        let children = view.children.clone();
        for child in children {
            let top_left = self.views[&child].i_frame.top_left();
            self.mark_modified(child, rect - top_left);
        }
    }

    fn update_screen_pos(&mut self, handle: ViewHandle) {
        let view = &self.views[&handle];
        let parent_pos = view
            .parent
            .map(|p| self.views[&p].screen_pos)
            .unwrap_or_default();
        let top_left = view.i_frame.top_left();
        let children = view.children.clone();
        self.views.get_mut(&handle).unwrap().screen_pos = parent_pos + top_left;
        for child in children {
            self.update_screen_pos(child);
        }
    }

    // ========================================================================
    // Geometry changes
    // ========================================================================

    pub fn set_frame(&mut self, handle: ViewHandle, frame: Rect) {
        let Some(view) = self.views.get(&handle) else { return };
        let parent = view.parent;
        let old_i_frame = view.i_frame;
        let hidden = view.hide_count > 0;
        let new_i_frame = IRect::from(frame);

        {
            let view = self.views.get_mut(&handle).unwrap();
            view.frame = frame;
        }

        if !hidden {
            if old_i_frame == new_i_frame {
                self.views.get_mut(&handle).unwrap().i_frame = new_i_frame;
                self.update_screen_pos(handle);
                return;
            }
            {
                let view = self.views.get_mut(&handle).unwrap();
                view.delta_move += new_i_frame.top_left() - old_i_frame.top_left();
                view.delta_size += IPoint::new(
                    new_i_frame.width() - old_i_frame.width(),
                    new_i_frame.height() - old_i_frame.height(),
                );
            }
            if let Some(parent) = parent {
                self.views.get_mut(&parent).unwrap().has_invalid_regs = true;
            }
            self.set_dirty_flags(handle);

            // Siblings stacked below may have become exposed or covered.
            if let Some(parent) = parent {
                let siblings = self.views[&parent].children.clone();
                let my_index = siblings.iter().position(|&s| s == handle).unwrap_or(0);
                for &sibling in &siblings[my_index + 1..] {
                    let sib_frame = self.views[&sibling].i_frame;
                    if sib_frame.intersects(&old_i_frame) || sib_frame.intersects(&new_i_frame) {
                        self.mark_modified(sibling, old_i_frame - sib_frame.top_left());
                        self.mark_modified(sibling, new_i_frame - sib_frame.top_left());
                    }
                }
            }
        }
        self.views.get_mut(&handle).unwrap().i_frame = new_i_frame;
        self.update_screen_pos(handle);
    }

    /// Adjust the hide count; a view is visible only while every count on
    /// the path to the root is zero.
    pub fn show(&mut self, handle: ViewHandle, visible: bool) {
        let Some(view) = self.views.get_mut(&handle) else { return };
        view.hide_count += if visible { -1 } else { 1 };
        if view.hide_count < 0 {
            crate::log_error!("[appserver] show: negative hide count on {}", handle);
            view.hide_count = 0;
        }
        let parent = view.parent;
        self.set_dirty_flags(handle);
        if let Some(parent) = parent {
            self.views.get_mut(&parent).unwrap().has_invalid_regs = true;
        }
    }

    /// Raise a view to the front of its siblings.
    pub fn toggle_depth(&mut self, handle: ViewHandle) {
        let Some(view) = self.views.get(&handle) else { return };
        let Some(parent) = view.parent else { return };
        let parent_view = self.views.get_mut(&parent).unwrap();
        parent_view.children.retain(|&c| c != handle);
        parent_view.children.insert(0, handle);
        parent_view.has_invalid_regs = true;
        self.set_dirty_flags(parent);
    }

    pub fn set_draw_constraint(&mut self, handle: ViewHandle, region: Option<Region>) {
        if let Some(view) = self.views.get_mut(&handle) {
            view.draw_constraint = region;
            view.draw_region = None;
            if view.hide_count == 0 {
                view.has_invalid_regs = true;
            }
        }
    }

    pub fn set_shape_constraint(&mut self, handle: ViewHandle, region: Option<Region>) {
        let Some(view) = self.views.get_mut(&handle) else { return };
        view.shape_constraint = region;
        let parent = view.parent;
        if view.hide_count == 0 {
            if let Some(parent) = parent {
                self.views.get_mut(&parent).unwrap().has_invalid_regs = true;
            }
            self.set_dirty_flags(handle);
        }
    }

    // ========================================================================
    // Region recomputation
    // ========================================================================

    /// Rebuild full and visible regions for the whole subtree, translate
    /// sibling moves into hardware moves, and derive damage from newly
    /// exposed area.
    pub fn update_regions(&mut self, gfx: &mut dyn GfxBackend) {
        let root = self.root;
        self.rebuild_region(root, false);
        self.move_childs(root, gfx);
        self.invalidate_new_areas(root);
        self.clear_dirty_flags(root);
    }

    fn rebuild_region(&mut self, handle: ViewHandle, force: bool) {
        let view = &self.views[&handle];
        if !view.is_attached() {
            return;
        }
        if view.hide_count > 0 {
            if view.visible.is_some() {
                self.views.get_mut(&handle).unwrap().drop_regions();
            }
            return;
        }
        let force_children = force;
        let needs_rebuild = view.has_invalid_regs || force;

        if needs_rebuild {
            let parent = view.parent;
            let i_frame = view.i_frame;
            let shape = view.shape_constraint.clone();

            // Start from what is left of the parent, clipped to our frame.
            let mut full = match parent {
                None => Region::from_rect(IRect::from_size(i_frame.width(), i_frame.height())),
                Some(parent) => {
                    let parent_full = self.views[&parent].full.clone().unwrap_or_default();
                    Region::from_clipped(&parent_full, i_frame, true)
                }
            };
            if let Some(shape) = &shape {
                full.intersect(shape);
            }

            // Subtract every sibling stacked above us.
            if let Some(parent) = parent {
                let siblings = self.views[&parent].children.clone();
                let my_index = siblings.iter().position(|&s| s == handle).unwrap_or(0);
                let top_left = i_frame.top_left();
                for &sibling in &siblings[..my_index] {
                    let sibling_view = &self.views[&sibling];
                    if sibling_view.hide_count != 0 {
                        continue;
                    }
                    if !sibling_view.i_frame.intersects(&i_frame) {
                        continue;
                    }
                    match &sibling_view.shape_constraint {
                        None => full.exclude(sibling_view.i_frame - top_left),
                        Some(shape) => full.exclude_region_offset(
                            shape,
                            sibling_view.i_frame.top_left() - top_left,
                        ),
                    }
                }
            }
            full.optimize();

            // Visible: the full region minus opaque children.
            let mut visible = full.clone();
            let view = &self.views[&handle];
            if !view.has_flag(view_flags::DRAW_ON_CHILDREN) {
                let mut modified = false;
                for &child in view.children.clone().iter() {
                    let child_view = &self.views[&child];
                    if child_view.hide_count != 0
                        || child_view.has_flag(view_flags::TRANSPARENT)
                    {
                        continue;
                    }
                    match &child_view.shape_constraint {
                        None => visible.exclude(child_view.i_frame),
                        Some(shape) => visible
                            .exclude_region_offset(shape, child_view.i_frame.top_left()),
                    }
                    modified = true;
                }
                if modified {
                    visible.optimize();
                }
            }

            let view = self.views.get_mut(&handle).unwrap();
            view.draw_region = None;
            view.prev_visible = view.visible.take();
            view.prev_full = view.full.take();
            view.full = Some(full);
            view.visible = Some(visible);
        }

        let children = self.views[&handle].children.clone();
        for child in children {
            self.rebuild_region(child, force_children);
        }
    }

    /// Translate children whose frames moved by blitting the intersection of
    /// their old and new full regions.
    fn move_childs(&mut self, handle: ViewHandle, gfx: &mut dyn GfxBackend) {
        let view = &self.views[&handle];
        if view.hide_count > 0 || !view.is_attached() {
            return;
        }
        if view.has_invalid_regs {
            let parent_screen_pos = view.screen_pos;
            let children = view.children.clone();
            for &child in &children {
                let child_view = &self.views[&child];
                let delta = child_view.delta_move;
                if delta == IPoint::default() {
                    continue;
                }
                let (Some(full), Some(prev_full)) =
                    (child_view.full.clone(), child_view.prev_full.clone())
                else {
                    continue;
                };

                // Only area visible both before and after the move can be
                // blitted; everything else is repainted through damage.
                let mut moved = prev_full;
                moved.intersect(&full);
                if moved.is_empty() {
                    continue;
                }

                let child_offset = child_view.i_frame.top_left() + parent_screen_pos;
                let mut blits: Vec<BlitRect> = moved
                    .rects()
                    .iter()
                    .map(|r| BlitRect { bounds: *r + child_offset, delta })
                    .collect();
                order_blits(&mut blits);
                for blit in &blits {
                    gfx.move_rect(blit.bounds - blit.delta, blit.bounds.top_left());
                }
            }
            // Shrinking the parent exposes its right/bottom edge under the
            // children; the rebuild already damaged it via prev regions.
            for &child in &children {
                let child_view = self.views.get_mut(&child).unwrap();
                child_view.prev_full = None;
            }
            self.views.get_mut(&handle).unwrap().prev_full = None;
        }
        let children = self.views[&handle].children.clone();
        for child in children {
            self.move_childs(child, gfx);
        }
    }

    /// Anything visible now that was not visible before must repaint.
    fn invalidate_new_areas(&mut self, handle: ViewHandle) {
        let view = &self.views[&handle];
        if view.hide_count > 0 || !view.is_attached() {
            return;
        }
        if view.has_invalid_regs {
            let full_update = (view.has_flag(view_flags::FULL_UPDATE_ON_RESIZE_H)
                && view.delta_size.x != 0)
                || (view.has_flag(view_flags::FULL_UPDATE_ON_RESIZE_V)
                    && view.delta_size.y != 0);

            let bounds = view.bounds();
            let fresh = if full_update {
                Some(Region::from_rect(bounds))
            } else {
                view.visible.as_ref().map(|visible| {
                    let mut fresh = visible.clone();
                    if let Some(prev) = &view.prev_visible {
                        fresh.exclude_region(prev);
                    }
                    fresh
                })
            };

            let view = self.views.get_mut(&handle).unwrap();
            if let Some(fresh) = fresh {
                for rect in fresh.rects() {
                    match &mut view.damage {
                        Some(damage) => damage.include(*rect),
                        None => view.damage = Some(Region::from_rect(*rect)),
                    }
                }
            }
            view.prev_visible = None;
            view.delta_move = IPoint::default();
            view.delta_size = IPoint::default();
        }
        let children = self.views[&handle].children.clone();
        for child in children {
            self.invalidate_new_areas(child);
        }
    }

    fn clear_dirty_flags(&mut self, handle: ViewHandle) {
        let Some(view) = self.views.get_mut(&handle) else { return };
        view.has_invalid_regs = false;
        let children = view.children.clone();
        for child in children {
            self.clear_dirty_flags(child);
        }
    }

    // ========================================================================
    // Paint loop
    // ========================================================================

    /// Walk the tree and start a paint round on every view with pending
    /// damage. Views that paint themselves get a callback (routed to their
    /// application); everything else is erased server-side.
    pub fn update_if_needed(
        &mut self,
        gfx: &mut dyn GfxBackend,
        request_paint: &mut dyn FnMut(AppId, ViewHandle, IRect),
    ) {
        self.update_view_if_needed(self.root, gfx, request_paint);
    }

    fn update_view_if_needed(
        &mut self,
        handle: ViewHandle,
        gfx: &mut dyn GfxBackend,
        request_paint: &mut dyn FnMut(AppId, ViewHandle, IRect),
    ) {
        let view = &self.views[&handle];
        if view.hide_count == 0 && view.is_attached() {
            if view.damage.is_some() && view.active_damage.is_none() && !view.is_updating {
                self.begin_update(handle);
                let view = &self.views[&handle];
                let bounds = view
                    .active_damage
                    .as_ref()
                    .map(|d| d.bounds())
                    .unwrap_or_default();
                if view.has_flag(view_flags::WILL_DRAW) && view.app != 0 {
                    if view.has_flag(view_flags::CLEAR_BACKGROUND) {
                        // Newly exposed area is cleared before the client
                        // gets to paint over it.
                        self.erase_active_damage(gfx, handle);
                    }
                    let view = &self.views[&handle];
                    request_paint(view.app, handle, bounds);
                    // The client paints and finishes with end-update.
                } else {
                    self.erase_active_damage(gfx, handle);
                    self.end_update(handle);
                }
            }
        }
        let children = self.views[&handle].children.clone();
        for child in children {
            self.update_view_if_needed(child, gfx, request_paint);
        }
    }

    /// Atomically promote damage to active damage.
    pub fn begin_update(&mut self, handle: ViewHandle) {
        let Some(view) = self.views.get_mut(&handle) else { return };
        if view.visible.is_none() {
            return;
        }
        view.is_updating = true;
        if view.active_damage.is_none() {
            if let Some(mut damage) = view.damage.take() {
                damage.optimize();
                view.active_damage = Some(damage);
                view.draw_region = None;
            }
        }
    }

    /// Close a paint round; damage accrued while painting starts the next.
    pub fn end_update(&mut self, handle: ViewHandle) -> Option<IRect> {
        let view = self.views.get_mut(&handle)?;
        view.active_damage = None;
        view.draw_region = None;
        view.is_updating = false;
        if let Some(mut damage) = view.damage.take() {
            damage.optimize();
            let bounds = damage.bounds();
            view.active_damage = Some(damage);
            Some(bounds)
        } else {
            None
        }
    }

    /// The clip all drawing for this view runs against: visible region,
    /// intersected with the active damage while updating and with the draw
    /// constraint when one is set.
    fn effective_clip(&mut self, handle: ViewHandle) -> Option<Region> {
        let view = self.views.get_mut(&handle)?;
        if view.hide_count > 0 {
            return None;
        }
        if view.is_updating && view.active_damage.is_none() {
            return None;
        }
        if let Some(cached) = &view.draw_region {
            return Some(cached.clone());
        }
        let visible = view.visible.as_ref()?;
        let mut clip = visible.clone();
        if view.is_updating {
            if let Some(active) = &view.active_damage {
                clip.intersect(active);
            }
        }
        if let Some(constraint) = &view.draw_constraint {
            clip.intersect(constraint);
        }
        clip.optimize();
        view.draw_region = Some(clip.clone());
        Some(clip)
    }

    /// Developer overlays: outline frames, draw regions or damage regions
    /// of views that asked for them via debug-draw.
    pub fn draw_debug_overlays(&mut self, gfx: &mut dyn GfxBackend) {
        use super::protocol::debug_draw_flags as ddf;

        let marked: Vec<ViewHandle> = self
            .views
            .values()
            .filter(|v| v.debug_draw != 0 && v.hide_count == 0 && v.visible.is_some())
            .map(|v| v.handle)
            .collect();
        for handle in marked {
            let view = &self.views[&handle];
            let color = view.debug_color;
            let screen_pos = view.screen_pos;
            let flags = view.debug_draw;
            let bounds = view.bounds();
            let mut outlines: Vec<IRect> = Vec::new();
            if flags & ddf::VIEW_FRAME != 0 {
                outlines.push(bounds);
            }
            if flags & ddf::DRAW_REGION != 0 {
                if let Some(visible) = &view.visible {
                    outlines.extend_from_slice(visible.rects());
                }
            }
            if flags & ddf::DAMAGE_REGION != 0 {
                if let Some(damage) = &view.damage {
                    outlines.extend_from_slice(damage.rects());
                }
            }
            gfx.wait_blitter();
            gfx.set_fg_color(color);
            for rect in outlines {
                let r = rect + screen_pos;
                gfx.wait_blitter();
                gfx.fill_rect(IRect::new(r.left, r.top, r.right, r.top + 1));
                gfx.wait_blitter();
                gfx.fill_rect(IRect::new(r.left, r.bottom - 1, r.right, r.bottom));
                gfx.wait_blitter();
                gfx.fill_rect(IRect::new(r.left, r.top, r.left + 1, r.bottom));
                gfx.wait_blitter();
                gfx.fill_rect(IRect::new(r.right - 1, r.top, r.right, r.bottom));
            }
        }
    }

    /// Default paint: fill the active damage with the erase color. Works in
    /// local coordinates, bypassing the scroll offset drawing calls apply.
    fn erase_active_damage(&mut self, gfx: &mut dyn GfxBackend, handle: ViewHandle) {
        let view = &self.views[&handle];
        let (Some(visible), Some(active)) = (&view.visible, &view.active_damage) else {
            return;
        };
        let mut clip = visible.clone();
        clip.intersect(active);
        let screen_pos = view.screen_pos;
        let erase_color = view.erase_color;

        gfx.wait_blitter();
        gfx.set_fg_color(erase_color);
        gfx.set_window(IRect::from_size(
            crate::config::DISPLAY_WIDTH,
            crate::config::DISPLAY_HEIGHT,
        ));
        let mut first = true;
        for rect in clip.rects() {
            if !first {
                gfx.wait_blitter();
            }
            first = false;
            gfx.fill_rect(*rect + screen_pos);
        }
    }

    // ========================================================================
    // Drawing translation
    // ========================================================================

    pub fn fill_rect(&mut self, gfx: &mut dyn GfxBackend, handle: ViewHandle, rect: Rect, color: Rgb565) {
        let Some(clip) = self.effective_clip(handle) else { return };
        let view = &self.views[&handle];
        let screen_pos = view.screen_pos;
        let local = IRect::from(rect + view.scroll_offset);

        gfx.wait_blitter();
        gfx.set_fg_color(color);
        gfx.set_window(IRect::from_size(
            crate::config::DISPLAY_WIDTH,
            crate::config::DISPLAY_HEIGHT,
        ));
        let mut first = true;
        for clip_rect in clip.rects() {
            let clipped = local & *clip_rect;
            if !clipped.is_valid() {
                continue;
            }
            if !first {
                gfx.wait_blitter();
            }
            first = false;
            gfx.fill_rect(clipped + screen_pos);
        }
    }

    pub fn draw_line(
        &mut self,
        gfx: &mut dyn GfxBackend,
        handle: ViewHandle,
        from: Point,
        to: Point,
    ) {
        let Some(clip) = self.effective_clip(handle) else { return };
        let view = &self.views[&handle];
        let screen_pos = view.screen_pos;
        let fg_color = view.fg_color;
        let mut from_local = IPoint::from(from + view.scroll_offset);
        let mut to_local = IPoint::from(to + view.scroll_offset);
        // Left-to-right keeps the clip rounding identical to the line engine
        if from_local.x > to_local.x {
            core::mem::swap(&mut from_local, &mut to_local);
        }

        gfx.wait_blitter();
        gfx.set_fg_color(fg_color);
        let mut first = true;
        for clip_rect in clip.rects() {
            let mut p1 = from_local;
            let mut p2 = to_local;
            if !Region::clip_line(clip_rect, &mut p1, &mut p2) {
                continue;
            }
            if !first {
                gfx.wait_blitter();
            }
            first = false;
            gfx.set_window(*clip_rect + screen_pos);
            gfx.draw_line(p1 + screen_pos, p2 + screen_pos);
        }
        gfx.set_window(IRect::from_size(
            crate::config::DISPLAY_WIDTH,
            crate::config::DISPLAY_HEIGHT,
        ));
    }

    pub fn fill_circle(
        &mut self,
        gfx: &mut dyn GfxBackend,
        handle: ViewHandle,
        center: Point,
        radius: f32,
    ) {
        let Some(clip) = self.effective_clip(handle) else { return };
        let view = &self.views[&handle];
        let screen_pos = view.screen_pos;
        let fg_color = view.fg_color;
        let center_scr = IPoint::from(center + view.scroll_offset) + screen_pos;
        let radius = libm::roundf(radius) as i32;

        // Cheap reject for clip rectangles the circle cannot touch.
        let bounding = IRect::new(
            center_scr.x - radius,
            center_scr.y - radius,
            center_scr.x + radius + 1,
            center_scr.y + radius + 1,
        );

        gfx.wait_blitter();
        gfx.set_fg_color(fg_color);
        let mut first = true;
        for clip_rect in clip.rects() {
            let clip_scr = *clip_rect + screen_pos;
            if !bounding.intersects(&clip_scr) {
                continue;
            }
            if !first {
                gfx.wait_blitter();
            }
            first = false;
            gfx.set_window(clip_scr);
            gfx.fill_circle(center_scr, radius);
        }
        gfx.set_window(IRect::from_size(
            crate::config::DISPLAY_WIDTH,
            crate::config::DISPLAY_HEIGHT,
        ));
    }

    /// Draw text at the pen position and advance the pen.
    pub fn draw_string(&mut self, gfx: &mut dyn GfxBackend, handle: ViewHandle, text: &str) {
        let Some(clip) = self.effective_clip(handle) else { return };
        let (screen_pos, fg_color, pen) = {
            let view = &self.views[&handle];
            (view.screen_pos, view.fg_color, view.pen_pos + view.scroll_offset)
        };
        let pos = IPoint::from(pen) + screen_pos;

        gfx.wait_blitter();
        gfx.set_fg_color(fg_color);
        let mut advance = 0;
        let mut first = true;
        for clip_rect in clip.rects() {
            if !first {
                gfx.wait_blitter();
            }
            first = false;
            gfx.set_window(*clip_rect + screen_pos);
            advance = gfx.draw_string(text, pos);
        }
        gfx.set_window(IRect::from_size(
            crate::config::DISPLAY_WIDTH,
            crate::config::DISPLAY_HEIGHT,
        ));
        if let Some(view) = self.views.get_mut(&handle) {
            view.pen_pos.x += advance as f32;
        }
    }

    /// Copy a rectangle within the view, moving visible pixels with the
    /// blitter and damaging whatever the copy could not source.
    pub fn copy_rect(
        &mut self,
        gfx: &mut dyn GfxBackend,
        handle: ViewHandle,
        src_rect: Rect,
        dst_pos: Point,
    ) {
        let Some(view) = self.views.get(&handle) else { return };
        let Some(visible) = view.visible.clone() else { return };
        let scroll = view.i_scroll_offset;
        let screen_pos = view.screen_pos;

        let src = IRect::from(src_rect) + scroll;
        let delta = IPoint::from(dst_pos) + scroll - src.top_left();
        let dst = src + delta;

        let mut damage = Region::from_clipped(&visible, dst, false);
        let mut blits: Vec<BlitRect> = Vec::new();
        for src_clip in visible.rects() {
            let clipped_src = src & *src_clip;
            if !clipped_src.is_valid() {
                continue;
            }
            let moved = clipped_src + delta;
            for dst_clip in visible.rects() {
                let target = moved & *dst_clip;
                if !target.is_valid() {
                    continue;
                }
                damage.exclude(target);
                blits.push(BlitRect { bounds: target, delta });
            }
        }

        if blits.is_empty() {
            self.views.get_mut(&handle).unwrap().invalidate_rect(dst);
            return;
        }
        order_blits(&mut blits);
        for blit in &blits {
            gfx.move_rect(blit.bounds - blit.delta + screen_pos, (blit.bounds + screen_pos).top_left());
        }

        // Damage riding along in the copied area moves with it.
        let view = self.views.get_mut(&handle).unwrap();
        if let Some(existing) = &mut view.damage {
            let carried = Region::from_clipped(existing, src, false);
            for rect in carried.rects() {
                existing.include((*rect + delta) & dst);
            }
        }
        for rect in damage.rects() {
            view.invalidate_rect(*rect);
        }
        if let Some(d) = &mut view.damage {
            d.optimize();
        }
    }

    /// Scroll the view's content. The still-visible part moves by hardware
    /// copy; the strip scrolled into view becomes damage.
    pub fn scroll_by(&mut self, gfx: &mut dyn GfxBackend, handle: ViewHandle, delta: Point) {
        let Some(view) = self.views.get_mut(&handle) else { return };
        let old_offset = view.i_scroll_offset;
        view.scroll_offset += delta;
        view.i_scroll_offset = IPoint::from(view.scroll_offset);
        let i_delta = view.i_scroll_offset - old_offset;
        if i_delta == IPoint::default() {
            return;
        }

        // Children live in the scrolled space: their frames shift.
        let children = view.children.clone();
        let hidden = view.hide_count > 0;
        for child in children {
            let child_view = self.views.get_mut(&child).unwrap();
            child_view.i_frame = child_view.i_frame + i_delta;
            child_view.frame = child_view.frame + Point::from(i_delta);
        }
        if hidden {
            return;
        }

        self.views.get_mut(&handle).unwrap().has_invalid_regs = true;
        self.set_dirty_flags(handle);
        self.rebuild_region(handle, false);
        self.invalidate_new_areas(handle);
        self.clear_dirty_flags(handle);
        self.update_screen_pos(handle);

        let view = &self.views[&handle];
        let (Some(full), Some(visible)) = (view.full.clone(), view.visible.clone()) else {
            return;
        };
        if !view.is_attached() {
            return;
        }
        let bounds = view.bounds();
        let screen_pos = view.screen_pos;
        let mut uncovered = visible;

        let mut blits: Vec<BlitRect> = Vec::new();
        for src_clip in full.rects() {
            let src = bounds & *src_clip;
            if !src.is_valid() {
                continue;
            }
            let moved = src + i_delta;
            for dst_clip in full.rects() {
                let target = moved & *dst_clip;
                if !target.is_valid() {
                    continue;
                }
                uncovered.exclude(target);
                blits.push(BlitRect { bounds: target, delta: i_delta });
            }
        }

        if blits.is_empty() {
            self.views.get_mut(&handle).unwrap().invalidate_rect(bounds);
            return;
        }
        order_blits(&mut blits);
        for blit in &blits {
            gfx.move_rect(
                blit.bounds - blit.delta + screen_pos,
                (blit.bounds + screen_pos).top_left(),
            );
        }

        // Translate pending damage along with the content it belongs to.
        let view = self.views.get_mut(&handle).unwrap();
        if let Some(damage) = &mut view.damage {
            damage.translate(i_delta);
            damage.intersect(&Region::from_rect(bounds));
        }
        if let Some(active) = &mut view.active_damage {
            active.translate(i_delta);
            active.intersect(&Region::from_rect(bounds));
        }
        for rect in uncovered.rects() {
            view.invalidate_rect(*rect);
        }
        if let Some(damage) = &mut view.damage {
            damage.optimize();
        }
        view.draw_region = None;
    }
}

/// Order blit rectangles so no move overwrites pixels a later move still
/// needs: for a move to the right, rightmost rectangles go first, and
/// correspondingly for the other directions.
fn order_blits(list: &mut Vec<BlitRect>) {
    list.sort_by(|a, b| {
        let delta = a.delta;
        let horizontal = if delta.x < 0 {
            a.bounds.left.cmp(&b.bounds.left)
        } else {
            b.bounds.left.cmp(&a.bounds.left)
        };
        let vertical = if delta.y < 0 {
            a.bounds.top.cmp(&b.bounds.top)
        } else {
            b.bounds.top.cmp(&a.bounds.top)
        };
        if delta.x != 0 && delta.y == 0 {
            horizontal.then(vertical)
        } else {
            vertical.then(horizontal)
        }
    });
}
