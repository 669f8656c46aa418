//! Client-side views
//!
//! A `View` mirrors a subset of its server twin and carries everything the
//! layout engine needs: preferred-size caches, per-axis overrides, layout
//! weight, alignment and same-size ring membership. State changes post a
//! message to the server; the mirror is eventually consistent.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use embedded_graphics_core::pixelcolor::Rgb565;

use crate::appserver::protocol::{MouseButton, ViewHandle, INVALID_HANDLE};
use crate::math::{Point, Rect};

use super::layout::LayoutNode;
use super::Application;

/// Client-local view handle
pub type ClientHandle = u32;

pub const INVALID_CLIENT_HANDLE: ClientHandle = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefSizeType {
    Smallest = 0,
    Greatest = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOverride {
    None,
    /// Replace both smallest and greatest
    Always,
    /// Floor on the smallest
    Extend,
    /// Ceiling on both
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Right,
    Top,
    Bottom,
    Center,
    Stretch,
}

/// Per-axis preferred-size override
#[derive(Debug, Clone, Copy)]
pub struct AxisOverride {
    pub mode: SizeOverride,
    pub value: f32,
}

impl Default for AxisOverride {
    fn default() -> Self {
        Self { mode: SizeOverride::None, value: 0.0 }
    }
}

/// Widget behavior hooks. A view without a handler erases on paint and
/// ignores input.
#[allow(unused_variables)]
pub trait ViewHandler: Send {
    fn on_paint(&mut self, app: &mut Application, view: ClientHandle, update_rect: Rect) {
        app.erase_rect(view, update_rect);
    }

    /// Return true to capture the pointer.
    fn on_mouse_down(
        &mut self,
        app: &mut Application,
        view: ClientHandle,
        button: MouseButton,
        position: Point,
    ) -> bool {
        false
    }

    fn on_mouse_up(
        &mut self,
        app: &mut Application,
        view: ClientHandle,
        button: MouseButton,
        position: Point,
    ) -> bool {
        false
    }

    fn on_mouse_move(
        &mut self,
        app: &mut Application,
        view: ClientHandle,
        button: MouseButton,
        position: Point,
    ) -> bool {
        false
    }

    fn on_long_press(&mut self, app: &mut Application, view: ClientHandle, position: Point) {}

    fn on_key_down(&mut self, app: &mut Application, view: ClientHandle, key: u32, repeat: bool) {}

    fn on_key_up(&mut self, app: &mut Application, view: ClientHandle, key: u32) {}

    fn on_attached(&mut self, app: &mut Application, view: ClientHandle) {}

    fn on_frame_changed(&mut self, app: &mut Application, view: ClientHandle, frame: Rect) {}

    fn on_focus_changed(&mut self, app: &mut Application, view: ClientHandle, focus: bool) {}

    /// Content-driven preferred size `(smallest, greatest)`; `None` defers
    /// to the layout node.
    fn content_size(&mut self, app: &Application, view: ClientHandle) -> Option<(Point, Point)> {
        None
    }
}

pub struct View {
    pub handle: ClientHandle,
    pub server_handle: ViewHandle,
    pub parent: Option<ClientHandle>,
    /// Paint order: first entry drawn first (bottom-most)
    pub children: Vec<ClientHandle>,
    pub name: String,

    pub frame: Rect,
    pub scroll_offset: Point,
    pub flags: u32,
    pub hide_count: i32,

    pub fg_color: Rgb565,
    pub bg_color: Rgb565,
    pub erase_color: Rgb565,
    pub pen_pos: Point,
    pub pen_width: f32,

    // Layout
    pub layout_node: LayoutNode,
    pub borders: Rect,
    pub wheight: f32,
    pub h_align: Alignment,
    pub v_align: Alignment,
    pub width_override: AxisOverride,
    pub height_override: AxisOverride,
    /// Cached preferred sizes, indexed by `PrefSizeType`
    pub preferred_sizes: [Point; 2],
    pub preferred_sizes_valid: bool,
    pub layout_valid: bool,

    /// Same-width / same-height rings (circular, handle of the next member;
    /// `None` when the view rings alone)
    pub width_ring_next: Option<ClientHandle>,
    pub height_ring_next: Option<ClientHandle>,

    pub handler: Option<Box<dyn ViewHandler>>,
}

impl View {
    pub fn new(handle: ClientHandle, name: &str, frame: Rect, flags: u32) -> Self {
        Self {
            handle,
            server_handle: INVALID_HANDLE,
            parent: None,
            children: Vec::new(),
            name: String::from(name),
            frame,
            scroll_offset: Point::default(),
            flags,
            hide_count: 0,
            fg_color: Rgb565::new(0, 0, 0),
            bg_color: Rgb565::new(31, 63, 31),
            erase_color: Rgb565::new(31, 63, 31),
            pen_pos: Point::default(),
            pen_width: 1.0,
            layout_node: LayoutNode::Stacked,
            borders: Rect::default(),
            wheight: 1.0,
            h_align: Alignment::Center,
            v_align: Alignment::Center,
            width_override: AxisOverride::default(),
            height_override: AxisOverride::default(),
            preferred_sizes: [Point::default(); 2],
            preferred_sizes_valid: false,
            layout_valid: true,
            width_ring_next: None,
            height_ring_next: None,
            handler: None,
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn is_attached(&self) -> bool {
        self.server_handle != INVALID_HANDLE
    }

    pub fn bounds(&self) -> Rect {
        self.frame.normalized()
    }

    pub fn is_visible(&self) -> bool {
        self.hide_count == 0
    }

    /// Apply the per-axis overrides to a freshly calculated size pair.
    pub fn apply_size_overrides(&self, smallest: &mut Point, greatest: &mut Point) {
        apply_axis(
            &self.width_override,
            &mut smallest.x,
            &mut greatest.x,
        );
        apply_axis(
            &self.height_override,
            &mut smallest.y,
            &mut greatest.y,
        );
        if greatest.x < smallest.x {
            greatest.x = smallest.x;
        }
        if greatest.y < smallest.y {
            greatest.y = smallest.y;
        }
    }
}

fn apply_axis(axis: &AxisOverride, smallest: &mut f32, greatest: &mut f32) {
    match axis.mode {
        SizeOverride::None => {}
        SizeOverride::Always => {
            *smallest = axis.value;
            *greatest = axis.value;
        }
        SizeOverride::Extend => {
            if *smallest < axis.value {
                *smallest = axis.value;
            }
        }
        SizeOverride::Limit => {
            if *smallest > axis.value {
                *smallest = axis.value;
            }
            if *greatest > axis.value {
                *greatest = axis.value;
            }
        }
    }
}
