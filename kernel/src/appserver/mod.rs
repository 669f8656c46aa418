//! Application server
//!
//! The compositor service. Owns the frame buffer and the RA8875, keeps one
//! server-side view tree per registered application, and translates batched
//! client drawing commands into clipped hardware primitives. Runs as a
//! single service thread; bundles are applied atomically in arrival order.

pub mod protocol;
pub mod server_view;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;

use crate::drivers::ra8875::{color_from_raw, GfxBackend};
use crate::ipc::{self, PortId};
use crate::math::{IRect, Point};
use crate::vfs::{ErrorCode, KResult};

use protocol::{
    view_flags, MouseButton, MsgCode, Reader, ViewHandle, Writer, INVALID_HANDLE,
};
use server_view::{AppId, ViewTree};

/// One registered client application
struct AppRecord {
    #[allow(dead_code)]
    id: AppId,
    name: String,
    /// Server-to-client events (paint requests, input, focus)
    event_port: PortId,
}

pub struct AppServer {
    tree: ViewTree,
    apps: BTreeMap<AppId, AppRecord>,
    next_app: AppId,
    gfx: Box<dyn GfxBackend>,
    focus_view: Option<ViewHandle>,
    /// Pointer capture between down and up
    capture: Option<(AppId, ViewHandle)>,
}

static SERVER: spin::Once<spin::Mutex<AppServer>> = spin::Once::new();
static SERVER_PORT: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(0);

/// Port clients register through.
pub fn server_port() -> PortId {
    SERVER_PORT.load(core::sync::atomic::Ordering::Acquire)
}

/// Bring the compositor up and start its service thread.
pub fn init(gfx: Box<dyn GfxBackend>) {
    SERVER.call_once(|| {
        let port = ipc::create_port("appserver", 64);
        SERVER_PORT.store(port, core::sync::atomic::Ordering::Release);
        crate::scheduler::spawn("appserver", service_entry);
        crate::log!("[appserver] online, port {}", port);
        spin::Mutex::new(AppServer::new(gfx))
    });
}

fn service_entry() {
    let port = server_port();
    loop {
        let Ok(message) = ipc::receive(port) else { continue };
        if let Some(server) = SERVER.get() {
            server.lock().dispatch(&message);
        }
    }
}

/// Drain pending server messages from the calling thread. The service
/// thread normally does this; clients waiting for a reply call it too so
/// request/reply pairs make progress even when the server thread is
/// starved (thread-cooperative handling).
pub fn drive() {
    let Some(server) = SERVER.get() else { return };
    let Some(mut server) = server.try_lock() else { return };
    let port = server_port();
    while let Ok(message) = ipc::try_receive(port) {
        server.dispatch(&message);
    }
}

/// Inject a touch/mouse event from the input layer.
pub fn post_pointer_event(code: MsgCode, button: MouseButton, position: Point) {
    if let Some(server) = SERVER.get() {
        server.lock().handle_pointer_event(code, button, position);
    }
}

impl AppServer {
    pub fn new(gfx: Box<dyn GfxBackend>) -> Self {
        let resolution = gfx.resolution();
        Self {
            tree: ViewTree::new(resolution),
            apps: BTreeMap::new(),
            next_app: 1,
            gfx,
            focus_view: None,
            capture: None,
        }
    }

    // ========================================================================
    // Message dispatch
    // ========================================================================

    /// Apply one port message. Bundles are applied to completion before the
    /// next message is taken, which makes them atomic against other clients.
    pub fn dispatch(&mut self, message: &ipc::Message) {
        let result = match MsgCode::from_u16(message.code) {
            Some(MsgCode::RegisterApplication) => self.handle_register(&message.data),
            Some(MsgCode::MessageBundle) => {
                for item in protocol::BundleIter::new(&message.data) {
                    match item {
                        Ok((code, payload)) => {
                            if let Err(error) = self.handle_sub_message(code, payload) {
                                crate::log_warn!(
                                    "[appserver] sub-message {} dropped: {:?}",
                                    code,
                                    error
                                );
                            }
                        }
                        Err(_) => {
                            crate::log_warn!("[appserver] malformed bundle frame dropped");
                            break;
                        }
                    }
                }
                self.recompose();
                Ok(())
            }
            Some(code) => {
                // Stray singleton message: treat like a one-element bundle.
                let result = self.handle_sub_message(code as u16, &message.data);
                self.recompose();
                result
            }
            None => Err(ErrorCode::InvalidArg),
        };
        if let Err(error) = result {
            crate::log_warn!("[appserver] message {} dropped: {:?}", message.code, error);
        }
    }

    fn handle_register(&mut self, payload: &[u8]) -> KResult<()> {
        let mut reader = Reader::new(payload);
        let reply_port = reader.read_u32()?;
        let event_port = reader.read_u32()?;
        let name = reader.read_string()?;

        let id = self.next_app;
        self.next_app += 1;
        self.apps.insert(
            id,
            AppRecord { id, name: String::from(name), event_port },
        );
        crate::log!("[appserver] registered application '{}' as {}", name, id);

        let mut writer = Writer::new();
        writer.write_u32(id);
        ipc::send(
            reply_port,
            MsgCode::RegisterApplicationReply as u16,
            &writer.into_inner(),
        )
    }

    fn handle_sub_message(&mut self, code: u16, payload: &[u8]) -> KResult<()> {
        let Some(code) = MsgCode::from_u16(code) else {
            return Err(ErrorCode::InvalidArg);
        };
        let mut reader = Reader::new(payload);
        match code {
            MsgCode::CreateView => self.handle_create_view(&mut reader),
            MsgCode::DeleteView => {
                let handle = reader.read_u32()?;
                self.tree.delete_view(handle);
                if self.focus_view == Some(handle) {
                    self.focus_view = None;
                }
                Ok(())
            }
            MsgCode::Sync => {
                let reply_port = reader.read_u32()?;
                // All preceding sub-messages of this sender are applied; the
                // reply releases the waiting client.
                ipc::send(reply_port, MsgCode::SyncReply as u16, &[])
            }
            MsgCode::ViewSetFrame => {
                let handle = reader.read_u32()?;
                let frame = reader.read_rect()?;
                self.tree.set_frame(handle, frame);
                Ok(())
            }
            MsgCode::InvalidateView => {
                let handle = reader.read_u32()?;
                let rect = reader.read_irect()?;
                if let Some(view) = self.tree.view_mut(handle) {
                    view.invalidate_rect(rect);
                }
                Ok(())
            }
            MsgCode::ViewSetFgColor => {
                let handle = reader.read_u32()?;
                let color = color_from_raw(reader.read_u16()?);
                if let Some(view) = self.tree.view_mut(handle) {
                    view.fg_color = color;
                }
                Ok(())
            }
            MsgCode::ViewSetBgColor => {
                let handle = reader.read_u32()?;
                let color = color_from_raw(reader.read_u16()?);
                if let Some(view) = self.tree.view_mut(handle) {
                    view.bg_color = color;
                }
                Ok(())
            }
            MsgCode::ViewSetEraseColor => {
                let handle = reader.read_u32()?;
                let color = color_from_raw(reader.read_u16()?);
                if let Some(view) = self.tree.view_mut(handle) {
                    view.erase_color = color;
                }
                Ok(())
            }
            MsgCode::ViewSetPenWidth => {
                let handle = reader.read_u32()?;
                let width = reader.read_f32()?;
                if let Some(view) = self.tree.view_mut(handle) {
                    view.pen_width = width;
                }
                Ok(())
            }
            MsgCode::ViewMovePenTo => {
                let handle = reader.read_u32()?;
                let position = reader.read_point()?;
                if let Some(view) = self.tree.view_mut(handle) {
                    view.pen_pos = position;
                }
                Ok(())
            }
            MsgCode::ViewShow => {
                let handle = reader.read_u32()?;
                let visible = reader.read_u8()? != 0;
                self.tree.show(handle, visible);
                Ok(())
            }
            MsgCode::ViewSetFlags => {
                let handle = reader.read_u32()?;
                let flags = reader.read_u32()? & !view_flags::IS_ATTACHED_TO_SCREEN;
                if let Some(view) = self.tree.view_mut(handle) {
                    view.flags =
                        flags | (view.flags & view_flags::IS_ATTACHED_TO_SCREEN);
                    view.has_invalid_regs = true;
                }
                Ok(())
            }
            MsgCode::ViewToggleDepth => {
                let handle = reader.read_u32()?;
                self.tree.toggle_depth(handle);
                Ok(())
            }
            MsgCode::ViewSetFocus => {
                let handle = reader.read_u32()?;
                let focus = reader.read_u8()? != 0;
                self.set_focus(if focus { Some(handle) } else { None });
                Ok(())
            }
            MsgCode::ViewBeginUpdate => {
                let handle = reader.read_u32()?;
                self.tree.begin_update(handle);
                Ok(())
            }
            MsgCode::ViewEndUpdate => {
                let handle = reader.read_u32()?;
                if let Some(bounds) = self.tree.end_update(handle) {
                    // Damage accrued while painting starts the next round.
                    self.request_paint(handle, bounds);
                }
                Ok(())
            }
            MsgCode::ViewDrawLine1 => {
                let handle = reader.read_u32()?;
                let to = reader.read_point()?;
                let from = self
                    .tree
                    .view(handle)
                    .map(|v| v.pen_pos)
                    .unwrap_or_default();
                self.tree.draw_line(self.gfx.as_mut(), handle, from, to);
                if let Some(view) = self.tree.view_mut(handle) {
                    view.pen_pos = to;
                }
                Ok(())
            }
            MsgCode::ViewDrawLine2 => {
                let handle = reader.read_u32()?;
                let from = reader.read_point()?;
                let to = reader.read_point()?;
                self.tree.draw_line(self.gfx.as_mut(), handle, from, to);
                Ok(())
            }
            MsgCode::ViewFillRect => {
                let handle = reader.read_u32()?;
                let rect = reader.read_rect()?;
                let color = color_from_raw(reader.read_u16()?);
                self.tree.fill_rect(self.gfx.as_mut(), handle, rect, color);
                Ok(())
            }
            MsgCode::ViewFillCircle => {
                let handle = reader.read_u32()?;
                let center = reader.read_point()?;
                let radius = reader.read_f32()?;
                self.tree.fill_circle(self.gfx.as_mut(), handle, center, radius);
                Ok(())
            }
            MsgCode::ViewDrawString => {
                let handle = reader.read_u32()?;
                let text = reader.read_string()?;
                self.tree.draw_string(self.gfx.as_mut(), handle, text);
                Ok(())
            }
            MsgCode::ViewCopyRect => {
                let handle = reader.read_u32()?;
                let src = reader.read_rect()?;
                let dst = reader.read_point()?;
                self.tree.copy_rect(self.gfx.as_mut(), handle, src, dst);
                Ok(())
            }
            MsgCode::ViewScrollBy => {
                let handle = reader.read_u32()?;
                let delta = reader.read_point()?;
                self.tree.scroll_by(self.gfx.as_mut(), handle, delta);
                Ok(())
            }
            MsgCode::ViewDebugDraw => {
                let handle = reader.read_u32()?;
                let color = color_from_raw(reader.read_u16()?);
                let flags = reader.read_u32()?;
                if let Some(view) = self.tree.view_mut(handle) {
                    view.debug_color = color;
                    view.debug_draw = flags;
                }
                Ok(())
            }
            _ => Err(ErrorCode::InvalidArg),
        }
    }

    fn handle_create_view(&mut self, reader: &mut Reader) -> KResult<()> {
        let app_id = reader.read_u32()?;
        let reply_port = reader.read_u32()?;
        let client_handle = reader.read_u32()?;
        let parent = reader.read_u32()?;
        let name = reader.read_string()?;
        let frame = reader.read_rect()?;
        let scroll_offset = reader.read_point()?;
        let flags = reader.read_u32()?;
        let hide_count = reader.read_i32()?;
        let erase_color = reader.read_u16()?;
        let bg_color = reader.read_u16()?;
        let fg_color = reader.read_u16()?;

        let parent = if parent == INVALID_HANDLE { self.tree.root } else { parent };
        let handle = if self.apps.contains_key(&app_id) {
            self.tree.create_view(
                app_id,
                parent,
                name,
                frame,
                scroll_offset,
                flags,
                hide_count,
                erase_color,
                bg_color,
                fg_color,
            )
        } else {
            crate::log_error!("[appserver] create_view from unknown app {}", app_id);
            INVALID_HANDLE
        };

        let mut writer = Writer::new();
        writer.write_u32(handle).write_u32(client_handle);
        ipc::send(reply_port, MsgCode::CreateViewReply as u16, &writer.into_inner())
    }

    /// Recompute regions, blit moved areas, and start paint rounds.
    fn recompose(&mut self) {
        let Self { tree, gfx, apps, .. } = self;
        tree.update_regions(gfx.as_mut());
        tree.update_if_needed(gfx.as_mut(), &mut |app, handle, bounds| {
            if let Some(record) = apps.get(&app) {
                let mut writer = Writer::new();
                writer.write_u32(handle).write_irect(bounds);
                let _ = ipc::send(
                    record.event_port,
                    MsgCode::PaintView as u16,
                    &writer.into_inner(),
                );
            }
        });
        tree.draw_debug_overlays(gfx.as_mut());
    }

    fn request_paint(&mut self, handle: ViewHandle, bounds: IRect) {
        let Some(view) = self.tree.view(handle) else { return };
        if !view.has_flag(view_flags::WILL_DRAW) {
            return;
        }
        let Some(record) = self.apps.get(&view.app) else { return };
        let mut writer = Writer::new();
        writer.write_u32(handle).write_irect(bounds);
        let _ = ipc::send(record.event_port, MsgCode::PaintView as u16, &writer.into_inner());
    }

    // ========================================================================
    // Focus & input
    // ========================================================================

    fn set_focus(&mut self, handle: Option<ViewHandle>) {
        if handle == self.focus_view {
            return;
        }
        let previous = self.focus_view.take();
        self.focus_view = handle;
        for (view, gained) in [(previous, false), (handle, true)] {
            let Some(view) = view else { continue };
            let Some(record) = self.tree.view(view).and_then(|v| self.apps.get(&v.app)) else {
                continue;
            };
            let mut writer = Writer::new();
            writer.write_u32(view).write_u8(gained as u8);
            let _ = ipc::send(
                record.event_port,
                MsgCode::ViewFocusChanged as u16,
                &writer.into_inner(),
            );
        }
    }

    /// Route a pointer event to the view under it (or the captured view),
    /// converting the position into the view's logical space.
    pub fn handle_pointer_event(&mut self, code: MsgCode, button: MouseButton, position: Point) {
        let target = match code {
            MsgCode::HandleMouseDown => {
                let target = self.view_at(position);
                let capture =
                    target.map(|t| (self.tree.view(t).map(|v| v.app).unwrap_or(0), t));
                self.capture = capture;
                target
            }
            MsgCode::HandleMouseUp => {
                let captured = self.capture.take().map(|(_, view)| view);
                captured.or_else(|| self.view_at(position))
            }
            MsgCode::HandleMouseMove => self
                .capture
                .map(|(_, view)| view)
                .or_else(|| self.view_at(position)),
            _ => None,
        };
        let Some(target) = target else { return };
        let Some(view) = self.tree.view(target) else { return };
        let Some(record) = self.apps.get(&view.app) else { return };

        let local = position
            - Point::from(view.screen_pos)
            - view.scroll_offset;
        let mut writer = Writer::new();
        writer
            .write_u32(target)
            .write_u8(button as u8)
            .write_point(local);
        let _ = ipc::send(record.event_port, code as u16, &writer.into_inner());
    }

    /// Topmost view under a screen position, honoring the mouse flags.
    fn view_at(&self, position: Point) -> Option<ViewHandle> {
        self.hit_test(self.tree.root, position)
    }

    fn hit_test(&self, handle: ViewHandle, position: Point) -> Option<ViewHandle> {
        let view = self.tree.view(handle)?;
        if view.has_flag(view_flags::FORCE_HANDLE_MOUSE) {
            return Some(handle);
        }
        for &child in &view.children {
            let child_view = self.tree.view(child)?;
            if child_view.hide_count > 0 || child_view.has_flag(view_flags::IGNORE_MOUSE) {
                continue;
            }
            if child_view.frame.contains(position) {
                let local = position - child_view.frame.top_left();
                return self.hit_test(child, local).or(Some(child));
            }
        }
        if handle == self.tree.root {
            None
        } else {
            Some(handle)
        }
    }

    #[cfg(test)]
    pub fn tree(&mut self) -> &mut ViewTree {
        &mut self.tree
    }

    #[cfg(test)]
    pub fn gfx_and_tree(&mut self) -> (&mut dyn GfxBackend, &mut ViewTree) {
        (self.gfx.as_mut(), &mut self.tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use embedded_graphics_core::pixelcolor::Rgb565;

    use crate::drivers::ra8875::color_to_raw;
    use crate::math::{IPoint, Rect};
    use crate::region::Region;

    #[derive(Debug, Clone, PartialEq)]
    enum GfxOp {
        SetFg(u16),
        SetWindow(IRect),
        FillRect(IRect),
        Line(IPoint, IPoint),
        Circle(IPoint, i32),
        MoveRect(IRect, IPoint),
        Text(alloc::string::String, IPoint),
    }

    /// Records every primitive the compositor emits.
    struct RecordingGfx {
        ops: Arc<spin::Mutex<Vec<GfxOp>>>,
    }

    impl RecordingGfx {
        fn new() -> (Box<Self>, Arc<spin::Mutex<Vec<GfxOp>>>) {
            let ops = Arc::new(spin::Mutex::new(Vec::new()));
            (Box::new(Self { ops: ops.clone() }), ops)
        }
    }

    impl GfxBackend for RecordingGfx {
        fn resolution(&self) -> IPoint {
            IPoint::new(crate::config::DISPLAY_WIDTH, crate::config::DISPLAY_HEIGHT)
        }

        fn wait_blitter(&mut self) {}

        fn set_window(&mut self, rect: IRect) {
            self.ops.lock().push(GfxOp::SetWindow(rect));
        }

        fn set_fg_color(&mut self, color: Rgb565) {
            self.ops.lock().push(GfxOp::SetFg(color_to_raw(color)));
        }

        fn set_bg_color(&mut self, _color: Rgb565) {}

        fn fill_rect(&mut self, rect: IRect) {
            self.ops.lock().push(GfxOp::FillRect(rect));
        }

        fn draw_line(&mut self, p1: IPoint, p2: IPoint) {
            self.ops.lock().push(GfxOp::Line(p1, p2));
        }

        fn fill_circle(&mut self, center: IPoint, radius: i32) {
            self.ops.lock().push(GfxOp::Circle(center, radius));
        }

        fn move_rect(&mut self, src: IRect, dst: IPoint) {
            self.ops.lock().push(GfxOp::MoveRect(src, dst));
        }

        fn draw_string(&mut self, text: &str, pos: IPoint) -> i32 {
            self.ops.lock().push(GfxOp::Text(alloc::string::String::from(text), pos));
            text.len() as i32 * 8
        }

        fn draw_bitmap(&mut self, _dst: IRect, _data: &[u16], _transparent: Option<Rgb565>) {}
    }

    fn make_server() -> (AppServer, Arc<spin::Mutex<Vec<GfxOp>>>) {
        let (gfx, ops) = RecordingGfx::new();
        (AppServer::new(gfx), ops)
    }

    fn region_intersects_rect(region: &Region, rect: IRect) -> bool {
        region.rects().iter().any(|r| r.intersects(&rect))
    }

    fn drain(ops: &Arc<spin::Mutex<Vec<GfxOp>>>) -> Vec<GfxOp> {
        core::mem::take(&mut *ops.lock())
    }

    // ========================================================================
    // Region maintenance
    // ========================================================================

    #[test]
    fn visible_region_excludes_topmost_sibling() {
        let (mut server, _ops) = make_server();
        let root = server.tree().root;
        let a = server.tree().create_view(
            0, root, "a",
            Rect::new(10.0, 10.0, 110.0, 110.0),
            Point::default(), 0, 0, 0, 0, 0,
        );
        // Created later: topmost
        let b = server.tree().create_view(
            0, root, "b",
            Rect::new(50.0, 50.0, 150.0, 150.0),
            Point::default(), 0, 0, 0, 0, 0,
        );
        server.recompose();

        let tree = server.tree();
        let a_visible = tree.view(a).unwrap().visible.clone().unwrap();
        let a_full = tree.view(a).unwrap().full.clone().unwrap();
        let b_frame = tree.view(b).unwrap().i_frame;

        // B's frame in A-local coordinates must be clear of A's regions.
        let b_local = b_frame - tree.view(a).unwrap().i_frame.top_left();
        assert!(!region_intersects_rect(&a_full, b_local));
        assert!(!region_intersects_rect(&a_visible, b_local));

        // A's own area short of B stays visible.
        assert!(a_visible.contains(IPoint::new(10, 10)));
        assert!(!a_visible.contains(IPoint::new(50, 50)));

        // B, topmost, sees its whole bounds.
        let b_visible = tree.view(b).unwrap().visible.clone().unwrap();
        assert!(b_visible.contains(IPoint::new(0, 0)));
        assert!(b_visible.contains(IPoint::new(99, 99)));
    }

    #[test]
    fn transparent_sibling_does_not_occlude() {
        let (mut server, _ops) = make_server();
        let root = server.tree().root;
        let a = server.tree().create_view(
            0, root, "a",
            Rect::new(0.0, 0.0, 100.0, 100.0),
            Point::default(), 0, 0, 0, 0, 0,
        );
        let _overlay = server.tree().create_view(
            0, root, "overlay",
            Rect::new(0.0, 0.0, 100.0, 100.0),
            Point::default(), view_flags::TRANSPARENT, 0, 0, 0, 0,
        );
        server.recompose();

        let tree = server.tree();
        let a_visible = tree.view(a).unwrap().visible.clone().unwrap();
        assert!(a_visible.contains(IPoint::new(50, 50)));
    }

    #[test]
    fn opaque_children_are_subtracted_unless_draw_on_children() {
        let (mut server, _ops) = make_server();
        let root = server.tree().root;
        let parent = server.tree().create_view(
            0, root, "parent",
            Rect::new(0.0, 0.0, 200.0, 200.0),
            Point::default(), 0, 0, 0, 0, 0,
        );
        let _child = server.tree().create_view(
            0, parent, "child",
            Rect::new(20.0, 20.0, 80.0, 80.0),
            Point::default(), 0, 0, 0, 0, 0,
        );
        server.recompose();

        let tree = server.tree();
        let visible = tree.view(parent).unwrap().visible.clone().unwrap();
        let full = tree.view(parent).unwrap().full.clone().unwrap();
        assert!(!visible.contains(IPoint::new(50, 50)));
        assert!(full.contains(IPoint::new(50, 50)));
        assert!(visible.contains(IPoint::new(100, 100)));

        // With DRAW_ON_CHILDREN the child is not subtracted.
        tree.view_mut(parent).unwrap().flags |= view_flags::DRAW_ON_CHILDREN;
        tree.view_mut(parent).unwrap().has_invalid_regs = true;
        server.recompose();
        let visible = server.tree().view(parent).unwrap().visible.clone().unwrap();
        assert!(visible.contains(IPoint::new(50, 50)));
    }

    #[test]
    fn frame_move_blits_intersection_and_damages_exposed_area() {
        let (mut server, ops) = make_server();
        let root = server.tree().root;
        let view = server.tree().create_view(
            0, root, "mover",
            Rect::new(0.0, 0.0, 100.0, 100.0),
            Point::default(), 0, 0, 0, 0, 0,
        );
        server.recompose();
        drain(&ops);

        server.tree().set_frame(view, Rect::new(20.0, 0.0, 120.0, 100.0));
        {
            let (gfx, tree) = server.gfx_and_tree();
            tree.update_regions(gfx);
        }

        let recorded = drain(&ops);
        assert!(
            recorded.contains(&GfxOp::MoveRect(
                IRect::new(0, 0, 100, 100),
                IPoint::new(20, 0)
            )),
            "expected accelerated move, got {recorded:?}"
        );

        // The strip uncovered on the root must repaint.
        let tree = server.tree();
        let root_damage = tree.view(tree.root).unwrap().damage.clone().unwrap();
        assert!(root_damage.contains(IPoint::new(10, 50)));
        assert!(!root_damage.contains(IPoint::new(60, 50)));
    }

    #[test]
    fn scroll_by_translates_and_damages_strip() {
        let (mut server, ops) = make_server();
        let root = server.tree().root;
        let view = server.tree().create_view(
            0, root, "scroller",
            Rect::new(0.0, 0.0, 200.0, 200.0),
            Point::default(), 0, 0, 0, 0, 0,
        );
        server.recompose();
        drain(&ops);
        server.tree().view_mut(view).unwrap().damage =
            Some(Region::from_rect(IRect::new(10, 10, 50, 50)));

        {
            let (gfx, tree) = server.gfx_and_tree();
            tree.scroll_by(gfx, view, Point::new(0.0, -30.0));
        }

        let recorded = drain(&ops);
        assert!(
            recorded.contains(&GfxOp::MoveRect(
                IRect::new(0, 30, 200, 200),
                IPoint::new(0, 0)
            )),
            "expected scroll blit, got {recorded:?}"
        );

        let tree = server.tree();
        let damage = tree.view(view).unwrap().damage.clone().unwrap();
        // Former damage translated and clipped to the top edge
        assert!(damage.contains(IPoint::new(10, 0)));
        assert!(damage.contains(IPoint::new(49, 19)));
        assert!(!damage.contains(IPoint::new(10, 25)));
        // Newly scrolled-in strip at the bottom
        assert!(damage.contains(IPoint::new(0, 170)));
        assert!(damage.contains(IPoint::new(199, 199)));
        assert!(!damage.contains(IPoint::new(100, 100)));
    }

    #[test]
    fn fill_rect_is_split_against_the_clip() {
        let (mut server, ops) = make_server();
        let root = server.tree().root;
        let parent = server.tree().create_view(
            0, root, "parent",
            Rect::new(0.0, 0.0, 100.0, 100.0),
            Point::default(), 0, 0, 0, 0, 0,
        );
        let child = server.tree().create_view(
            0, parent, "child",
            Rect::new(25.0, 25.0, 75.0, 75.0),
            Point::default(), 0, 0, 0, 0, 0,
        );
        server.recompose();
        drain(&ops);

        {
            let (gfx, tree) = server.gfx_and_tree();
            let red = crate::drivers::ra8875::rgb(255, 0, 0);
            tree.fill_rect(gfx, parent, Rect::new(0.0, 0.0, 100.0, 100.0), red);
        }
        let recorded = drain(&ops);
        let child_frame = server.tree().view(child).unwrap().i_frame;
        let mut filled = 0;
        for op in &recorded {
            if let GfxOp::FillRect(rect) = op {
                assert!(
                    !rect.intersects(&child_frame),
                    "fill {rect:?} overlaps child {child_frame:?}"
                );
                filled += 1;
            }
        }
        assert!(filled >= 4, "expected the fill split into fragments");
    }

    #[test]
    fn line_endpoints_are_clipped_per_rect() {
        let (mut server, ops) = make_server();
        let root = server.tree().root;
        let view = server.tree().create_view(
            0, root, "canvas",
            Rect::new(10.0, 10.0, 110.0, 110.0),
            Point::default(), 0, 0, 0, 0, 0,
        );
        server.recompose();
        drain(&ops);

        {
            let (gfx, tree) = server.gfx_and_tree();
            tree.draw_line(
                gfx,
                view,
                Point::new(-50.0, 50.0),
                Point::new(150.0, 50.0),
            );
        }
        let recorded = drain(&ops);
        let lines: Vec<_> = recorded
            .iter()
            .filter_map(|op| match op {
                GfxOp::Line(p1, p2) => Some((*p1, *p2)),
                _ => None,
            })
            .collect();
        assert_eq!(lines.len(), 1);
        let (p1, p2) = lines[0];
        // Clipped to the view's screen-space span (view at +10,+10)
        assert_eq!(p1.y, 60);
        assert_eq!(p2.y, 60);
        assert!(p1.x >= 10 && p2.x <= 109);
    }

    // ========================================================================
    // Protocol round trips
    // ========================================================================

    fn register_app(server: &mut AppServer, name: &str) -> (AppId, PortId, PortId) {
        let reply_port = ipc::create_port("test_reply", 16);
        let event_port = ipc::create_port("test_event", 16);
        let mut writer = Writer::new();
        writer.write_u32(reply_port).write_u32(event_port).write_string(name);
        server.dispatch(&ipc::Message {
            code: MsgCode::RegisterApplication as u16,
            data: writer.into_inner(),
        });
        let reply = ipc::try_receive(reply_port).expect("register reply");
        assert_eq!(reply.code, MsgCode::RegisterApplicationReply as u16);
        let app = Reader::new(&reply.data).read_u32().unwrap();
        (app, reply_port, event_port)
    }

    fn create_view_msg(
        app: AppId,
        reply_port: PortId,
        client_handle: u32,
        parent: ViewHandle,
        frame: Rect,
        flags: u32,
    ) -> Vec<u8> {
        let mut writer = Writer::new();
        writer
            .write_u32(app)
            .write_u32(reply_port)
            .write_u32(client_handle)
            .write_u32(parent)
            .write_string("view")
            .write_rect(frame)
            .write_point(Point::default())
            .write_u32(flags)
            .write_i32(0)
            .write_u16(0xFFFF)
            .write_u16(0xFFFF)
            .write_u16(0x0000);
        writer.into_inner()
    }

    #[test]
    fn bundle_applies_in_order_and_sync_replies_last() {
        let (mut server, ops) = make_server();
        let (app, reply_port, _event_port) = register_app(&mut server, "bundletest");

        let mut bundle = Vec::new();
        protocol::write_frame(
            &mut bundle,
            MsgCode::CreateView,
            &create_view_msg(
                app,
                reply_port,
                7,
                INVALID_HANDLE,
                Rect::new(0.0, 0.0, 100.0, 100.0),
                0,
            ),
        );
        server.dispatch(&ipc::Message {
            code: MsgCode::MessageBundle as u16,
            data: bundle,
        });
        let reply = ipc::try_receive(reply_port).expect("create reply");
        assert_eq!(reply.code, MsgCode::CreateViewReply as u16);
        let mut reader = Reader::new(&reply.data);
        let view = reader.read_u32().unwrap();
        assert_ne!(view, INVALID_HANDLE);
        assert_eq!(reader.read_u32().unwrap(), 7); // client handle echoed
        drain(&ops);

        // Three fills in distinct colors followed by a sync.
        let mut bundle = Vec::new();
        for color in [0x001Fu16, 0x07E0, 0xF800] {
            let mut payload = Writer::new();
            payload
                .write_u32(view)
                .write_rect(Rect::new(0.0, 0.0, 10.0, 10.0))
                .write_u16(color);
            protocol::write_frame(&mut bundle, MsgCode::ViewFillRect, &payload.into_inner());
        }
        let mut sync = Writer::new();
        sync.write_u32(reply_port);
        protocol::write_frame(&mut bundle, MsgCode::Sync, &sync.into_inner());

        server.dispatch(&ipc::Message {
            code: MsgCode::MessageBundle as u16,
            data: bundle,
        });

        // Sync replied only after everything else was applied.
        let reply = ipc::try_receive(reply_port).expect("sync reply");
        assert_eq!(reply.code, MsgCode::SyncReply as u16);

        let colors: Vec<u16> = drain(&ops)
            .iter()
            .filter_map(|op| match op {
                GfxOp::SetFg(color) => Some(*color),
                _ => None,
            })
            .collect();
        let wanted: Vec<u16> = colors
            .iter()
            .copied()
            .filter(|c| [0x001F, 0x07E0, 0xF800].contains(c))
            .collect();
        assert_eq!(wanted, alloc::vec![0x001F, 0x07E0, 0xF800]);
    }

    #[test]
    fn create_view_under_unknown_parent_replies_invalid() {
        let (mut server, _ops) = make_server();
        let (app, reply_port, _event_port) = register_app(&mut server, "badparent");

        let mut bundle = Vec::new();
        protocol::write_frame(
            &mut bundle,
            MsgCode::CreateView,
            &create_view_msg(app, reply_port, 1, 9999, Rect::new(0.0, 0.0, 10.0, 10.0), 0),
        );
        server.dispatch(&ipc::Message {
            code: MsgCode::MessageBundle as u16,
            data: bundle,
        });
        let reply = ipc::try_receive(reply_port).expect("create reply");
        let handle = Reader::new(&reply.data).read_u32().unwrap();
        assert_eq!(handle, INVALID_HANDLE);
    }

    #[test]
    fn will_draw_views_get_paint_requests() {
        let (mut server, _ops) = make_server();
        let (app, reply_port, event_port) = register_app(&mut server, "painter");

        let mut bundle = Vec::new();
        protocol::write_frame(
            &mut bundle,
            MsgCode::CreateView,
            &create_view_msg(
                app,
                reply_port,
                1,
                INVALID_HANDLE,
                Rect::new(0.0, 0.0, 50.0, 50.0),
                view_flags::WILL_DRAW,
            ),
        );
        server.dispatch(&ipc::Message {
            code: MsgCode::MessageBundle as u16,
            data: bundle,
        });
        let reply = ipc::try_receive(reply_port).unwrap();
        let view = Reader::new(&reply.data).read_u32().unwrap();

        let paint = ipc::try_receive(event_port).expect("paint request");
        assert_eq!(paint.code, MsgCode::PaintView as u16);
        let mut reader = Reader::new(&paint.data);
        assert_eq!(reader.read_u32().unwrap(), view);
        let bounds = reader.read_irect().unwrap();
        assert!(bounds.is_valid());
    }

    #[test]
    fn pointer_events_route_to_topmost_and_skip_ignore_mouse() {
        let (mut server, _ops) = make_server();
        let (app, reply_port, event_port) = register_app(&mut server, "input");

        let mut bundle = Vec::new();
        // B first (below), then A atop with IGNORE_MOUSE.
        protocol::write_frame(
            &mut bundle,
            MsgCode::CreateView,
            &create_view_msg(
                app, reply_port, 1, INVALID_HANDLE,
                Rect::new(10.0, 10.0, 110.0, 110.0),
                0,
            ),
        );
        server.dispatch(&ipc::Message { code: MsgCode::MessageBundle as u16, data: bundle });
        let b = Reader::new(&ipc::try_receive(reply_port).unwrap().data).read_u32().unwrap();

        let mut bundle = Vec::new();
        protocol::write_frame(
            &mut bundle,
            MsgCode::CreateView,
            &create_view_msg(
                app, reply_port, 2, INVALID_HANDLE,
                Rect::new(10.0, 10.0, 110.0, 110.0),
                view_flags::IGNORE_MOUSE,
            ),
        );
        server.dispatch(&ipc::Message { code: MsgCode::MessageBundle as u16, data: bundle });
        let _a = Reader::new(&ipc::try_receive(reply_port).unwrap().data).read_u32().unwrap();
        while ipc::try_receive(event_port).is_ok() {}

        server.handle_pointer_event(
            MsgCode::HandleMouseDown,
            MouseButton::Touch,
            Point::new(50.0, 50.0),
        );
        let event = ipc::try_receive(event_port).expect("mouse event");
        assert_eq!(event.code, MsgCode::HandleMouseDown as u16);
        let mut reader = Reader::new(&event.data);
        assert_eq!(reader.read_u32().unwrap(), b);
        assert_eq!(reader.read_u8().unwrap(), MouseButton::Touch as u8);
        assert_eq!(reader.read_point().unwrap(), Point::new(40.0, 40.0));

        // Moves go to the captured view even when the pointer leaves it.
        server.handle_pointer_event(
            MsgCode::HandleMouseMove,
            MouseButton::Touch,
            Point::new(500.0, 400.0),
        );
        let event = ipc::try_receive(event_port).expect("move event");
        assert_eq!(event.code, MsgCode::HandleMouseMove as u16);
        assert_eq!(Reader::new(&event.data).read_u32().unwrap(), b);

        server.handle_pointer_event(
            MsgCode::HandleMouseUp,
            MouseButton::Touch,
            Point::new(500.0, 400.0),
        );
        let event = ipc::try_receive(event_port).expect("up event");
        assert_eq!(Reader::new(&event.data).read_u32().unwrap(), b);
    }
}
