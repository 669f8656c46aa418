//! GUI client framework
//!
//! Runs inside each application thread. Owns the client-side view tree,
//! batches drawing commands into a bounded send buffer flushed as one
//! bundle to the application server, and dispatches incoming server events
//! (paint requests, pointer input, focus) to view handlers.

pub mod layout;
pub mod view;

pub use layout::LayoutNode;
pub use view::{Alignment, AxisOverride, ClientHandle, PrefSizeType, SizeOverride, View, ViewHandler};

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;

use embedded_graphics_core::pixelcolor::Rgb565;

use crate::appserver::protocol::{
    view_flags, MouseButton, MsgCode, Reader, ViewHandle, Writer, HEADER_SIZE, INVALID_HANDLE,
};
use crate::config::{
    BEGIN_DRAG_OFFSET, KEYREPEAT_DELAY, KEYREPEAT_REPEAT, LONG_PRESS_DELAY, SEND_BUFFER_SIZE,
};
use crate::drivers::ra8875::color_to_raw;
use crate::ipc::{self, PortId};
use crate::math::{IRect, Point, Rect};
use crate::vfs::{ErrorCode, KResult};

/// How long a request/reply exchange with the server may take
const REPLY_TIMEOUT_MS: u64 = 1000;

/// An active press, tracked for long-press and drag detection
#[derive(Debug, Clone, Copy)]
struct PressState {
    view: ClientHandle,
    start_pos: Point,
    start_ms: u64,
    long_press_fired: bool,
    dragging: bool,
}

#[derive(Debug, Clone, Copy)]
struct HeldKey {
    key: u32,
    next_repeat_ms: u64,
}

pub struct Application {
    pub name: String,
    /// Our handle on the server
    server_ref: u32,
    server_port: PortId,
    reply_port: PortId,
    event_port: PortId,
    /// Framed messages accumulate here; overflow forces a flush
    send_buffer: heapless::Vec<u8, SEND_BUFFER_SIZE>,

    pub(crate) views: BTreeMap<ClientHandle, View>,
    server_to_client: BTreeMap<ViewHandle, ClientHandle>,
    next_handle: ClientHandle,

    capture: Option<ClientHandle>,
    press: Option<PressState>,
    focus: Option<ClientHandle>,
    held_key: Option<HeldKey>,
}

impl Application {
    /// Register with the application server. Blocks until the server
    /// replies with our handle.
    pub fn new(name: &str) -> KResult<Application> {
        let mut app = Self::make(name, crate::appserver::server_port());
        let mut writer = Writer::new();
        writer
            .write_u32(app.reply_port)
            .write_u32(app.event_port)
            .write_string(name);
        ipc::send(
            app.server_port,
            MsgCode::RegisterApplication as u16,
            &writer.into_inner(),
        )?;
        let reply = app.wait_reply(MsgCode::RegisterApplicationReply)?;
        app.server_ref = Reader::new(&reply.data).read_u32()?;
        Ok(app)
    }

    fn make(name: &str, server_port: PortId) -> Application {
        Application {
            name: String::from(name),
            server_ref: 0,
            server_port,
            reply_port: ipc::create_port("app_reply", 16),
            event_port: ipc::create_port("app_events", 64),
            send_buffer: heapless::Vec::new(),
            views: BTreeMap::new(),
            server_to_client: BTreeMap::new(),
            next_handle: 1,
            capture: None,
            press: None,
            focus: None,
            held_key: None,
        }
    }

    /// Client tree without a server connection; used by the test suite for
    /// layout and dispatch logic.
    #[cfg(test)]
    pub fn new_detached(name: &str, server_port: PortId) -> Application {
        Self::make(name, server_port)
    }

    // ========================================================================
    // Message batching
    // ========================================================================

    /// Append a framed message; flushes first when it would overflow.
    fn post(&mut self, code: MsgCode, payload: &[u8]) {
        let frame_len = payload.len() + HEADER_SIZE;
        if frame_len > SEND_BUFFER_SIZE {
            crate::log_error!("[gui] message {} too large ({})", code as u16, frame_len);
            return;
        }
        if self.send_buffer.len() + frame_len > SEND_BUFFER_SIZE {
            self.flush();
        }
        let _ = self.send_buffer.extend_from_slice(&(code as u16).to_le_bytes());
        let _ = self
            .send_buffer
            .extend_from_slice(&(frame_len as u16).to_le_bytes());
        let _ = self.send_buffer.extend_from_slice(payload);
    }

    /// Send the pending bundle. May block on the server port.
    pub fn flush(&mut self) {
        if self.send_buffer.is_empty() {
            return;
        }
        if let Err(error) = ipc::send(
            self.server_port,
            MsgCode::MessageBundle as u16,
            &self.send_buffer,
        ) {
            crate::log_error!("[gui] flush failed: {:?}", error);
        }
        self.send_buffer.clear();
    }

    /// Flush and wait until the server has applied everything sent so far.
    pub fn sync(&mut self) -> KResult<()> {
        let mut writer = Writer::new();
        writer.write_u32(self.reply_port);
        self.post(MsgCode::Sync, &writer.into_inner());
        self.flush();
        self.wait_reply(MsgCode::SyncReply).map(|_| ())
    }

    fn wait_reply(&mut self, expected: MsgCode) -> KResult<ipc::Message> {
        let deadline = crate::time::Deadline::after_ms(REPLY_TIMEOUT_MS);
        loop {
            match ipc::try_receive(self.reply_port) {
                Ok(message) if message.code == expected as u16 => return Ok(message),
                Ok(message) => {
                    crate::log_error!("[gui] unexpected reply {}", message.code);
                }
                Err(ErrorCode::WouldBlock) => {
                    crate::appserver::drive();
                    crate::scheduler::yield_now();
                    if deadline.expired() {
                        // Final poll so a reply that arrived during the
                        // drive is not thrown away.
                        return match ipc::try_receive(self.reply_port) {
                            Ok(message) if message.code == expected as u16 => Ok(message),
                            _ => Err(ErrorCode::TimedOut),
                        };
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    // ========================================================================
    // View tree
    // ========================================================================

    /// Create a client view, initially detached from both trees.
    pub fn create_view(&mut self, name: &str, frame: Rect, flags: u32) -> ClientHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.views.insert(handle, View::new(handle, name, frame, flags));
        handle
    }

    pub fn view(&self, handle: ClientHandle) -> Option<&View> {
        self.views.get(&handle)
    }

    pub fn view_mut(&mut self, handle: ClientHandle) -> Option<&mut View> {
        self.views.get_mut(&handle)
    }

    pub fn set_handler(&mut self, handle: ClientHandle, handler: Box<dyn ViewHandler>) {
        if let Some(view) = self.views.get_mut(&handle) {
            view.handler = Some(handler);
        }
    }

    pub(crate) fn take_handler(&mut self, handle: ClientHandle) -> Option<Box<dyn ViewHandler>> {
        self.views.get_mut(&handle).and_then(|v| v.handler.take())
    }

    pub(crate) fn put_handler(&mut self, handle: ClientHandle, handler: Box<dyn ViewHandler>) {
        if let Some(view) = self.views.get_mut(&handle) {
            if view.handler.is_none() {
                view.handler = Some(handler);
            }
        }
    }

    /// Link `child` under `parent`. A view belongs to at most one parent.
    pub fn add_child(&mut self, parent: ClientHandle, child: ClientHandle) -> KResult<()> {
        let Some(child_view) = self.views.get(&child) else {
            return Err(ErrorCode::NotFound);
        };
        if child_view.parent.is_some() {
            crate::log_error!("[gui] view {} already has a parent", child);
            return Err(ErrorCode::InvalidArg);
        }
        if !self.views.contains_key(&parent) {
            return Err(ErrorCode::NotFound);
        }
        self.views.get_mut(&child).unwrap().parent = Some(parent);
        self.views.get_mut(&parent).unwrap().children.push(child);
        self.invalidate_layout(parent);
        Ok(())
    }

    /// Attach a view (and its subtree) to the screen: create the server
    /// twins, wire handles, run the attach hooks and schedule a layout.
    pub fn add_view(&mut self, handle: ClientHandle) -> KResult<()> {
        let parent = self.views.get(&handle).and_then(|v| v.parent);
        let parent_server = match parent {
            Some(parent) => {
                let server = self
                    .views
                    .get(&parent)
                    .map(|p| p.server_handle)
                    .unwrap_or(INVALID_HANDLE);
                if server == INVALID_HANDLE {
                    crate::log_error!("[gui] view {} has a detached parent", handle);
                    return Err(ErrorCode::InvalidArg);
                }
                server
            }
            None => INVALID_HANDLE, // top level, docks under the screen
        };
        self.attach_view(handle, parent_server)?;
        self.invalidate_layout(handle);
        self.commit_layouts();
        self.flush();
        Ok(())
    }

    fn attach_view(&mut self, handle: ClientHandle, parent_server: ViewHandle) -> KResult<()> {
        {
            let Some(view) = self.views.get(&handle) else {
                return Err(ErrorCode::NotFound);
            };
            if view.is_attached() {
                crate::log_error!("[gui] view {} is already attached", handle);
                return Err(ErrorCode::InvalidArg);
            }
            let mut writer = Writer::new();
            writer
                .write_u32(self.server_ref)
                .write_u32(self.reply_port)
                .write_u32(handle)
                .write_u32(parent_server)
                .write_string(&view.name)
                .write_rect(view.frame)
                .write_point(view.scroll_offset)
                .write_u32(view.flags)
                .write_i32(view.hide_count)
                .write_u16(color_to_raw(view.erase_color))
                .write_u16(color_to_raw(view.bg_color))
                .write_u16(color_to_raw(view.fg_color));
            let payload = writer.into_inner();
            self.post(MsgCode::CreateView, &payload);
        }
        self.flush();

        let reply = self.wait_reply(MsgCode::CreateViewReply)?;
        let mut reader = Reader::new(&reply.data);
        let server_handle = reader.read_u32()?;
        let echoed = reader.read_u32()?;
        if echoed != handle {
            crate::log_error!("[gui] create reply for {} while attaching {}", echoed, handle);
        }
        if server_handle == INVALID_HANDLE {
            crate::log_error!("[gui] server refused view {}", handle);
            return Err(ErrorCode::IoError);
        }
        {
            let view = self.views.get_mut(&handle).unwrap();
            view.server_handle = server_handle;
            view.flags |= view_flags::IS_ATTACHED_TO_SCREEN;
        }
        self.server_to_client.insert(server_handle, handle);

        if let Some(mut handler) = self.take_handler(handle) {
            handler.on_attached(self, handle);
            self.put_handler(handle, handler);
        }

        let children = self.views[&handle].children.clone();
        for child in children {
            self.attach_view(child, server_handle)?;
        }
        Ok(())
    }

    /// Delete the server twin and detach locally.
    pub fn remove_view(&mut self, handle: ClientHandle) {
        let Some(view) = self.views.get(&handle) else { return };
        let server_handle = view.server_handle;
        if server_handle != INVALID_HANDLE {
            let mut writer = Writer::new();
            writer.write_u32(server_handle);
            self.post(MsgCode::DeleteView, &writer.into_inner());
        }
        self.detach_local(handle);
        let parent = self.views.get(&handle).and_then(|v| v.parent);
        if let Some(parent) = parent {
            if let Some(parent_view) = self.views.get_mut(&parent) {
                parent_view.children.retain(|&c| c != handle);
            }
            if let Some(view) = self.views.get_mut(&handle) {
                view.parent = None;
            }
            self.invalidate_layout(parent);
        }
    }

    fn detach_local(&mut self, handle: ClientHandle) {
        let Some(view) = self.views.get_mut(&handle) else { return };
        let server_handle = view.server_handle;
        view.server_handle = INVALID_HANDLE;
        view.flags &= !view_flags::IS_ATTACHED_TO_SCREEN;
        if server_handle != INVALID_HANDLE {
            self.server_to_client.remove(&server_handle);
        }
        let children = self.views[&handle].children.clone();
        for child in children {
            self.detach_local(child);
        }
    }

    // ========================================================================
    // Mirrored view state
    // ========================================================================

    fn post_view(&mut self, handle: ClientHandle, code: MsgCode, build: impl FnOnce(&mut Writer)) {
        let Some(view) = self.views.get(&handle) else { return };
        if !view.is_attached() {
            return;
        }
        let mut writer = Writer::new();
        writer.write_u32(view.server_handle);
        build(&mut writer);
        let payload = writer.into_inner();
        self.post(code, &payload);
    }

    pub fn set_view_frame(&mut self, handle: ClientHandle, frame: Rect) {
        let Some(view) = self.views.get_mut(&handle) else { return };
        if view.frame == frame {
            return;
        }
        view.frame = frame;
        view.layout_valid = false;
        self.post_view(handle, MsgCode::ViewSetFrame, |w| {
            w.write_rect(frame);
        });
        if let Some(mut handler) = self.take_handler(handle) {
            handler.on_frame_changed(self, handle, frame);
            self.put_handler(handle, handler);
        }
    }

    pub fn show(&mut self, handle: ClientHandle, visible: bool) {
        if let Some(view) = self.views.get_mut(&handle) {
            view.hide_count += if visible { -1 } else { 1 };
            if view.hide_count < 0 {
                view.hide_count = 0;
            }
        }
        self.post_view(handle, MsgCode::ViewShow, |w| {
            w.write_u8(visible as u8);
        });
        let parent = self.views.get(&handle).and_then(|v| v.parent);
        if let Some(parent) = parent {
            self.invalidate_layout(parent);
        }
    }

    pub fn set_fg_color(&mut self, handle: ClientHandle, color: Rgb565) {
        if let Some(view) = self.views.get_mut(&handle) {
            view.fg_color = color;
        }
        self.post_view(handle, MsgCode::ViewSetFgColor, |w| {
            w.write_u16(color_to_raw(color));
        });
    }

    pub fn set_bg_color(&mut self, handle: ClientHandle, color: Rgb565) {
        if let Some(view) = self.views.get_mut(&handle) {
            view.bg_color = color;
        }
        self.post_view(handle, MsgCode::ViewSetBgColor, |w| {
            w.write_u16(color_to_raw(color));
        });
    }

    pub fn set_erase_color(&mut self, handle: ClientHandle, color: Rgb565) {
        if let Some(view) = self.views.get_mut(&handle) {
            view.erase_color = color;
        }
        self.post_view(handle, MsgCode::ViewSetEraseColor, |w| {
            w.write_u16(color_to_raw(color));
        });
    }

    pub fn set_pen_width(&mut self, handle: ClientHandle, width: f32) {
        if let Some(view) = self.views.get_mut(&handle) {
            view.pen_width = width;
        }
        self.post_view(handle, MsgCode::ViewSetPenWidth, |w| {
            w.write_f32(width);
        });
    }

    pub fn move_pen_to(&mut self, handle: ClientHandle, position: Point) {
        if let Some(view) = self.views.get_mut(&handle) {
            view.pen_pos = position;
        }
        self.post_view(handle, MsgCode::ViewMovePenTo, |w| {
            w.write_point(position);
        });
    }

    pub fn set_focus(&mut self, handle: ClientHandle, focus: bool) {
        self.focus = if focus { Some(handle) } else { None };
        self.post_view(handle, MsgCode::ViewSetFocus, |w| {
            w.write_u8(focus as u8);
        });
    }

    pub fn toggle_depth(&mut self, handle: ClientHandle) {
        self.post_view(handle, MsgCode::ViewToggleDepth, |_| {});
    }

    /// Scroll offsets mirror as deltas, never as absolute positions.
    pub fn scroll_by(&mut self, handle: ClientHandle, delta: Point) {
        if let Some(view) = self.views.get_mut(&handle) {
            view.scroll_offset += delta;
        }
        self.post_view(handle, MsgCode::ViewScrollBy, |w| {
            w.write_point(delta);
        });
    }

    pub fn invalidate(&mut self, handle: ClientHandle, rect: IRect) {
        self.post_view(handle, MsgCode::InvalidateView, |w| {
            w.write_irect(rect);
        });
    }

    // ========================================================================
    // Drawing
    // ========================================================================

    pub fn draw_line_to(&mut self, handle: ClientHandle, to: Point) {
        if let Some(view) = self.views.get_mut(&handle) {
            view.pen_pos = to;
        }
        self.post_view(handle, MsgCode::ViewDrawLine1, |w| {
            w.write_point(to);
        });
    }

    pub fn draw_line(&mut self, handle: ClientHandle, from: Point, to: Point) {
        self.post_view(handle, MsgCode::ViewDrawLine2, |w| {
            w.write_point(from).write_point(to);
        });
    }

    pub fn fill_rect(&mut self, handle: ClientHandle, rect: Rect) {
        let color = self
            .views
            .get(&handle)
            .map(|v| v.fg_color)
            .unwrap_or(Rgb565::new(0, 0, 0));
        self.fill_rect_color(handle, rect, color);
    }

    pub fn fill_rect_color(&mut self, handle: ClientHandle, rect: Rect, color: Rgb565) {
        self.post_view(handle, MsgCode::ViewFillRect, |w| {
            w.write_rect(rect).write_u16(color_to_raw(color));
        });
    }

    pub fn erase_rect(&mut self, handle: ClientHandle, rect: Rect) {
        let color = self
            .views
            .get(&handle)
            .map(|v| v.erase_color)
            .unwrap_or(Rgb565::new(31, 63, 31));
        self.fill_rect_color(handle, rect, color);
    }

    pub fn fill_circle(&mut self, handle: ClientHandle, center: Point, radius: f32) {
        self.post_view(handle, MsgCode::ViewFillCircle, |w| {
            w.write_point(center).write_f32(radius);
        });
    }

    pub fn draw_string(&mut self, handle: ClientHandle, text: &str) {
        self.post_view(handle, MsgCode::ViewDrawString, |w| {
            w.write_string(text);
        });
    }

    pub fn copy_rect(&mut self, handle: ClientHandle, src: Rect, dst: Point) {
        self.post_view(handle, MsgCode::ViewCopyRect, |w| {
            w.write_rect(src).write_point(dst);
        });
    }

    pub fn debug_draw(&mut self, handle: ClientHandle, color: Rgb565, flags: u32) {
        self.post_view(handle, MsgCode::ViewDebugDraw, |w| {
            w.write_u16(color_to_raw(color)).write_u32(flags);
        });
    }

    // ========================================================================
    // Event dispatch
    // ========================================================================

    /// Drain and dispatch pending server events.
    pub fn process_events(&mut self) {
        while let Ok(message) = ipc::try_receive(self.event_port) {
            if let Err(error) = self.handle_event(&message) {
                crate::log_warn!("[gui] event {} dropped: {:?}", message.code, error);
            }
        }
    }

    /// One framework step: events, input timers, pending layout, flush.
    pub fn tick(&mut self) {
        self.process_events();
        self.process_timers();
        self.commit_layouts();
        self.flush();
    }

    fn handle_event(&mut self, message: &ipc::Message) -> KResult<()> {
        let mut reader = Reader::new(&message.data);
        match MsgCode::from_u16(message.code) {
            Some(MsgCode::PaintView) => {
                let server = reader.read_u32()?;
                let bounds = reader.read_irect()?;
                let Some(&client) = self.server_to_client.get(&server) else {
                    return Err(ErrorCode::NotFound);
                };
                self.handle_paint(client, bounds);
                Ok(())
            }
            Some(MsgCode::HandleMouseDown) => {
                let server = reader.read_u32()?;
                let button = MouseButton::from_u8(reader.read_u8()?);
                let position = reader.read_point()?;
                let Some(&client) = self.server_to_client.get(&server) else {
                    return Err(ErrorCode::NotFound);
                };
                self.handle_mouse_down(client, button, position);
                Ok(())
            }
            Some(MsgCode::HandleMouseUp) => {
                let server = reader.read_u32()?;
                let button = MouseButton::from_u8(reader.read_u8()?);
                let position = reader.read_point()?;
                let target = self
                    .capture
                    .take()
                    .or_else(|| self.server_to_client.get(&server).copied());
                self.press = None;
                if let Some(target) = target {
                    self.call_mouse(target, MsgCode::HandleMouseUp, button, position);
                }
                Ok(())
            }
            Some(MsgCode::HandleMouseMove) => {
                let server = reader.read_u32()?;
                let button = MouseButton::from_u8(reader.read_u8()?);
                let position = reader.read_point()?;
                if let Some(press) = &mut self.press {
                    if (position - press.start_pos).length() > BEGIN_DRAG_OFFSET {
                        press.dragging = true;
                    }
                }
                let target = self
                    .capture
                    .or_else(|| self.server_to_client.get(&server).copied());
                if let Some(target) = target {
                    self.call_mouse(target, MsgCode::HandleMouseMove, button, position);
                }
                Ok(())
            }
            Some(MsgCode::ViewFocusChanged) => {
                let server = reader.read_u32()?;
                let focus = reader.read_u8()? != 0;
                let Some(&client) = self.server_to_client.get(&server) else {
                    return Err(ErrorCode::NotFound);
                };
                if let Some(mut handler) = self.take_handler(client) {
                    handler.on_focus_changed(self, client, focus);
                    self.put_handler(client, handler);
                }
                Ok(())
            }
            Some(MsgCode::ViewFrameChanged) => {
                let server = reader.read_u32()?;
                let frame = reader.read_rect()?;
                let Some(&client) = self.server_to_client.get(&server) else {
                    return Err(ErrorCode::NotFound);
                };
                if let Some(view) = self.views.get_mut(&client) {
                    view.frame = frame;
                    view.layout_valid = false;
                }
                Ok(())
            }
            _ => Err(ErrorCode::InvalidArg),
        }
    }

    fn handle_paint(&mut self, client: ClientHandle, bounds: IRect) {
        let Some(view) = self.views.get(&client) else { return };
        let server = view.server_handle;
        let mut writer = Writer::new();
        writer.write_u32(server);
        let begin = writer.into_inner();
        self.post(MsgCode::ViewBeginUpdate, &begin);

        let update_rect = Rect::from(bounds);
        match self.take_handler(client) {
            Some(mut handler) => {
                handler.on_paint(self, client, update_rect);
                self.put_handler(client, handler);
            }
            None => self.erase_rect(client, update_rect),
        }

        self.post(MsgCode::ViewEndUpdate, &begin);
        self.flush();
    }

    fn handle_mouse_down(&mut self, client: ClientHandle, button: MouseButton, position: Point) {
        self.press = Some(PressState {
            view: client,
            start_pos: position,
            start_ms: crate::time::uptime_ms(),
            long_press_fired: false,
            dragging: false,
        });
        if self.dispatch_mouse_down(client, button, position) {
            if let (Some(press), Some(capture)) = (&mut self.press, self.capture) {
                press.view = capture;
            }
        }
    }

    /// Deliver a mouse-down. A `true` from the handler captures the
    /// pointer. A `false` falls through to the next sibling under the
    /// position (topmost first) and finally to the parent.
    fn dispatch_mouse_down(
        &mut self,
        handle: ClientHandle,
        button: MouseButton,
        position: Point,
    ) -> bool {
        if self.call_mouse(handle, MsgCode::HandleMouseDown, button, position) {
            self.capture = Some(handle);
            return true;
        }
        let Some(view) = self.views.get(&handle) else { return false };
        let Some(parent) = view.parent else { return false };
        let parent_pos = position + view.frame.top_left();

        let siblings = self.views[&parent].children.clone();
        let my_index = siblings.iter().position(|&s| s == handle);
        if let Some(my_index) = my_index {
            // Children are in paint order; walk downward from just below us.
            for &sibling in siblings[..my_index].iter().rev() {
                let Some(sibling_view) = self.views.get(&sibling) else { continue };
                if !sibling_view.is_visible()
                    || sibling_view.has_flag(view_flags::IGNORE_MOUSE)
                {
                    continue;
                }
                if sibling_view.frame.contains(parent_pos) {
                    let local = parent_pos - sibling_view.frame.top_left();
                    if self.call_mouse(sibling, MsgCode::HandleMouseDown, button, local) {
                        self.capture = Some(sibling);
                        return true;
                    }
                }
            }
        }
        self.dispatch_mouse_down(parent, button, parent_pos)
    }

    fn call_mouse(
        &mut self,
        handle: ClientHandle,
        code: MsgCode,
        button: MouseButton,
        position: Point,
    ) -> bool {
        let Some(mut handler) = self.take_handler(handle) else { return false };
        let handled = match code {
            MsgCode::HandleMouseDown => handler.on_mouse_down(self, handle, button, position),
            MsgCode::HandleMouseUp => handler.on_mouse_up(self, handle, button, position),
            MsgCode::HandleMouseMove => handler.on_mouse_move(self, handle, button, position),
            _ => false,
        };
        self.put_handler(handle, handler);
        handled
    }

    // ========================================================================
    // Key repeat & long press
    // ========================================================================

    pub fn key_down(&mut self, key: u32) {
        self.dispatch_key(key, false);
        self.held_key = Some(HeldKey {
            key,
            next_repeat_ms: crate::time::uptime_ms() + (KEYREPEAT_DELAY * 1000.0) as u64,
        });
    }

    pub fn key_up(&mut self, key: u32) {
        if self.held_key.map(|h| h.key) == Some(key) {
            self.held_key = None;
        }
        let Some(focus) = self.focus else { return };
        if let Some(mut handler) = self.take_handler(focus) {
            handler.on_key_up(self, focus, key);
            self.put_handler(focus, handler);
        }
    }

    fn dispatch_key(&mut self, key: u32, repeat: bool) {
        let Some(focus) = self.focus else { return };
        if let Some(mut handler) = self.take_handler(focus) {
            handler.on_key_down(self, focus, key, repeat);
            self.put_handler(focus, handler);
        }
    }

    /// Fire key repeats and long presses whose deadlines passed.
    pub fn process_timers(&mut self) {
        let now = crate::time::uptime_ms();

        if let Some(held) = self.held_key {
            if now >= held.next_repeat_ms {
                self.held_key = Some(HeldKey {
                    key: held.key,
                    next_repeat_ms: now + (KEYREPEAT_REPEAT * 1000.0) as u64,
                });
                self.dispatch_key(held.key, true);
            }
        }

        if let Some(press) = self.press {
            if !press.long_press_fired
                && !press.dragging
                && now.saturating_sub(press.start_ms) >= (LONG_PRESS_DELAY * 1000.0) as u64
            {
                if let Some(state) = &mut self.press {
                    state.long_press_fired = true;
                }
                if let Some(mut handler) = self.take_handler(press.view) {
                    handler.on_long_press(self, press.view, press.start_pos);
                    self.put_handler(press.view, handler);
                }
            }
        }
    }

    // ========================================================================
    // Test access
    // ========================================================================

    #[cfg(test)]
    pub fn event_port_for_test(&self) -> PortId {
        self.event_port
    }

    #[cfg(test)]
    pub fn map_server_handle_for_test(&mut self, client: ClientHandle, server: ViewHandle) {
        if let Some(view) = self.views.get_mut(&client) {
            view.server_handle = server;
            view.flags |= view_flags::IS_ATTACHED_TO_SCREEN;
        }
        self.server_to_client.insert(server, client);
    }

    #[cfg(test)]
    pub fn send_buffer_len(&self) -> usize {
        self.send_buffer.len()
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        ipc::delete_port(self.reply_port);
        ipc::delete_port(self.event_port);
    }
}

#[cfg(test)]
mod tests;
