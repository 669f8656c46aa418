use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::*;
use crate::appserver::protocol::{self, view_flags, BundleIter};
use crate::drivers::ra8875::NullGfx;
use crate::math::{IRect, Point, Rect};

type EventLog = Arc<spin::Mutex<Vec<String>>>;

struct TestHandler {
    name: &'static str,
    log: EventLog,
    capture_on_down: bool,
}

impl TestHandler {
    fn new(name: &'static str, log: &EventLog, capture_on_down: bool) -> Box<Self> {
        Box::new(Self { name, log: log.clone(), capture_on_down })
    }
}

impl ViewHandler for TestHandler {
    fn on_paint(&mut self, app: &mut Application, view: ClientHandle, update_rect: Rect) {
        self.log.lock().push(format!("{}:paint", self.name));
        app.erase_rect(view, update_rect);
    }

    fn on_mouse_down(
        &mut self,
        _app: &mut Application,
        _view: ClientHandle,
        _button: MouseButton,
        position: Point,
    ) -> bool {
        self.log
            .lock()
            .push(format!("{}:down@{},{}", self.name, position.x, position.y));
        self.capture_on_down
    }

    fn on_mouse_up(
        &mut self,
        _app: &mut Application,
        _view: ClientHandle,
        _button: MouseButton,
        _position: Point,
    ) -> bool {
        self.log.lock().push(format!("{}:up", self.name));
        false
    }

    fn on_mouse_move(
        &mut self,
        _app: &mut Application,
        _view: ClientHandle,
        _button: MouseButton,
        _position: Point,
    ) -> bool {
        self.log.lock().push(format!("{}:move", self.name));
        false
    }

    fn on_long_press(&mut self, _app: &mut Application, _view: ClientHandle, _position: Point) {
        self.log.lock().push(format!("{}:longpress", self.name));
    }

    fn on_key_down(
        &mut self,
        _app: &mut Application,
        _view: ClientHandle,
        key: u32,
        repeat: bool,
    ) {
        self.log.lock().push(format!("{}:key{}:{}", self.name, key, repeat));
    }
}

fn new_log() -> EventLog {
    Arc::new(spin::Mutex::new(Vec::new()))
}

fn spacer(app: &mut Application, min: Point, max: Point, wheight: f32) -> ClientHandle {
    let handle = app.create_view("spacer", Rect::default(), 0);
    let view = app.view_mut(handle).unwrap();
    view.layout_node = LayoutNode::Spacer { min, max };
    view.wheight = wheight;
    handle
}

fn send_event(app: &Application, code: MsgCode, build: impl FnOnce(&mut Writer)) {
    let mut writer = Writer::new();
    build(&mut writer);
    ipc::send(app.event_port_for_test(), code as u16, &writer.into_inner()).unwrap();
}

fn advance_time(ms: u64) {
    for _ in 0..ms {
        crate::time::tick();
    }
}

// ============================================================================
// Layout
// ============================================================================

#[test]
fn horizontal_layout_distributes_by_wheight() {
    let mut app = Application::new_detached("layout", 0);
    let row = app.create_view("row", Rect::new(0.0, 0.0, 300.0, 100.0), 0);
    app.view_mut(row).unwrap().layout_node = LayoutNode::Horizontal;

    let a = spacer(&mut app, Point::new(10.0, 20.0), Point::new(100.0, 20.0), 1.0);
    let b = spacer(&mut app, Point::new(50.0, 20.0), Point::new(80.0, 20.0), 2.0);
    let c = spacer(&mut app, Point::new(10.0, 20.0), Point::new(1000.0, 20.0), 1.0);
    for child in [a, b, c] {
        app.add_child(row, child).unwrap();
    }

    app.invalidate_layout(row);
    app.commit_layouts();

    let fa = app.view(a).unwrap().frame;
    let fb = app.view(b).unwrap().frame;
    let fc = app.view(c).unwrap().frame;

    // Widths sum to the bounds, each within min/max, proportional after cap.
    assert_eq!(fa.width(), 100.0);
    assert_eq!(fb.width(), 80.0);
    assert_eq!(fc.width(), 120.0);
    assert_eq!(fa.width() + fb.width() + fc.width(), 300.0);

    // Placed left to right without gaps (no unused slack here).
    assert_eq!(fa.left, 0.0);
    assert_eq!(fb.left, fa.right);
    assert_eq!(fc.left, fb.right);
}

#[test]
fn unused_slack_becomes_even_padding() {
    let mut app = Application::new_detached("slack", 0);
    let row = app.create_view("row", Rect::new(0.0, 0.0, 100.0, 40.0), 0);
    app.view_mut(row).unwrap().layout_node = LayoutNode::Horizontal;
    let a = spacer(&mut app, Point::new(20.0, 10.0), Point::new(20.0, 10.0), 1.0);
    let b = spacer(&mut app, Point::new(20.0, 10.0), Point::new(20.0, 10.0), 1.0);
    app.add_child(row, a).unwrap();
    app.add_child(row, b).unwrap();

    app.invalidate_layout(row);
    app.commit_layouts();

    // 60 unused pixels split as 30 per child, half leading each child.
    let fa = app.view(a).unwrap().frame;
    let fb = app.view(b).unwrap().frame;
    assert_eq!(fa.left, 15.0);
    assert_eq!(fa.width(), 20.0);
    assert_eq!(fb.left, 65.0);
}

#[test]
fn width_ring_reports_ring_maximum() {
    let mut app = Application::new_detached("ring", 0);
    let a = spacer(&mut app, Point::new(30.0, 20.0), Point::new(30.0, 20.0), 1.0);
    let b = spacer(&mut app, Point::new(50.0, 20.0), Point::new(50.0, 20.0), 1.0);
    app.add_to_ring(a, b, true);

    assert_eq!(app.get_preferred_size(a, PrefSizeType::Smallest).x, 50.0);
    assert_eq!(app.get_preferred_size(b, PrefSizeType::Smallest).x, 50.0);
    // Heights are not shared through a width ring.
    assert_eq!(app.get_preferred_size(a, PrefSizeType::Smallest).y, 20.0);
}

#[test]
fn size_overrides_apply_per_axis() {
    let mut app = Application::new_detached("override", 0);
    let v = spacer(&mut app, Point::new(30.0, 30.0), Point::new(60.0, 60.0), 1.0);

    app.view_mut(v).unwrap().width_override =
        AxisOverride { mode: SizeOverride::Always, value: 44.0 };
    app.view_mut(v).unwrap().height_override =
        AxisOverride { mode: SizeOverride::Limit, value: 40.0 };

    let smallest = app.get_preferred_size(v, PrefSizeType::Smallest);
    let greatest = app.get_preferred_size(v, PrefSizeType::Greatest);
    assert_eq!(smallest.x, 44.0);
    assert_eq!(greatest.x, 44.0);
    assert_eq!(smallest.y, 30.0);
    assert_eq!(greatest.y, 40.0);

    app.view_mut(v).unwrap().preferred_sizes_valid = false;
    app.view_mut(v).unwrap().height_override =
        AxisOverride { mode: SizeOverride::Extend, value: 50.0 };
    let smallest = app.get_preferred_size(v, PrefSizeType::Smallest);
    assert_eq!(smallest.y, 50.0);
}

#[test]
fn second_parent_is_rejected() {
    let mut app = Application::new_detached("tree", 0);
    let p1 = app.create_view("p1", Rect::from_size(10.0, 10.0), 0);
    let p2 = app.create_view("p2", Rect::from_size(10.0, 10.0), 0);
    let child = app.create_view("c", Rect::from_size(5.0, 5.0), 0);
    app.add_child(p1, child).unwrap();
    assert_eq!(app.add_child(p2, child), Err(ErrorCode::InvalidArg));
}

// ============================================================================
// Batching
// ============================================================================

#[test]
fn overflowing_batch_flushes_and_preserves_order() {
    let fake_server = ipc::create_port("fake_server", 64);
    let mut app = Application::new_detached("batch", fake_server);
    let v = app.create_view("v", Rect::from_size(100.0, 100.0), 0);
    app.map_server_handle_for_test(v, 55);

    let color = crate::drivers::ra8875::rgb(10, 20, 30);
    for i in 0..60 {
        app.fill_rect_color(v, Rect::new(i as f32, 0.0, i as f32 + 8.0, 8.0), color);
        assert!(app.send_buffer_len() <= crate::config::SEND_BUFFER_SIZE);
    }
    app.flush();

    let mut bundles = 0;
    let mut lefts = Vec::new();
    while let Ok(message) = ipc::try_receive(fake_server) {
        assert_eq!(message.code, MsgCode::MessageBundle as u16);
        bundles += 1;
        for item in BundleIter::new(&message.data) {
            let (code, payload) = item.unwrap();
            assert_eq!(code, MsgCode::ViewFillRect as u16);
            let mut reader = Reader::new(payload);
            assert_eq!(reader.read_u32().unwrap(), 55);
            lefts.push(reader.read_rect().unwrap().left as i32);
        }
    }
    assert!(bundles >= 2, "expected overflow to split into bundles");
    assert_eq!(lefts, (0..60).collect::<Vec<i32>>());
    ipc::delete_port(fake_server);
}

#[test]
fn paint_request_is_bracketed_by_update_messages() {
    let fake_server = ipc::create_port("paint_server", 16);
    let mut app = Application::new_detached("paint", fake_server);
    let v = app.create_view("v", Rect::from_size(100.0, 100.0), 0);
    app.map_server_handle_for_test(v, 77);

    send_event(&app, MsgCode::PaintView, |w| {
        w.write_u32(77).write_irect(IRect::new(0, 0, 40, 40));
    });
    app.process_events();

    let message = ipc::try_receive(fake_server).expect("bundle");
    let codes: Vec<u16> = BundleIter::new(&message.data)
        .map(|item| item.unwrap().0)
        .collect();
    assert_eq!(
        codes,
        alloc::vec![
            MsgCode::ViewBeginUpdate as u16,
            MsgCode::ViewFillRect as u16, // default erase
            MsgCode::ViewEndUpdate as u16,
        ]
    );
    ipc::delete_port(fake_server);
}

// ============================================================================
// Input dispatch
// ============================================================================

#[test]
fn capture_routes_follow_up_events_to_the_captor() {
    let log = new_log();
    let mut app = Application::new_detached("input", 0);

    let parent = app.create_view("p", Rect::from_size(200.0, 200.0), 0);
    let b = app.create_view("b", Rect::new(10.0, 10.0, 110.0, 110.0), 0);
    let a = app.create_view("a", Rect::new(10.0, 10.0, 110.0, 110.0), view_flags::IGNORE_MOUSE);
    app.add_child(parent, b).unwrap();
    app.add_child(parent, a).unwrap(); // later: above b

    app.set_handler(parent, TestHandler::new("p", &log, false));
    app.set_handler(b, TestHandler::new("b", &log, true));
    app.set_handler(a, TestHandler::new("a", &log, true));

    app.map_server_handle_for_test(parent, 200);
    app.map_server_handle_for_test(b, 202);
    app.map_server_handle_for_test(a, 201);

    // The server already skipped A (IgnoreMouse) and targeted B.
    send_event(&app, MsgCode::HandleMouseDown, |w| {
        w.write_u32(202)
            .write_u8(protocol::MouseButton::Touch as u8)
            .write_point(Point::new(40.0, 40.0));
    });
    app.process_events();
    // B captured: moves keep going to B even with another target view.
    send_event(&app, MsgCode::HandleMouseMove, |w| {
        w.write_u32(201)
            .write_u8(protocol::MouseButton::Touch as u8)
            .write_point(Point::new(300.0, 300.0));
    });
    send_event(&app, MsgCode::HandleMouseUp, |w| {
        w.write_u32(201)
            .write_u8(protocol::MouseButton::Touch as u8)
            .write_point(Point::new(300.0, 300.0));
    });
    app.process_events();

    let entries = log.lock().clone();
    assert_eq!(entries, alloc::vec!["b:down@40,40", "b:move", "b:up"]);
}

#[test]
fn unhandled_mouse_down_falls_through_to_parent() {
    let log = new_log();
    let mut app = Application::new_detached("fallthrough", 0);

    let parent = app.create_view("p", Rect::from_size(200.0, 200.0), 0);
    let b = app.create_view("b", Rect::new(10.0, 10.0, 110.0, 110.0), 0);
    app.add_child(parent, b).unwrap();
    app.set_handler(parent, TestHandler::new("p", &log, false));
    app.set_handler(b, TestHandler::new("b", &log, false));
    app.map_server_handle_for_test(parent, 300);
    app.map_server_handle_for_test(b, 301);

    send_event(&app, MsgCode::HandleMouseDown, |w| {
        w.write_u32(301)
            .write_u8(protocol::MouseButton::Touch as u8)
            .write_point(Point::new(40.0, 40.0));
    });
    app.process_events();

    let entries = log.lock().clone();
    // B declined; the event reaches the parent in parent coordinates.
    assert_eq!(entries, alloc::vec!["b:down@40,40", "p:down@50,50"]);
}

#[test]
fn sibling_under_position_is_tried_before_the_parent() {
    let log = new_log();
    let mut app = Application::new_detached("siblings", 0);

    let parent = app.create_view("p", Rect::from_size(200.0, 200.0), 0);
    let below = app.create_view("below", Rect::new(0.0, 0.0, 150.0, 150.0), 0);
    let top = app.create_view("top", Rect::new(10.0, 10.0, 110.0, 110.0), 0);
    app.add_child(parent, below).unwrap();
    app.add_child(parent, top).unwrap();
    app.set_handler(parent, TestHandler::new("p", &log, false));
    app.set_handler(below, TestHandler::new("below", &log, true));
    app.set_handler(top, TestHandler::new("top", &log, false));
    app.map_server_handle_for_test(parent, 400);
    app.map_server_handle_for_test(below, 401);
    app.map_server_handle_for_test(top, 402);

    send_event(&app, MsgCode::HandleMouseDown, |w| {
        w.write_u32(402)
            .write_u8(protocol::MouseButton::Touch as u8)
            .write_point(Point::new(30.0, 30.0));
    });
    app.process_events();

    let entries = log.lock().clone();
    assert_eq!(entries, alloc::vec!["top:down@30,30", "below:down@40,40"]);
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn stationary_press_fires_long_press_once() {
    let log = new_log();
    let mut app = Application::new_detached("longpress", 0);
    let v = app.create_view("v", Rect::from_size(100.0, 100.0), 0);
    app.set_handler(v, TestHandler::new("v", &log, true));
    app.map_server_handle_for_test(v, 500);

    send_event(&app, MsgCode::HandleMouseDown, |w| {
        w.write_u32(500)
            .write_u8(protocol::MouseButton::Touch as u8)
            .write_point(Point::new(10.0, 10.0));
    });
    app.process_events();

    advance_time(600);
    app.process_timers();
    app.process_timers();
    let fired = log.lock().iter().filter(|e| e.contains("longpress")).count();
    assert_eq!(fired, 1);
}

#[test]
fn drag_past_threshold_cancels_long_press() {
    let log = new_log();
    let mut app = Application::new_detached("drag", 0);
    let v = app.create_view("v", Rect::from_size(100.0, 100.0), 0);
    app.set_handler(v, TestHandler::new("v", &log, true));
    app.map_server_handle_for_test(v, 501);

    send_event(&app, MsgCode::HandleMouseDown, |w| {
        w.write_u32(501)
            .write_u8(protocol::MouseButton::Touch as u8)
            .write_point(Point::new(10.0, 10.0));
    });
    send_event(&app, MsgCode::HandleMouseMove, |w| {
        w.write_u32(501)
            .write_u8(protocol::MouseButton::Touch as u8)
            .write_point(Point::new(40.0, 10.0)); // 30 px > drag threshold
    });
    app.process_events();

    advance_time(600);
    app.process_timers();
    assert!(!log.lock().iter().any(|e| e.contains("longpress")));
}

#[test]
fn held_key_repeats_with_qualifier() {
    let log = new_log();
    let mut app = Application::new_detached("keys", 0);
    let v = app.create_view("v", Rect::from_size(100.0, 100.0), 0);
    app.set_handler(v, TestHandler::new("v", &log, false));
    app.map_server_handle_for_test(v, 502);
    app.set_focus(v, true);

    app.key_down(42);
    assert_eq!(log.lock().last().unwrap(), "v:key42:false");

    advance_time(350);
    app.process_timers();
    assert_eq!(log.lock().last().unwrap(), "v:key42:true");

    advance_time(100);
    app.process_timers();
    assert_eq!(log.lock().iter().filter(|e| e.ends_with("true")).count(), 2);

    app.key_up(42);
    advance_time(500);
    app.process_timers();
    assert_eq!(log.lock().iter().filter(|e| e.ends_with("true")).count(), 2);
}

// ============================================================================
// End-to-end against the server
// ============================================================================

#[test]
fn register_attach_draw_and_sync() {
    crate::appserver::init(Box::new(NullGfx));
    let mut app = Application::new("endtoend").expect("register");

    let root = app.create_view("main", Rect::from_size(300.0, 200.0), 0);
    let child = app.create_view("child", Rect::new(10.0, 10.0, 60.0, 60.0), 0);
    app.add_child(root, child).unwrap();
    app.add_view(root).expect("attach");

    assert!(app.view(root).unwrap().is_attached());
    assert!(app.view(child).unwrap().is_attached());

    app.set_fg_color(root, crate::drivers::ra8875::rgb(200, 30, 30));
    app.fill_rect(root, Rect::new(0.0, 0.0, 100.0, 100.0));
    app.draw_string(child, "hello");
    app.sync().expect("sync");

    app.remove_view(root);
    app.sync().expect("sync after remove");
}
