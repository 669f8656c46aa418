//! Client / server wire protocol
//!
//! Every message is framed `{code: u16, length: u16}` little-endian, length
//! including the 4-byte header. A `MessageBundle` payload is a concatenated
//! run of framed sub-messages. Coordinates travel as f32 in the view's
//! logical space; rectangles are `{left, top, right, bottom}` with
//! right/bottom exclusive; colors are raw RGB565.

use alloc::vec::Vec;

use crate::math::{IRect, Point, Rect};
use crate::vfs::{ErrorCode, KResult};

pub const HEADER_SIZE: usize = 4;

/// Server-side view handle. `INVALID_HANDLE` is the error sentinel replies
/// carry.
pub type ViewHandle = u32;
pub const INVALID_HANDLE: ViewHandle = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgCode {
    // Session
    RegisterApplication = 1,
    RegisterApplicationReply = 2,
    CreateView = 3,
    CreateViewReply = 4,
    DeleteView = 5,
    Sync = 6,
    SyncReply = 7,
    MessageBundle = 8,
    InvalidateView = 9,

    // View state
    ViewSetFgColor = 20,
    ViewSetBgColor = 21,
    ViewSetEraseColor = 22,
    ViewSetPenWidth = 23,
    ViewMovePenTo = 24,
    ViewSetFrame = 25,
    ViewToggleDepth = 26,
    ViewSetFocus = 27,
    ViewShow = 28,
    ViewSetFlags = 29,
    ViewBeginUpdate = 30,
    ViewEndUpdate = 31,

    // Drawing
    ViewDrawLine1 = 40,
    ViewDrawLine2 = 41,
    ViewFillRect = 42,
    ViewFillCircle = 43,
    ViewDrawString = 44,
    ViewCopyRect = 45,
    ViewScrollBy = 46,
    ViewDebugDraw = 47,

    // Server to client
    HandleMouseDown = 60,
    HandleMouseUp = 61,
    HandleMouseMove = 62,
    PaintView = 63,
    ViewFrameChanged = 64,
    ViewFocusChanged = 65,
}

impl MsgCode {
    pub fn from_u16(value: u16) -> Option<MsgCode> {
        Some(match value {
            1 => MsgCode::RegisterApplication,
            2 => MsgCode::RegisterApplicationReply,
            3 => MsgCode::CreateView,
            4 => MsgCode::CreateViewReply,
            5 => MsgCode::DeleteView,
            6 => MsgCode::Sync,
            7 => MsgCode::SyncReply,
            8 => MsgCode::MessageBundle,
            9 => MsgCode::InvalidateView,
            20 => MsgCode::ViewSetFgColor,
            21 => MsgCode::ViewSetBgColor,
            22 => MsgCode::ViewSetEraseColor,
            23 => MsgCode::ViewSetPenWidth,
            24 => MsgCode::ViewMovePenTo,
            25 => MsgCode::ViewSetFrame,
            26 => MsgCode::ViewToggleDepth,
            27 => MsgCode::ViewSetFocus,
            28 => MsgCode::ViewShow,
            29 => MsgCode::ViewSetFlags,
            30 => MsgCode::ViewBeginUpdate,
            31 => MsgCode::ViewEndUpdate,
            40 => MsgCode::ViewDrawLine1,
            41 => MsgCode::ViewDrawLine2,
            42 => MsgCode::ViewFillRect,
            43 => MsgCode::ViewFillCircle,
            44 => MsgCode::ViewDrawString,
            45 => MsgCode::ViewCopyRect,
            46 => MsgCode::ViewScrollBy,
            47 => MsgCode::ViewDebugDraw,
            60 => MsgCode::HandleMouseDown,
            61 => MsgCode::HandleMouseUp,
            62 => MsgCode::HandleMouseMove,
            63 => MsgCode::PaintView,
            64 => MsgCode::ViewFrameChanged,
            65 => MsgCode::ViewFocusChanged,
            _ => return None,
        })
    }
}

/// Pointer-event source, touch included
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MouseButton {
    None = 0,
    Left = 1,
    Right = 2,
    Touch = 3,
}

impl MouseButton {
    pub fn from_u8(value: u8) -> MouseButton {
        match value {
            1 => MouseButton::Left,
            2 => MouseButton::Right,
            3 => MouseButton::Touch,
            _ => MouseButton::None,
        }
    }
}

/// View behavior flags shared between client and server. Bits 0..=15 are
/// reserved for the framework; widgets start at `FIRST_USER_BIT`.
pub mod view_flags {
    /// Invalidate the whole view when it gets wider
    pub const FULL_UPDATE_ON_RESIZE_H: u32 = 0x0001;
    /// Invalidate the whole view when it gets taller
    pub const FULL_UPDATE_ON_RESIZE_V: u32 = 0x0002;
    pub const FULL_UPDATE_ON_RESIZE: u32 = 0x0003;
    /// Excluded from layout while hidden
    pub const IGNORE_WHEN_HIDDEN: u32 = 0x0004;
    /// The view paints its own content
    pub const WILL_DRAW: u32 = 0x0008;
    /// The parent draws through this view
    pub const TRANSPARENT: u32 = 0x0010;
    /// The server clears newly exposed area
    pub const CLEAR_BACKGROUND: u32 = 0x0020;
    /// The view paints atop its children
    pub const DRAW_ON_CHILDREN: u32 = 0x0040;
    /// Reserved: read-only mirror of a foreign server view
    pub const EAVESDROPPER: u32 = 0x0080;
    /// Invisible to pointer events
    pub const IGNORE_MOUSE: u32 = 0x0100;
    /// Consume pointer events even when a child is under the pointer
    pub const FORCE_HANDLE_MOUSE: u32 = 0x0200;
    /// Managed by the framework, never settable by the user
    pub const IS_ATTACHED_TO_SCREEN: u32 = 0x0400;
    pub const FIRST_USER_BIT: u32 = 16;
}

/// Debug-draw overlay selection bits
pub mod debug_draw_flags {
    pub const VIEW_FRAME: u32 = 0x01;
    pub const DRAW_REGION: u32 = 0x02;
    pub const DAMAGE_REGION: u32 = 0x04;
}

// ============================================================================
// Field codec
// ============================================================================

/// Cursor over one message payload.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> KResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ErrorCode::InvalidArg);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> KResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> KResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> KResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> KResult<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> KResult<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_point(&mut self) -> KResult<Point> {
        Ok(Point::new(self.read_f32()?, self.read_f32()?))
    }

    pub fn read_rect(&mut self) -> KResult<Rect> {
        Ok(Rect::new(
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
        ))
    }

    pub fn read_irect(&mut self) -> KResult<IRect> {
        Ok(IRect::new(
            self.read_i32()?,
            self.read_i32()?,
            self.read_i32()?,
            self.read_i32()?,
        ))
    }

    /// Length-prefixed UTF-8 string (u16 length)
    pub fn read_string(&mut self) -> KResult<&'a str> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        core::str::from_utf8(bytes).map_err(|_| ErrorCode::InvalidArg)
    }
}

/// Growable writer for replies and server-to-client events.
#[derive(Default)]
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_point(&mut self, p: Point) -> &mut Self {
        self.write_f32(p.x).write_f32(p.y)
    }

    pub fn write_rect(&mut self, r: Rect) -> &mut Self {
        self.write_f32(r.left).write_f32(r.top).write_f32(r.right).write_f32(r.bottom)
    }

    pub fn write_irect(&mut self, r: IRect) -> &mut Self {
        self.write_i32(r.left).write_i32(r.top).write_i32(r.right).write_i32(r.bottom)
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.write_u16(s.len() as u16);
        self.data.extend_from_slice(s.as_bytes());
        self
    }
}

// ============================================================================
// Bundle framing
// ============================================================================

/// Iterator over the framed sub-messages of a bundle payload. Truncated or
/// malformed frames terminate iteration with an error item.
pub struct BundleIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BundleIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for BundleIter<'a> {
    type Item = KResult<(u16, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.data.len() {
            return None;
        }
        if self.data.len() - self.pos < HEADER_SIZE {
            self.pos = self.data.len();
            return Some(Err(ErrorCode::InvalidArg));
        }
        let code = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        let length =
            u16::from_le_bytes([self.data[self.pos + 2], self.data[self.pos + 3]]) as usize;
        if length < HEADER_SIZE || self.pos + length > self.data.len() {
            self.pos = self.data.len();
            return Some(Err(ErrorCode::InvalidArg));
        }
        let payload = &self.data[self.pos + HEADER_SIZE..self.pos + length];
        self.pos += length;
        Some(Ok((code, payload)))
    }
}

/// Frame one message into `out`: header plus payload.
pub fn write_frame(out: &mut Vec<u8>, code: MsgCode, payload: &[u8]) {
    let length = (payload.len() + HEADER_SIZE) as u16;
    out.extend_from_slice(&(code as u16).to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_codec_round_trip() {
        let mut writer = Writer::new();
        writer
            .write_u32(0xDEAD_BEEF)
            .write_point(Point::new(1.5, -2.5))
            .write_rect(Rect::new(0.0, 1.0, 2.0, 3.0))
            .write_string("hello")
            .write_u8(7);
        let data = writer.into_inner();

        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_point().unwrap(), Point::new(1.5, -2.5));
        assert_eq!(reader.read_rect().unwrap(), Rect::new(0.0, 1.0, 2.0, 3.0));
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.remaining(), 0);
        assert_eq!(reader.read_u8().unwrap_err(), ErrorCode::InvalidArg);
    }

    #[test]
    fn bundle_preserves_order_and_payloads() {
        let mut bundle = Vec::new();
        for i in 0..10u8 {
            let mut payload = Writer::new();
            payload.write_u32(i as u32).write_u8(i);
            write_frame(&mut bundle, MsgCode::ViewFillRect, &payload.into_inner());
        }
        write_frame(&mut bundle, MsgCode::ViewScrollBy, &[]);

        let mut count = 0u32;
        for (i, item) in BundleIter::new(&bundle).enumerate() {
            let (code, payload) = item.unwrap();
            if i < 10 {
                assert_eq!(code, MsgCode::ViewFillRect as u16);
                let mut reader = Reader::new(payload);
                assert_eq!(reader.read_u32().unwrap(), i as u32);
                assert_eq!(reader.read_u8().unwrap(), i as u8);
            } else {
                assert_eq!(code, MsgCode::ViewScrollBy as u16);
                assert!(payload.is_empty());
            }
            count += 1;
        }
        assert_eq!(count, 11);
    }

    #[test]
    fn truncated_bundle_yields_error() {
        let mut bundle = Vec::new();
        write_frame(&mut bundle, MsgCode::ViewFillRect, &[1, 2, 3, 4]);
        bundle.truncate(bundle.len() - 2);
        let results: Vec<_> = BundleIter::new(&bundle).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn msg_code_round_trip() {
        for code in [
            MsgCode::RegisterApplication,
            MsgCode::MessageBundle,
            MsgCode::ViewScrollBy,
            MsgCode::ViewFocusChanged,
        ] {
            assert_eq!(MsgCode::from_u16(code as u16), Some(code));
        }
        assert_eq!(MsgCode::from_u16(0xFFFF), None);
    }
}
