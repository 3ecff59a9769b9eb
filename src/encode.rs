// SPDX-License-Identifier: Apache-2.0 OR MIT
// Record encoder and frame decoder
//
// A frame is the owned binary form of a record, produced when a record
// crosses the queue to a worker thread. Layout, little-endian, no
// padding:
//
//   u32 total_len | u16 component_count | u8 severity | u8 flags
//   u64 logger_id | u64 timestamp_ns
//   u16 loc_file_len | loc_file ("file:line")
//   u16 loc_entity_len | loc_entity
//   [u32 task_id]                if HAS_TASK_ID
//   [u16 scope_depth | u64 scope_elapsed_ns]  if HAS_SCOPE
//   component*: u8 tag | payload

use crate::component::{tag, Component};
use crate::pool;
use crate::record::Record;
use crate::severity::Severity;
use crate::typereg;

/// Default per-sink limit on an encoded frame.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

pub(crate) mod flags {
    /// The frame lost components (or payload bytes) to the size limit.
    pub const TRUNCATED: u8 = 1;
    pub const HAS_TASK_ID: u8 = 2;
    pub const HAS_SCOPE: u8 = 4;
}

const HEADER_LEN: usize = 24;

/// An owned, self-contained encoded record. The backing storage comes
/// from the frame pool and returns there on drop.
pub struct Frame {
    buf: Option<Vec<u8>>,
}

impl Frame {
    pub(crate) fn from_buf(buf: Vec<u8>) -> Frame {
        Frame { buf: Some(buf) }
    }

    pub fn bytes(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// Borrow a decoded view of this frame.
    pub fn view(&self) -> Option<FrameView<'_>> {
        FrameView::parse(self.bytes())
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            pool::release(buf);
        }
    }
}

fn dec_len(value: u32) -> usize {
    let mut len = 1;
    let mut v = value / 10;
    while v > 0 {
        len += 1;
        v /= 10;
    }
    len
}

fn push_decimal(buf: &mut Vec<u8>, value: u32) {
    let mut digits = [0u8; 10];
    let mut i = digits.len();
    let mut v = value;
    loop {
        i -= 1;
        digits[i] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    buf.extend_from_slice(&digits[i..]);
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Encoded size of one component, tag byte included.
fn component_len(component: &Component) -> usize {
    1 + match component {
        Component::Empty => 0,
        Component::I64(_)
        | Component::F64(_)
        | Component::Address(_)
        | Component::Instant(_) => 8,
        Component::Bool(_) => 1,
        Component::Str(s) => 4 + s.len(),
        Component::Bytes(b) => 4 + b.len(),
        Component::User { type_id, bytes } => {
            let declared = match typereg::lookup(*type_id) {
                Some(def) => (def.encoded_len)(bytes),
                None => bytes.len(),
            };
            2 + 4 + declared
        }
    }
}

fn put_component(buf: &mut Vec<u8>, component: &Component) {
    buf.push(component.wire_tag());
    match component {
        Component::Empty => {}
        Component::I64(v) => put_u64(buf, *v as u64),
        Component::F64(v) => put_u64(buf, v.to_bits()),
        Component::Bool(v) => buf.push(*v as u8),
        Component::Str(s) => {
            put_u32(buf, s.len() as u32);
            buf.extend_from_slice(s.as_bytes());
        }
        Component::Bytes(b) => {
            put_u32(buf, b.len() as u32);
            buf.extend_from_slice(b);
        }
        Component::Address(v) => put_u64(buf, *v as u64),
        Component::Instant(v) => put_u64(buf, *v),
        Component::User { type_id, bytes } => {
            put_u16(buf, *type_id);
            match typereg::lookup(*type_id) {
                Some(def) => {
                    let declared = (def.encoded_len)(bytes);
                    put_u32(buf, declared as u32);
                    let start = buf.len();
                    buf.resize(start + declared, 0);
                    let written = (def.encode)(bytes, &mut buf[start..start + declared]);
                    debug_assert!(
                        written <= declared,
                        "user type {} wrote {} of {} declared bytes",
                        type_id,
                        written,
                        declared
                    );
                }
                None => {
                    put_u32(buf, bytes.len() as u32);
                    buf.extend_from_slice(bytes);
                }
            }
        }
    }
}

/// Shorten a trailing string/bytes component so its encoding fits in
/// `budget` bytes. Other kinds are dropped whole.
fn fit_partial<'a>(component: &Component<'a>, budget: usize) -> Option<Component<'a>> {
    match component {
        Component::Str(s) => {
            let keep = budget.checked_sub(1 + 4)?;
            let mut cut = keep.min(s.len());
            while cut > 0 && !s.is_char_boundary(cut) {
                cut -= 1;
            }
            Some(Component::Str(&s[..cut]))
        }
        Component::Bytes(b) => {
            let keep = budget.checked_sub(1 + 4)?;
            Some(Component::Bytes(&b[..keep.min(b.len())]))
        }
        _ => None,
    }
}

struct Parts<'a> {
    logger_id: u64,
    severity: Severity,
    timestamp_ns: u64,
    task_id: Option<u32>,
    scope: Option<(u16, u64)>,
    loc_file: &'a str,
    loc_line: Option<u32>,
    loc_entity: &'a str,
}

fn encode_parts(parts: &Parts, components: &[Component], max_frame: usize) -> Frame {
    let file_len = parts.loc_file.len()
        + parts.loc_line.map(|line| 1 + dec_len(line)).unwrap_or(0);
    let entity_len = parts.loc_entity.len();
    let ext_len = parts.task_id.map(|_| 4).unwrap_or(0) + parts.scope.map(|_| 10).unwrap_or(0);
    let fixed = HEADER_LEN + 2 + file_len + 2 + entity_len + ext_len;

    // Keep whole components while they fit; if the very first one is
    // already too large, carry a shortened copy of it instead.
    let budget = max_frame.saturating_sub(fixed);
    let mut used = 0usize;
    let mut kept = 0usize;
    let mut partial: Option<Component> = None;
    let mut truncated = false;
    for component in components {
        let len = component_len(component);
        if used + len <= budget {
            used += len;
            kept += 1;
        } else {
            truncated = true;
            if kept == 0 {
                if let Some(cut) = fit_partial(component, budget) {
                    used = component_len(&cut);
                    partial = Some(cut);
                }
            }
            break;
        }
    }

    let count = kept + partial.is_some() as usize;
    let total = fixed + used;
    let mut flag_bits = 0u8;
    if truncated {
        flag_bits |= flags::TRUNCATED;
    }
    if parts.task_id.is_some() {
        flag_bits |= flags::HAS_TASK_ID;
    }
    if parts.scope.is_some() {
        flag_bits |= flags::HAS_SCOPE;
    }

    let mut buf = pool::acquire(total);
    put_u32(&mut buf, total as u32);
    put_u16(&mut buf, count as u16);
    buf.push(parts.severity.rank());
    buf.push(flag_bits);
    put_u64(&mut buf, parts.logger_id);
    put_u64(&mut buf, parts.timestamp_ns);

    put_u16(&mut buf, file_len as u16);
    buf.extend_from_slice(parts.loc_file.as_bytes());
    if let Some(line) = parts.loc_line {
        buf.push(b':');
        push_decimal(&mut buf, line);
    }
    put_u16(&mut buf, entity_len as u16);
    buf.extend_from_slice(parts.loc_entity.as_bytes());
    if let Some(task_id) = parts.task_id {
        put_u32(&mut buf, task_id);
    }
    if let Some((depth, elapsed_ns)) = parts.scope {
        put_u16(&mut buf, depth);
        put_u64(&mut buf, elapsed_ns);
    }

    for component in &components[..kept] {
        put_component(&mut buf, component);
    }
    if let Some(cut) = &partial {
        put_component(&mut buf, cut);
    }
    debug_assert_eq!(buf.len(), total);

    Frame::from_buf(buf)
}

/// Encode a live record into a self-contained frame. Allocates exactly
/// once, from the frame pool; records whose encoding would exceed
/// `max_frame` are truncated and flagged.
pub(crate) fn encode(record: &Record, max_frame: usize) -> Frame {
    let location = record.location();
    encode_parts(
        &Parts {
            logger_id: record.logger_id(),
            severity: record.severity(),
            timestamp_ns: record.timestamp_ns(),
            task_id: Some(record.task_id()),
            scope: record.scope(),
            loc_file: location.file,
            loc_line: Some(location.line),
            loc_entity: location.entity,
        },
        record.components(),
        max_frame,
    )
}

/// Encode an internally synthesized record (overflow and error
/// diagnostics). Logger id 0 marks it as coming from the library.
pub(crate) fn encode_diagnostic(severity: Severity, message: &str) -> Frame {
    encode_parts(
        &Parts {
            logger_id: 0,
            severity,
            timestamp_ns: crate::scope::epoch_nanos(),
            task_id: None,
            scope: None,
            loc_file: "logfan",
            loc_line: None,
            loc_entity: "logfan",
        },
        &[Component::Str(message)],
        DEFAULT_MAX_FRAME,
    )
}

/// Re-encode a decoded frame view into a new owned frame (a frame
/// crossing into a nested async sink).
pub(crate) fn reencode(view: &FrameView) -> Frame {
    let mut buf = pool::acquire(view.buf.len());
    buf.extend_from_slice(view.buf);
    Frame::from_buf(buf)
}

fn get_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(buf.get(at..at + 2)?.try_into().ok()?))
}

fn get_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn get_u64(buf: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(at..at + 8)?.try_into().ok()?))
}

/// A borrowed, decoded view into a frame's bytes. No payload is copied.
pub struct FrameView<'a> {
    buf: &'a [u8],
    severity: Severity,
    flag_bits: u8,
    logger_id: u64,
    timestamp_ns: u64,
    loc_file: &'a str,
    loc_entity: &'a str,
    task_id: Option<u32>,
    scope: Option<(u16, u64)>,
    component_count: u16,
    components_at: usize,
}

impl<'a> FrameView<'a> {
    /// Parse the frame header. A malformed frame is an
    /// encoder/decoder inconsistency: debug builds assert, release
    /// builds get None and the frame is dropped.
    pub fn parse(buf: &'a [u8]) -> Option<FrameView<'a>> {
        let parsed = Self::parse_inner(buf);
        debug_assert!(parsed.is_some() || buf.is_empty(), "malformed frame");
        parsed
    }

    fn parse_inner(buf: &'a [u8]) -> Option<FrameView<'a>> {
        let total = get_u32(buf, 0)? as usize;
        if total != buf.len() || total < HEADER_LEN {
            return None;
        }
        let component_count = get_u16(buf, 4)?;
        let severity = Severity::from_rank(buf[6]);
        let flag_bits = buf[7];
        let logger_id = get_u64(buf, 8)?;
        let timestamp_ns = get_u64(buf, 16)?;

        let mut at = HEADER_LEN;
        let file_len = get_u16(buf, at)? as usize;
        at += 2;
        let loc_file = std::str::from_utf8(buf.get(at..at + file_len)?).ok()?;
        at += file_len;
        let entity_len = get_u16(buf, at)? as usize;
        at += 2;
        let loc_entity = std::str::from_utf8(buf.get(at..at + entity_len)?).ok()?;
        at += entity_len;

        let task_id = if flag_bits & flags::HAS_TASK_ID != 0 {
            let id = get_u32(buf, at)?;
            at += 4;
            Some(id)
        } else {
            None
        };
        let scope = if flag_bits & flags::HAS_SCOPE != 0 {
            let depth = get_u16(buf, at)?;
            let elapsed = get_u64(buf, at + 2)?;
            at += 10;
            Some((depth, elapsed))
        } else {
            None
        };

        Some(FrameView {
            buf,
            severity,
            flag_bits,
            logger_id,
            timestamp_ns,
            loc_file,
            loc_entity,
            task_id,
            scope,
            component_count,
            components_at: at,
        })
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn logger_id(&self) -> u64 {
        self.logger_id
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    /// Source file and line as captured, formatted `file:line`.
    pub fn loc_file(&self) -> &'a str {
        self.loc_file
    }

    pub fn loc_entity(&self) -> &'a str {
        self.loc_entity
    }

    pub fn task_id(&self) -> Option<u32> {
        self.task_id
    }

    pub fn scope(&self) -> Option<(u16, u64)> {
        self.scope
    }

    pub fn truncated(&self) -> bool {
        self.flag_bits & flags::TRUNCATED != 0
    }

    pub fn component_count(&self) -> u16 {
        self.component_count
    }

    pub fn components(&self) -> ComponentIter<'a> {
        ComponentIter {
            buf: self.buf,
            at: self.components_at,
            remaining: self.component_count,
        }
    }
}

pub struct ComponentIter<'a> {
    buf: &'a [u8],
    at: usize,
    remaining: u16,
}

impl<'a> ComponentIter<'a> {
    fn decode_next(&mut self) -> Option<Component<'a>> {
        let kind = *self.buf.get(self.at)?;
        self.at += 1;
        let component = match kind {
            tag::EMPTY => Component::Empty,
            tag::I64 => {
                let v = get_u64(self.buf, self.at)?;
                self.at += 8;
                Component::I64(v as i64)
            }
            tag::F64 => {
                let v = get_u64(self.buf, self.at)?;
                self.at += 8;
                Component::F64(f64::from_bits(v))
            }
            tag::BOOL => {
                let v = *self.buf.get(self.at)?;
                self.at += 1;
                Component::Bool(v != 0)
            }
            tag::STR => {
                let len = get_u32(self.buf, self.at)? as usize;
                self.at += 4;
                let bytes = self.buf.get(self.at..self.at + len)?;
                self.at += len;
                Component::Str(std::str::from_utf8(bytes).ok()?)
            }
            tag::BYTES => {
                let len = get_u32(self.buf, self.at)? as usize;
                self.at += 4;
                let bytes = self.buf.get(self.at..self.at + len)?;
                self.at += len;
                Component::Bytes(bytes)
            }
            tag::ADDRESS => {
                let v = get_u64(self.buf, self.at)?;
                self.at += 8;
                Component::Address(v as usize)
            }
            tag::INSTANT => {
                let v = get_u64(self.buf, self.at)?;
                self.at += 8;
                Component::Instant(v)
            }
            tag::USER => {
                let type_id = get_u16(self.buf, self.at)?;
                let len = get_u32(self.buf, self.at + 2)? as usize;
                self.at += 6;
                let bytes = self.buf.get(self.at..self.at + len)?;
                self.at += len;
                Component::User { type_id, bytes }
            }
            _ => return None,
        };
        Some(component)
    }
}

impl<'a> Iterator for ComponentIter<'a> {
    type Item = Component<'a>;

    fn next(&mut self) -> Option<Component<'a>> {
        if self.remaining == 0 {
            return None;
        }
        match self.decode_next() {
            Some(component) => {
                self.remaining -= 1;
                Some(component)
            }
            None => {
                debug_assert!(false, "malformed component in frame");
                self.remaining = 0;
                None
            }
        }
    }
}
