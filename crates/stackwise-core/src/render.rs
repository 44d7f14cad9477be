//! # Trace Formatting
//!
//! Renders resolved frames as text.
//!
//! ## Line style
//!
//! One line per frame, stable enough to be parsed:
//!
//! ```text
//! #<index> <address> in <name>+0x<offset> at <file>:<line> (<module>)
//! ```
//!
//! - `<address>` is `0x` followed by 16 hex digits
//! - `<name>` is the demangled name, else the raw symbol, else `??`
//! - `+0x<offset>` only when a symbol is known
//! - ` at <file>:<line>` only when a line is known
//! - ` (<module>)` is the module's file name, only when known
//!
//! ## Structured style
//!
//! A bracketed attribute list per frame; unknown attributes are omitted:
//!
//! ```text
//! [
//!  address = 0x401136
//!  library file name = "/usr/bin/demo"
//!  line number = 12
//!  mangled symbol name = "_ZN4demo4main17h0123456789abcdefE"
//!  offset from symbol = 6
//!  source file name = "src/main.rs"
//!  symbol name = "demo::main"
//! ]
//! ```
//!
//! With `spaces_per_level: None` the same list is printed on one line.
//!
//! An incomplete trace ends with the record `... (trace incomplete)`. When
//! output is capped, room for that record is kept back from the frames, so a
//! truncated incomplete trace still says so.
//!
//! Rendering never allocates beyond what the output sink does, so
//! [`TraceFormatter::write_into`] with a stack buffer is safe on the crash
//! path.

use std::fmt::{self, Write};

use crate::capture::Trace;
use crate::types::StackTraceFrame;

/// Record appended to traces that stopped early.
pub const INCOMPLETE_MARKER: &str = "... (trace incomplete)";

/// Layout of each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Style
{
    #[default]
    Line,
    Structured
    {
        /// Indentation level of the opening bracket
        level: usize,
        /// `None` prints each frame on a single line
        spaces_per_level: Option<usize>,
    },
}

/// What to render
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions
{
    pub show_index: bool,
    pub show_module: bool,
    pub show_symbol: bool,
    /// Prefer demangled names over raw symbols
    pub demangle: bool,
    pub show_location: bool,
    /// Cap on output bytes; output is cut at a char boundary
    pub max_len: Option<usize>,
    pub style: Style,
}

impl Default for FormatOptions
{
    fn default() -> Self
    {
        Self {
            show_index: true,
            show_module: true,
            show_symbol: true,
            demangle: true,
            show_location: true,
            max_len: None,
            style: Style::Line,
        }
    }
}

impl FormatOptions
{
    pub fn with_style(mut self, style: Style) -> Self
    {
        self.style = style;
        self
    }

    pub fn with_demangle(mut self, demangle: bool) -> Self
    {
        self.demangle = demangle;
        self
    }

    pub fn with_location(mut self, show_location: bool) -> Self
    {
        self.show_location = show_location;
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self
    {
        self.max_len = Some(max_len);
        self
    }
}

/// Bytes produced by a render call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Written
{
    pub bytes: usize,
    /// Output was cut short by `max_len` or by the buffer size
    pub truncated: bool,
}

/// `fmt::Write` into a fixed byte buffer
///
/// Stops at the first write that does not fit, keeping as much of it as ends
/// on a char boundary.
///
/// ```rust
/// use std::fmt::Write;
/// use stackwise_core::render::FixedWriter;
///
/// let mut buf = [0u8; 8];
/// let mut out = FixedWriter::new(&mut buf);
/// assert!(write!(out, "héllo wörld").is_err());
/// assert_eq!(out.as_str(), "héllo w");
/// assert!(out.is_truncated());
/// ```
#[derive(Debug)]
pub struct FixedWriter<'a>
{
    buf: &'a mut [u8],
    len: usize,
    truncated: bool,
}

impl<'a> FixedWriter<'a>
{
    pub fn new(buf: &'a mut [u8]) -> Self
    {
        Self {
            buf,
            len: 0,
            truncated: false,
        }
    }

    pub fn len(&self) -> usize
    {
        self.len
    }

    pub fn is_empty(&self) -> bool
    {
        self.len == 0
    }

    pub fn is_truncated(&self) -> bool
    {
        self.truncated
    }

    /// The text written so far.
    pub fn as_str(&self) -> &str
    {
        // Only whole chars are ever copied in.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }
}

impl Write for FixedWriter<'_>
{
    fn write_str(&mut self, s: &str) -> fmt::Result
    {
        let remaining = self.buf.len() - self.len;
        let (part, fits) = split_at_boundary(s, remaining);
        self.buf[self.len..self.len + part.len()].copy_from_slice(part.as_bytes());
        self.len += part.len();
        if fits {
            Ok(())
        } else {
            self.truncated = true;
            Err(fmt::Error)
        }
    }
}

/// Longest prefix of `s` that fits in `limit` bytes and ends on a char
/// boundary, and whether that prefix is all of `s`.
fn split_at_boundary(s: &str, limit: usize) -> (&str, bool)
{
    if s.len() <= limit {
        return (s, true);
    }
    let mut cut = limit;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    (&s[..cut], false)
}

/// Byte-capped adapter over any `fmt::Write`
struct Limited<'w, W: Write + ?Sized>
{
    inner: &'w mut W,
    remaining: usize,
    written: usize,
    truncated: bool,
    at_line_start: bool,
}

impl<'w, W: Write + ?Sized> Limited<'w, W>
{
    fn new(inner: &'w mut W, limit: usize) -> Self
    {
        Self {
            inner,
            remaining: limit,
            written: 0,
            truncated: false,
            at_line_start: true,
        }
    }
}

impl<W: Write + ?Sized> Write for Limited<'_, W>
{
    fn write_str(&mut self, s: &str) -> fmt::Result
    {
        let (part, fits) = split_at_boundary(s, self.remaining);
        self.inner.write_str(part)?;
        self.remaining -= part.len();
        self.written += part.len();
        if !part.is_empty() {
            self.at_line_start = part.ends_with('\n');
        }
        if fits {
            Ok(())
        } else {
            self.truncated = true;
            Err(fmt::Error)
        }
    }
}

/// Renders traces according to [`FormatOptions`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceFormatter
{
    options: FormatOptions,
}

impl TraceFormatter
{
    pub fn new(options: FormatOptions) -> Self
    {
        Self { options }
    }

    pub fn options(&self) -> &FormatOptions
    {
        &self.options
    }

    /// Render `trace` into `out`.
    ///
    /// Hitting `max_len` is not an error; it is reported in [`Written`].
    pub fn write<T, W>(&self, trace: &T, out: &mut W) -> Result<Written, fmt::Error>
    where
        T: Trace + ?Sized,
        W: Write + ?Sized,
    {
        self.write_limited(trace, out, self.options.max_len.unwrap_or(usize::MAX))
    }

    /// Render `trace` into a new string.
    pub fn render<T: Trace + ?Sized>(&self, trace: &T) -> String
    {
        let mut text = String::new();
        // Writing into a String only fails on truncation, which `write` absorbs.
        let _ = self.write(trace, &mut text);
        text
    }

    /// Render `trace` into `out` without allocating.
    pub fn write_into<T: Trace + ?Sized>(&self, trace: &T, out: &mut [u8]) -> Written
    {
        let limit = self.options.max_len.map_or(out.len(), |max_len| max_len.min(out.len()));
        let mut fixed = FixedWriter::new(out);
        let written = self.write_limited(trace, &mut fixed, limit).unwrap_or_default();
        Written {
            bytes: fixed.len(),
            truncated: written.truncated || fixed.is_truncated(),
        }
    }

    fn write_limited<T, W>(&self, trace: &T, out: &mut W, limit: usize) -> Result<Written, fmt::Error>
    where
        T: Trace + ?Sized,
        W: Write + ?Sized,
    {
        let reserve = if trace.is_incomplete() { self.marker_len() } else { 0 };
        let mut limited = Limited::new(out, limit.saturating_sub(reserve));

        match self.write_frames(trace, &mut limited) {
            Ok(()) => {}
            Err(_) if limited.truncated => {}
            Err(err) => return Err(err),
        }
        if trace.is_incomplete() {
            limited.remaining = limited.remaining.saturating_add(reserve).min(limit - limited.written);
            match self.write_marker(&mut limited) {
                Ok(()) => {}
                Err(_) if limited.truncated => {}
                Err(err) => return Err(err),
            }
        }

        Ok(Written {
            bytes: limited.written,
            truncated: limited.truncated,
        })
    }

    fn write_frames<T, W>(&self, trace: &T, out: &mut W) -> fmt::Result
    where
        T: Trace + ?Sized,
        W: Write + ?Sized,
    {
        match self.options.style {
            Style::Line => {
                for (i, frame) in trace.frames().iter().enumerate() {
                    if i > 0 {
                        out.write_char('\n')?;
                    }
                    self.write_line_frame(frame, out)?;
                }
            }
            Style::Structured { level, spaces_per_level } => {
                for (i, frame) in trace.frames().iter().enumerate() {
                    if i > 0 && spaces_per_level.is_none() {
                        out.write_char('\n')?;
                    }
                    self.write_structured_frame(frame, level, spaces_per_level, out)?;
                }
            }
        }
        Ok(())
    }

    /// Indentation of the marker, and whether it ends its own line.
    fn marker_layout(&self) -> (usize, bool)
    {
        match self.options.style {
            Style::Structured {
                level,
                spaces_per_level: Some(spaces),
            } => (level * spaces, true),
            _ => (0, false),
        }
    }

    /// Most bytes [`Self::write_marker`] can produce.
    fn marker_len(&self) -> usize
    {
        let (indent, newline) = self.marker_layout();
        1 + indent + INCOMPLETE_MARKER.len() + usize::from(newline)
    }

    fn write_marker<W: Write + ?Sized>(&self, out: &mut Limited<'_, W>) -> fmt::Result
    {
        let (indent, newline) = self.marker_layout();
        if !out.at_line_start {
            out.write_char('\n')?;
        }
        write_indent(out, indent)?;
        out.write_str(INCOMPLETE_MARKER)?;
        if newline {
            out.write_char('\n')?;
        }
        Ok(())
    }

    fn name<'f>(&self, frame: &'f StackTraceFrame) -> Option<&'f str>
    {
        if self.options.demangle {
            frame.display_name()
        } else {
            frame.symbol()
        }
    }

    fn write_line_frame<W: Write + ?Sized>(&self, frame: &StackTraceFrame, out: &mut W) -> fmt::Result
    {
        let options = &self.options;
        if options.show_index {
            write!(out, "#{} ", frame.index())?;
        }
        write!(out, "{}", frame.address())?;

        if options.show_symbol {
            write!(out, " in {}", self.name(frame).unwrap_or("??"))?;
            if let (Some(_), Some(offset)) = (frame.symbol(), frame.symbol_offset()) {
                write!(out, "+0x{offset:x}")?;
            }
        }
        if options.show_location {
            if let (Some(file), Some(line)) = (frame.source_file(), frame.line()) {
                write!(out, " at {file}:{line}")?;
            }
        }
        if options.show_module {
            if let Some(module) = frame.module() {
                write!(out, " ({})", module.name())?;
            }
        }
        Ok(())
    }

    fn write_structured_frame<W: Write + ?Sized>(
        &self,
        frame: &StackTraceFrame,
        level: usize,
        spaces_per_level: Option<usize>,
        out: &mut W,
    ) -> fmt::Result
    {
        let options = &self.options;
        let mut fields = StructuredFields {
            out,
            spaces_per_level,
            attribute_indent: spaces_per_level.map_or(0, |spaces| (level + 1) * spaces),
        };

        write_indent(fields.out, spaces_per_level.map_or(0, |spaces| level * spaces))?;
        fields.out.write_char('[')?;
        fields.attribute(format_args!("address = 0x{:x}", frame.address().value()))?;
        if options.show_module {
            if let Some(module) = frame.module() {
                fields.attribute(format_args!("library file name = \"{}\"", module.path().display()))?;
            }
        }
        if options.show_location {
            if let Some(line) = frame.line() {
                fields.attribute(format_args!("line number = {line}"))?;
            }
        }
        if options.show_symbol {
            if let Some(symbol) = frame.symbol() {
                fields.attribute(format_args!("mangled symbol name = \"{symbol}\""))?;
            }
            if let Some(offset) = frame.symbol_offset() {
                fields.attribute(format_args!("offset from symbol = {offset}"))?;
            }
        }
        if options.show_location {
            if let Some(file) = frame.source_file() {
                fields.attribute(format_args!("source file name = \"{file}\""))?;
            }
        }
        if options.show_symbol {
            if let Some(name) = self.name(frame) {
                fields.attribute(format_args!("symbol name = \"{name}\""))?;
            }
        }

        match spaces_per_level {
            Some(spaces) => {
                fields.out.write_char('\n')?;
                write_indent(fields.out, level * spaces)?;
                fields.out.write_str("]\n")
            }
            None => fields.out.write_str(" ]"),
        }
    }
}

struct StructuredFields<'o, W: Write + ?Sized>
{
    out: &'o mut W,
    spaces_per_level: Option<usize>,
    attribute_indent: usize,
}

impl<W: Write + ?Sized> StructuredFields<'_, W>
{
    fn attribute(&mut self, text: fmt::Arguments<'_>) -> fmt::Result
    {
        match self.spaces_per_level {
            Some(_) => {
                self.out.write_char('\n')?;
                write_indent(self.out, self.attribute_indent)?;
            }
            None => self.out.write_char(' ')?,
        }
        self.out.write_fmt(text)
    }
}

fn write_indent<W: Write + ?Sized>(out: &mut W, width: usize) -> fmt::Result
{
    for _ in 0..width {
        out.write_char(' ')?;
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::capture::CaptureResult;
    use crate::types::Address;

    fn bare(incomplete: bool) -> CaptureResult
    {
        CaptureResult::new(
            vec![
                StackTraceFrame::new(0, Address::from(0x40_1000)),
                StackTraceFrame::new(1, Address::from(0x40_2000)),
            ],
            incomplete,
        )
    }

    #[test]
    fn test_line_style_omits_unknown_fields()
    {
        let text = TraceFormatter::default().render(&bare(false));
        assert_eq!(text, "#0 0x0000000000401000 in ??\n#1 0x0000000000402000 in ??");
    }

    #[test]
    fn test_incomplete_marker_is_last_record()
    {
        let text = TraceFormatter::default().render(&bare(true));
        assert!(text.ends_with("\n... (trace incomplete)"));

        let empty = TraceFormatter::default().render(&CaptureResult::new(Vec::new(), true));
        assert_eq!(empty, INCOMPLETE_MARKER);
    }

    #[test]
    fn test_structured_single_line()
    {
        let options = FormatOptions::default().with_style(Style::Structured {
            level: 0,
            spaces_per_level: None,
        });
        let text = TraceFormatter::new(options).render(&CaptureResult::new(
            vec![StackTraceFrame::new(0, Address::from(0xabcd_ef01))],
            false,
        ));
        assert_eq!(text, "[ address = 0xabcdef01 ]");
    }

    #[test]
    fn test_structured_indented()
    {
        let options = FormatOptions::default().with_style(Style::Structured {
            level: 1,
            spaces_per_level: Some(2),
        });
        let text = TraceFormatter::new(options).render(&CaptureResult::new(
            vec![StackTraceFrame::new(0, Address::from(0xabcd_ef01))],
            false,
        ));
        assert_eq!(text, "  [\n    address = 0xabcdef01\n  ]\n");
    }

    #[test]
    fn test_max_len_truncates()
    {
        let formatter = TraceFormatter::new(FormatOptions::default().with_max_len(10));
        let mut text = String::new();
        let written = formatter.write(&bare(false), &mut text).unwrap();
        assert_eq!(text, "#0 0x00000");
        assert_eq!(written, Written { bytes: 10, truncated: true });
    }

    #[test]
    fn test_write_into_small_buffer()
    {
        let mut buf = [0u8; 16];
        let written = TraceFormatter::default().write_into(&bare(false), &mut buf);
        assert_eq!(written.bytes, 16);
        assert!(written.truncated);
        assert_eq!(&buf, b"#0 0x00000000004");
    }

    #[test]
    fn test_truncated_incomplete_trace_keeps_marker()
    {
        let mut buf = [0u8; 40];
        let written = TraceFormatter::default().write_into(&bare(true), &mut buf);
        assert!(written.truncated);
        let text = std::str::from_utf8(&buf[..written.bytes]).unwrap();
        assert_eq!(text, "#0 0x000000000040\n... (trace incomplete)");

        let formatter = TraceFormatter::new(FormatOptions::default().with_max_len(40));
        let text = formatter.render(&bare(true));
        assert_eq!(text.len(), 40);
        assert!(text.ends_with("\n... (trace incomplete)"));
    }

    #[test]
    fn test_marker_alone_when_nothing_else_fits()
    {
        let formatter = TraceFormatter::new(FormatOptions::default().with_max_len(INCOMPLETE_MARKER.len() + 1));
        assert_eq!(formatter.render(&bare(true)), INCOMPLETE_MARKER);
    }

    #[test]
    fn test_truncated_structured_marker_on_own_line()
    {
        let options = FormatOptions::default()
            .with_style(Style::Structured {
                level: 0,
                spaces_per_level: Some(1),
            })
            .with_max_len(40);
        let text = TraceFormatter::new(options).render(&bare(true));
        assert!(text.ends_with("\n... (trace incomplete)\n"), "{text:?}");
        assert!(text.len() <= 40);
    }
}
