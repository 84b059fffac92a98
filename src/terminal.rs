//! Terminal screen model (C3): wraps `vt100::Parser` for ANSI/VT100
//! emulation and encodes/decodes the binary `BufferSnapshot` wire format.
//!
//! The emulation itself (bold/italic/underline/inverse, 16/256/RGB color,
//! wide characters, alternate screen) is `vt100`'s problem; `BufferSnapshot`'s
//! byte layout below is bespoke since no off-the-shelf crate speaks it.

use vt100::Parser;

const MAGIC: u16 = 0x5654;
const VERSION: u8 = 0x01;

const TOKEN_EXTENDED: u8 = 0xFD;
const TOKEN_BLANK_RUN: u8 = 0xFE;
const TOKEN_REPEAT_RUN: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellColor {
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalCell {
    pub ch: String,
    pub wide: bool,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub inverse: bool,
    pub dim: bool,
    pub blink: bool,
    pub strikethrough: bool,
    pub fg: CellColor,
    pub bg: CellColor,
}

impl TerminalCell {
    fn blank() -> Self {
        Self {
            ch: " ".to_string(),
            wide: false,
            bold: false,
            italic: false,
            underline: false,
            inverse: false,
            dim: false,
            blink: false,
            strikethrough: false,
            fg: CellColor::Default,
            bg: CellColor::Default,
        }
    }

    /// The second cell of a double-wide character: a trailer marker.
    /// Distinct from `blank()` so a decoder can tell "nothing here" from
    /// "the wide glyph to my left occupies me too", and so the cell count
    /// for a row with wide characters still adds up to `cols`.
    fn trailer() -> Self {
        Self {
            ch: "\0".to_string(),
            ..Self::blank()
        }
    }

    fn attr_byte(&self) -> u8 {
        let mut attr = 0u8;
        if self.bold {
            attr |= 1;
        }
        if self.italic {
            attr |= 2;
        }
        if self.underline {
            attr |= 4;
        }
        if self.inverse {
            attr |= 8;
        }
        if self.dim {
            attr |= 16;
        }
        if self.blink {
            attr |= 32;
        }
        if self.strikethrough {
            attr |= 64;
        }
        if self.wide {
            attr |= 128;
        }
        attr
    }

    fn from_attr_byte(attr: u8, ch: String, fg: CellColor, bg: CellColor) -> Self {
        Self {
            ch,
            wide: attr & 128 != 0,
            bold: attr & 1 != 0,
            italic: attr & 2 != 0,
            underline: attr & 4 != 0,
            inverse: attr & 8 != 0,
            dim: attr & 16 != 0,
            blink: attr & 32 != 0,
            strikethrough: attr & 64 != 0,
            fg,
            bg,
        }
    }

    /// A basic cell fits in 4 bytes iff its character is printable ASCII and
    /// both colors are either default or an indexed palette entry < 255.
    fn is_basic(&self) -> bool {
        self.ch.len() == 1
            && self.ch.as_bytes()[0].is_ascii()
            && self.ch.as_bytes()[0] < TOKEN_EXTENDED
            && matches!(self.fg, CellColor::Default | CellColor::Indexed(0..=254))
            && matches!(self.bg, CellColor::Default | CellColor::Indexed(0..=254))
    }
}

pub struct BufferSnapshot {
    pub cols: u16,
    pub rows: u16,
    pub viewport_y: u16,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub cells: Vec<TerminalCell>,
}

impl BufferSnapshot {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.cells.len());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.push(VERSION);
        out.push(0); // flags: bit0 (delta) always unset, we only emit full snapshots
        out.extend_from_slice(&self.cols.to_le_bytes());
        out.extend_from_slice(&self.rows.to_le_bytes());
        out.extend_from_slice(&self.viewport_y.to_le_bytes());
        out.extend_from_slice(&self.cursor_x.to_le_bytes());
        out.extend_from_slice(&self.cursor_y.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // reserved

        let mut i = 0;
        while i < self.cells.len() {
            let cell = &self.cells[i];

            if cell == &TerminalCell::blank() {
                let mut run = 1u16;
                while i + (run as usize) < self.cells.len()
                    && run < 255
                    && self.cells[i + run as usize] == TerminalCell::blank()
                {
                    run += 1;
                }
                out.push(TOKEN_BLANK_RUN);
                out.push(run as u8);
                i += run as usize;
                continue;
            }

            encode_cell(&mut out, cell);
            i += 1;

            let mut run = 0u16;
            while i + (run as usize) < self.cells.len()
                && run < 255
                && &self.cells[i + run as usize] == cell
            {
                run += 1;
            }
            if run > 0 {
                out.push(TOKEN_REPEAT_RUN);
                out.push(run as u8);
                i += run as usize;
            }
        }

        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 16 {
            return None;
        }
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        if magic != MAGIC {
            return None;
        }
        let _version = bytes[2];
        let _flags = bytes[3];
        let cols = u16::from_le_bytes([bytes[4], bytes[5]]);
        let rows = u16::from_le_bytes([bytes[6], bytes[7]]);
        let viewport_y = u16::from_le_bytes([bytes[8], bytes[9]]);
        let cursor_x = u16::from_le_bytes([bytes[10], bytes[11]]);
        let cursor_y = u16::from_le_bytes([bytes[12], bytes[13]]);

        let total = rows as usize * cols as usize;
        let mut cells = Vec::with_capacity(total);
        let body = &bytes[16..];
        let mut pos = 0usize;
        let mut last_cell: Option<TerminalCell> = None;

        while cells.len() < total && pos < body.len() {
            let tag = body[pos];
            match tag {
                TOKEN_BLANK_RUN => {
                    let count = *body.get(pos + 1)?;
                    pos += 2;
                    for _ in 0..count {
                        cells.push(TerminalCell::blank());
                    }
                    last_cell = Some(TerminalCell::blank());
                }
                TOKEN_REPEAT_RUN => {
                    let count = *body.get(pos + 1)?;
                    pos += 2;
                    let cell = last_cell.clone()?;
                    for _ in 0..count {
                        cells.push(cell.clone());
                    }
                }
                TOKEN_EXTENDED => {
                    let (cell, consumed) = decode_extended(&body[pos + 1..])?;
                    pos += 1 + consumed;
                    cells.push(cell.clone());
                    last_cell = Some(cell);
                }
                ch => {
                    let attr = *body.get(pos + 1)?;
                    let fg = decode_basic_color(*body.get(pos + 2)?);
                    let bg = decode_basic_color(*body.get(pos + 3)?);
                    pos += 4;
                    let cell =
                        TerminalCell::from_attr_byte(attr, (ch as char).to_string(), fg, bg);
                    cells.push(cell.clone());
                    last_cell = Some(cell);
                }
            }
        }

        Some(Self {
            cols,
            rows,
            viewport_y,
            cursor_x,
            cursor_y,
            cells,
        })
    }
}

fn encode_basic_color(color: CellColor) -> u8 {
    match color {
        CellColor::Default => 0,
        CellColor::Indexed(idx) => idx.saturating_add(1),
        CellColor::Rgb(..) => unreachable!("is_basic() excludes rgb colors"),
    }
}

fn decode_basic_color(byte: u8) -> CellColor {
    if byte == 0 {
        CellColor::Default
    } else {
        CellColor::Indexed(byte - 1)
    }
}

fn encode_cell(out: &mut Vec<u8>, cell: &TerminalCell) {
    if cell.is_basic() {
        out.push(cell.ch.as_bytes()[0]);
        out.push(cell.attr_byte());
        out.push(encode_basic_color(cell.fg));
        out.push(encode_basic_color(cell.bg));
    } else {
        out.push(TOKEN_EXTENDED);
        let ch_bytes = cell.ch.as_bytes();
        out.push(ch_bytes.len() as u8);
        out.extend_from_slice(ch_bytes);
        out.push(cell.attr_byte());
        encode_extended_color(out, cell.fg);
        encode_extended_color(out, cell.bg);
    }
}

fn encode_extended_color(out: &mut Vec<u8>, color: CellColor) {
    match color {
        CellColor::Default => out.push(0),
        CellColor::Indexed(idx) => {
            out.push(1);
            out.push(idx);
        }
        CellColor::Rgb(r, g, b) => {
            out.push(2);
            out.extend_from_slice(&[r, g, b]);
        }
    }
}

fn decode_extended_color(body: &[u8]) -> Option<(CellColor, usize)> {
    match *body.first()? {
        0 => Some((CellColor::Default, 1)),
        1 => Some((CellColor::Indexed(*body.get(1)?), 2)),
        2 => Some((
            CellColor::Rgb(*body.get(1)?, *body.get(2)?, *body.get(3)?),
            4,
        )),
        _ => None,
    }
}

fn decode_extended(body: &[u8]) -> Option<(TerminalCell, usize)> {
    let len = *body.first()? as usize;
    let ch = std::str::from_utf8(body.get(1..1 + len)?).ok()?.to_string();
    let mut pos = 1 + len;
    let attr = *body.get(pos)?;
    pos += 1;
    let (fg, fg_len) = decode_extended_color(&body[pos..])?;
    pos += fg_len;
    let (bg, bg_len) = decode_extended_color(&body[pos..])?;
    pos += bg_len;
    Some((TerminalCell::from_attr_byte(attr, ch, fg, bg), pos))
}

fn convert_color(color: vt100::Color) -> CellColor {
    match color {
        vt100::Color::Default => CellColor::Default,
        vt100::Color::Idx(n) => CellColor::Indexed(n),
        vt100::Color::Rgb(r, g, b) => CellColor::Rgb(r, g, b),
    }
}

/// Owns a `vt100::Parser` and produces `BufferSnapshot`/plain-text views on
/// demand. One instance per session, fed sequentially by that session's
/// reader thread — never shared across threads concurrently.
pub struct TerminalModel {
    parser: Parser,
}

impl TerminalModel {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: Parser::new(rows, cols, 0),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.parser.set_size(rows, cols);
    }

    pub fn size(&self) -> (u16, u16) {
        self.parser.screen().size()
    }

    pub fn lines(&self) -> Vec<String> {
        let screen = self.parser.screen();
        let (rows, cols) = screen.size();
        screen.rows(0, cols).take(rows as usize).collect()
    }

    pub fn cursor_position(&self) -> (u16, u16, bool) {
        let screen = self.parser.screen();
        let (row, col) = screen.cursor_position();
        (col, row, !screen.hide_cursor())
    }

    pub fn snapshot(&self, viewport_y: u16) -> BufferSnapshot {
        let screen = self.parser.screen();
        let (rows, cols) = screen.size();
        let (cursor_x, cursor_y, _visible) = self.cursor_position();

        let mut cells = Vec::with_capacity(rows as usize * cols as usize);
        for row in 0..rows {
            for col in 0..cols {
                let Some(vt_cell) = screen.cell(row, col) else {
                    cells.push(TerminalCell::blank());
                    continue;
                };
                if vt_cell.is_wide_continuation() {
                    cells.push(TerminalCell::trailer());
                    continue;
                }
                cells.push(TerminalCell {
                    ch: if vt_cell.contents().is_empty() {
                        " ".to_string()
                    } else {
                        vt_cell.contents().clone()
                    },
                    wide: vt_cell.is_wide(),
                    bold: vt_cell.bold(),
                    italic: vt_cell.italic(),
                    underline: vt_cell.underline(),
                    inverse: vt_cell.inverse(),
                    dim: false,
                    blink: false,
                    strikethrough: false,
                    fg: convert_color(vt_cell.fgcolor()),
                    bg: convert_color(vt_cell.bgcolor()),
                });
            }
        }

        BufferSnapshot {
            cols,
            rows,
            viewport_y,
            cursor_x,
            cursor_y,
            cells,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feeds_plain_text_into_lines() {
        let mut term = TerminalModel::new(24, 80);
        term.feed(b"hello world\r\n");
        let lines = term.lines();
        assert!(lines[0].starts_with("hello world"));
    }

    #[test]
    fn snapshot_round_trips_through_binary_encoding() {
        let mut term = TerminalModel::new(4, 10);
        term.feed(b"hi\x1b[1mbold\x1b[0m");
        let snapshot = term.snapshot(0);
        let bytes = snapshot.encode();
        let decoded = BufferSnapshot::decode(&bytes).unwrap();

        assert_eq!(decoded.cols, snapshot.cols);
        assert_eq!(decoded.rows, snapshot.rows);
        assert_eq!(decoded.cursor_x, snapshot.cursor_x);
        assert_eq!(decoded.cursor_y, snapshot.cursor_y);
        assert_eq!(decoded.cells.len(), snapshot.cells.len());
        for (a, b) in decoded.cells.iter().zip(snapshot.cells.iter()) {
            assert_eq!(a.ch, b.ch);
            assert_eq!(a.bold, b.bold);
        }
    }

    #[test]
    fn resize_updates_reported_size() {
        let mut term = TerminalModel::new(24, 80);
        term.resize(30, 100);
        assert_eq!(term.size(), (30, 100));
    }

    #[test]
    fn wide_characters_keep_snapshot_cell_count_at_rows_times_cols() {
        let mut term = TerminalModel::new(3, 10);
        term.feed("\u{4F60}\u{597D}".as_bytes()); // two CJK wide glyphs
        let snapshot = term.snapshot(0);
        assert_eq!(snapshot.cells.len(), 3 * 10);

        let bytes = snapshot.encode();
        let decoded = BufferSnapshot::decode(&bytes).unwrap();
        assert_eq!(decoded.cells.len(), snapshot.cells.len());
        assert!(decoded.cells[0].wide);
        assert_eq!(decoded.cells[1].ch, "\0");
    }
}
