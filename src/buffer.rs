//! `BufferPayload` binary codec (spec §4.6): a fixed 32-byte little-endian
//! header, one tag byte per row, and a variable-length cell stream within
//! content rows. Shared by the snapshot REST endpoint and the Buffer
//! Aggregator's WebSocket data frames.

use crate::protocol::{Attrs, BufferSnapshot, Cell, Color};

const MAGIC: u16 = 0x5654; // "VT"
const VERSION: u8 = 0x01;
const HEADER_LEN: usize = 32;

const ROW_EMPTY: u8 = 0xFE;
const ROW_CONTENT: u8 = 0xFD;

const TYPE_WIDE: u8 = 0b0000_0001;
const FG_MODE_MASK: u8 = 0b0000_0110;
const FG_MODE_SHIFT: u8 = 1;
const BG_MODE_MASK: u8 = 0b0001_1000;
const BG_MODE_SHIFT: u8 = 3;
const ATTRS_PRESENT: u8 = 0b0010_0000;

const COLOR_MODE_DEFAULT: u8 = 0;
const COLOR_MODE_INDEXED: u8 = 1;
const COLOR_MODE_RGB: u8 = 2;

/// Encodes a snapshot into a `BufferPayload` (no WS frame wrapper).
#[must_use]
pub fn encode(snapshot: &BufferSnapshot) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + (snapshot.rows as usize) * 8);

    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.push(VERSION);
    out.push(0); // flags
    out.extend_from_slice(&snapshot.cols.to_le_bytes());
    out.extend_from_slice(&snapshot.rows.to_le_bytes());
    out.extend_from_slice(&snapshot.cursor_x.to_le_bytes());
    out.extend_from_slice(&snapshot.cursor_y.to_le_bytes());
    out.extend_from_slice(&snapshot.viewport_y.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved
    debug_assert_eq!(out.len(), HEADER_LEN);

    for row in &snapshot.grid {
        if row.is_empty() {
            out.push(ROW_EMPTY);
            continue;
        }
        out.push(ROW_CONTENT);
        for cell in row {
            encode_cell(&mut out, cell);
        }
    }

    out
}

fn encode_cell(out: &mut Vec<u8>, cell: &Cell) {
    let wide = u32::from(cell.codepoint) > 0x7F;
    let (fg_mode, fg_bytes) = color_mode(cell.fg);
    let (bg_mode, bg_bytes) = color_mode(cell.bg);
    let has_attrs = !cell.attrs.is_empty();

    let mut type_byte = 0u8;
    if wide {
        type_byte |= TYPE_WIDE;
    }
    type_byte |= fg_mode << FG_MODE_SHIFT;
    type_byte |= bg_mode << BG_MODE_SHIFT;
    if has_attrs {
        type_byte |= ATTRS_PRESENT;
    }
    out.push(type_byte);

    if wide {
        out.extend_from_slice(&(cell.codepoint as u32).to_le_bytes());
    } else {
        out.push(cell.codepoint as u8);
    }

    write_color_bytes(out, cell.fg, fg_bytes);
    write_color_bytes(out, cell.bg, bg_bytes);

    if has_attrs {
        out.push(encode_attrs(cell.attrs));
    }
}

const fn color_mode(color: Color) -> (u8, usize) {
    match color {
        Color::Default => (COLOR_MODE_DEFAULT, 0),
        Color::Indexed(_) => (COLOR_MODE_INDEXED, 1),
        Color::Rgb(..) => (COLOR_MODE_RGB, 3),
    }
}

fn write_color_bytes(out: &mut Vec<u8>, color: Color, expected_len: usize) {
    match color {
        Color::Default => debug_assert_eq!(expected_len, 0),
        Color::Indexed(i) => out.push(i),
        Color::Rgb(r, g, b) => out.extend_from_slice(&[r, g, b]),
    }
}

const fn encode_attrs(attrs: Attrs) -> u8 {
    let mut byte = 0u8;
    if attrs.bold {
        byte |= 1 << 0;
    }
    if attrs.italic {
        byte |= 1 << 1;
    }
    if attrs.underline {
        byte |= 1 << 2;
    }
    if attrs.inverse {
        byte |= 1 << 3;
    }
    if attrs.dim {
        byte |= 1 << 4;
    }
    if attrs.invisible {
        byte |= 1 << 5;
    }
    if attrs.strikethrough {
        byte |= 1 << 6;
    }
    byte
}

const fn decode_attrs(byte: u8) -> Attrs {
    Attrs {
        bold: byte & (1 << 0) != 0,
        italic: byte & (1 << 1) != 0,
        underline: byte & (1 << 2) != 0,
        inverse: byte & (1 << 3) != 0,
        dim: byte & (1 << 4) != 0,
        invisible: byte & (1 << 5) != 0,
        strikethrough: byte & (1 << 6) != 0,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload too short")]
    Truncated,
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("bad row tag {0:#x}")]
    BadRowTag(u8),
}

/// Reconstructs a `BufferSnapshot` from a `BufferPayload`. Every receiver
/// must be able to do this from the payload alone (spec §4.6).
pub fn decode(bytes: &[u8]) -> Result<BufferSnapshot, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
    if magic != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = bytes[2];
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let cols = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let rows = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let cursor_x = i32::from_le_bytes(bytes[12..16].try_into().unwrap());
    let cursor_y = i32::from_le_bytes(bytes[16..20].try_into().unwrap());
    let viewport_y = i32::from_le_bytes(bytes[20..24].try_into().unwrap());

    let mut cursor = HEADER_LEN;
    let mut grid = Vec::with_capacity(rows as usize);
    for _ in 0..rows {
        let tag = *bytes.get(cursor).ok_or(DecodeError::Truncated)?;
        cursor += 1;
        match tag {
            ROW_EMPTY => grid.push(Vec::new()),
            ROW_CONTENT => {
                let mut cells = Vec::with_capacity(cols as usize);
                for _ in 0..cols {
                    let (cell, consumed) = decode_cell(&bytes[cursor..])?;
                    cells.push(cell);
                    cursor += consumed;
                }
                grid.push(cells);
            }
            other => return Err(DecodeError::BadRowTag(other)),
        }
    }

    Ok(BufferSnapshot {
        cols,
        rows,
        cursor_x,
        cursor_y,
        viewport_y,
        grid,
    })
}

fn decode_cell(bytes: &[u8]) -> Result<(Cell, usize), DecodeError> {
    let type_byte = *bytes.first().ok_or(DecodeError::Truncated)?;
    let mut offset = 1;

    let wide = type_byte & TYPE_WIDE != 0;
    let codepoint = if wide {
        let raw = u32::from_le_bytes(
            bytes
                .get(offset..offset + 4)
                .ok_or(DecodeError::Truncated)?
                .try_into()
                .unwrap(),
        );
        offset += 4;
        char::from_u32(raw).unwrap_or(' ')
    } else {
        let byte = *bytes.get(offset).ok_or(DecodeError::Truncated)?;
        offset += 1;
        char::from(byte)
    };

    let fg_mode = (type_byte & FG_MODE_MASK) >> FG_MODE_SHIFT;
    let (fg, consumed) = decode_color(bytes, offset, fg_mode)?;
    offset += consumed;

    let bg_mode = (type_byte & BG_MODE_MASK) >> BG_MODE_SHIFT;
    let (bg, consumed) = decode_color(bytes, offset, bg_mode)?;
    offset += consumed;

    let attrs = if type_byte & ATTRS_PRESENT != 0 {
        let byte = *bytes.get(offset).ok_or(DecodeError::Truncated)?;
        offset += 1;
        decode_attrs(byte)
    } else {
        Attrs::empty()
    };

    Ok((
        Cell {
            codepoint,
            fg,
            bg,
            attrs,
        },
        offset,
    ))
}

fn decode_color(bytes: &[u8], offset: usize, mode: u8) -> Result<(Color, usize), DecodeError> {
    match mode {
        COLOR_MODE_DEFAULT => Ok((Color::Default, 0)),
        COLOR_MODE_INDEXED => {
            let i = *bytes.get(offset).ok_or(DecodeError::Truncated)?;
            Ok((Color::Indexed(i), 1))
        }
        COLOR_MODE_RGB => {
            let slice = bytes.get(offset..offset + 3).ok_or(DecodeError::Truncated)?;
            Ok((Color::Rgb(slice[0], slice[1], slice[2]), 3))
        }
        _ => Ok((Color::Default, 0)),
    }
}

/// Wraps an encoded `BufferPayload` in the WebSocket data-frame envelope:
/// `0xBF` magic, `idLen` byte, session id bytes, then the payload.
#[must_use]
pub fn wrap_frame(session_id: &str, payload: &[u8]) -> Vec<u8> {
    let id_bytes = session_id.as_bytes();
    let mut frame = Vec::with_capacity(2 + id_bytes.len() + payload.len());
    frame.push(0xBF);
    frame.push(id_bytes.len() as u8);
    frame.extend_from_slice(id_bytes);
    frame.extend_from_slice(payload);
    frame
}

/// Unwraps a WebSocket data frame into `(sessionId, payload)`.
pub fn unwrap_frame(frame: &[u8]) -> Result<(&str, &[u8]), DecodeError> {
    if frame.len() < 2 || frame[0] != 0xBF {
        return Err(DecodeError::BadMagic);
    }
    let id_len = frame[1] as usize;
    let id_bytes = frame.get(2..2 + id_len).ok_or(DecodeError::Truncated)?;
    let session_id = std::str::from_utf8(id_bytes).map_err(|_| DecodeError::Truncated)?;
    Ok((session_id, &frame[2 + id_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> BufferSnapshot {
        BufferSnapshot {
            cols: 3,
            rows: 2,
            cursor_x: 1,
            cursor_y: 0,
            viewport_y: 0,
            grid: vec![
                vec![
                    Cell {
                        codepoint: 'h',
                        fg: Color::Indexed(2),
                        bg: Color::Default,
                        attrs: Attrs {
                            bold: true,
                            ..Attrs::empty()
                        },
                    },
                    Cell {
                        codepoint: 'i',
                        fg: Color::Rgb(10, 20, 30),
                        bg: Color::Rgb(1, 2, 3),
                        attrs: Attrs::empty(),
                    },
                    Cell::default(),
                ],
                Vec::new(),
            ],
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let snapshot = sample_snapshot();
        let encoded = encode(&snapshot);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn empty_row_is_single_tag_byte() {
        let snapshot = sample_snapshot();
        let encoded = encode(&snapshot);
        // header(32) + content row(1 tag + 3 cells) then empty row tag.
        let decoded = decode(&encoded).unwrap();
        assert!(decoded.grid[1].is_empty());
    }

    #[test]
    fn header_fields_round_trip() {
        let snapshot = sample_snapshot();
        let encoded = encode(&snapshot);
        assert_eq!(u16::from_le_bytes([encoded[0], encoded[1]]), MAGIC);
        assert_eq!(encoded[2], VERSION);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.cols, 3);
        assert_eq!(decoded.rows, 2);
        assert_eq!(decoded.cursor_x, 1);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let err = decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated));
    }

    #[test]
    fn frame_wrap_unwrap_round_trips() {
        let payload = encode(&sample_snapshot());
        let frame = wrap_frame("sess-123", &payload);
        let (id, unwrapped) = unwrap_frame(&frame).unwrap();
        assert_eq!(id, "sess-123");
        assert_eq!(unwrapped, payload.as_slice());
    }
}
