//! Byte-stuffing for frames on the radio module link.
//!
//! Frames are terminated by a single [`FLAG`] byte. Any flag or escape byte
//! inside the frame is replaced by a two-byte escape sequence:
//!
//! ```text
//! 0x7e  ->  0x7d 0x01
//! 0x7d  ->  0x7d 0x02
//! ```
//!
//! Both directions work in place on a pool [`Buffer`].

use tracing::{error, warn};

use crate::buffer::{Buffer, BUFFER_CAPACITY};

/// Frame terminator.
pub const FLAG: u8 = 0x7e;

/// Escape introducer.
pub const ESC: u8 = 0x7d;

/// Escape code standing for [`FLAG`].
pub const ESCAPED_FLAG: u8 = 0x01;

/// Escape code standing for [`ESC`].
pub const ESCAPED_ESC: u8 = 0x02;

/// Escape `buffer` in place.
///
/// Returns `None`, releasing the buffer, if the escaped frame would not fit.
pub fn escape(mut buffer: Buffer) -> Option<Buffer> {
    let extra = buffer.iter().filter(|&&b| b == FLAG || b == ESC).count();
    if extra == 0 {
        return Some(buffer);
    }

    let escaped_len = buffer.len() + extra;
    if escaped_len > BUFFER_CAPACITY {
        warn!(
            "Framer: escaped frame needs {} bytes, capacity {}",
            escaped_len, BUFFER_CAPACITY
        );
        return None;
    }

    // Walk backwards so every byte is read before it can be overwritten.
    let mut src = buffer.len();
    let mut dst = escaped_len;
    let data = buffer.storage_mut();
    while src > 0 {
        src -= 1;
        match data[src] {
            FLAG => {
                dst -= 2;
                data[dst] = ESC;
                data[dst + 1] = ESCAPED_FLAG;
            }
            ESC => {
                dst -= 2;
                data[dst] = ESC;
                data[dst + 1] = ESCAPED_ESC;
            }
            byte => {
                dst -= 1;
                data[dst] = byte;
            }
        }
    }
    buffer.set_len(escaped_len);
    Some(buffer)
}

/// Decode escape sequences in `buffer` in place.
///
/// An unknown escape code is logged and kept as-is. A lone escape byte at the
/// end of the frame is kept as-is.
pub fn unescape(buffer: &mut Buffer) {
    let len = buffer.len();
    let data = buffer.storage_mut();
    let mut read = 0;
    let mut write = 0;

    while read < len {
        let byte = data[read];
        read += 1;
        if byte != ESC {
            data[write] = byte;
        } else if read < len {
            let code = data[read];
            read += 1;
            data[write] = match code {
                ESCAPED_FLAG => FLAG,
                ESCAPED_ESC => ESC,
                other => {
                    error!("Framer: unknown escape code 0x{:02x}", other);
                    other
                }
            };
        } else {
            error!("Framer: frame ends with a lone escape byte");
            data[write] = byte;
        }
        write += 1;
    }
    buffer.set_len(write);
}

/// Escape and terminate `frame` into a new vector.
///
/// For radio module simulators and bridges that work outside the pool.
pub fn to_wire(frame: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(frame.len() * 2 + 1);
    for &byte in frame {
        match byte {
            FLAG => wire.extend_from_slice(&[ESC, ESCAPED_FLAG]),
            ESC => wire.extend_from_slice(&[ESC, ESCAPED_ESC]),
            other => wire.push(other),
        }
    }
    wire.push(FLAG);
    wire
}
