//! Control-sequence stripping for output scanning.
//!
//! The retry scanner matches failure phrases against CLI output, and those
//! CLIs colorize and reposition everything. This removes CSI and OSC
//! sequences plus the short ESC forms so that substring matching sees the
//! words, not the paint.

/// Strip escape sequences from raw PTY output, lossily decoding to text.
pub fn strip_control_sequences(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\x1b' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            // CSI: parameters and intermediates end at the final byte.
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: runs to BEL or ST (ESC \).
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\x07' {
                        break;
                    }
                    if c == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            // Charset designation takes one more byte.
            Some('(') | Some(')') | Some('*') | Some('+') => {
                chars.next();
                chars.next();
            }
            // Any other ESC form is a two-byte sequence.
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }

    result
}
