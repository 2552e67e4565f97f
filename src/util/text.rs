use std::borrow::Cow;

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const ELLIPSIS: &str = "...";
const ELLIPSIS_WIDTH: usize = 3;

/// Terminal columns occupied by `s` (CJK and emoji count as 2).
pub fn display_width(s: &str) -> usize {
    UnicodeWidthStr::width(s)
}

/// Shortens `s` to at most `max_width` columns, ending in `...` when cut.
///
/// Widths of 3 or less have no room for the ellipsis, so the text is simply
/// clipped. Borrows when nothing needs to change.
pub fn truncate_to_width(s: &str, max_width: usize) -> Cow<'_, str> {
    if display_width(s) <= max_width {
        return Cow::Borrowed(s);
    }

    let (budget, suffix) = if max_width <= ELLIPSIS_WIDTH {
        (max_width, "")
    } else {
        (max_width - ELLIPSIS_WIDTH, ELLIPSIS)
    };

    let mut used = 0;
    let mut end = 0;
    for (idx, c) in s.char_indices() {
        let w = UnicodeWidthChar::width(c).unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        end = idx + c.len_utf8();
    }

    Cow::Owned(format!("{}{}", &s[..end], suffix))
}

/// Truncates then right-pads with spaces to exactly `width` columns.
///
/// `format!("{:<n}")` pads by char count, which misaligns wide glyphs.
pub fn pad_to_width(s: &str, width: usize) -> String {
    let cell = truncate_to_width(s, width);
    let fill = width.saturating_sub(display_width(&cell));
    let mut out = String::with_capacity(cell.len() + fill);
    out.push_str(&cell);
    out.extend(std::iter::repeat(' ').take(fill));
    out
}

fn is_stripped_control(b: u8) -> bool {
    b == 0x7f || (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
}

/// Removes terminal control bytes and ANSI escape sequences from feed text.
///
/// Feed titles and names end up printed straight to the terminal, so CSI
/// (`ESC [ ... final`) and OSC (`ESC ] ... BEL|ST`) sequences are dropped
/// whole. Tab, newline and carriage return survive.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    if !bytes.iter().any(|&b| b == 0x1b || is_stripped_control(b)) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            0x1b => {
                i += 1;
                match bytes.get(i) {
                    Some(b'[') => {
                        i += 1;
                        while i < bytes.len() {
                            let c = bytes[i];
                            i += 1;
                            if (0x40..=0x7e).contains(&c) {
                                break;
                            }
                        }
                    }
                    Some(b']') => {
                        i += 1;
                        while i < bytes.len() {
                            if bytes[i] == 0x07 {
                                i += 1;
                                break;
                            }
                            if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                                i += 2;
                                break;
                            }
                            i += 1;
                        }
                    }
                    _ => {}
                }
            }
            b if is_stripped_control(b) => i += 1,
            _ => {
                let start = i;
                while i < bytes.len() && bytes[i] != 0x1b && !is_stripped_control(bytes[i]) {
                    i += 1;
                }
                // Only ASCII bytes end a run, so the slice is on a char boundary
                out.push_str(&s[start..i]);
            }
        }
    }

    Cow::Owned(out)
}
