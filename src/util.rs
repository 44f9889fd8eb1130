const HEX: &[u8; 16] = b"0123456789abcdef";
const ID_SUFFIX_LEN: usize = 24;

/// Synthesize a `tool_use` id for calls the backend did not name.
#[inline]
pub(crate) fn next_tool_use_id() -> String {
    prefixed_random_id("toolu_")
}

/// Synthesize a message id for `message_start`.
#[inline]
pub(crate) fn next_message_id() -> String {
    prefixed_random_id("msg_")
}

fn prefixed_random_id(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + ID_SUFFIX_LEN);
    out.push_str(prefix);
    for _ in 0..ID_SUFFIX_LEN {
        out.push(fastrand::alphanumeric());
    }
    out
}

#[inline]
pub(crate) fn push_json_string_escaped(out: &mut String, value: &str) {
    let bytes = value.as_bytes();
    if bytes.iter().all(|&b| b >= 0x20 && b != b'"' && b != b'\\') {
        out.push('"');
        out.push_str(value);
        out.push('"');
        return;
    }

    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if c <= '\u{1f}' => {
                let control = c as u8;
                out.push_str("\\u00");
                out.push(char::from(HEX[(control >> 4) as usize]));
                out.push(char::from(HEX[(control & 0x0f) as usize]));
            }
            _ => out.push(ch),
        }
    }
    out.push('"');
}

#[inline]
pub(crate) fn push_u64_decimal(out: &mut String, mut n: u64) {
    if n == 0 {
        out.push('0');
        return;
    }

    let mut buf = [0u8; 20];
    let mut i = buf.len();
    while n > 0 {
        i -= 1;
        buf[i] = b'0' + ((n % 10) as u8);
        n /= 10;
    }
    let digits = std::str::from_utf8(&buf[i..]).unwrap_or("0");
    out.push_str(digits);
}

#[inline]
pub(crate) fn push_usize_decimal(out: &mut String, n: usize) {
    push_u64_decimal(out, n as u64);
}
