pub(crate) const CR: u8 = 13;
pub(crate) const LF: u8 = 10;
pub(crate) const SP: u8 = 32;
pub(crate) const COLON: u8 = 58;
pub(crate) const CRLF: &[u8] = &[CR, LF];

const ZERO: u8 = 48;
const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Parse an unsigned decimal integer, tolerating surrounding whitespace.
pub(crate) fn atoi(data: &[u8]) -> Option<usize> {
    let data = data.trim_ascii();
    if data.is_empty() {
        return None;
    }

    let mut val: usize = 0;
    for digit in data {
        if !digit.is_ascii_digit() {
            return None;
        }
        val = val
            .checked_mul(10)?
            .checked_add((digit - ZERO) as usize)?;
    }

    Some(val)
}

/// Parse a hexadecimal chunk size.  Chunk extensions following a `;` are ignored.
pub(crate) fn hextoi(data: &[u8]) -> Option<usize> {
    let data = match data.iter().position(|b| *b == b';') {
        Some(p) => &data[..p],
        None => data,
    };
    let data = data.trim_ascii();
    if data.is_empty() {
        return None;
    }

    let mut val: usize = 0;
    for digit in data {
        let nibble = match digit {
            b'0'..=b'9' => digit - b'0',
            b'a'..=b'f' => digit - b'a' + 10,
            b'A'..=b'F' => digit - b'A' + 10,
            _ => return None,
        };
        val = val.checked_mul(16)?.checked_add(nibble as usize)?;
    }

    Some(val)
}

/// Stack formatted integer, used where a heap `String` would be wasteful.
pub(crate) struct AsciiInt {
    buf: [u8; 20],
    start: usize,
}

impl AsciiInt {
    fn with_radix(mut value: u64, radix: u64) -> Self {
        let mut buf = [SP; 20];
        let mut start = buf.len();
        loop {
            start -= 1;
            buf[start] = HEX_DIGITS[(value % radix) as usize];
            value /= radix;
            if value == 0 {
                break;
            }
        }

        Self { buf, start }
    }

    pub(crate) fn decimal(value: u64) -> Self {
        Self::with_radix(value, 10)
    }

    pub(crate) fn hex(value: u64) -> Self {
        Self::with_radix(value, 16)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[self.start..]
    }
}

/// Lowercase hex encoding of a digest.
pub(crate) fn hex_string(data: &[u8]) -> alloc::string::String {
    let mut out = alloc::string::String::with_capacity(data.len() * 2);
    for b in data {
        out.push(HEX_DIGITS[(b >> 4) as usize] as char);
        out.push(HEX_DIGITS[(b & 0x0F) as usize] as char);
    }
    out
}
