//! Data transformation helpers shared by the server and client halves:
//! chainable CRC-32, hex rendering of response payloads, and transfer
//! progress reporting.

/// Calculates the CRC32 checksum of a buffer (ISO 3309, reflected,
/// polynomial 0xEDB88320, initial value 0xFFFFFFFF, final XOR 0xFFFFFFFF).
///
/// Supports chaining over multiple buffers: pass 0 as `crc` for the first
/// call, then feed each previous result back in. The pre/post inversion
/// keeps the register state continuous across calls.
pub fn crc32(crc: u32, data: &[u8]) -> u32 {
    let mut crc = !crc;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            crc = (crc >> 1) ^ if crc & 1 != 0 { 0xEDB8_8320 } else { 0 };
        }
    }
    !crc
}

/// Renders a byte buffer as a hex dump followed by its printable ASCII form,
/// the way data identifier payloads are shown to the user.
///
/// Example output for `[0x30, 0x31, 0xFF]`: `30 31 FF | 01.`
pub fn hex_ascii_dump(data: &[u8]) -> String {
    if data.is_empty() {
        return "(no data)".into();
    }
    let mut out = String::with_capacity(data.len() * 4 + 3);
    for b in data {
        out.push_str(&format!("{b:02X} "));
    }
    out.push_str("| ");
    for b in data {
        let c = *b as char;
        out.push(if c.is_ascii_graphic() || c == ' ' {
            c
        } else {
            '.'
        });
    }
    out
}

/// Transfer progress snapshot handed to client progress callbacks
#[derive(Debug, Copy, Clone)]
pub struct TransferProgress {
    /// Bytes moved so far
    pub current: u64,
    /// Expected total, 0 when unknown
    pub total: u64,
}

impl TransferProgress {
    /// Completion ratio clamped to 0..=100, or `None` when the total is unknown
    pub fn percent(&self) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        Some(((self.current * 100 / self.total).min(100)) as u8)
    }

    /// One-line rendering of the progress state, e.g. `42% (430/1024)`
    pub fn render(&self) -> String {
        match self.percent() {
            Some(p) => format!("{p:3}% ({}/{})", self.current, self.total),
            None => format!("{} bytes", self.current),
        }
    }
}
