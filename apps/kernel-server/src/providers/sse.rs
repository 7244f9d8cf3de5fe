// [[AXON]]/apps/kernel-server/src/providers/sse.rs
// Purpose: Line framing for server-sent-event response bodies.
// Architecture: Provider Support
// Dependencies: std

/// Reassembles complete lines out of an HTTP byte stream.
///
/// Splitting happens on raw bytes and each line is decoded on its own, so
/// a multi-byte UTF-8 character falling across two network reads cannot
/// be mangled (line boundaries are always ASCII).
#[derive(Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes in; get every newly completed line back, newline and
    /// carriage return stripped. Partial trailing data stays buffered.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// Extract the payload of a `data: ` SSE line; None for comments,
/// event-name lines, and blank keep-alives.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
}
