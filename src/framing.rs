use memchr::{memchr, memmem};

use crate::protocol::{Request, Response};

pub const DEFAULT_READY_MARKER: &str = "__REPL_BRIDGE_READY__";
pub const DEFAULT_START_MARKER: &str = "<<<REPL_BRIDGE";
pub const DEFAULT_END_MARKER: &str = "REPL_BRIDGE>>>";
/// ASCII record separator.
pub const DEFAULT_SENTINEL: u8 = 0x1e;

/// Carried bytes are bounded so an interpreter that only ever prints
/// non-protocol chatter cannot grow the decoder without limit.
const DECODER_CARRY_CAP: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct FramerConfig {
    pub ready_marker: String,
    pub start_marker: String,
    pub end_marker: String,
    pub sentinel: u8,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            start_marker: DEFAULT_START_MARKER.to_string(),
            end_marker: DEFAULT_END_MARKER.to_string(),
            sentinel: DEFAULT_SENTINEL,
        }
    }
}

/// One decoded frame. Undecodable flushed segments surface as `Malformed`
/// rather than an error return; the stream keeps going afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Response(Response),
    Malformed { fragment: String },
}

enum Extract {
    Frame(Decoded),
    /// Bytes were consumed (chatter, stray sentinel) but no frame came out.
    Consumed,
    Nothing,
}

enum MarkerScan {
    Frame(Decoded),
    /// Start marker present, end marker not yet arrived.
    Partial,
    Absent,
}

/// Incremental decoder over the interpreter's stdout stream. Bytes that do
/// not yet form a complete frame are carried into the next `feed` call.
pub struct FrameDecoder {
    config: FramerConfig,
    buffer: Vec<u8>,
    ready_seen: bool,
}

impl FrameDecoder {
    pub fn new(config: FramerConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            ready_seen: false,
        }
    }

    /// Whether the readiness marker has appeared anywhere on the stream,
    /// including split across chunk boundaries.
    pub fn ready_seen(&self) -> bool {
        self.ready_seen
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        self.buffer.extend_from_slice(bytes);
        if !self.ready_seen
            && memmem::find(&self.buffer, self.config.ready_marker.as_bytes()).is_some()
        {
            self.ready_seen = true;
        }
        let mut frames = Vec::new();
        loop {
            match self.extract_once() {
                Extract::Frame(decoded) => frames.push(decoded),
                Extract::Consumed => continue,
                Extract::Nothing => break,
            }
        }
        self.compact();
        frames
    }

    /// Strategies in priority order: explicit markers, sentinel byte,
    /// brace balancing.
    fn extract_once(&mut self) -> Extract {
        match self.scan_marker_frame() {
            MarkerScan::Frame(decoded) => return Extract::Frame(decoded),
            MarkerScan::Partial => return Extract::Nothing,
            MarkerScan::Absent => {}
        }
        match self.extract_sentinel_frame() {
            Extract::Nothing => {}
            extracted => return extracted,
        }
        self.extract_balanced_frame()
    }

    fn scan_marker_frame(&mut self) -> MarkerScan {
        let start_marker = self.config.start_marker.as_bytes();
        let end_marker = self.config.end_marker.as_bytes();
        let Some(start) = memmem::find(&self.buffer, start_marker) else {
            return MarkerScan::Absent;
        };
        let payload_start = start + start_marker.len();
        let Some(end) = memmem::find(&self.buffer[payload_start..], end_marker) else {
            return MarkerScan::Partial;
        };
        let payload_end = payload_start + end;
        let payload = self.buffer[payload_start..payload_end].to_vec();
        self.buffer.drain(..payload_end + end_marker.len());
        MarkerScan::Frame(parse_payload(&payload))
    }

    fn extract_sentinel_frame(&mut self) -> Extract {
        let Some(pos) = memchr(self.config.sentinel, &self.buffer) else {
            return Extract::Nothing;
        };
        let segment = self.buffer[..pos].to_vec();
        self.buffer.drain(..=pos);
        match memchr(b'{', &segment) {
            Some(brace) => Extract::Frame(parse_payload(&segment[brace..])),
            // Sentinel with no object in front of it: interleaved chatter,
            // drop it and keep scanning.
            None => Extract::Consumed,
        }
    }

    /// Fallback for producers that emit neither markers nor sentinels: count
    /// brace depth, attempt a parse each time depth returns to zero, and keep
    /// the LAST span that parses. Spurious earlier spans (banners, echoed
    /// fragments) are discarded along with everything before the winner.
    fn extract_balanced_frame(&mut self) -> Extract {
        let mut depth = 0usize;
        let mut span_start = None;
        let mut last_valid: Option<(usize, Response)> = None;
        for (index, &byte) in self.buffer.iter().enumerate() {
            match byte {
                b'{' => {
                    if depth == 0 {
                        span_start = Some(index);
                    }
                    depth += 1;
                }
                b'}' => {
                    if depth > 0 {
                        depth -= 1;
                        if depth == 0
                            && let Some(start) = span_start.take()
                            && let Ok(response) =
                                serde_json::from_slice::<Response>(&self.buffer[start..=index])
                        {
                            last_valid = Some((index, response));
                        }
                    }
                }
                _ => {}
            }
        }
        match last_valid {
            Some((end, response)) => {
                self.buffer.drain(..=end);
                Extract::Frame(Decoded::Response(response))
            }
            None => Extract::Nothing,
        }
    }

    fn compact(&mut self) {
        if self.buffer.len() <= DECODER_CARRY_CAP {
            return;
        }
        let keep_from = memmem::find(&self.buffer, self.config.start_marker.as_bytes())
            .or_else(|| memchr(b'{', &self.buffer));
        match keep_from {
            Some(offset) if offset > 0 => {
                self.buffer.drain(..offset);
            }
            Some(_) => {
                // A giant span that still will not parse: keep the tail only.
                let cut = self.buffer.len() - DECODER_CARRY_CAP / 2;
                self.buffer.drain(..cut);
            }
            None => self.buffer.clear(),
        }
    }
}

fn parse_payload(payload: &[u8]) -> Decoded {
    let trimmed = payload.trim_ascii();
    match serde_json::from_slice::<Response>(trimmed) {
        Ok(response) => Decoded::Response(response),
        Err(_) => Decoded::Malformed {
            fragment: String::from_utf8_lossy(trimmed).into_owned(),
        },
    }
}

/// One request, one line.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, serde_json::Error> {
    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    Ok(payload)
}
