use base64::Engine;

use crate::codepage::CodePageStack;

/// Per-call mutable state (SPEC §3 Lifecycles, §5): version, charset,
/// diagnostic flags, the code-page stack, and (when capturing) the XML
/// trace buffer. Owned by exactly one in-flight call; callers construct or
/// `reset()` it per call, mirroring the teacher's per-call `Wbxml`
/// instance rather than a process-wide singleton.
#[derive(Debug, Clone)]
pub struct Context {
    /// `None` means "unset"; `marshal` defaults it to WBXML 1.2 (`0x03`)
    /// and logs a `tracing::warn!` (SPEC §4.3 Preamble).
    pub version: Option<u8>,
    /// Defaults to 1; `marshal` logs a `tracing::warn!` when it is 0.
    pub public_id: u32,
    /// `None` means "unset"; `marshal` defaults it to UTF-8 (106) and logs
    /// a `tracing::warn!`.
    pub charset: Option<u32>,
    /// Emit every string scalar through `OPAQUE` instead of `STR_I`.
    pub opaque_strings: bool,
    /// Append a diagnostic XML trace alongside normal marshal/unmarshal.
    pub capture_xml: bool,
    pub(crate) pages: CodePageStack,
    trace: String,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            version: None,
            public_id: 1,
            charset: None,
            opaque_strings: false,
            capture_xml: false,
            pages: CodePageStack::new(),
            trace: String::new(),
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_opaque_strings(mut self, on: bool) -> Self {
        self.opaque_strings = on;
        self
    }

    #[must_use]
    pub fn with_capture_xml(mut self, on: bool) -> Self {
        self.capture_xml = on;
        self
    }

    /// Resets per-call state so one `Context` can be reused for a
    /// subsequent call without sharing it concurrently (SPEC §5).
    pub fn reset(&mut self) {
        self.pages = CodePageStack::new();
        self.trace.clear();
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }

    pub(crate) fn trace_start(&mut self, name: &str) {
        if self.capture_xml {
            self.trace.push('<');
            self.trace.push_str(name);
            self.trace.push('>');
        }
    }

    pub(crate) fn trace_text(&mut self, text: &str) {
        if self.capture_xml {
            self.trace.push_str(text);
        }
    }

    pub(crate) fn trace_opaque(&mut self, bytes: &[u8]) {
        if self.capture_xml {
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            self.trace.push_str("<!--b64:");
            self.trace.push_str(&encoded);
            self.trace.push_str("-->");
        }
    }

    pub(crate) fn trace_end(&mut self, name: &str) {
        if self.capture_xml {
            self.trace.push_str("</");
            self.trace.push_str(name);
            self.trace.push('>');
        }
    }
}
