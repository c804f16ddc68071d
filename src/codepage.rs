use crate::error::{Breadcrumb, WbxmlError};
use crate::primitives::{self, EncodeSink};

/// A WBXML code page: a numbered namespace of element tokens (SPEC §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodePage {
    pub index: u8,
    pub public_id: u32,
}

impl CodePage {
    pub const fn new(index: u8, public_id: u32) -> Self {
        Self { index, public_id }
    }
}

/// Runtime stack tracking the active code page (SPEC §4.2).
///
/// The top of the stack is the page the decoder/encoder is currently
/// operating in. Pushed on entering an object whose binding declares a
/// different page, popped on leaving it.
#[derive(Debug, Default, Clone)]
pub struct CodePageStack(Vec<CodePage>);

impl CodePageStack {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn peek(&self) -> Option<CodePage> {
        self.0.last().copied()
    }

    pub fn push(&mut self, page: CodePage) {
        self.0.push(page);
    }

    /// Pops the top page. Per Open Question 2 (DESIGN.md), this does not
    /// re-push the popped page; the caller is responsible for emitting a
    /// restoring `SWITCH_PAGE` to whatever is now on top, if any.
    pub fn pop(&mut self) -> Option<CodePage> {
        self.0.pop()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Enters `target`: pushes it and emits a `SWITCH_PAGE` only if it
    /// differs from the current top (SPEC §4.2/§4.3 — "push on entering an
    /// object whose Binding declares a page different from the active
    /// one"). An empty stack always counts as differing. Returns whether a
    /// push happened; the caller must call `exit` only when it did, so a
    /// same-page nested object leaves the stack untouched (Invariant 3: at
    /// encoder exit the stack equals its entry state).
    pub fn enter<S: EncodeSink>(
        &mut self,
        target: CodePage,
        sink: &mut S,
        at: &Breadcrumb,
    ) -> Result<bool, WbxmlError> {
        let differs = match self.peek() {
            Some(current) => current.index != target.index,
            None => true,
        };
        let _ = at; // breadcrumb reserved for parity with PageMissing call sites
        if differs {
            primitives::switch_code_page(sink, target.index).map_err(WbxmlError::IoFailure)?;
            self.push(target);
        }
        Ok(differs)
    }

    /// Pops the current page and, if a page remains, emits a `SWITCH_PAGE`
    /// back to it (Open Question 2: pop first, then switch to new top).
    /// Only call this when the matching `enter` returned `true`.
    pub fn exit<S: EncodeSink>(&mut self, sink: &mut S) -> Result<(), WbxmlError> {
        self.pop();
        if let Some(restored) = self.peek() {
            primitives::switch_code_page(sink, restored.index).map_err(WbxmlError::IoFailure)?;
        }
        Ok(())
    }
}
