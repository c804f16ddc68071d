use std::fmt;

/// Path of member names from the root object to the site of a failure,
/// e.g. `FolderSync.Changes.Folder[2].ServerId`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Breadcrumb(Vec<String>);

impl Breadcrumb {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn member(&self, name: &str) -> Self {
        let mut path = self.0.clone();
        path.push(name.to_string());
        Self(path)
    }

    #[must_use]
    pub fn index(&self, i: usize) -> Self {
        let mut path = self.0.clone();
        if let Some(last) = path.last_mut() {
            last.push_str(&format!("[{i}]"));
        } else {
            path.push(format!("[{i}]"));
        }
        Self(path)
    }
}

impl fmt::Display for Breadcrumb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0.join("."))
        }
    }
}

/// Error taxonomy for the marshal/unmarshal core (SPEC §7).
#[derive(Debug, thiserror::Error)]
pub enum WbxmlError {
    #[error("no schema binding for type at {0}")]
    SchemaMissing(Breadcrumb),

    #[error("no code page could be determined at {0}")]
    PageMissing(Breadcrumb),

    #[error("required member missing at {0}")]
    RequiredMissing(Breadcrumb),

    #[error("element (page {page}, token {token:#04x}) did not resolve to any member at {breadcrumb}")]
    UnmappedElement {
        page: u8,
        token: u8,
        breadcrumb: Breadcrumb,
    },

    #[error("opaque payload had no assignable target at {0}")]
    UnmappedOpaque(Breadcrumb),

    #[error("opaque payload targets typed member with no registered inner codec at {0}")]
    UnsupportedOpaqueTarget(Breadcrumb),

    #[error("malformed WBXML at {breadcrumb}: {reason}")]
    Malformed {
        reason: String,
        breadcrumb: Breadcrumb,
    },

    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WbxmlError>;
