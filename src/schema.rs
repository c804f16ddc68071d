use std::collections::{HashMap, HashSet};

use crate::codepage::CodePage;

/// Interned identifier for a bound object type. A plain `&'static str` in
/// place of runtime reflection's `Class<?>` (SPEC §9: "precompile Bindings
/// into an immutable registry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(pub &'static str);

/// Whether a member holds one value or a list of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Scalar,
    Collection,
}

/// The declared element type of a member (or, for a collection, of its
/// items). `Object` is the generic top type used for polymorphic/opaque
/// containers; `WbxmlValue` is the generic identity-preserving carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Bool,
    Bytes,
    String,
    /// A non-string primitive scalar (number, enum, ...), always carried as
    /// its string form on the wire (SPEC §4.3 "Other primitive scalar").
    Scalar,
    Object,
    Bound(BindingId),
    WbxmlValue,
}

/// One member of a `Binding`'s member list (SPEC §3 MemberBinding).
#[derive(Debug, Clone)]
pub struct MemberBinding {
    pub name: &'static str,
    /// `None` is the `NO_INDEX` ghost sentinel.
    pub token: Option<u8>,
    pub cardinality: Cardinality,
    pub kind: MemberKind,
    pub model_class: Option<BindingId>,
    pub required: bool,
    pub filters: HashSet<&'static str>,
    /// Per-item wrapper token for a *ghost* collection of primitive items
    /// (SPEC §8 S4: "token=NO_INDEX, item type string, item wrapper token
    /// 0x12"). A ghost collection of bound objects doesn't need this — each
    /// item brackets itself with its own Binding's root token. Unused
    /// outside that one case.
    pub item_token: Option<u8>,
}

impl MemberBinding {
    pub fn scalar(name: &'static str, token: Option<u8>, kind: MemberKind) -> Self {
        Self {
            name,
            token,
            cardinality: Cardinality::Scalar,
            kind,
            model_class: None,
            required: false,
            filters: HashSet::new(),
            item_token: None,
        }
    }

    pub fn collection(name: &'static str, token: Option<u8>, item_kind: MemberKind) -> Self {
        Self {
            name,
            token,
            cardinality: Cardinality::Collection,
            kind: item_kind,
            model_class: None,
            required: false,
            filters: HashSet::new(),
            item_token: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_model_class(mut self, id: BindingId) -> Self {
        self.model_class = Some(id);
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: &[&'static str]) -> Self {
        self.filters = filters.iter().copied().collect();
        self
    }

    #[must_use]
    pub fn with_item_token(mut self, token: u8) -> Self {
        self.item_token = Some(token);
        self
    }

    pub fn is_ghost(&self) -> bool {
        self.token.is_none()
    }

    /// Permissive-on-empty filter matching (Open Question 3): a member is
    /// emitted if the caller supplied no filters, or if the member declares
    /// no filters, or if the two sets intersect.
    pub fn passes_filter(&self, caller_filters: &HashSet<&'static str>) -> bool {
        if caller_filters.is_empty() || self.filters.is_empty() {
            return true;
        }
        self.filters.intersection(caller_filters).next().is_some()
    }
}

/// The schema mapping from an object type to its code page, root token, and
/// member list (SPEC §3 Binding).
#[derive(Debug, Clone)]
pub struct Binding {
    pub type_id: BindingId,
    pub page: CodePage,
    pub root_token: u8,
    pub members: Vec<MemberBinding>,
}

impl Binding {
    pub fn new(type_id: BindingId, page: CodePage, root_token: u8) -> Self {
        Self {
            type_id,
            page,
            root_token,
            members: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_member(mut self, member: MemberBinding) -> Self {
        self.members.push(member);
        self
    }

    pub fn member_by_token(&self, token: u8) -> Option<&MemberBinding> {
        self.members.iter().find(|m| m.token == Some(token))
    }

    pub fn member_by_name(&self, name: &str) -> Option<&MemberBinding> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// What the low-level decoder's "page finder" can tell the engine about a
/// `(page, token)` pair, independent of which parent is currently open
/// (SPEC §6: "a CodePageField carrying page, token, field-name, optional
/// modelClass").
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub name: &'static str,
    pub default_class: Option<BindingId>,
}

/// Immutable, `Sync`-shareable registry of declared bindings (SPEC §3
/// Lifecycles, §4.1).
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    bindings: HashMap<BindingId, Binding>,
    /// Reverse index for the page-finder: a (page, token) pair always names
    /// the same element across every binding that declares it, mirroring
    /// the teacher's `tok_to_tag: HashMap<(u8,u8), &'static str>` (wbxml.rs).
    by_token: HashMap<(u8, u8), TokenInfo>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, binding: Binding) {
        let page = binding.page.index;
        self.by_token.entry((page, binding.root_token)).or_insert(TokenInfo {
            name: binding.type_id.0,
            default_class: Some(binding.type_id),
        });
        for member in &binding.members {
            if let Some(token) = member.token {
                let default_class = match member.kind {
                    MemberKind::Bound(id) => Some(id),
                    _ => member.model_class,
                };
                self.by_token.entry((page, token)).or_insert(TokenInfo {
                    name: member.name,
                    default_class,
                });
            }
            if let Some(item_token) = member.item_token {
                self.by_token.entry((page, item_token)).or_insert(TokenInfo {
                    name: member.name,
                    default_class: None,
                });
            }
        }
        self.bindings.insert(binding.type_id, binding);
    }

    pub fn binding_for(&self, type_id: BindingId) -> Option<&Binding> {
        self.bindings.get(&type_id)
    }

    /// The registry-level "resolve_token" contract (SPEC §4.1): looks up
    /// what a (page, token) pair names, independent of parse-stack context.
    pub fn resolve_token(&self, page: u8, token: u8) -> Option<&TokenInfo> {
        self.by_token.get(&(page, token))
    }
}
