//! The Decoder Engine (SPEC §4.4): consumes a stream of decode events,
//! maintains a parse stack, resolves each token to a target member via the
//! Schema Registry, instantiates child objects, and assigns values.
//!
//! Grounded on the teacher's `Wbxml::decode` token-dispatch loop
//! (`wbxml.rs`), with the source's untyped `target`/up-cast pattern
//! replaced by the tagged-union `FrameTarget` the spec's Design Notes call
//! for (§9), and with child-value assignment deferred to `EndElement` time
//! instead of `StartElement` time (DESIGN.md Open Question 5 — Rust
//! ownership doesn't allow a child to stay mutably open while already
//! spliced into its parent by value).

use tracing::debug;

use crate::context::Context;
use crate::error::{Breadcrumb, Result, WbxmlError};
use crate::primitives::{CodePageField, DecodeEvent, PrimitiveError, WbxmlReader};
use crate::schema::{BindingId, Cardinality, MemberBinding, MemberKind, SchemaRegistry};
use crate::value::{BoundObject, Value, WbxmlValue};

/// A parse-stack frame's payload (SPEC §9: tagged union replacing the
/// source's untyped `target` + casts).
enum FrameTarget {
    Object(BoundObject),
    /// Awaiting a single Text/Opaque payload.
    Scalar { kind: MemberKind, value: Option<Value> },
    /// A Boolean member whose `true` was already committed at Start time;
    /// this frame exists only to balance the stack for the matching End.
    Placeholder,
    /// A generic identity-preserving value carrier.
    Carrier(WbxmlValue),
    /// An open non-ghost collection wrapper (SPEC §4.3 "If `m` is not a
    /// ghost, emit open-element for `m` ... the outer element already
    /// provides the bracket"): the wrapper's own StartElement pushes this
    /// scope rather than an item. Nested item StartElements re-resolve
    /// against `member` (its own token never matches an item's root token,
    /// so resolution falls through to the modelClass clause) and commit
    /// straight into `parent_idx`'s collection, skipping this frame. Text
    /// events arriving while this is on top (non-ghost string items have no
    /// bracket of their own) append directly to that same collection.
    CollectionWrapper { member: MemberBinding, parent_idx: usize },
}

/// Where a completed frame's value is written back into its parent once
/// popped.
enum WriteBack {
    /// The bottom (root) frame: never popped, nothing to commit.
    Root,
    Field {
        parent_idx: usize,
        member: &'static str,
        collection: bool,
    },
}

struct Entry {
    target: FrameTarget,
    /// Candidate members eligible to receive the next child StartElement
    /// (SPEC "candidateFields"). Empty for non-`Object` targets.
    candidates: Vec<MemberBinding>,
    write_back: WriteBack,
    bc: Breadcrumb,
    trace_name: &'static str,
}

fn malformed(e: PrimitiveError, bc: &Breadcrumb) -> WbxmlError {
    WbxmlError::Malformed {
        reason: e.0,
        breadcrumb: bc.clone(),
    }
}

/// SPEC §4.4 `parent.findField(cp)` resolution, in exact priority order.
fn find_field<'a>(candidates: &'a [MemberBinding], field: &CodePageField) -> Option<&'a MemberBinding> {
    if let Some(m) = candidates.iter().find(|m| {
        m.token == Some(field.token)
            || (m.token.is_none()
                && m.cardinality == Cardinality::Collection
                && m.item_token == Some(field.token))
    }) {
        return Some(m);
    }
    if let Some(model_class) = field.model_class {
        if let Some(m) = candidates.iter().find(|m| {
            m.model_class == Some(model_class) || matches!(m.kind, MemberKind::Bound(id) if id == model_class)
        }) {
            return Some(m);
        }
    }
    if candidates.len() == 1 {
        let sole = &candidates[0];
        if matches!(sole.kind, MemberKind::Object | MemberKind::WbxmlValue) {
            return Some(sole);
        }
    }
    None
}

fn default_for_kind(kind: MemberKind) -> Value {
    match kind {
        MemberKind::Object => Value::Null,
        _ => Value::Str(String::new()),
    }
}

/// Commits a popped frame's completed value into its parent's storage
/// (SPEC §3 Lifecycles note / DESIGN.md Open Question 5).
fn pop_top_and_commit(stack: &mut Vec<Entry>, ctx: &mut Context) -> Result<()> {
    let entry = stack.pop().expect("caller never pops the root frame");
    ctx.trace_end(entry.trace_name);
    let value = match entry.target {
        FrameTarget::Object(obj) => Some(Value::Object(obj)),
        FrameTarget::Scalar { kind, value } => Some(value.unwrap_or_else(|| default_for_kind(kind))),
        FrameTarget::Carrier(wv) => Some(Value::Raw(wv)),
        FrameTarget::Placeholder | FrameTarget::CollectionWrapper { .. } => None,
    };
    if let (Some(value), WriteBack::Field { parent_idx, member, collection }) = (value, entry.write_back) {
        if let Some(parent) = stack.get_mut(parent_idx) {
            if let FrameTarget::Object(obj) = &mut parent.target {
                if collection {
                    obj.push_to_collection(member, value);
                } else {
                    obj.set(member, value);
                }
            }
        }
    }
    Ok(())
}

fn handle_start(
    stack: &mut Vec<Entry>,
    registry: &SchemaRegistry,
    ctx: &mut Context,
    field: CodePageField,
    has_content: bool,
) -> Result<()> {
    let top_idx = stack.len() - 1;

    // A `CollectionWrapper` on top re-resolves nested StartElements against
    // its own (sole) member rather than the grandparent's full candidate
    // list — the wrapper's token never matches an item's own root token, so
    // resolution falls through to the modelClass clause (SPEC §4.4 clause 2).
    let in_wrapper = matches!(stack[top_idx].target, FrameTarget::CollectionWrapper { .. });
    let parent_bc = stack[top_idx].bc.clone();

    let member = match &stack[top_idx].target {
        FrameTarget::CollectionWrapper { member, .. } => find_field(std::slice::from_ref(member), &field),
        _ => find_field(&stack[top_idx].candidates, &field),
    }
    .cloned()
    .ok_or_else(|| WbxmlError::UnmappedElement {
        page: field.page,
        token: field.token,
        breadcrumb: parent_bc.clone(),
    })?;

    ctx.trace_start(member.name);

    if member.cardinality == Cardinality::Collection {
        // The wrapper-open event: field's token is the member's own declared
        // token, only ever seen once, directly against the true parent's
        // candidates (SPEC §4.3 "If `m` is not a ghost, emit open-element
        // for `m`"). Ghost collections have no wrapper and go straight to
        // item creation below, as before.
        let is_wrapper_open = !in_wrapper && !member.is_ghost() && member.token == Some(field.token);
        if is_wrapper_open {
            stack.push(Entry {
                target: FrameTarget::CollectionWrapper { member: member.clone(), parent_idx: top_idx },
                candidates: Vec::new(),
                write_back: WriteBack::Root,
                bc: parent_bc.member(member.name),
                trace_name: member.name,
            });
            if !has_content {
                pop_top_and_commit(stack, ctx)?;
            }
            return Ok(());
        }

        // Item occurrence: commits into the collection owner, which is the
        // true parent object directly for a ghost collection, or the frame
        // the open `CollectionWrapper` was pushed from for a non-ghost one.
        let parent_idx = match &stack[top_idx].target {
            FrameTarget::CollectionWrapper { parent_idx, .. } => *parent_idx,
            _ => top_idx,
        };
        let owner_bc = stack[parent_idx].bc.clone();
        let existing_len = match &stack[parent_idx].target {
            FrameTarget::Object(obj) => obj
                .get(member.name)
                .and_then(Value::as_collection)
                .map(<[Value]>::len)
                .unwrap_or(0),
            _ => 0,
        };
        let item_bc = owner_bc.member(member.name).index(existing_len);

        match member.kind {
            MemberKind::WbxmlValue => stack.push(Entry {
                target: FrameTarget::Carrier(WbxmlValue::new(field.page, field.token, field.name.map(str::to_string))),
                candidates: Vec::new(),
                write_back: WriteBack::Field { parent_idx, member: member.name, collection: true },
                bc: item_bc,
                trace_name: member.name,
            }),
            MemberKind::String | MemberKind::Scalar => stack.push(Entry {
                target: FrameTarget::Scalar { kind: member.kind, value: None },
                candidates: Vec::new(),
                write_back: WriteBack::Field { parent_idx, member: member.name, collection: true },
                bc: item_bc,
                trace_name: member.name,
            }),
            // An Object-kind item with no resolved concrete type is an
            // opaque/plain passthrough slot; one resolved via the token's
            // modelClass is a nested bound object (falls through to Bound).
            MemberKind::Object if field.model_class.is_none() => stack.push(Entry {
                target: FrameTarget::Scalar { kind: member.kind, value: None },
                candidates: Vec::new(),
                write_back: WriteBack::Field { parent_idx, member: member.name, collection: true },
                bc: item_bc,
                trace_name: member.name,
            }),
            MemberKind::Bound(_) | MemberKind::Object => {
                let concrete = field.model_class.unwrap_or(match member.kind {
                    MemberKind::Bound(id) => id,
                    _ => unreachable!("Object arm above requires model_class"),
                });
                let child_binding = registry
                    .binding_for(concrete)
                    .ok_or_else(|| WbxmlError::SchemaMissing(item_bc.clone()))?;
                stack.push(Entry {
                    target: FrameTarget::Object(BoundObject::new(concrete)),
                    candidates: child_binding.members.clone(),
                    write_back: WriteBack::Field { parent_idx, member: member.name, collection: true },
                    bc: item_bc,
                    trace_name: member.name,
                });
            }
            MemberKind::Bool | MemberKind::Bytes => {
                return Err(WbxmlError::SchemaMissing(item_bc));
            }
        }
        if !has_content {
            pop_top_and_commit(stack, ctx)?;
        }
        return Ok(());
    }

    // Only reachable against the true parent's own candidates: a
    // `CollectionWrapper`'s sole candidate is always a Collection member,
    // so the branch above always returns first when `in_wrapper`.
    let parent_idx = top_idx;
    let member_bc = parent_bc.member(member.name);
    match member.kind {
        MemberKind::Bool => {
            if let FrameTarget::Object(obj) = &mut stack[parent_idx].target {
                obj.set(member.name, Value::Bool(true));
            }
            stack.push(Entry {
                target: FrameTarget::Placeholder,
                candidates: Vec::new(),
                write_back: WriteBack::Root,
                bc: member_bc,
                trace_name: member.name,
            });
        }
        MemberKind::Object if field.model_class.is_none() => stack.push(Entry {
            target: FrameTarget::Scalar { kind: member.kind, value: None },
            candidates: Vec::new(),
            write_back: WriteBack::Field { parent_idx, member: member.name, collection: false },
            bc: member_bc,
            trace_name: member.name,
        }),
        MemberKind::Bound(_) | MemberKind::Object => {
            let concrete = field.model_class.unwrap_or(match member.kind {
                MemberKind::Bound(id) => id,
                _ => unreachable!("Object arm above requires model_class"),
            });
            let child_binding = registry
                .binding_for(concrete)
                .ok_or_else(|| WbxmlError::SchemaMissing(member_bc.clone()))?;
            stack.push(Entry {
                target: FrameTarget::Object(BoundObject::new(concrete)),
                candidates: child_binding.members.clone(),
                write_back: WriteBack::Field { parent_idx, member: member.name, collection: false },
                bc: member_bc,
                trace_name: member.name,
            });
        }
        MemberKind::WbxmlValue => stack.push(Entry {
            target: FrameTarget::Carrier(WbxmlValue::new(field.page, field.token, field.name.map(str::to_string))),
            candidates: Vec::new(),
            write_back: WriteBack::Field { parent_idx, member: member.name, collection: false },
            bc: member_bc,
            trace_name: member.name,
        }),
        MemberKind::Bytes | MemberKind::String | MemberKind::Scalar => stack.push(Entry {
            target: FrameTarget::Scalar { kind: member.kind, value: None },
            candidates: Vec::new(),
            write_back: WriteBack::Field { parent_idx, member: member.name, collection: false },
            bc: member_bc,
            trace_name: member.name,
        }),
    }
    if !has_content {
        pop_top_and_commit(stack, ctx)?;
    }
    Ok(())
}

/// A non-ghost collection of string/scalar items has no per-item bracket
/// (SPEC §4.3 "the outer element already provides the bracket"), so their
/// `Text`/`Opaque` events arrive while a `CollectionWrapper` is on top
/// rather than a per-item `Scalar` frame; route them straight into the
/// owner's collection (SPEC §4.4: "push a frame whose target IS the
/// collection").
fn collection_wrapper_target(stack: &[Entry], top_idx: usize) -> Option<(&'static str, usize)> {
    match &stack[top_idx].target {
        FrameTarget::CollectionWrapper { member, parent_idx } => Some((member.name, *parent_idx)),
        _ => None,
    }
}

fn handle_text(stack: &mut [Entry], ctx: &mut Context, text: String) {
    ctx.trace_text(&text);
    let Some(top_idx) = stack.len().checked_sub(1) else {
        return;
    };
    if let Some((member_name, parent_idx)) = collection_wrapper_target(stack, top_idx) {
        if let FrameTarget::Object(obj) = &mut stack[parent_idx].target {
            obj.push_to_collection(member_name, Value::Str(text));
        }
        return;
    }
    let top = &mut stack[top_idx];
    match &mut top.target {
        FrameTarget::Scalar { value, .. } => *value = Some(Value::Str(text)),
        FrameTarget::Carrier(wv) => wv.text = Some(text),
        _ => debug!(breadcrumb = %top.bc, "unmapped text, ignoring"),
    }
}

fn handle_opaque(
    stack: &mut [Entry],
    ctx: &mut Context,
    bytes: Vec<u8>,
    registry: &SchemaRegistry,
) -> Result<()> {
    ctx.trace_opaque(&bytes);
    let Some(top_idx) = stack.len().checked_sub(1) else {
        return Ok(());
    };
    if let Some((member_name, parent_idx)) = collection_wrapper_target(stack, top_idx) {
        let bc = stack[top_idx].bc.clone();
        let s = String::from_utf8(bytes)
            .map_err(|e| WbxmlError::Malformed { reason: format!("invalid UTF-8 in opaque: {e}"), breadcrumb: bc.clone() })?;
        if let FrameTarget::Object(obj) = &mut stack[parent_idx].target {
            obj.push_to_collection(member_name, Value::Str(s));
        }
        return Ok(());
    }
    let top = &mut stack[top_idx];
    let bc = top.bc.clone();
    match &mut top.target {
        FrameTarget::Scalar { kind, value } => match *kind {
            MemberKind::Bytes => *value = Some(Value::Bytes(bytes)),
            MemberKind::String => {
                let s = String::from_utf8(bytes)
                    .map_err(|e| WbxmlError::Malformed { reason: format!("invalid UTF-8 in opaque: {e}"), breadcrumb: bc.clone() })?;
                *value = Some(Value::Str(s));
            }
            MemberKind::Object => {
                if WbxmlReader::new(&bytes, registry).is_ok() {
                    *value = Some(Value::Bytes(bytes));
                } else if let Ok(s) = String::from_utf8(bytes.clone()) {
                    *value = Some(Value::Str(s));
                } else {
                    *value = Some(Value::Bytes(bytes));
                }
            }
            MemberKind::Scalar | MemberKind::Bool | MemberKind::Bound(_) | MemberKind::WbxmlValue => {
                return Err(WbxmlError::UnsupportedOpaqueTarget(bc));
            }
        },
        FrameTarget::Carrier(wv) => wv.bytes = Some(bytes),
        _ => return Err(WbxmlError::UnmappedOpaque(bc)),
    }
    Ok(())
}

/// Unmarshals `data` into a `Value::Object` of `root_type`.
pub fn unmarshal(registry: &SchemaRegistry, ctx: &mut Context, data: &[u8], root_type: BindingId) -> Result<Value> {
    let _span = tracing::info_span!("wbxml_unmarshal").entered();
    let root_binding = registry
        .binding_for(root_type)
        .ok_or_else(|| WbxmlError::SchemaMissing(Breadcrumb::root()))?;

    let mut stack = vec![Entry {
        target: FrameTarget::Object(BoundObject::new(root_type)),
        candidates: root_binding.members.clone(),
        write_back: WriteBack::Root,
        bc: Breadcrumb::root(),
        trace_name: root_binding.type_id.0,
    }];

    let mut reader = WbxmlReader::new(data, registry).map_err(|e| malformed(e, &Breadcrumb::root()))?;
    let mut seen_root = false;

    loop {
        let bc_for_err = stack.last().map(|e| e.bc.clone()).unwrap_or_else(Breadcrumb::root);
        let event = match reader.next() {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => return Err(malformed(e, &bc_for_err)),
        };
        match event {
            DecodeEvent::StartElement { field, has_content } => {
                if !seen_root {
                    seen_root = true;
                    ctx.trace_start(field.name.unwrap_or(root_binding.type_id.0));
                    continue;
                }
                handle_start(&mut stack, registry, ctx, field, has_content)?;
            }
            DecodeEvent::Text(t) => handle_text(&mut stack, ctx, t),
            DecodeEvent::Opaque(b) => handle_opaque(&mut stack, ctx, b, registry)?,
            DecodeEvent::EndElement => {
                if stack.len() == 1 {
                    ctx.trace_end(root_binding.type_id.0);
                } else {
                    pop_top_and_commit(&mut stack, ctx)?;
                }
            }
        }
    }

    let root_entry = stack.into_iter().next().expect("root frame always present");
    match root_entry.target {
        FrameTarget::Object(obj) => Ok(Value::Object(obj)),
        _ => unreachable!("the root frame is always an Object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codepage::CodePage as CP;
    use crate::schema::{Binding as Bd, BindingId, MemberBinding as MB};

    const PING: BindingId = BindingId("Ping");

    fn schema() -> SchemaRegistry {
        let mut reg = SchemaRegistry::new();
        reg.register(
            Bd::new(PING, CP::new(13, 1), 0x05)
                .with_member(MB::scalar("HeartbeatInterval", Some(0x0A), MemberKind::String)),
        );
        reg
    }

    #[test]
    fn decodes_single_page_scalar() {
        let reg = schema();
        let bytes: Vec<u8> = vec![
            0x03, 0x01, 0x6A, 0x00, 0x00, 0x0D, 0x45, 0x4A, 0x03, b'4', b'8', b'0', 0x00, 0x01, 0x01,
        ];
        let mut ctx = Context::new();
        let value = unmarshal(&reg, &mut ctx, &bytes, PING).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.get("HeartbeatInterval").unwrap().as_str(), Some("480"));
    }

    #[test]
    fn unmapped_element_raises_error() {
        let reg = schema();
        // root element's only child uses an unbound token (0x0B instead of 0x0A).
        let bytes: Vec<u8> = vec![
            0x03, 0x01, 0x6A, 0x00, 0x00, 0x0D, 0x45, 0x4B, 0x03, b'x', 0x00, 0x01, 0x01,
        ];
        let mut ctx = Context::new();
        let err = unmarshal(&reg, &mut ctx, &bytes, PING).unwrap_err();
        assert!(matches!(err, WbxmlError::UnmappedElement { .. }));
    }
}
