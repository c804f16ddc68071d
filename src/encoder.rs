//! The Encoder Engine (SPEC §4.3): walks an object graph top-down and
//! drives the byte-level primitives to emit a WBXML stream.
//!
//! Grounded on the teacher's `Wbxml::encode` recursive dispatch loop
//! (`wbxml.rs`), re-targeted from quick-xml events over a parsed XML
//! fragment to a typed `Value` tree driven by the `SchemaRegistry`.

use std::collections::HashSet;

use tracing::warn;

use crate::codepage::CodePage;
use crate::context::Context;
use crate::error::{Breadcrumb, Result, WbxmlError};
use crate::primitives::{self, CHARSET_UTF8, EncodeSink};
use crate::schema::{Binding, Cardinality, MemberBinding, MemberKind, SchemaRegistry};
use crate::value::Value;

/// Marshals `root` (of the bound type named by `root.type_id`) into `sink`.
///
/// `filters`: the caller's filter set (SPEC §4.1); pass an empty set to
/// mean "no filters" (permissive-on-empty, Open Question 3).
pub fn marshal<S: EncodeSink>(
    registry: &SchemaRegistry,
    ctx: &mut Context,
    sink: &mut S,
    root: &Value,
    filters: &HashSet<&'static str>,
) -> Result<()> {
    let _span = tracing::info_span!("wbxml_marshal").entered();
    ctx.pages = crate::codepage::CodePageStack::new();

    let version = ctx.version.unwrap_or_else(|| {
        warn!("WBXML version unset, defaulting to 1.2");
        0x03
    });
    if ctx.public_id == 0 {
        warn!("WBXML public-id is 0");
    }
    let charset = ctx.charset.unwrap_or_else(|| {
        warn!("WBXML charset unset, defaulting to UTF-8");
        CHARSET_UTF8
    });

    primitives::write_version(sink, version).map_err(WbxmlError::IoFailure)?;
    primitives::write_public_id(sink, ctx.public_id).map_err(WbxmlError::IoFailure)?;
    primitives::write_encoding(sink, charset).map_err(WbxmlError::IoFailure)?;
    primitives::write_string_table(sink, 0).map_err(WbxmlError::IoFailure)?;

    let root_obj = root
        .as_object()
        .ok_or_else(|| WbxmlError::SchemaMissing(Breadcrumb::root()))?;
    let binding = registry
        .binding_for(root_obj.type_id)
        .ok_or_else(|| WbxmlError::SchemaMissing(Breadcrumb::root()))?;

    let bc = Breadcrumb::root();
    ctx.pages.enter(binding.page, sink, &bc)?;
    ctx.trace_start(binding.type_id.0);
    primitives::push_element(sink, binding.root_token, true).map_err(WbxmlError::IoFailure)?;

    marshal_members(registry, ctx, sink, binding, root, filters, &bc)?;

    primitives::pop_element(sink).map_err(WbxmlError::IoFailure)?;
    ctx.trace_end(binding.type_id.0);
    ctx.pages.exit(sink)?;

    primitives::finalize(sink).map_err(WbxmlError::IoFailure)
}

/// Emits the root element bracket and body for a nested bound object
/// reached as a scalar/ghost/collection-item member (SPEC §4.3
/// "Bound-object scalar" and the ghost-collection item path).
fn marshal_object<S: EncodeSink>(
    registry: &SchemaRegistry,
    ctx: &mut Context,
    sink: &mut S,
    value: &Value,
    filters: &HashSet<&'static str>,
    bc: &Breadcrumb,
) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;
    let binding = registry
        .binding_for(obj.type_id)
        .ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;

    let pushed = ctx.pages.enter(binding.page, sink, bc)?;
    ctx.trace_start(binding.type_id.0);
    primitives::push_element(sink, binding.root_token, true).map_err(WbxmlError::IoFailure)?;

    marshal_members(registry, ctx, sink, binding, value, filters, bc)?;

    primitives::pop_element(sink).map_err(WbxmlError::IoFailure)?;
    ctx.trace_end(binding.type_id.0);
    if pushed {
        ctx.pages.exit(sink)?;
    }
    Ok(())
}

/// Emits a single bracket (using the member's own token, not the object's)
/// around a non-ghost bound-object scalar member's body (SPEC §4.3
/// "Bound-object scalar").
fn marshal_bound_scalar_body<S: EncodeSink>(
    registry: &SchemaRegistry,
    ctx: &mut Context,
    sink: &mut S,
    member_name: &'static str,
    token: u8,
    field: &Value,
    filters: &HashSet<&'static str>,
    bc: &Breadcrumb,
) -> Result<()> {
    let obj = field
        .as_object()
        .ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;
    let binding = registry
        .binding_for(obj.type_id)
        .ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;

    let pushed = ctx.pages.enter(binding.page, sink, bc)?;
    primitives::push_element(sink, token, true).map_err(WbxmlError::IoFailure)?;
    ctx.trace_start(member_name);

    marshal_members(registry, ctx, sink, binding, field, filters, bc)?;

    primitives::pop_element(sink).map_err(WbxmlError::IoFailure)?;
    ctx.trace_end(member_name);
    if pushed {
        ctx.pages.exit(sink)?;
    }
    Ok(())
}

fn marshal_members<S: EncodeSink>(
    registry: &SchemaRegistry,
    ctx: &mut Context,
    sink: &mut S,
    binding: &Binding,
    value: &Value,
    filters: &HashSet<&'static str>,
    bc: &Breadcrumb,
) -> Result<()> {
    let obj = value.as_object().expect("checked by caller");
    for member in &binding.members {
        let member_bc = bc.member(member.name);
        let field = obj.get(member.name).cloned().unwrap_or(Value::Null);

        if field.is_null() {
            if member.required {
                return Err(WbxmlError::RequiredMissing(member_bc));
            }
            continue;
        }
        if !member.passes_filter(filters) {
            continue;
        }

        marshal_member(registry, ctx, sink, member, &field, filters, &member_bc)?;
    }
    Ok(())
}

fn marshal_member<S: EncodeSink>(
    registry: &SchemaRegistry,
    ctx: &mut Context,
    sink: &mut S,
    member: &MemberBinding,
    field: &Value,
    filters: &HashSet<&'static str>,
    bc: &Breadcrumb,
) -> Result<()> {
    match member.cardinality {
        Cardinality::Collection => marshal_collection(registry, ctx, sink, member, field, filters, bc),
        Cardinality::Scalar => marshal_scalar(registry, ctx, sink, member, field, filters, bc),
    }
}

fn marshal_collection<S: EncodeSink>(
    registry: &SchemaRegistry,
    ctx: &mut Context,
    sink: &mut S,
    member: &MemberBinding,
    field: &Value,
    filters: &HashSet<&'static str>,
    bc: &Breadcrumb,
) -> Result<()> {
    let items = field
        .as_collection()
        .ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;

    let ghost = member.is_ghost();
    if !ghost {
        let token = member.token.expect("non-ghost member always has a token");
        primitives::push_element(sink, token, true).map_err(WbxmlError::IoFailure)?;
        ctx.trace_start(member.name);
    }

    for (i, item) in items.iter().enumerate() {
        let item_bc = bc.index(i);
        match member.kind {
            // A bound-object item always brackets itself with its own
            // Binding's root token, ghost or not (SPEC §4.3: "if the outer
            // m is a ghost, emit the item's own root element bracket").
            MemberKind::Bound(_) => marshal_object(registry, ctx, sink, item, filters, &item_bc)?,
            MemberKind::String | MemberKind::Scalar => {
                let text = item.as_str().ok_or_else(|| WbxmlError::SchemaMissing(item_bc.clone()))?;
                if ghost {
                    // primitives have no Binding of their own to bracket with,
                    // so a ghost collection of them needs a per-item wrapper
                    // token (SPEC §8 S4).
                    let item_token = member
                        .item_token
                        .ok_or_else(|| WbxmlError::SchemaMissing(item_bc.clone()))?;
                    primitives::push_element(sink, item_token, true).map_err(WbxmlError::IoFailure)?;
                    ctx.trace_start(member.name);
                    marshal_string_payload(ctx, sink, text)?;
                    primitives::pop_element(sink).map_err(WbxmlError::IoFailure)?;
                    ctx.trace_end(member.name);
                } else {
                    marshal_string_payload(ctx, sink, text)?;
                }
            }
            _ => return Err(WbxmlError::SchemaMissing(item_bc)),
        }
    }

    if !ghost {
        primitives::pop_element(sink).map_err(WbxmlError::IoFailure)?;
        ctx.trace_end(member.name);
    }
    Ok(())
}

fn marshal_scalar<S: EncodeSink>(
    registry: &SchemaRegistry,
    ctx: &mut Context,
    sink: &mut S,
    member: &MemberBinding,
    field: &Value,
    filters: &HashSet<&'static str>,
    bc: &Breadcrumb,
) -> Result<()> {
    match member.kind {
        MemberKind::Bool => {
            let flag = matches!(field, Value::Bool(true));
            if flag {
                let token = member.token.ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;
                primitives::push_element(sink, token, false).map_err(WbxmlError::IoFailure)?;
                ctx.trace_start(member.name);
                ctx.trace_end(member.name);
            }
            // false/null: nothing is emitted (handled by the null check upstream
            // for None; an explicit Value::Bool(false) also emits nothing here).
            Ok(())
        }
        MemberKind::Bytes => {
            let bytes = field.as_bytes().ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;
            let token = member.token.ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;
            ctx.trace_start(member.name);
            ctx.trace_opaque(bytes);
            primitives::push_opaque(sink, token, bytes).map_err(WbxmlError::IoFailure)?;
            ctx.trace_end(member.name);
            Ok(())
        }
        MemberKind::Bound(_) => {
            match member.token {
                // Non-ghost: the member's own token is the only bracket
                // (SPEC §4.3 "Bound-object scalar": "emit open ... emit
                // close" — a single pair, not the object's own element
                // nested inside it).
                Some(token) => marshal_bound_scalar_body(registry, ctx, sink, member.name, token, field, filters, bc),
                // Ghost: no member token exists, so the object emits its
                // own root bracket directly.
                None => marshal_object(registry, ctx, sink, field, filters, bc),
            }
        }
        MemberKind::Object => match field {
            Value::Object(obj) => {
                let token = member.token.unwrap_or(
                    registry
                        .binding_for(obj.type_id)
                        .ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?
                        .root_token,
                );
                marshal_bound_scalar_body(registry, ctx, sink, member.name, token, field, filters, bc)
            }
            Value::Bytes(bytes) => {
                let token = member.token.ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;
                ctx.trace_start(member.name);
                ctx.trace_opaque(bytes);
                primitives::push_opaque(sink, token, bytes).map_err(WbxmlError::IoFailure)?;
                ctx.trace_end(member.name);
                Ok(())
            }
            Value::Str(text) => {
                let token = member.token.ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;
                primitives::push_element(sink, token, true).map_err(WbxmlError::IoFailure)?;
                ctx.trace_start(member.name);
                marshal_string_payload(ctx, sink, text)?;
                primitives::pop_element(sink).map_err(WbxmlError::IoFailure)?;
                ctx.trace_end(member.name);
                Ok(())
            }
            _ => Err(WbxmlError::SchemaMissing(bc.clone())),
        },
        MemberKind::WbxmlValue => {
            let wv = match field {
                Value::Raw(wv) => wv,
                _ => return Err(WbxmlError::SchemaMissing(bc.clone())),
            };
            let target_page = CodePage::new(wv.page, ctx.pages.peek().map_or(0, |p| p.public_id));
            let pushed = ctx.pages.enter(target_page, sink, bc)?;
            primitives::push_element(sink, wv.token, true).map_err(WbxmlError::IoFailure)?;
            ctx.trace_start(member.name);
            if let Some(bytes) = &wv.bytes {
                ctx.trace_opaque(bytes);
                primitives::opaque(sink, bytes).map_err(WbxmlError::IoFailure)?;
            } else if let Some(text) = &wv.text {
                marshal_string_payload(ctx, sink, text)?;
            }
            primitives::pop_element(sink).map_err(WbxmlError::IoFailure)?;
            ctx.trace_end(member.name);
            if pushed {
                ctx.pages.exit(sink)?;
            }
            Ok(())
        }
        MemberKind::String | MemberKind::Scalar => {
            let text = field.as_str().ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;
            let token = member.token.ok_or_else(|| WbxmlError::SchemaMissing(bc.clone()))?;
            primitives::push_element(sink, token, true).map_err(WbxmlError::IoFailure)?;
            ctx.trace_start(member.name);
            marshal_string_payload(ctx, sink, text)?;
            primitives::pop_element(sink).map_err(WbxmlError::IoFailure)?;
            ctx.trace_end(member.name);
            Ok(())
        }
    }
}

fn marshal_string_payload<S: EncodeSink>(ctx: &mut Context, sink: &mut S, text: &str) -> Result<()> {
    if ctx.opaque_strings {
        let bytes = text.as_bytes();
        ctx.trace_opaque(bytes);
        primitives::opaque(sink, bytes).map_err(WbxmlError::IoFailure)
    } else {
        ctx.trace_text(text);
        primitives::inline_string(sink, text).map_err(WbxmlError::IoFailure)
    }
}

/// Convenience for callers passing no filters at all.
pub fn no_filters() -> HashSet<&'static str> {
    HashSet::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codepage::CodePage as CP;
    use crate::schema::{Binding as Bd, BindingId, MemberBinding as MB};
    use crate::value::BoundObject;

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
    fn single_page_scalar_round_trip_matches_s1() {
        let reg = schema();
        let mut ctx = Context::new();
        let mut obj = BoundObject::new(PING);
        obj.set("HeartbeatInterval", Value::Str("480".into()));
        let root = Value::Object(obj);

        let mut out = Vec::new();
        marshal(&reg, &mut ctx, &mut out, &root, &no_filters()).unwrap();

        let expected = [
            0x03, 0x01, 0x6A, 0x00, // preamble
            0x00, 0x0D, // SWITCH_PAGE 13
            0x45, // root element 0x40|0x05
            0x4A, // HeartbeatInterval 0x40|0x0A
            0x03, b'4', b'8', b'0', 0x00, // STR_I "480"
            0x01, // END HeartbeatInterval
            0x01, // END Ping
        ];
        assert_eq!(out, expected);
    }

    #[test]
    fn required_missing_fails_before_writing_more() {
        let mut reg = SchemaRegistry::new();
        reg.register(
            Bd::new(PING, CP::new(13, 1), 0x05).with_member(
                MB::scalar("HeartbeatInterval", Some(0x0A), MemberKind::String).required(),
            ),
        );
        let mut ctx = Context::new();
        let root = Value::Object(BoundObject::new(PING));
        let mut out = Vec::new();
        let err = marshal(&reg, &mut ctx, &mut out, &root, &no_filters()).unwrap_err();
        assert!(matches!(err, WbxmlError::RequiredMissing(_)));
    }
}
