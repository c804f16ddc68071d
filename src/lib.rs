//! Schema-driven WBXML marshaller: a bidirectional codec between typed
//! object graphs and WAP Binary XML (WBXML), driven entirely by a
//! compiled-in `SchemaRegistry` rather than runtime reflection.
//!
//! The public surface is small: build a [`SchemaRegistry`] of
//! [`Binding`]s, then call [`marshal`] and [`unmarshal`] against a
//! per-call [`Context`].

pub mod codepage;
pub mod context;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod primitives;
pub mod schema;
pub mod value;

pub use codepage::{CodePage, CodePageStack};
pub use context::Context;
pub use decoder::unmarshal;
pub use encoder::{marshal, no_filters};
pub use error::{Breadcrumb, Result, WbxmlError};
pub use primitives::{CodePageField, DecodeEvent, EncodeSink, WbxmlReader};
pub use schema::{Binding, BindingId, Cardinality, MemberBinding, MemberKind, SchemaRegistry, TokenInfo};
pub use value::{BoundObject, Value, WbxmlValue};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const FOLDER_SYNC: BindingId = BindingId("FolderSync");
    const FOLDER: BindingId = BindingId("Folder");

    fn schema() -> SchemaRegistry {
        let mut reg = SchemaRegistry::new();
        let page = CodePage::new(7, 2);
        reg.register(
            Binding::new(FOLDER, page, 0x07)
                .with_member(MemberBinding::scalar("ServerId", Some(0x09), MemberKind::String).required())
                .with_member(MemberBinding::scalar("DisplayName", Some(0x0A), MemberKind::String)),
        );
        reg.register(
            Binding::new(FOLDER_SYNC, page, 0x05).with_member(
                MemberBinding::collection("Changes", Some(0x06), MemberKind::Bound(FOLDER))
                    .with_model_class(FOLDER),
            ),
        );
        reg
    }

    #[test]
    fn marshal_then_unmarshal_round_trips_a_collection() {
        let reg = schema();
        let mut folder1 = BoundObject::new(FOLDER);
        folder1.set("ServerId", Value::Str("1".into()));
        folder1.set("DisplayName", Value::Str("Inbox".into()));
        let mut folder2 = BoundObject::new(FOLDER);
        folder2.set("ServerId", Value::Str("2".into()));

        let mut root = BoundObject::new(FOLDER_SYNC);
        root.set(
            "Changes",
            Value::Collection(vec![Value::Object(folder1), Value::Object(folder2)]),
        );
        let root = Value::Object(root);

        let mut ctx = Context::new();
        let mut out = Vec::new();
        marshal(&reg, &mut ctx, &mut out, &root, &no_filters()).unwrap();

        let mut ctx = Context::new();
        let decoded = unmarshal(&reg, &mut ctx, &out, FOLDER_SYNC).unwrap();
        let obj = decoded.as_object().unwrap();
        let changes = obj.get("Changes").unwrap().as_collection().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[0].as_object().unwrap().get("ServerId").unwrap().as_str(),
            Some("1")
        );
        assert_eq!(
            changes[1].as_object().unwrap().get("DisplayName"),
            None
        );
    }

    #[test]
    fn unknown_binding_is_schema_missing() {
        let reg = SchemaRegistry::new();
        let mut ctx = Context::new();
        let root = Value::Object(BoundObject::new(BindingId("Nope")));
        let err = marshal(&reg, &mut ctx, &mut Vec::new(), &root, &HashSet::new()).unwrap_err();
        assert!(matches!(err, WbxmlError::SchemaMissing(_)));
    }
}
