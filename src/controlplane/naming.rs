//! Backend Naming
//!
//! Deterministic backend-visible names for internal objects. The same
//! context and object always yield the same name, which is what lets a
//! retried `create` find its earlier work and lets a timed-out call be
//! resolved by reading back.

use crate::domain::types::{ProviderAdapterContext, ProviderAdapterDataObject, ProviderObjectType};

/// Name prefix per object type
pub fn prefix(object_type: ProviderObjectType) -> &'static str {
    match object_type {
        ProviderObjectType::Volume => "vol",
        ProviderObjectType::Snapshot => "snap",
        ProviderObjectType::Template => "tmpl",
        ProviderObjectType::Archive => "arch",
    }
}

/// `{prefix}[-{env}]-{pool}-{domain}-{account}-{id}`
pub fn external_name(ctx: &ProviderAdapterContext, object: &ProviderAdapterDataObject) -> String {
    let mut name = String::from(prefix(object.object_type));
    if let Some(env) = ctx.environment.as_deref().filter(|e| !e.is_empty()) {
        name.push('-');
        name.push_str(env);
    }
    for part in [
        object.storage_pool_id.as_str(),
        ctx.domain_id.as_str(),
        ctx.account_id.as_str(),
        object.id.as_str(),
    ] {
        name.push('-');
        name.push_str(part);
    }
    name
}

/// The name an adapter should use: the recorded one, else the derived one
pub fn resolve_name(ctx: &ProviderAdapterContext, object: &ProviderAdapterDataObject) -> String {
    object
        .external_name
        .clone()
        .unwrap_or_else(|| external_name(ctx, object))
}

/// Free-text owner annotation; never parsed back
pub fn annotation(ctx: &ProviderAdapterContext, object: &ProviderAdapterDataObject) -> String {
    format!(
        "{} {} ({}) owned by account {} ({}) in domain {} ({})",
        object.object_type,
        object.name,
        object.uuid,
        ctx.account_name,
        ctx.account_uuid,
        ctx.domain_name,
        ctx.domain_uuid,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::Owner;

    fn ctx(env: Option<&str>) -> ProviderAdapterContext {
        ProviderAdapterContext::from_owner(&Owner::new("7", "3", "zone-1"), env)
    }

    fn object(id: &str, object_type: ProviderObjectType) -> ProviderAdapterDataObject {
        ProviderAdapterDataObject {
            id: id.into(),
            uuid: "0f4c".into(),
            name: "data".into(),
            object_type,
            storage_pool_id: "12".into(),
            external_name: None,
            external_uuid: None,
            external_connection_id: None,
        }
    }

    #[test]
    fn test_name_layout() {
        assert_eq!(
            external_name(&ctx(None), &object("42", ProviderObjectType::Volume)),
            "vol-12-3-7-42"
        );
        assert_eq!(
            external_name(&ctx(Some("prod")), &object("42", ProviderObjectType::Snapshot)),
            "snap-prod-12-3-7-42"
        );
        assert_eq!(
            external_name(&ctx(Some("")), &object("42", ProviderObjectType::Archive)),
            "arch-12-3-7-42"
        );
    }

    #[test]
    fn test_name_is_deterministic_and_distinct() {
        let ctx = ctx(Some("qa"));
        let a = object("42", ProviderObjectType::Volume);
        assert_eq!(external_name(&ctx, &a), external_name(&ctx, &a));
        assert_ne!(
            external_name(&ctx, &a),
            external_name(&ctx, &object("43", ProviderObjectType::Volume))
        );
        assert_ne!(
            external_name(&ctx, &a),
            external_name(&ctx, &object("42", ProviderObjectType::Template))
        );
    }

    #[test]
    fn test_recorded_name_wins() {
        let ctx = ctx(None);
        let obj = object("42", ProviderObjectType::Volume).with_external_name("legacy-disk");
        assert_eq!(resolve_name(&ctx, &obj), "legacy-disk");
    }

    #[test]
    fn test_annotation_mentions_owner() {
        let ctx = ctx(None);
        let text = annotation(&ctx, &object("42", ProviderObjectType::Volume));
        assert!(text.contains(&ctx.account_uuid));
        assert!(text.starts_with("volume data"));
    }
}
