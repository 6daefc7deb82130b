//! Deconflicted aggregation of upstream capability lists.

use std::collections::HashSet;

use bridge_config::ConflictResolution;
use rmcp::model::{Prompt, Resource, Tool};
use url::Url;

use crate::error::AggregateError;

/// A capability item with a single externally visible identifier.
pub(crate) trait NamedItem: Clone {
    fn ident(&self) -> &str;
    fn set_ident(&mut self, ident: String);
}

impl NamedItem for Tool {
    fn ident(&self) -> &str {
        self.name.as_ref()
    }

    fn set_ident(&mut self, ident: String) {
        self.name = ident.into();
    }
}

impl NamedItem for Prompt {
    fn ident(&self) -> &str {
        &self.name
    }

    fn set_ident(&mut self, ident: String) {
        self.name = ident;
    }
}

impl NamedItem for Resource {
    fn ident(&self) -> &str {
        &self.uri
    }

    fn set_ident(&mut self, ident: String) {
        self.uri = ident;
    }
}

/// One upstream's contribution to an aggregated view, with its effective
/// namespace already resolved. Sources must arrive in ascending priority
/// order.
pub(crate) struct CapabilitySource<I> {
    pub upstream: String,
    pub namespace: Option<String>,
    pub items: Vec<I>,
}

pub(crate) fn compose_ident(namespace: Option<&str>, local: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}__{local}"),
        None => local.to_string(),
    }
}

/// Build the aggregated view for one capability kind.
///
/// Upstreams are visited in the given (priority) order; duplicate aggregated
/// identifiers are resolved per `policy`. With `validate_uri`, identifiers
/// that do not parse as URLs after the namespace rewrite are dropped with a
/// warning (resources only).
pub(crate) fn aggregate<I: NamedItem>(
    sources: Vec<CapabilitySource<I>>,
    policy: ConflictResolution,
    kind: &'static str,
    validate_uri: bool,
) -> Result<Vec<I>, AggregateError> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut aggregated = Vec::new();

    for source in sources {
        let namespace = source.namespace.as_deref();
        for item in source.items {
            let ident = compose_ident(namespace, item.ident());

            if seen.contains(&ident) {
                match policy {
                    ConflictResolution::Error => {
                        return Err(AggregateError::Conflict {
                            kind,
                            identifier: ident,
                        });
                    }
                    // `priority` and `first` both keep the earlier source;
                    // `namespace` should not collide, and degrades the same
                    // way when it does.
                    ConflictResolution::Priority
                    | ConflictResolution::First
                    | ConflictResolution::Namespace => {
                        tracing::debug!(
                            upstream = %source.upstream,
                            identifier = %ident,
                            "skipping duplicate aggregated {kind}"
                        );
                        continue;
                    }
                }
            }

            if validate_uri && Url::parse(&ident).is_err() {
                tracing::warn!(
                    upstream = %source.upstream,
                    original = %item.ident(),
                    rewritten = %ident,
                    "dropping resource with invalid aggregated URI"
                );
                continue;
            }

            let mut item = item;
            if namespace.is_some() {
                item.set_ident(ident.clone());
            }
            seen.insert(ident);
            aggregated.push(item);
        }
    }

    Ok(aggregated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(String);

    impl NamedItem for Item {
        fn ident(&self) -> &str {
            &self.0
        }

        fn set_ident(&mut self, ident: String) {
            self.0 = ident;
        }
    }

    fn source(upstream: &str, namespace: Option<&str>, idents: &[&str]) -> CapabilitySource<Item> {
        CapabilitySource {
            upstream: upstream.to_string(),
            namespace: namespace.map(str::to_string),
            items: idents.iter().map(|id| Item(id.to_string())).collect(),
        }
    }

    #[test]
    fn priority_order_wins_conflicts() {
        let sources = vec![
            source("a", None, &["search", "fetch"]),
            source("b", None, &["search"]),
        ];
        let items = aggregate(sources, ConflictResolution::Priority, "tool", false).unwrap();
        assert_eq!(items, vec![Item("search".into()), Item("fetch".into())]);
    }

    #[test]
    fn first_policy_behaves_like_priority() {
        let sources = vec![source("a", None, &["x"]), source("b", None, &["x"])];
        let items = aggregate(sources, ConflictResolution::First, "tool", false).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn namespaces_isolate_identical_names() {
        let sources = vec![
            source("a", Some("a"), &["search"]),
            source("b", Some("b"), &["search"]),
        ];
        let items = aggregate(sources, ConflictResolution::Priority, "tool", false).unwrap();
        assert_eq!(
            items,
            vec![Item("a__search".into()), Item("b__search".into())]
        );
    }

    #[test]
    fn residual_collision_under_namespace_policy_degrades_to_priority() {
        // Both upstreams configured the same explicit namespace.
        let sources = vec![
            source("a", Some("shared"), &["search"]),
            source("b", Some("shared"), &["search"]),
        ];
        let items = aggregate(sources, ConflictResolution::Namespace, "tool", false).unwrap();
        assert_eq!(items, vec![Item("shared__search".into())]);
    }

    #[test]
    fn error_policy_raises_on_conflict() {
        let sources = vec![source("a", None, &["dup"]), source("b", None, &["dup"])];
        let err = aggregate(sources, ConflictResolution::Error, "tool", false).unwrap_err();
        assert!(matches!(
            err,
            AggregateError::Conflict { kind: "tool", identifier } if identifier == "dup"
        ));
    }

    #[test]
    fn unnamespaced_items_keep_their_idents() {
        let sources = vec![source("a", None, &["keep_me"])];
        let items = aggregate(sources, ConflictResolution::Priority, "prompt", false).unwrap();
        assert_eq!(items, vec![Item("keep_me".into())]);
    }

    #[test]
    fn namespaced_resource_uri_that_fails_validation_is_dropped() {
        // "docs__file:///x" is not a valid URL scheme, so the rewrite makes
        // the resource unroutable; it must vanish from the aggregate.
        let sources = vec![source("docs", Some("docs"), &["file:///readme"])];
        let items = aggregate(sources, ConflictResolution::Priority, "resource", true).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn valid_resource_uris_survive_validation() {
        let sources = vec![source("docs", None, &["file:///readme", "memo://insights"])];
        let items = aggregate(sources, ConflictResolution::Priority, "resource", true).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn compose_ident_uses_double_underscore() {
        assert_eq!(compose_ident(Some("ns"), "tool"), "ns__tool");
        assert_eq!(compose_ident(None, "tool"), "tool");
    }
}
