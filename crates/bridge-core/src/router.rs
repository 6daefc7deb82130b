//! Resolution of externally visible identifiers back to their upstream.

/// One connected upstream's routing data for a capability kind, in priority
/// order.
pub(crate) struct RouteCandidate {
    pub upstream: String,
    pub namespace: Option<String>,
    pub idents: Vec<String>,
}

impl RouteCandidate {
    fn contains(&self, ident: &str) -> bool {
        self.idents.iter().any(|candidate| candidate == ident)
    }

    fn matches_namespace(&self, namespace: &str) -> bool {
        self.namespace.as_deref() == Some(namespace)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RouteTarget {
    pub upstream: String,
    pub local: String,
}

/// Resolve a tool/prompt identifier. Namespaced identifiers (`ns__local`)
/// must match both the namespace and the upstream's current list; bare
/// identifiers go to the first upstream (in priority order) that lists
/// them. Routing never falls back to a different upstream than the one
/// resolved here.
pub(crate) fn resolve(id: &str, candidates: &[RouteCandidate]) -> Option<RouteTarget> {
    if let Some((namespace, local)) = id.split_once("__") {
        return candidates
            .iter()
            .find(|candidate| candidate.matches_namespace(namespace) && candidate.contains(local))
            .map(|candidate| RouteTarget {
                upstream: candidate.upstream.clone(),
                local: local.to_string(),
            });
    }

    candidates
        .iter()
        .find(|candidate| candidate.contains(id))
        .map(|candidate| RouteTarget {
            upstream: candidate.upstream.clone(),
            local: id.to_string(),
        })
}

/// Resolve a resource URI. `"__"` is the canonical namespace delimiter; the
/// legacy `"<ns>://<local>"` form is still accepted on input, but only when
/// the prefix actually names a configured namespace — otherwise the whole
/// string is treated as a bare URI.
pub(crate) fn resolve_resource(uri: &str, candidates: &[RouteCandidate]) -> Option<RouteTarget> {
    if uri.contains("__") {
        return resolve(uri, candidates);
    }

    if let Some((namespace, local)) = uri.split_once("://")
        && let Some(candidate) = candidates
            .iter()
            .find(|candidate| candidate.matches_namespace(namespace) && candidate.contains(local))
    {
        return Some(RouteTarget {
            upstream: candidate.upstream.clone(),
            local: local.to_string(),
        });
    }

    candidates
        .iter()
        .find(|candidate| candidate.contains(uri))
        .map(|candidate| RouteTarget {
            upstream: candidate.upstream.clone(),
            local: uri.to_string(),
        })
}

/// Targets for subscription fan-out: a namespaced URI addresses exactly one
/// upstream, a bare URI addresses every upstream that lists it.
pub(crate) fn resolve_subscription_targets(
    uri: &str,
    candidates: &[RouteCandidate],
) -> Vec<RouteTarget> {
    if uri.contains("__") {
        return resolve(uri, candidates).into_iter().collect();
    }

    if let Some((namespace, local)) = uri.split_once("://")
        && let Some(candidate) = candidates
            .iter()
            .find(|candidate| candidate.matches_namespace(namespace) && candidate.contains(local))
    {
        return vec![RouteTarget {
            upstream: candidate.upstream.clone(),
            local: local.to_string(),
        }];
    }

    candidates
        .iter()
        .filter(|candidate| candidate.contains(uri))
        .map(|candidate| RouteTarget {
            upstream: candidate.upstream.clone(),
            local: uri.to_string(),
        })
        .collect()
}
