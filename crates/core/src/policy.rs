//! Multi-layer tool access control.
//!
//! A policy is a stack of layers; a tool is allowed only if every layer
//! accepts it. Within a layer, deny always wins, a non-empty allow list is
//! exhaustive, and an empty layer (no profile, no allow) accepts everything.

/// Tool group shorthands usable in allow/deny lists.
pub fn expand_group(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "group:fs" => Some(&["read_file", "write_file", "edit_file", "list_dir"]),
        "group:runtime" => Some(&["exec"]),
        "group:web" => Some(&["web_fetch"]),
        _ => None,
    }
}

/// One layer of tool access control.
#[derive(Debug, Clone, Default)]
pub struct PolicyLayer {
    /// "minimal" | "coding" | "messaging" | "full" | "" (no profile).
    pub profile: String,
    /// Allowlist. Entries may be tool names, "*", or "group:<name>".
    pub allow: Vec<String>,
    /// Denylist. Same syntax; always wins.
    pub deny: Vec<String>,
}

/// A stack of policy layers. All layers must pass.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    layers: Vec<PolicyLayer>,
}

impl Policy {
    pub fn new(layers: Vec<PolicyLayer>) -> Self {
        Self { layers }
    }

    /// An unrestricted policy (no layers).
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_allowed(&self, tool_name: &str) -> bool {
        self.layers
            .iter()
            .all(|layer| layer_allows(tool_name, layer))
    }
}

fn layer_allows(tool_name: &str, layer: &PolicyLayer) -> bool {
    let mut allow = expand_names(&layer.allow);
    let deny = expand_names(&layer.deny);

    // Profile defaults are prepended to the layer's own allow list. The
    // "full" profile means unrestricted, so it contributes nothing.
    if !layer.profile.is_empty() {
        if let Some(defaults) = profile_defaults(&layer.profile) {
            let mut combined = defaults;
            combined.extend(allow);
            allow = combined;
        }
    }

    if match_any(tool_name, &deny) {
        return false;
    }

    if allow.is_empty() {
        return true;
    }

    match_any(tool_name, &allow)
}

fn match_any(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| p == name || p == "*")
}

/// Expand "group:<name>" references into individual tool names. Unknown
/// entries pass through unchanged.
fn expand_names(names: &[String]) -> Vec<String> {
    let mut expanded = Vec::with_capacity(names.len());
    for name in names {
        match expand_group(name) {
            Some(group) => expanded.extend(group.iter().map(|s| s.to_string())),
            None => expanded.push(name.clone()),
        }
    }
    expanded
}

/// Default allow set for a profile. `None` means unrestricted.
fn profile_defaults(profile: &str) -> Option<Vec<String>> {
    match profile {
        "minimal" => Some(vec!["read_file".into(), "list_dir".into()]),
        "coding" => Some(expand_names(&[
            "group:fs".into(),
            "group:runtime".into(),
            "group:web".into(),
        ])),
        "messaging" => Some(vec!["web_fetch".into()]),
        // "full" and unknown profiles impose no restriction.
        _ => None,
    }
}
