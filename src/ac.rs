//! Access-control policy store (PAP)
//!
//! Policies are JSON documents describing a tree of protected resources.
//! Each node carries a path pattern, an allowed-subject predicate, and
//! children. A directory reload is all-or-nothing: every document is parsed
//! and validated into a fresh [`PolicyTree`] before the active tree pointer
//! is swapped, so evaluators never observe a half-built tree and a failed
//! reload keeps the previous tree in force.
//!
//! Evaluation is longest-prefix match, fail-closed: a request path with no
//! matching node is denied. Ties between equally specific nodes go to the
//! earlier declaration within the same source file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::provider::Claims;
use crate::{Error, Result};

/// Outcome of a policy evaluation. Deny is a decision, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request is authorized
    Permit,
    /// Request is not authorized
    Deny,
}

/// Predicate over the caller's claims.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubjectPredicate {
    /// Matches every caller, authenticated or not
    Any,
    /// Matches any caller with a validated session
    Authenticated,
    /// Matches callers whose named claim equals the given value
    Claim {
        /// Claim name (`sub`, `email`, or any custom attribute)
        name: String,
        /// Required value
        equals: serde_json::Value,
    },
    /// Matches when at least one sub-predicate matches
    AnyOf {
        /// Sub-predicates
        of: Vec<SubjectPredicate>,
    },
    /// Matches when every sub-predicate matches
    AllOf {
        /// Sub-predicates
        of: Vec<SubjectPredicate>,
    },
}

impl SubjectPredicate {
    /// Evaluate against the caller's claims (`None` = unauthenticated).
    #[must_use]
    pub fn evaluate(&self, claims: Option<&Claims>) -> bool {
        match self {
            Self::Any => true,
            Self::Authenticated => claims.is_some(),
            Self::Claim { name, equals } => {
                claims.is_some_and(|c| c.get(name).is_some_and(|v| v == equals))
            }
            Self::AnyOf { of } => of.iter().any(|p| p.evaluate(claims)),
            Self::AllOf { of } => of.iter().all(|p| p.evaluate(claims)),
        }
    }
}

/// One node of a policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyNode {
    /// Path pattern; a trailing `/*` matches any suffix
    pub path: String,
    /// Operator-facing description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// HTTP methods this node applies to (empty = all)
    #[serde(default)]
    pub actions: Vec<String>,
    /// Allowed-subject predicate
    pub allow: SubjectPredicate,
    /// Child nodes; their paths must extend this node's path
    #[serde(default)]
    pub children: Vec<PolicyNode>,
}

/// A policy document: one resource-hierarchy fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Root nodes of this fragment
    pub resources: Vec<PolicyNode>,
}

/// A flattened, matchable policy rule.
#[derive(Debug, Clone)]
struct MatchEntry {
    /// Normalized path prefix (wildcard suffix stripped)
    prefix: String,
    /// Whether the pattern ended in `/*`
    wildcard: bool,
    actions: Vec<String>,
    predicate: SubjectPredicate,
    /// Source file, for diagnostics
    source: String,
}

impl MatchEntry {
    fn matches(&self, path: &str, action: &str) -> bool {
        let path_match = if self.wildcard {
            if self.prefix == "/" {
                path.starts_with('/')
            } else {
                path == self.prefix || path.starts_with(&format!("{}/", self.prefix))
            }
        } else {
            path == self.prefix
        };

        if !path_match {
            return false;
        }

        self.actions.is_empty() || self.actions.iter().any(|a| a.eq_ignore_ascii_case(action))
    }

    /// Longer prefixes are more specific; an exact pattern beats a wildcard
    /// with the same prefix.
    fn specificity(&self) -> usize {
        self.prefix.len() * 2 + usize::from(!self.wildcard)
    }
}

/// An immutable, fully-built policy tree.
#[derive(Debug, Default)]
pub struct PolicyTree {
    entries: Vec<MatchEntry>,
}

impl PolicyTree {
    /// Evaluate a request against the tree.
    #[must_use]
    pub fn authorize(&self, claims: Option<&Claims>, path: &str, action: &str) -> Decision {
        let mut best: Option<&MatchEntry> = None;
        for entry in &self.entries {
            if !entry.matches(path, action) {
                continue;
            }
            // Strictly-greater keeps the earlier declaration on ties.
            if best.is_none_or(|b| entry.specificity() > b.specificity()) {
                best = Some(entry);
            }
        }

        match best {
            Some(entry) if entry.predicate.evaluate(claims) => Decision::Permit,
            _ => Decision::Deny,
        }
    }

    /// Number of flattened rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree holds no rules (every request denied).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON listing of the active rules, for the PAP endpoint.
    #[must_use]
    pub fn describe(&self) -> serde_json::Value {
        let rules: Vec<_> = self
            .entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "path": if e.wildcard {
                        format!("{}/*", e.prefix.trim_end_matches('/'))
                    } else {
                        e.prefix.clone()
                    },
                    "actions": e.actions,
                    "allow": e.predicate,
                    "source": e.source,
                })
            })
            .collect();
        serde_json::json!({ "rules": rules })
    }

    /// Structural self-check: reject path collisions (two rules with the
    /// same pattern), usable as an offline lint before deployment.
    pub fn check(&self) -> Result<()> {
        for (i, a) in self.entries.iter().enumerate() {
            for b in &self.entries[i + 1..] {
                if a.prefix == b.prefix && a.wildcard == b.wildcard && a.actions == b.actions {
                    return Err(Error::Config(format!(
                        "Policy collision on '{}' between {} and {}",
                        a.prefix, a.source, b.source
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Post-processing applied to every authorization decision.
///
/// Obligation plugins sit behind this boundary: they receive the tree's
/// decision together with the request context and may enrich or veto it.
/// Hooks are pure functions of their inputs; they run on the request path
/// and must not block.
pub trait DecisionHook: Send + Sync {
    /// Transform a decision. Returning it unchanged is always valid.
    fn apply(
        &self,
        decision: Decision,
        claims: Option<&Claims>,
        path: &str,
        action: &str,
    ) -> Decision;
}

/// Policy administration point: owns the active tree behind an atomic swap.
///
/// Readers clone the `Arc` snapshot and never block on a reload.
pub struct PolicyStore {
    active: RwLock<Arc<PolicyTree>>,
    hook: Option<Arc<dyn DecisionHook>>,
}

impl PolicyStore {
    /// Create an empty store (denies everything until a load succeeds).
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(PolicyTree::default())),
            hook: None,
        }
    }

    /// Attach a decision hook applied after every tree evaluation.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn DecisionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Snapshot of the active tree.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicyTree> {
        Arc::clone(&self.active.read())
    }

    /// Evaluate against the current snapshot, then run the decision hook.
    #[must_use]
    pub fn authorize(&self, claims: Option<&Claims>, path: &str, action: &str) -> Decision {
        let decision = self.snapshot().authorize(claims, path, action);
        match &self.hook {
            Some(hook) => hook.apply(decision, claims, path, action),
            None => decision,
        }
    }

    /// Load every `.json` document under `dir`, recursing into
    /// subdirectories, and atomically swap the active tree. Any parse or
    /// validation failure aborts the whole reload and keeps the previous
    /// tree active.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        self.load_dirs(std::slice::from_ref(&dir.to_path_buf()))
    }

    /// Load several directory trees as one atomic reload.
    pub fn load_dirs(&self, dirs: &[PathBuf]) -> Result<usize> {
        let mut entries = Vec::new();

        for dir in dirs {
            let mut files = Vec::new();
            collect_documents(dir, &mut files)?;

            for file in files {
                let content = fs::read_to_string(&file)?;
                let document: PolicyDocument = serde_json::from_str(&content).map_err(|e| {
                    error!(file = %file.display(), error = %e, "Policy parse failed");
                    Error::Config(format!("Malformed policy document {}: {e}", file.display()))
                })?;

                let source = file.display().to_string();
                for node in &document.resources {
                    flatten(node, None, &source, &mut entries)?;
                }
            }
        }

        let tree = PolicyTree { entries };
        tree.check()?;

        let count = tree.len();
        *self.active.write() = Arc::new(tree);
        info!(rules = count, "Policy tree reloaded");
        Ok(count)
    }

    /// A sample policy document, for `print-sample-ac`.
    #[must_use]
    pub fn sample_document() -> PolicyDocument {
        PolicyDocument {
            resources: vec![PolicyNode {
                path: "/reports/*".to_string(),
                description: Some("Quarterly reports".to_string()),
                actions: vec!["GET".to_string()],
                allow: SubjectPredicate::Claim {
                    name: "role".to_string(),
                    equals: serde_json::json!("analyst"),
                },
                children: vec![PolicyNode {
                    path: "/reports/admin/*".to_string(),
                    description: None,
                    actions: Vec::new(),
                    allow: SubjectPredicate::AllOf {
                        of: vec![
                            SubjectPredicate::Authenticated,
                            SubjectPredicate::Claim {
                                name: "role".to_string(),
                                equals: serde_json::json!("admin"),
                            },
                        ],
                    },
                    children: Vec::new(),
                }],
            }],
        }
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Gather `.json` documents under `dir`, descending into subdirectories.
/// Entries are visited in sorted name order, so load order is deterministic.
fn collect_documents(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("Policy directory {}: {e}", dir.display())))?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .collect();
    paths.sort();

    for path in paths {
        if path.is_dir() {
            collect_documents(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}

/// Normalize a path pattern into (prefix, wildcard).
fn normalize(pattern: &str) -> Result<(String, bool)> {
    if !pattern.starts_with('/') {
        return Err(Error::Config(format!(
            "Policy path '{pattern}' must start with '/'"
        )));
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let prefix = if prefix.is_empty() { "/" } else { prefix };
        Ok((prefix.to_string(), true))
    } else {
        Ok((pattern.to_string(), false))
    }
}

/// Flatten a node and its children, validating hierarchy on the way.
/// Entries keep declaration order, which breaks specificity ties.
fn flatten(
    node: &PolicyNode,
    parent_prefix: Option<&str>,
    source: &str,
    entries: &mut Vec<MatchEntry>,
) -> Result<()> {
    let (prefix, wildcard) = normalize(&node.path)?;

    if let Some(parent) = parent_prefix {
        let extends = parent == "/" || prefix.starts_with(&format!("{parent}/"));
        if !extends {
            return Err(Error::Config(format!(
                "Policy node '{}' does not extend its parent '{parent}' in {source}",
                node.path
            )));
        }
    }

    entries.push(MatchEntry {
        prefix: prefix.clone(),
        wildcard,
        actions: node.actions.clone(),
        predicate: node.allow.clone(),
        source: source.to_string(),
    });

    for child in &node.children {
        flatten(child, Some(&prefix), source, entries)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn claims_with(name: &str, value: &str) -> Claims {
        let mut claims = Claims::new("subject-1", "https://idp.example.com");
        claims
            .extra
            .insert(name.to_string(), serde_json::json!(value));
        claims
    }

    fn store_with(documents: &[(&str, &str)]) -> PolicyStore {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in documents {
            fs::write(dir.path().join(name), body).unwrap();
        }
        let store = PolicyStore::new();
        store.load_dir(dir.path()).unwrap();
        store
    }

    const REPORTS_DOC: &str = r#"{
        "resources": [
            {
                "path": "/reports/*",
                "allow": {"type": "claim", "name": "role", "equals": "analyst"}
            }
        ]
    }"#;

    // ── Fail-closed ───────────────────────────────────────────────────

    #[test]
    fn empty_tree_denies_everything() {
        let store = PolicyStore::new();
        let claims = claims_with("role", "admin");
        assert_eq!(
            store.authorize(Some(&claims), "/anything", "GET"),
            Decision::Deny
        );
    }

    #[test]
    fn unmatched_path_is_denied() {
        let store = store_with(&[("reports.json", REPORTS_DOC)]);
        let claims = claims_with("role", "analyst");
        assert_eq!(
            store.authorize(Some(&claims), "/other", "GET"),
            Decision::Deny
        );
    }

    // ── Scenario: /reports/* for role=analyst ─────────────────────────

    #[test]
    fn matching_claim_permits() {
        let store = store_with(&[("reports.json", REPORTS_DOC)]);
        let claims = claims_with("role", "analyst");
        assert_eq!(
            store.authorize(Some(&claims), "/reports/q1", "GET"),
            Decision::Permit
        );
    }

    #[test]
    fn wrong_claim_value_denies() {
        let store = store_with(&[("reports.json", REPORTS_DOC)]);
        let claims = claims_with("role", "guest");
        assert_eq!(
            store.authorize(Some(&claims), "/reports/q1", "GET"),
            Decision::Deny
        );
    }

    #[test]
    fn unauthenticated_claim_check_denies() {
        let store = store_with(&[("reports.json", REPORTS_DOC)]);
        assert_eq!(store.authorize(None, "/reports/q1", "GET"), Decision::Deny);
    }

    // ── Specificity and tie-breaking ──────────────────────────────────

    #[test]
    fn longest_prefix_wins() {
        let doc = r#"{
            "resources": [
                {"path": "/api/*", "allow": {"type": "any"}},
                {"path": "/api/admin/*", "allow": {"type": "claim", "name": "role", "equals": "admin"}}
            ]
        }"#;
        let store = store_with(&[("api.json", doc)]);

        // Non-admin reaches /api but not /api/admin
        let claims = claims_with("role", "user");
        assert_eq!(
            store.authorize(Some(&claims), "/api/data", "GET"),
            Decision::Permit
        );
        assert_eq!(
            store.authorize(Some(&claims), "/api/admin/users", "GET"),
            Decision::Deny
        );
    }

    #[test]
    fn exact_beats_wildcard_at_same_prefix() {
        let doc = r#"{
            "resources": [
                {"path": "/api/*", "allow": {"type": "any"}},
                {"path": "/api", "allow": {"type": "claim", "name": "role", "equals": "admin"}}
            ]
        }"#;
        let store = store_with(&[("api.json", doc)]);
        let claims = claims_with("role", "user");
        // Exact /api rule applies to /api itself, wildcard covers the rest.
        assert_eq!(
            store.authorize(Some(&claims), "/api", "GET"),
            Decision::Deny
        );
        assert_eq!(
            store.authorize(Some(&claims), "/api/data", "GET"),
            Decision::Permit
        );
    }

    #[test]
    fn declaration_order_breaks_ties() {
        // Two equally-specific nodes: the earlier one wins.
        let doc = r#"{
            "resources": [
                {"path": "/x/*", "actions": ["GET", "POST"], "allow": {"type": "any"}},
                {"path": "/x/*", "actions": ["GET"], "allow": {"type": "claim", "name": "role", "equals": "admin"}}
            ]
        }"#;
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.json"), doc).unwrap();
        let store = PolicyStore::new();
        store.load_dir(dir.path()).unwrap();

        let claims = claims_with("role", "user");
        assert_eq!(
            store.authorize(Some(&claims), "/x/y", "GET"),
            Decision::Permit
        );
    }

    // ── Actions ───────────────────────────────────────────────────────

    #[test]
    fn action_list_restricts_methods() {
        let doc = r#"{
            "resources": [
                {"path": "/ro/*", "actions": ["GET"], "allow": {"type": "any"}}
            ]
        }"#;
        let store = store_with(&[("ro.json", doc)]);
        assert_eq!(store.authorize(None, "/ro/x", "GET"), Decision::Permit);
        assert_eq!(store.authorize(None, "/ro/x", "POST"), Decision::Deny);
    }

    #[test]
    fn empty_action_list_matches_all_methods() {
        let store = store_with(&[("reports.json", REPORTS_DOC)]);
        let claims = claims_with("role", "analyst");
        assert_eq!(
            store.authorize(Some(&claims), "/reports/q1", "DELETE"),
            Decision::Permit
        );
    }

    // ── Predicates ────────────────────────────────────────────────────

    #[test]
    fn any_of_and_all_of() {
        let analyst = SubjectPredicate::Claim {
            name: "role".to_string(),
            equals: serde_json::json!("analyst"),
        };
        let admin = SubjectPredicate::Claim {
            name: "role".to_string(),
            equals: serde_json::json!("admin"),
        };
        let either = SubjectPredicate::AnyOf {
            of: vec![analyst.clone(), admin.clone()],
        };
        let both = SubjectPredicate::AllOf {
            of: vec![analyst, admin],
        };

        let claims = claims_with("role", "analyst");
        assert!(either.evaluate(Some(&claims)));
        assert!(!both.evaluate(Some(&claims)));
    }

    #[test]
    fn authenticated_predicate() {
        let pred = SubjectPredicate::Authenticated;
        assert!(!pred.evaluate(None));
        assert!(pred.evaluate(Some(&claims_with("role", "x"))));
    }

    #[test]
    fn subject_claim_is_matchable() {
        let pred = SubjectPredicate::Claim {
            name: "sub".to_string(),
            equals: serde_json::json!("subject-1"),
        };
        assert!(pred.evaluate(Some(&claims_with("role", "x"))));
    }

    // ── Reload semantics ──────────────────────────────────────────────

    #[test]
    fn failed_reload_keeps_previous_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ok.json"), REPORTS_DOC).unwrap();
        let store = PolicyStore::new();
        store.load_dir(dir.path()).unwrap();

        let bad_dir = tempfile::tempdir().unwrap();
        fs::write(bad_dir.path().join("bad.json"), "{broken").unwrap();
        assert!(store.load_dir(bad_dir.path()).is_err());

        // Previous tree still active
        let claims = claims_with("role", "analyst");
        assert_eq!(
            store.authorize(Some(&claims), "/reports/q1", "GET"),
            Decision::Permit
        );
    }

    #[test]
    fn one_bad_file_aborts_whole_reload() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a_ok.json"), REPORTS_DOC).unwrap();
        fs::write(dir.path().join("b_bad.json"), "not json").unwrap();

        let store = PolicyStore::new();
        assert!(store.load_dir(dir.path()).is_err());
        // Nothing from the good file is visible either
        let claims = claims_with("role", "analyst");
        assert_eq!(
            store.authorize(Some(&claims), "/reports/q1", "GET"),
            Decision::Deny
        );
    }

    #[test]
    fn documents_in_subdirectories_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("reports.json"), REPORTS_DOC).unwrap();

        let store = PolicyStore::new();
        assert_eq!(store.load_dir(dir.path()).unwrap(), 1);
        let claims = claims_with("role", "analyst");
        assert_eq!(
            store.authorize(Some(&claims), "/reports/q1", "GET"),
            Decision::Permit
        );
    }

    #[test]
    fn reload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("reports.json"), REPORTS_DOC).unwrap();
        let store = PolicyStore::new();
        store.load_dir(dir.path()).unwrap();

        let claims = claims_with("role", "analyst");
        let before = store.authorize(Some(&claims), "/reports/q1", "GET");

        store.load_dir(dir.path()).unwrap();
        let after = store.authorize(Some(&claims), "/reports/q1", "GET");
        assert_eq!(before, after);
        assert_eq!(store.authorize(None, "/other", "GET"), Decision::Deny);
    }

    #[test]
    fn child_must_extend_parent_path() {
        let doc = r#"{
            "resources": [
                {
                    "path": "/a/*",
                    "allow": {"type": "any"},
                    "children": [
                        {"path": "/elsewhere", "allow": {"type": "any"}}
                    ]
                }
            ]
        }"#;
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.json"), doc).unwrap();
        let store = PolicyStore::new();
        let err = store.load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn check_flags_collisions() {
        let doc_a = r#"{"resources": [{"path": "/x/*", "allow": {"type": "any"}}]}"#;
        let doc_b = r#"{"resources": [{"path": "/x/*", "allow": {"type": "authenticated"}}]}"#;
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), doc_a).unwrap();
        fs::write(dir.path().join("b.json"), doc_b).unwrap();

        let store = PolicyStore::new();
        // Collision detection runs as part of the load
        assert!(store.load_dir(dir.path()).is_err());
    }

    #[test]
    fn sample_document_round_trips() {
        let sample = PolicyStore::sample_document();
        let json = serde_json::to_string(&sample).unwrap();
        let parsed: PolicyDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.resources.len(), 1);
        assert_eq!(parsed.resources[0].children.len(), 1);
    }

    #[test]
    fn describe_lists_rules() {
        let store = store_with(&[("reports.json", REPORTS_DOC)]);
        let listing = store.snapshot().describe();
        let rules = listing["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["path"], "/reports/*");
    }

    // ── Decision hooks ────────────────────────────────────────────────

    struct VetoWrites;

    impl DecisionHook for VetoWrites {
        fn apply(
            &self,
            decision: Decision,
            _claims: Option<&Claims>,
            _path: &str,
            action: &str,
        ) -> Decision {
            if action == "DELETE" {
                Decision::Deny
            } else {
                decision
            }
        }
    }

    #[test]
    fn hook_can_veto_a_permit() {
        let store = store_with(&[("reports.json", REPORTS_DOC)]).with_hook(Arc::new(VetoWrites));
        let claims = claims_with("role", "analyst");
        assert_eq!(
            store.authorize(Some(&claims), "/reports/q1", "GET"),
            Decision::Permit
        );
        assert_eq!(
            store.authorize(Some(&claims), "/reports/q1", "DELETE"),
            Decision::Deny
        );
    }

    #[test]
    fn hook_cannot_be_reached_on_snapshot_reads() {
        // Snapshot evaluation stays hook-free; only `authorize` runs hooks.
        let store = store_with(&[("reports.json", REPORTS_DOC)]).with_hook(Arc::new(VetoWrites));
        let claims = claims_with("role", "analyst");
        assert_eq!(
            store
                .snapshot()
                .authorize(Some(&claims), "/reports/q1", "DELETE"),
            Decision::Permit
        );
    }
}
