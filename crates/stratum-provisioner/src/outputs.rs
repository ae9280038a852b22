use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratum_core::ResourceState;

/// A named value exposed to collaborators after apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    pub name: String,
    pub expr: OutputExpr,
    /// Rendered as [`ResolvedOutput::Sensitive`], never as the value.
    #[serde(default)]
    pub sensitive: bool,
}

impl OutputDef {
    pub fn new(name: impl Into<String>, expr: OutputExpr) -> Self {
        Self {
            name: name.into(),
            expr,
            sensitive: false,
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputExpr {
    Ref { resource: String, attribute: String },
    Literal(Value),
    Group(BTreeMap<String, OutputExpr>),
    List(Vec<OutputExpr>),
}

impl OutputExpr {
    pub fn reference(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        OutputExpr::Ref {
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedOutput {
    Value(Value),
    /// The source resource is not Ready or lacks the attribute.
    Unavailable { resource: String, reason: String },
    Group(BTreeMap<String, ResolvedOutput>),
    List(Vec<ResolvedOutput>),
    Sensitive,
}

impl ResolvedOutput {
    /// True if this output, or anything nested in it, is unavailable.
    pub fn is_partial(&self) -> bool {
        match self {
            ResolvedOutput::Unavailable { .. } => true,
            ResolvedOutput::Group(g) => g.values().any(ResolvedOutput::is_partial),
            ResolvedOutput::List(l) => l.iter().any(ResolvedOutput::is_partial),
            ResolvedOutput::Value(_) | ResolvedOutput::Sensitive => false,
        }
    }
}

/// Resolve every output against final resource states. One unavailable
/// source never affects sibling outputs.
pub fn resolve_outputs(
    defs: &[OutputDef],
    states: &[ResourceState],
) -> BTreeMap<String, ResolvedOutput> {
    let by_id: HashMap<&str, &ResourceState> = states.iter().map(|s| (s.id.as_str(), s)).collect();
    defs.iter()
        .map(|def| {
            let resolved = if def.sensitive {
                ResolvedOutput::Sensitive
            } else {
                resolve_expr(&def.expr, &by_id)
            };
            (def.name.clone(), resolved)
        })
        .collect()
}

fn resolve_expr(expr: &OutputExpr, states: &HashMap<&str, &ResourceState>) -> ResolvedOutput {
    match expr {
        OutputExpr::Literal(v) => ResolvedOutput::Value(v.clone()),
        OutputExpr::Group(group) => ResolvedOutput::Group(
            group
                .iter()
                .map(|(k, e)| (k.clone(), resolve_expr(e, states)))
                .collect(),
        ),
        OutputExpr::List(items) => {
            ResolvedOutput::List(items.iter().map(|e| resolve_expr(e, states)).collect())
        }
        OutputExpr::Ref {
            resource,
            attribute,
        } => {
            let unavailable = |reason: String| ResolvedOutput::Unavailable {
                resource: resource.clone(),
                reason,
            };
            match states.get(resource.as_str()) {
                None => unavailable("not part of this graph".to_string()),
                Some(state) if !state.is_ready() => {
                    unavailable(format!("resource is {}", state.status))
                }
                // Observed state holds secret-typed attributes as tokens
                // only, so this can never surface a raw value.
                Some(state) => match state.observed.get(attribute) {
                    Some(v) => ResolvedOutput::Value(v.clone()),
                    None => unavailable(format!("attribute {attribute} was not reported")),
                },
            }
        }
    }
}
