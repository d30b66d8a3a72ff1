use navspace_shaper::estimate_value;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result collections the shaping layer knows how to prioritize. Operations
/// tag their raw batches with one of these instead of carrying their own
/// truncation logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Navigation,
    References,
    Symbols,
    Diagnostics,
    Edits,
}

pub struct ShapeSpec {
    pub cost: fn(&Value) -> anyhow::Result<u64>,
    pub priority: fn(&Value) -> i64,
}

static NAVIGATION: ShapeSpec = ShapeSpec {
    cost: default_cost,
    priority: no_priority,
};
static REFERENCES: ShapeSpec = ShapeSpec {
    cost: default_cost,
    priority: reference_priority,
};
static SYMBOLS: ShapeSpec = ShapeSpec {
    cost: default_cost,
    priority: symbol_priority,
};
static DIAGNOSTICS: ShapeSpec = ShapeSpec {
    cost: default_cost,
    priority: diagnostic_priority,
};
static EDITS: ShapeSpec = ShapeSpec {
    cost: default_cost,
    priority: no_priority,
};

/// Cost/priority dispatch table. Cost is the generic serialized-size walk for
/// every kind today; priorities differ so reduction keeps the items an agent
/// would ask for first.
#[must_use]
pub fn shape_spec(kind: ResultKind) -> &'static ShapeSpec {
    match kind {
        ResultKind::Navigation => &NAVIGATION,
        ResultKind::References => &REFERENCES,
        ResultKind::Symbols => &SYMBOLS,
        ResultKind::Diagnostics => &DIAGNOSTICS,
        ResultKind::Edits => &EDITS,
    }
}

fn default_cost(item: &Value) -> anyhow::Result<u64> {
    Ok(estimate_value(item))
}

fn no_priority(_: &Value) -> i64 {
    0
}

/// Definitions outrank write references outrank reads: when a reference
/// listing must shrink, the declaration site and mutation sites survive.
fn reference_priority(item: &Value) -> i64 {
    match item.get("kind").and_then(Value::as_str) {
        Some("definition" | "declaration") => 3,
        Some("write") => 2,
        Some("read") => 1,
        _ => 0,
    }
}

fn diagnostic_priority(item: &Value) -> i64 {
    match item.get("severity").and_then(Value::as_str) {
        Some("error") => 3,
        Some("warning") => 2,
        Some("info") => 1,
        _ => 0,
    }
}

fn symbol_priority(item: &Value) -> i64 {
    item.get("score")
        .and_then(Value::as_f64)
        .map_or(0, |score| (score * 1_000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::{shape_spec, ResultKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn reference_priorities_rank_definition_write_read() {
        let spec = shape_spec(ResultKind::References);
        let definition = (spec.priority)(&json!({"kind": "definition"}));
        let write = (spec.priority)(&json!({"kind": "write"}));
        let read = (spec.priority)(&json!({"kind": "read"}));
        assert!(definition > write && write > read);
    }

    #[test]
    fn diagnostics_rank_by_severity() {
        let spec = shape_spec(ResultKind::Diagnostics);
        assert!(
            (spec.priority)(&json!({"severity": "error"}))
                > (spec.priority)(&json!({"severity": "warning"}))
        );
    }

    #[test]
    fn symbol_scores_scale_to_priorities() {
        let spec = shape_spec(ResultKind::Symbols);
        assert_eq!((spec.priority)(&json!({"score": 0.75})), 750);
        assert_eq!((spec.priority)(&json!({})), 0);
    }

    #[test]
    fn cost_tracks_serialized_size() {
        let spec = shape_spec(ResultKind::Navigation);
        let small = (spec.cost)(&json!({"path": "a.cs"})).unwrap();
        let large = (spec.cost)(&json!({"path": "a.cs", "preview": "x".repeat(800)})).unwrap();
        assert!(large > small);
    }
}
