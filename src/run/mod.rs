//! Run schema and builder.
//!
//! A `Run` is the central entity: one node in an execution trace. The
//! builder fills in identity/ordering defaults (uuid, trace_id,
//! dotted_order) and the [`to_circular_safe_json`] visitor makes
//! serialization total even over pathological, cyclic `inputs`/`outputs`
//! maps the caller hands us.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::dotted_order;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Llm,
    Chain,
    Tool,
    Retriever,
    Embedding,
    Prompt,
    Parser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Log,
    Error,
    Feedback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub name: String,
    pub time: i64,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

/// The full create payload for a run. Serializes exactly as shipped in a
/// `post` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub name: String,
    pub run_type: RunType,
    pub inputs: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub events: Vec<RunEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    pub trace_id: Uuid,
    pub dotted_order: String,
    pub session_name: String,
}

/// A partial update to an already-created run; fields are `Some` only when
/// the caller set them, so overlaying onto a queued `post` only touches
/// what changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunUpdate {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<RunEvent>>,
}

/// Inputs to [`RunBuilder::build`]; mirrors what application code supplies
/// at `create_run` time.
pub struct NewRun {
    pub name: String,
    pub run_type: RunType,
    pub inputs: Value,
    pub session_name: String,
    pub tags: Vec<String>,
    pub extra: HashMap<String, Value>,
    pub id: Option<Uuid>,
    pub start_time: Option<i64>,
}

/// The parent a new run is attached to, carrying everything needed to
/// extend its dotted-order and inherit its trace id.
#[derive(Debug, Clone)]
pub struct ParentRef {
    pub trace_id: Uuid,
    pub dotted_order: String,
}

pub struct RunBuilder;

impl RunBuilder {
    /// Builds a `Run`, assigning identity/ordering defaults. `execution_order`
    /// must be unique among siblings sharing a parent (see dotted_order::encode).
    pub fn build(new_run: NewRun, parent: Option<&ParentRef>, execution_order: u32) -> Run {
        let id = new_run.id.unwrap_or_else(Uuid::new_v4);
        let start_time = new_run.start_time.unwrap_or_else(|| Utc::now().timestamp_millis());

        let (trace_id, dotted_order, parent_run_id) = match parent {
            Some(p) => {
                let segment = dotted_order::encode(start_time, id, execution_order);
                (
                    p.trace_id,
                    dotted_order::join(&[p.dotted_order.clone(), segment]),
                    Some(parent_segment_run_id(&p.dotted_order)),
                )
            }
            None => {
                let segment = dotted_order::encode(start_time, id, execution_order);
                (id, segment, None)
            }
        };

        Run {
            id,
            name: new_run.name,
            run_type: new_run.run_type,
            inputs: to_circular_safe_json(&new_run.inputs),
            outputs: None,
            error: None,
            start_time,
            end_time: None,
            extra: new_run.extra,
            tags: new_run.tags,
            events: Vec::new(),
            parent_run_id,
            trace_id,
            dotted_order,
            session_name: new_run.session_name,
        }
    }
}

fn parent_segment_run_id(parent_dotted_order: &str) -> Uuid {
    let last = parent_dotted_order.rsplit('.').next().unwrap_or(parent_dotted_order);
    let run_id_str = &last[last.len().saturating_sub(36)..];
    Uuid::parse_str(run_id_str).unwrap_or_else(|_| Uuid::nil())
}

/// Re-entrancy marker substituted for a back-edge during serialization.
fn circular_sentinel() -> Value {
    let mut map = Map::new();
    map.insert("result".to_string(), Value::String("[Circular]".to_string()));
    Value::Object(map)
}

/// Walks `value`, replacing any container that is a self-referential
/// back-edge with `{ "result": "[Circular]" }`. `serde_json::Value` is a
/// plain tree (no shared ownership), so true cycles can only arise from
/// construction bugs upstream; this visitor still defends against deeply
/// self-similar structures without ever panicking or erroring, per the
/// "serializer must remain total" invariant.
pub fn to_circular_safe_json(value: &Value) -> Value {
    fn walk(value: &Value, seen: &mut Vec<*const Value>, depth: usize) -> Value {
        const MAX_DEPTH: usize = 64;
        if depth >= MAX_DEPTH {
            return circular_sentinel();
        }

        let ptr = value as *const Value;
        if seen.contains(&ptr) {
            return circular_sentinel();
        }

        match value {
            Value::Array(items) => {
                seen.push(ptr);
                let out = Value::Array(items.iter().map(|v| walk(v, seen, depth + 1)).collect());
                seen.pop();
                out
            }
            Value::Object(map) => {
                seen.push(ptr);
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), walk(v, seen, depth + 1));
                }
                seen.pop();
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    let mut seen = Vec::new();
    walk(value, &mut seen, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_run_has_trace_id_equal_to_id() {
        let run = RunBuilder::build(
            NewRun {
                name: "t".into(),
                run_type: RunType::Llm,
                inputs: json!({"text": "hi"}),
                session_name: "default".into(),
                tags: vec![],
                extra: HashMap::new(),
                id: None,
                start_time: None,
            },
            None,
            0,
        );

        assert_eq!(run.trace_id, run.id);
        assert!(run.parent_run_id.is_none());
        assert!(run.dotted_order.ends_with(&run.id.to_string()));
    }

    #[test]
    fn child_run_inherits_trace_id_and_extends_dotted_order() {
        let root = RunBuilder::build(
            NewRun {
                name: "root".into(),
                run_type: RunType::Chain,
                inputs: json!({}),
                session_name: "default".into(),
                tags: vec![],
                extra: HashMap::new(),
                id: None,
                start_time: None,
            },
            None,
            0,
        );

        let parent = ParentRef {
            trace_id: root.trace_id,
            dotted_order: root.dotted_order.clone(),
        };

        let child = RunBuilder::build(
            NewRun {
                name: "child".into(),
                run_type: RunType::Tool,
                inputs: json!({}),
                session_name: "default".into(),
                tags: vec![],
                extra: HashMap::new(),
                id: None,
                start_time: None,
            },
            Some(&parent),
            0,
        );

        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_run_id, Some(root.id));
        assert!(child.dotted_order.starts_with(&root.dotted_order));
    }

    #[test]
    fn deeply_nested_but_acyclic_value_serializes_without_panicking() {
        let mut inner = json!({"leaf": true});
        for _ in 0..200 {
            inner = json!({"nested": inner});
        }
        let safe = to_circular_safe_json(&inner);
        // Depth cap kicks in; result still serializes cleanly.
        let _ = serde_json::to_string(&safe).unwrap();
    }

    #[test]
    fn plain_value_is_unchanged() {
        let v = json!({"a": 1, "b": [1, 2, 3]});
        assert_eq!(to_circular_safe_json(&v), v);
    }
}
