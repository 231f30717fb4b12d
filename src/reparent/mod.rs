//! Dotted-order reparenting for interop with externally-rooted traces.
//!
//! An exporter (e.g. an OTEL adapter, out of scope for this crate) that
//! discovers a root run actually belongs under an external parent computes
//! a sequence of rewrite actions; this module applies them to dotted-order
//! strings. Actions accumulate per-trace and compose left-to-right.

use uuid::Uuid;

/// One rewrite action produced by an exporter.
#[derive(Debug, Clone)]
pub enum RewriteAction {
    /// Rewrite occurrences of `source_id` to `target_id`.
    Rename { source_id: Uuid, target_id: Uuid },
    /// Replace the dotted-order prefix up to `run_id`'s segment with
    /// `parent_dot_order`'s segments.
    Reparent {
        run_id: Uuid,
        parent_dot_order: String,
    },
    /// Drop the segment belonging to `run_id`, collapsing the path.
    Delete { run_id: Uuid },
}

fn segment_run_id(segment: &str) -> Option<Uuid> {
    // The trailing 36 characters of a segment are always the run id.
    if segment.len() < 36 {
        return None;
    }
    Uuid::parse_str(&segment[segment.len() - 36..]).ok()
}

fn apply_one(dot_order: &str, action: &RewriteAction) -> String {
    let mut segments: Vec<String> = dot_order.split('.').map(String::from).collect();

    match action {
        RewriteAction::Rename {
            source_id,
            target_id,
        } => {
            for seg in segments.iter_mut() {
                if segment_run_id(seg) == Some(*source_id) {
                    let prefix_len = seg.len() - 36;
                    *seg = format!("{}{}", &seg[..prefix_len], target_id);
                }
            }
        }
        RewriteAction::Reparent {
            run_id,
            parent_dot_order,
        } => {
            if let Some(pos) = segments.iter().position(|s| segment_run_id(s) == Some(*run_id)) {
                let mut rewritten: Vec<String> =
                    parent_dot_order.split('.').map(String::from).collect();
                rewritten.extend(segments.split_off(pos));
                segments = rewritten;
            }
        }
        RewriteAction::Delete { run_id } => {
            segments.retain(|s| segment_run_id(s) != Some(*run_id));
        }
    }

    segments.join(".")
}

/// Applies a sequence of rewrite actions, in order, to a dotted-order string.
pub fn apply_actions(dot_order: &str, actions: &[RewriteAction]) -> String {
    actions
        .iter()
        .fold(dot_order.to_string(), |acc, action| apply_one(&acc, action))
}
