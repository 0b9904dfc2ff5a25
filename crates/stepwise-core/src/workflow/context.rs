//! Per-run execution context.
//!
//! `ExecutionContext` is the read-only state threaded through every step of a
//! run: identifiers, the original input, the cancellation token and the run
//! span. Nested branches and Map iterations get a derived context that shares
//! the run identity but carries a child token and, for Map, the current item.
//!
//! The context also renders the `$$` document that context paths read.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use stepwise_types::workflow::StateMachine;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The Map element an iteration is processing.
#[derive(Debug, Clone, PartialEq)]
pub struct MapItem {
    pub index: usize,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    /// The top-level definition of the run.
    pub workflow: Arc<StateMachine>,
    pub started_at: DateTime<Utc>,
    /// The decoded run input, exposed as `$$.Execution.Input`.
    pub input: Arc<Value>,
    pub cancel: CancellationToken,
    pub map_item: Option<MapItem>,
    pub span: tracing::Span,
}

impl ExecutionContext {
    pub fn new(workflow: Arc<StateMachine>, input: Value, cancel: CancellationToken) -> Self {
        let run_id = Uuid::now_v7();
        let span = tracing::info_span!(
            "execution",
            run_id = %run_id,
            start_at = workflow.start_at.as_str(),
        );
        Self {
            run_id,
            workflow,
            started_at: Utc::now(),
            input: Arc::new(input),
            cancel,
            map_item: None,
            span,
        }
    }

    /// A context for a Parallel branch: same run, cancellable on its own.
    pub fn child(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            map_item: None,
            ..self.clone()
        }
    }

    /// A context for one Map iteration.
    pub fn for_item(&self, cancel: CancellationToken, index: usize, value: Value) -> Self {
        Self {
            cancel,
            map_item: Some(MapItem { index, value }),
            ..self.clone()
        }
    }

    /// Build the `$$` document for a state about to run.
    pub fn to_context_document(&self, state_name: &str, retry_count: u32) -> Value {
        let mut doc = json!({
            "Execution": {
                "Id": self.run_id.to_string(),
                "Input": self.input.as_ref(),
                "StartTime": self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            },
            "State": {
                "Name": state_name,
                "EnteredTime": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "RetryCount": retry_count,
            },
            "StateMachine": {
                "StartAt": self.workflow.start_at,
            },
        });

        if let (Some(item), Some(obj)) = (&self.map_item, doc.as_object_mut()) {
            obj.insert(
                "Map".to_string(),
                json!({ "Item": { "Index": item.index, "Value": item.value } }),
            );
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> ExecutionContext {
        let workflow: StateMachine = serde_json::from_value(json!({
            "StartAt": "A",
            "States": { "A": { "Type": "Succeed" } }
        }))
        .unwrap();
        ExecutionContext::new(Arc::new(workflow), json!({ "n": 1 }), CancellationToken::new())
    }

    #[test]
    fn test_context_document_shape() {
        let ctx = sample_context();
        let doc = ctx.to_context_document("A", 2);

        assert_eq!(doc["Execution"]["Id"], json!(ctx.run_id.to_string()));
        assert_eq!(doc["Execution"]["Input"], json!({ "n": 1 }));
        assert_eq!(doc["State"]["Name"], json!("A"));
        assert_eq!(doc["State"]["RetryCount"], json!(2));
        assert_eq!(doc["StateMachine"]["StartAt"], json!("A"));
        assert!(doc.get("Map").is_none());
    }

    #[test]
    fn test_item_context_exposes_map_item() {
        let ctx = sample_context();
        let item = ctx.for_item(ctx.cancel.child_token(), 3, json!("d"));

        assert_eq!(item.run_id, ctx.run_id);
        let doc = item.to_context_document("Inner", 0);
        assert_eq!(doc["Map"]["Item"]["Index"], json!(3));
        assert_eq!(doc["Map"]["Item"]["Value"], json!("d"));
    }

    #[test]
    fn test_child_token_cancelled_by_parent() {
        let ctx = sample_context();
        let child = ctx.child(ctx.cancel.child_token());
        ctx.cancel.cancel();
        assert!(child.cancel.is_cancelled());
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(sample_context().run_id, sample_context().run_id);
    }
}
