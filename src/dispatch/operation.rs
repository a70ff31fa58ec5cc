//! Operation stack: the ancestry of the currently-executing dispatch.
//!
//! Strictly nested per cascade branch — a frame is pushed before a nested
//! dispatch and popped when it completes, success or failure, via the RAII
//! guard. The stack is a linear ancestry, never a general graph.

use std::sync::{Arc, Mutex};

use crate::message::Message;

/// What kind of work an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Handler,
    Query,
}

/// Position of an operation in the dispatch ancestry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// No ancestor: the caller's own dispatch.
    Root,
    /// Created by cascading dispatch.
    Branch,
}

/// One node of the dispatch stack.
#[derive(Debug, Clone)]
pub struct Operation {
    pub op_type: OperationType,
    pub kind: OperationKind,
    /// Message being processed; `None` for parameterless queries.
    pub message: Option<Arc<Message>>,
    /// The executing component.
    pub component: String,
}

impl Operation {
    pub fn handler(
        kind: OperationKind,
        message: Arc<Message>,
        component: impl Into<String>,
    ) -> Self {
        Self {
            op_type: OperationType::Handler,
            kind,
            message: Some(message),
            component: component.into(),
        }
    }

    pub fn query(message: Option<Arc<Message>>, component: impl Into<String>) -> Self {
        Self {
            op_type: OperationType::Query,
            kind: OperationKind::Root,
            message,
            component: component.into(),
        }
    }
}

/// The per-dispatch operation stack.
#[derive(Default)]
pub struct OperationStack {
    frames: Mutex<Vec<Operation>>,
}

impl OperationStack {
    /// Push a frame; the returned guard pops it on drop.
    pub fn push(&self, operation: Operation) -> FrameGuard<'_> {
        self.frames
            .lock()
            .expect("operation stack lock")
            .push(operation);
        FrameGuard { stack: self }
    }

    fn pop(&self) {
        self.frames.lock().expect("operation stack lock").pop();
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().expect("operation stack lock").len()
    }

    /// The operation currently executing, innermost frame.
    pub fn current(&self) -> Option<Operation> {
        self.frames
            .lock()
            .expect("operation stack lock")
            .last()
            .cloned()
    }

    /// Snapshot of the ancestry, root first.
    pub fn trace(&self) -> Vec<Operation> {
        self.frames.lock().expect("operation stack lock").clone()
    }
}

/// Pops its frame when dropped, so failures unwind the stack too.
pub struct FrameGuard<'a> {
    stack: &'a OperationStack,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.stack.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frames_pop_on_guard_drop() {
        let stack = OperationStack::default();
        let message = Arc::new(Message::command("a", json!({})));

        let root = stack.push(Operation::handler(
            OperationKind::Root,
            message.clone(),
            "root",
        ));
        assert_eq!(stack.depth(), 1);
        {
            let _branch = stack.push(Operation::handler(
                OperationKind::Branch,
                message,
                "branch",
            ));
            assert_eq!(stack.depth(), 2);
            assert_eq!(stack.current().unwrap().component, "branch");
        }
        assert_eq!(stack.depth(), 1);
        drop(root);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_trace_is_root_first() {
        let stack = OperationStack::default();
        let message = Arc::new(Message::command("a", json!({})));
        let _root = stack.push(Operation::handler(
            OperationKind::Root,
            message.clone(),
            "root",
        ));
        let _branch = stack.push(Operation::handler(OperationKind::Branch, message, "branch"));

        let trace = stack.trace();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].kind, OperationKind::Root);
        assert_eq!(trace[1].kind, OperationKind::Branch);
    }
}
