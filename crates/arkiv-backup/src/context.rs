//! Job context and the traversal frame stack

use arkiv_core::Value;

use crate::scalar::Scalar;
use crate::schema::ContextVar;

/// Job-level values for a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobContext {
    pub activity_id: i64,
    pub course_module_id: i64,
    /// Resolved once per job; when false, user-data subtrees are not walked
    pub include_user_data: bool,
}

impl JobContext {
    pub fn new(activity_id: i64, course_module_id: i64) -> Self {
        Self {
            activity_id,
            course_module_id,
            include_user_data: true,
        }
    }

    pub fn without_user_data(mut self) -> Self {
        self.include_user_data = false;
        self
    }
}

/// One level of the traversal: the record currently being descended into.
///
/// Frames borrow their parent, so the chain lives on the call stack of the
/// recursive walk and is never mutated.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub parent: Option<&'a Frame<'a>>,
    /// Name of the element the record belongs to; empty above the root
    pub element: &'a str,
    /// `None` for grouping records, which have no identity
    pub identity: Option<&'a Scalar>,
}

impl<'a> Frame<'a> {
    pub fn root() -> Self {
        Frame {
            parent: None,
            element: "",
            identity: None,
        }
    }

    pub fn child(&'a self, element: &'a str, identity: Option<&'a Scalar>) -> Frame<'a> {
        Frame {
            parent: Some(self),
            element,
            identity,
        }
    }

    /// Identity of the nearest record that came from a data source.
    pub fn parent_identity(&self) -> Option<&'a Scalar> {
        let mut current = Some(self);
        while let Some(frame) = current {
            if let Some(identity) = frame.identity {
                return Some(identity);
            }
            current = frame.parent;
        }
        None
    }
}

/// Resolves `var` for a query parameter, or `None` when it has no value at
/// this point of the walk.
pub fn resolve(var: ContextVar, frame: &Frame<'_>, job: &JobContext) -> Option<Value> {
    match var {
        ContextVar::ParentId => frame.parent_identity().map(Scalar::to_value),
        ContextVar::ActivityId => Some(Value::Integer(job.activity_id)),
        ContextVar::ModuleId => Some(Value::Integer(job.course_module_id)),
    }
}
