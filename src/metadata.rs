//! Per-node evaluation metadata
//!
//! When evaluation runs in annotating mode, every list and map node visited is
//! stamped with what happened to it: the value it finally produced, the
//! function applied at it, and the form a macro expanded it into. A node that
//! is evaluated again is overwritten; the last run wins.

use std::cell::RefCell;
use std::fmt;

use crate::ast::Value;

#[derive(Default)]
pub struct EvalMetadata {
    evaluated: RefCell<Option<Value>>,
    applied: RefCell<Option<Value>>,
    expansion: RefCell<Option<Value>>,
}

impl EvalMetadata {
    /// Final value the node produced, after macro expansion and tail calls
    pub fn last_evaluated(&self) -> Option<Value> {
        self.evaluated.borrow().clone()
    }

    /// Function or macro applied at this call site
    pub fn last_applied(&self) -> Option<Value> {
        self.applied.borrow().clone()
    }

    /// Form a macro call expanded into
    pub fn last_expansion(&self) -> Option<Value> {
        self.expansion.borrow().clone()
    }

    pub(crate) fn stamp_evaluated(&self, value: Value) {
        // The previous value is dropped after the borrow ends
        let _previous = self.evaluated.replace(Some(value));
    }

    pub(crate) fn stamp_applied(&self, function: Value) {
        let _previous = self.applied.replace(Some(function));
    }

    pub(crate) fn stamp_expansion(&self, form: Value) {
        let _previous = self.expansion.replace(Some(form));
    }

    /// Forget everything stamped on this node
    pub fn clear(&self) {
        self.evaluated.replace(None);
        self.applied.replace(None);
        self.expansion.replace(None);
    }
}

impl fmt::Debug for EvalMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalMetadata")
            .field("evaluated", &self.evaluated.borrow().is_some())
            .field("applied", &self.applied.borrow().is_some())
            .field("expansion", &self.expansion.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{list, sym, val};

    #[test]
    fn test_stamps_overwrite() {
        let node = list(vec![sym("+"), val(1)]);
        let Some(meta) = node.metadata() else {
            panic!("lists carry metadata");
        };
        assert_eq!(meta.last_evaluated(), None);

        meta.stamp_evaluated(val(1));
        meta.stamp_evaluated(val(2));
        assert_eq!(meta.last_evaluated(), Some(val(2)));

        meta.stamp_expansion(val("x"));
        assert_eq!(meta.last_expansion(), Some(val("x")));
        assert_eq!(meta.last_applied(), None);

        meta.clear();
        assert_eq!(meta.last_evaluated(), None);
        assert_eq!(meta.last_expansion(), None);
    }

    #[test]
    fn test_atoms_have_no_metadata() {
        assert!(val(1).metadata().is_none());
        assert!(sym("a").metadata().is_none());
    }

    #[test]
    fn test_stamps_visible_through_clones() {
        let node = list(vec![val(1)]);
        let alias = node.clone();
        if let Some(meta) = node.metadata() {
            meta.stamp_evaluated(val(9));
        }
        assert_eq!(
            alias.metadata().and_then(|m| m.last_evaluated()),
            Some(val(9))
        );
    }
}
