// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cell::RefCell;
use std::fmt::Display;
use std::rc::Rc;

/// Collects violations found while walking state, so a check reports all of them at once.
///
/// Scoped views made with [`MessageAccumulator::with_prefix`] append to the same list, each
/// prefixing what it records with where in the state it is looking.
#[derive(Default, Clone)]
pub struct MessageAccumulator {
    msgs: Rc<RefCell<Vec<String>>>,
    prefix: String,
}

impl MessageAccumulator {
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self { msgs: Rc::clone(&self.msgs), prefix: format!("{}{}", self.prefix, prefix) }
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.borrow().is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.msgs.borrow().clone()
    }

    pub fn add(&self, msg: &str) {
        let line = format!("{}{}", self.prefix, msg);
        self.msgs.borrow_mut().push(line);
    }

    /// Records `msg` when `predicate` fails.
    pub fn require(&self, predicate: bool, msg: &str) {
        if !predicate {
            self.add(msg)
        }
    }

    /// Records `msg` with the error appended when `result` is an error.
    pub fn require_no_error<V, E: Display>(&self, result: Result<V, E>, msg: &str) {
        if let Err(e) = result {
            self.add(&format!("{}: {}", msg, e))
        }
    }

    pub fn assert_empty(&self) {
        let msgs = self.messages();
        assert!(msgs.is_empty(), "state violations:\n{}", msgs.join("\n"));
    }

    /// Asserts one recorded message per pattern, in order, each containing its pattern.
    pub fn assert_expected(&self, expected_patterns: &[&str]) {
        let msgs = self.messages();
        assert_eq!(expected_patterns.len(), msgs.len(), "recorded messages: {:?}", msgs);
        for (msg, pattern) in msgs.iter().zip(expected_patterns) {
            assert!(msg.contains(pattern), "'{}' does not mention '{}'", msg, pattern);
        }
    }
}
