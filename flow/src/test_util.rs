// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for tests of chains

use crate::flow::Flow;
use crate::flow::FlowFunc;
use cirrus_common::api::error::Error;
use std::sync::Arc;
use std::sync::Mutex;

/// Records every forward and rollback action, in order
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub(crate) fn record(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// A step that journals "run NAME" and "undo NAME", stores `true` under its
/// own name on success, and fails with `fail_with` if given
pub(crate) fn journaled_step(
    journal: &Journal,
    name: &'static str,
    fail_with: Option<Error>,
) -> Arc<dyn Flow> {
    let run_journal = journal.clone();
    let undo_journal = journal.clone();
    FlowFunc::new(
        name,
        move |sctx| {
            let journal = run_journal.clone();
            let fail_with = fail_with.clone();
            async move {
                journal.record(format!("run {}", name));
                match fail_with {
                    Some(error) => Err(error),
                    None => sctx.insert(name, &true),
                }
            }
        },
        move |_| {
            let journal = undo_journal.clone();
            async move {
                journal.record(format!("undo {}", name));
                Ok(())
            }
        },
    )
}
