// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Reassembly of streamed tool-call fragments into complete calls, keyed by
//! the stable `id` every [`crate::ToolCallFragment`] carries by the time it
//! reaches this stage.

use std::collections::HashMap;

use crate::types::{ResponseEvent, ToolCallFragment};

/// Accumulates [`ResponseEvent::ToolCallDelta`]/[`ResponseEvent::ToolCallsReplace`]
/// events into a stable, ordered list of complete tool calls.
///
/// Two reassembly strategies exist on the wire:
/// - delta-by-id: successive fragments for the same `id` have their
///   `arguments` strings concatenated (OpenAI- and Anthropic-family drivers).
/// - wholesale replace: a single event carries the complete call list, which
///   simply overwrites whatever was accumulated so far (Google-family
///   drivers, whose function calls arrive as a single event, not fragments).
#[derive(Debug, Default)]
pub struct ToolCallAggregator {
    order: Vec<String>,
    by_id: HashMap<String, ToolCallFragment>,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event into the aggregator. Non-tool-call events are ignored.
    pub fn push(&mut self, event: &ResponseEvent) {
        match event {
            ResponseEvent::ToolCallDelta(frag) => self.merge_delta(frag.clone()),
            ResponseEvent::ToolCallsReplace(calls) => self.replace(calls.clone()),
            _ => {}
        }
    }

    fn merge_delta(&mut self, frag: ToolCallFragment) {
        match self.by_id.get_mut(&frag.id) {
            Some(existing) => {
                if !frag.name.is_empty() {
                    existing.name = frag.name;
                }
                existing.arguments.push_str(&frag.arguments);
            }
            None => {
                self.order.push(frag.id.clone());
                self.by_id.insert(frag.id.clone(), frag);
            }
        }
    }

    fn replace(&mut self, calls: Vec<ToolCallFragment>) {
        self.order.clear();
        self.by_id.clear();
        for call in calls {
            self.order.push(call.id.clone());
            self.by_id.insert(call.id.clone(), call);
        }
    }

    /// Finalize accumulated fragments into complete tool calls, in the order
    /// their ids were first seen.
    pub fn finish(self) -> Vec<ToolCallFragment> {
        self.order
            .into_iter()
            .filter_map(|id| self.by_id.get(&id).cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
