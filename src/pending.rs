// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-shot handle for a caller awaiting an outcome.

use tokio::sync::oneshot;
use tracing::debug;

/// A caller waiting for exactly one outcome.
///
/// Resolving consumes the handle, so a request can never be answered twice.
#[derive(Debug)]
pub struct PendingRequest<T> {
    label: &'static str,
    reply: oneshot::Sender<T>,
}

impl<T> PendingRequest<T> {
    pub fn new(label: &'static str, reply: oneshot::Sender<T>) -> Self {
        Self { label, reply }
    }

    pub fn resolve(self, outcome: T) {
        if self.reply.send(outcome).is_err() {
            debug!("{} requester went away before resolution", self.label);
        }
    }

    /// The caller stopped waiting.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}
