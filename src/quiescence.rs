// Copyright 2024, The Tremor Team
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

use event_listener::Event;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Inner {
    state: AtomicU32,
    changed: Event,
}
impl Inner {
    // different states of the beacon, they only ever increase
    const RUNNING: u32 = 0x0;
    const DRAINING: u32 = 0x1;
    const STOPPED: u32 = 0x2;

    fn advance(&self, to: u32) {
        self.state.fetch_max(to, Ordering::AcqRel);
        self.changed.notify(usize::MAX);
    }

    async fn reached(&self, state: u32) {
        loop {
            if self.state.load(Ordering::Acquire) >= state {
                return;
            }
            let listener = self.changed.listen();
            // the state might have changed before we started listening
            if self.state.load(Ordering::Acquire) >= state {
                return;
            }
            listener.await;
        }
    }
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: AtomicU32::new(Self::RUNNING),
            changed: Event::new(),
        }
    }
}

/// Use this beacon to check if submission workers should keep retrying or give up entirely.
///
/// * draining: batches that are in flight finish, but no new backoff sleeps are started
/// * stopped: in-flight submissions are abandoned
#[derive(Debug, Clone, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct QuiescenceBeacon(Arc<Inner>);

impl QuiescenceBeacon {
    /// returns `true` if failed submissions should still be retried
    #[must_use]
    pub fn continue_retrying(&self) -> bool {
        self.0.state.load(Ordering::Acquire) == Inner::RUNNING
    }

    /// returns `true` once a full stop was requested
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.state.load(Ordering::Acquire) >= Inner::STOPPED
    }

    /// notify consumers of this beacon that no new retries should be started
    pub fn drain(&self) {
        self.0.advance(Inner::DRAINING);
    }

    /// notify consumers of this beacon that all in-flight work should be abandoned
    pub fn full_stop(&self) {
        self.0.advance(Inner::STOPPED);
    }

    /// resolves once draining (or a full stop) was requested
    pub async fn draining(&self) {
        self.0.reached(Inner::DRAINING).await;
    }

    /// resolves once a full stop was requested
    pub async fn stopped(&self) {
        self.0.reached(Inner::STOPPED).await;
    }
}
