// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::{Duration, Instant, SystemTime};

/// Process-local monotonic clock anchored at session init.
///
/// Timestamps are nanoseconds since the anchor. They are carried in the
/// trace for human-readable reporting only; the analyzer never compares
/// them across processes.
#[derive(Debug)]
pub struct TraceClock {
    origin: Instant,
    origin_wall: SystemTime,
}

impl Default for TraceClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            origin_wall: SystemTime::now(),
        }
    }
}

impl TraceClock {
    pub fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as _
    }

    /// Wall-clock time corresponding to a recorded timestamp, as a unix
    /// offset. Approximate; for report rendering only.
    pub fn ns_to_unix(&self, ts_ns: u64) -> Duration {
        let mut dt = Duration::from_nanos(ts_ns);
        if let Ok(d) = self.origin_wall.duration_since(SystemTime::UNIX_EPOCH) {
            dt += d;
        }
        dt
    }
}
