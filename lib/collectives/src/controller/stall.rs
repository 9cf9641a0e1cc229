// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use super::table::{MessageTable, PartialName};

/// Warns about operations that only some ranks have submitted.
///
/// A rank that never submits a name the others are waiting for is the usual cause of
/// a hung training step; the warning names the missing ranks.
pub struct StallInspector {
    warning_time: Duration,
    last_check: Instant,
}

impl StallInspector {
    pub fn new(warning_time: Duration) -> Self {
        Self {
            warning_time,
            last_check: Instant::now(),
        }
    }

    /// Inspect `table` at most once per warning interval. Returns the names that have
    /// been waiting longer than the interval.
    pub fn check(&mut self, table: &MessageTable, now: Instant) -> Vec<PartialName> {
        if now.saturating_duration_since(self.last_check) < self.warning_time {
            return Vec::new();
        }
        self.last_check = now;

        let stalled: Vec<PartialName> = table
            .partial()
            .into_iter()
            .filter(|p| now.saturating_duration_since(p.first_seen) >= self.warning_time)
            .collect();

        for p in &stalled {
            tracing::warn!(
                name = %p.name,
                missing_ranks = ?p.missing,
                waited_secs = now.saturating_duration_since(p.first_seen).as_secs(),
                "one or more ranks have not submitted this operation; training may be stalled"
            );
        }
        stalled
    }
}
