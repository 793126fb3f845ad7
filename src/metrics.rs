//! Per-request generation metrics.

use serde::{Deserialize, Serialize};

use crate::engine::EngineSnapshot;

/// Timings for secondary media produced alongside the text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxDurations {
    pub vision_us: u64,
    pub audio_us: u64,
}

/// Counts and timings for one submission. Immutable once returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
    pub prefill_us: u64,
    pub decode_us: u64,
    pub aux: AuxDurations,
}

impl GenerationResult {
    /// Prompt tokens processed per second of prefill, or 0.0 without timing.
    pub fn prefill_tokens_per_sec(&self) -> f64 {
        if self.prefill_us > 0 {
            self.prompt_tokens as f64 / (self.prefill_us as f64 / 1e6)
        } else {
            0.0
        }
    }

    /// Tokens generated per second of decode, or 0.0 without timing.
    pub fn decode_tokens_per_sec(&self) -> f64 {
        if self.decode_us > 0 {
            self.generated_tokens as f64 / (self.decode_us as f64 / 1e6)
        } else {
            0.0
        }
    }
}

/// Accumulates engine-reported counters into a [`GenerationResult`].
///
/// A missing snapshot contributes nothing, so a request whose engine never
/// produced a result handle finishes with a zero-valued result.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    result: GenerationResult,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one request's totals.
    ///
    /// Snapshots are cumulative for their request, so call this once per
    /// request with the final snapshot; absorbing per step counts the same
    /// tokens again.
    pub fn absorb(&mut self, snapshot: Option<&EngineSnapshot>) {
        let Some(snap) = snapshot else {
            return;
        };
        let r = &mut self.result;
        r.prompt_tokens = r.prompt_tokens.saturating_add(snap.prompt_tokens);
        r.generated_tokens = r.generated_tokens.saturating_add(snap.generated_tokens);
        r.prefill_us = r.prefill_us.saturating_add(snap.prefill_us);
        r.decode_us = r.decode_us.saturating_add(snap.decode_us);
        r.aux.vision_us = r.aux.vision_us.saturating_add(snap.vision_us);
        r.aux.audio_us = r.aux.audio_us.saturating_add(snap.audio_us);
    }

    pub fn current(&self) -> &GenerationResult {
        &self.result
    }

    pub fn finish(self) -> GenerationResult {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> EngineSnapshot {
        EngineSnapshot {
            prompt_tokens: 10,
            generated_tokens: 4,
            prefill_us: 2_000,
            decode_us: 1_000,
            vision_us: 5,
            audio_us: 7,
        }
    }

    #[test]
    fn test_absent_snapshot_yields_zero_result() {
        let mut collector = MetricsCollector::new();
        collector.absorb(None);
        assert_eq!(collector.finish(), GenerationResult::default());
    }

    #[test]
    fn test_absorb_copies_fields() {
        let mut collector = MetricsCollector::new();
        collector.absorb(Some(&snapshot()));
        let result = collector.finish();
        assert_eq!(result.prompt_tokens, 10);
        assert_eq!(result.generated_tokens, 4);
        assert_eq!(result.prefill_us, 2_000);
        assert_eq!(result.decode_us, 1_000);
        assert_eq!(result.aux, AuxDurations { vision_us: 5, audio_us: 7 });
    }

    #[test]
    fn test_absorb_accumulates() {
        let mut collector = MetricsCollector::new();
        collector.absorb(Some(&snapshot()));
        collector.absorb(Some(&snapshot()));
        assert_eq!(collector.current().prompt_tokens, 20);
        assert_eq!(collector.current().aux.audio_us, 14);
    }

    #[test]
    fn test_absorb_saturates() {
        let mut collector = MetricsCollector::new();
        let big = EngineSnapshot {
            decode_us: u64::MAX,
            ..EngineSnapshot::default()
        };
        collector.absorb(Some(&big));
        collector.absorb(Some(&big));
        assert_eq!(collector.current().decode_us, u64::MAX);
    }

    #[test]
    fn test_throughput() {
        let result = GenerationResult {
            prompt_tokens: 10,
            generated_tokens: 4,
            prefill_us: 2_000,
            decode_us: 1_000,
            ..GenerationResult::default()
        };
        assert!((result.prefill_tokens_per_sec() - 5_000.0).abs() < 1e-6);
        assert!((result.decode_tokens_per_sec() - 4_000.0).abs() < 1e-6);
        assert_eq!(GenerationResult::default().decode_tokens_per_sec(), 0.0);
    }
}
