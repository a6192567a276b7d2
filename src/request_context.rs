use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::info;

/// Per-request timing context. Owned by the orchestrator; phases are
/// recorded sequentially, so no interior locking is needed.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub trace_id: String,
    pub start: Instant,
    phase_timings: HashMap<&'static str, Duration>,
}

impl RequestContext {
    pub fn new(request_id: String, trace_id: String) -> Self {
        Self {
            request_id,
            trace_id,
            start: Instant::now(),
            phase_timings: HashMap::new(),
        }
    }

    /// Run `f` under the named phase and record its elapsed time
    pub fn phase<T>(&mut self, name: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.phase_timings.insert(name, start.elapsed());
        out
    }

    pub fn record_phase(&mut self, name: &'static str, elapsed: Duration) {
        self.phase_timings.insert(name, elapsed);
    }

    pub fn phase_millis(&self, name: &str) -> u64 {
        self.phase_timings
            .get(name)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn total_elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn log_summary(&self) {
        let phases: Vec<String> = self
            .phase_timings
            .iter()
            .map(|(name, d)| format!("{name}={}ms", d.as_millis()))
            .collect();
        info!(
            request_id = %self.request_id,
            trace_id = %self.trace_id,
            total_ms = self.total_elapsed().as_millis() as u64,
            phases = %phases.join(", "),
            "request summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_recorded() {
        let mut ctx = RequestContext::new("req-1".into(), "trace-1".into());
        let v = ctx.phase("parse_request", || 7);
        assert_eq!(v, 7);
        ctx.record_phase("streaming", Duration::from_millis(120));
        assert_eq!(ctx.phase_millis("streaming"), 120);
        assert_eq!(ctx.phase_millis("missing"), 0);
    }
}
