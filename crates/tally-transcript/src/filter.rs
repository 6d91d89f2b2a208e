use tally_core::Event;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutcomeFilter {
    #[default]
    Any,
    SuccessOnly,
    FailureOnly,
}

/// Selection applied to decoded events before they are emitted.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Inclusive lower bound.
    pub start: Option<OffsetDateTime>,
    /// Exclusive upper bound.
    pub end: Option<OffsetDateTime>,
    pub sessions: Vec<String>,
    /// Case-insensitive; applies to invocation events only.
    pub include_tools: Vec<String>,
    pub exclude_tools: Vec<String>,
    /// Applies to result events only.
    pub outcome: OutcomeFilter,
    /// Keep every ⌊1/r⌋-th eligible event, `r ∈ (0, 1]`.
    pub sample_rate: Option<f64>,
    pub max_events: Option<usize>,
}

impl EventFilter {
    /// Whether `event` passes every criterion except sampling and the event cap.
    pub fn matches(&self, event: &Event) -> bool {
        let ts = event.ts();
        if self.start.is_some_and(|start| ts < start) {
            return false;
        }
        if self.end.is_some_and(|end| ts >= end) {
            return false;
        }
        if !self.sessions.is_empty() && !self.sessions.iter().any(|s| s == event.session()) {
            return false;
        }

        match event {
            Event::ToolInvocation { tool_name, .. } => {
                if !self.include_tools.is_empty()
                    && !self
                        .include_tools
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(tool_name))
                {
                    return false;
                }
                !self
                    .exclude_tools
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(tool_name))
            }
            Event::ToolResult { error, .. } => match self.outcome {
                OutcomeFilter::Any => true,
                OutcomeFilter::SuccessOnly => error.is_none(),
                OutcomeFilter::FailureOnly => error.is_some(),
            },
            _ => true,
        }
    }

    pub fn sampler(&self) -> Sampler {
        Sampler::new(self.sample_rate)
    }
}

/// Deterministic every-n-th selector over eligible events.
#[derive(Debug, Clone)]
pub struct Sampler {
    interval: usize,
    eligible: usize,
}

impl Sampler {
    /// Rates outside `(0, 1)` disable sampling.
    pub fn new(rate: Option<f64>) -> Self {
        let interval = match rate {
            Some(r) if r > 0.0 && r < 1.0 => ((1.0 / r).floor() as usize).max(1),
            _ => 1,
        };
        Self {
            interval,
            eligible: 0,
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Register one eligible event and report whether it is kept.
    pub fn keep(&mut self) -> bool {
        let idx = self.eligible;
        self.eligible += 1;
        idx % self.interval == 0
    }
}
