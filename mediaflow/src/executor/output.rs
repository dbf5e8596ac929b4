//! Classification and buffering of stage output lines.

use crate::config::ExecutorConfig;
use crate::errors::ConfigurationError;
use regex::{Regex, RegexBuilder};
use std::collections::VecDeque;

/// Severity assigned to one line of stage output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Progress bars and download chatter; dropped.
    Noise,
    /// Ordinary output.
    Normal,
    /// Contains a failure keyword; logged at error level whatever the
    /// eventual exit code.
    Escalated,
}

/// Noise denylist plus failure keywords, compiled once.
#[derive(Debug, Clone)]
pub struct OutputFilter {
    noise: Vec<Regex>,
    failure: Vec<Regex>,
}

impl OutputFilter {
    /// Compiles the filter.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] naming the first invalid pattern.
    pub fn new<S: AsRef<str>>(noise: &[S], failure: &[S]) -> Result<Self, ConfigurationError> {
        let compile = |pattern: &str, case_insensitive: bool| {
            RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|e| {
                    ConfigurationError::new(format!("invalid output pattern '{pattern}': {e}"))
                })
        };
        Ok(Self {
            noise: noise
                .iter()
                .map(|p| compile(p.as_ref(), false))
                .collect::<Result<_, _>>()?,
            failure: failure
                .iter()
                .map(|p| compile(p.as_ref(), true))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Compiles the filter from executor settings.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn from_config(config: &ExecutorConfig) -> Result<Self, ConfigurationError> {
        Self::new(
            config.noise_patterns.as_slice(),
            config.failure_keywords.as_slice(),
        )
    }

    /// Classifies a line. Failure keywords win over noise.
    #[must_use]
    pub fn classify(&self, line: &str) -> LineClass {
        if self.failure.iter().any(|r| r.is_match(line)) {
            LineClass::Escalated
        } else if self.noise.iter().any(|r| r.is_match(line)) {
            LineClass::Noise
        } else {
            LineClass::Normal
        }
    }
}

/// Bounded buffer of the most recent lines.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl TailBuffer {
    /// Creates a buffer keeping at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Appends a line, evicting the oldest when full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Number of buffered lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The buffered lines, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}
