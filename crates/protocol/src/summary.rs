//! Test-boundary value objects.

use serde::{Deserialize, Serialize};

/// Status reported by the test runner at a test boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
	Running,
	Passed,
	Failed,
}

impl TestStatus {
	/// Parses the lowercase wire spelling.
	pub fn parse(value: &str) -> Option<Self> {
		match value {
			"running" => Some(Self::Running),
			"passed" => Some(Self::Passed),
			"failed" => Some(Self::Failed),
			_ => None,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Running => "running",
			Self::Passed => "passed",
			Self::Failed => "failed",
		}
	}
}

impl std::fmt::Display for TestStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Summary of one test passed to `before_each`/`after_each`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
	pub title: String,
	pub full_name: String,
	pub status: TestStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timed_out: Option<bool>,
}

impl TestSummary {
	pub fn new(title: impl Into<String>, full_name: impl Into<String>, status: TestStatus) -> Self {
		Self {
			title: title.into(),
			full_name: full_name.into(),
			status,
			timed_out: None,
		}
	}

	pub fn with_timed_out(mut self, timed_out: bool) -> Self {
		self.timed_out = Some(timed_out);
		self
	}

	pub fn timed_out(&self) -> bool {
		self.timed_out.unwrap_or(false)
	}
}

/// Suite descriptor passed to `suite_start`/`suite_end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteInfo {
	pub name: String,
}

impl SuiteInfo {
	pub fn new(name: impl Into<String>) -> Self {
		Self { name: name.into() }
	}
}
