//! Structural checks for values crossing the test-runner boundary.

use dtx_protocol::{TestStatus, TestSummary};
use dtx_runtime::{Error, Result};
use serde_json::Value;

const SUMMARY_SHAPE: &str =
	r#"{ title: string, fullName: string, status: "running" | "passed" | "failed", timedOut?: boolean }"#;

/// Test summary as handed over by a runner adapter.
///
/// Typed summaries are already well-formed; raw JSON ones are checked field
/// by field before use.
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryInput {
	Typed(TestSummary),
	Raw(Value),
}

impl From<TestSummary> for SummaryInput {
	fn from(summary: TestSummary) -> Self {
		Self::Typed(summary)
	}
}

impl From<&TestSummary> for SummaryInput {
	fn from(summary: &TestSummary) -> Self {
		Self::Typed(summary.clone())
	}
}

impl From<Value> for SummaryInput {
	fn from(value: Value) -> Self {
		Self::Raw(value)
	}
}

/// Validates the summary passed to `method`.
pub fn test_summary(method: &str, input: SummaryInput) -> Result<TestSummary> {
	let value = match input {
		SummaryInput::Typed(summary) => return Ok(summary),
		SummaryInput::Raw(value) => value,
	};

	let invalid = |reason: &str| {
		Error::validation(
			format!("Invalid test summary was passed to {method}(summary): {reason}. Expected an object of type: {SUMMARY_SHAPE}"),
			&value,
		)
	};

	let Some(object) = value.as_object() else {
		return Err(invalid("not an object"));
	};
	let title = object.get("title").and_then(Value::as_str).ok_or_else(|| invalid("title must be a string"))?;
	let full_name = object
		.get("fullName")
		.and_then(Value::as_str)
		.ok_or_else(|| invalid("fullName must be a string"))?;
	let status = object
		.get("status")
		.and_then(Value::as_str)
		.and_then(TestStatus::parse)
		.ok_or_else(|| invalid("status must be one of running, passed, failed"))?;
	let timed_out = match object.get("timedOut") {
		None | Some(Value::Null) => None,
		Some(Value::Bool(flag)) => Some(*flag),
		Some(_) => return Err(invalid("timedOut must be a boolean")),
	};

	let mut summary = TestSummary::new(title, full_name, status);
	summary.timed_out = timed_out;
	Ok(summary)
}
