use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::proxy::UpstreamResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
	DisableKey,
	BanKey,
	Alert,
	Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCodeOp {
	Equals,
	NotEquals,
	GreaterThan,
	LessThan,
	InRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyOp {
	Contains,
	NotContains,
	Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonPathOp {
	Equals,
	NotEquals,
	Exists,
	IsNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderOp {
	Equals,
	NotEquals,
	Contains,
	LessThan,
	NotExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyOp {
	GreaterThan,
	LessThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeLogic {
	#[serde(rename = "AND")]
	And,
	#[serde(rename = "OR")]
	Or,
}

/// Predicate tree evaluated against an upstream response. Evaluation is
/// total: malformed values, bad regexes, and non-JSON bodies make the node
/// false, never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
	StatusCode {
		operator: StatusCodeOp,
		value: Value,
	},
	ResponseBody {
		operator: BodyOp,
		value: String,
	},
	JsonPath {
		path: String,
		operator: JsonPathOp,
		#[serde(default)]
		value: Value,
	},
	ResponseHeader {
		header_name: String,
		operator: HeaderOp,
		#[serde(default)]
		value: Value,
	},
	Latency {
		operator: LatencyOp,
		value: i64,
	},
	Composite {
		logic: CompositeLogic,
		conditions: Vec<RuleCondition>,
	},
}

impl RuleCondition {
	pub fn matches(&self, resp: &UpstreamResponse) -> bool {
		match self {
			RuleCondition::StatusCode { operator, value } => {
				check_status(*operator, value, resp.status)
			},
			RuleCondition::ResponseBody { operator, value } => match operator {
				BodyOp::Contains => resp.body.contains(value),
				BodyOp::NotContains => !resp.body.contains(value),
				BodyOp::Regex => Regex::new(value)
					.map(|re| re.is_match(&resp.body))
					.unwrap_or(false),
			},
			RuleCondition::JsonPath {
				path,
				operator,
				value,
			} => check_json_path(path, *operator, value, &resp.body),
			RuleCondition::ResponseHeader {
				header_name,
				operator,
				value,
			} => check_header(header_name, *operator, value, resp),
			RuleCondition::Latency { operator, value } => match operator {
				LatencyOp::GreaterThan => (resp.latency_ms as i64) > *value,
				LatencyOp::LessThan => (resp.latency_ms as i64) < *value,
			},
			RuleCondition::Composite { logic, conditions } => match logic {
				CompositeLogic::And => conditions.iter().all(|c| c.matches(resp)),
				CompositeLogic::Or => conditions.iter().any(|c| c.matches(resp)),
			},
		}
	}
}

fn check_status(op: StatusCodeOp, value: &Value, status: u16) -> bool {
	let status = status as i64;
	match op {
		StatusCodeOp::InRange => {
			// value is [min, max], both inclusive
			let Some(range) = value.as_array() else {
				return false;
			};
			let (Some(min), Some(max)) = (
				range.first().and_then(Value::as_i64),
				range.get(1).and_then(Value::as_i64),
			) else {
				return false;
			};
			min <= status && status <= max
		},
		_ => {
			let Some(expected) = value.as_i64() else {
				return false;
			};
			match op {
				StatusCodeOp::Equals => status == expected,
				StatusCodeOp::NotEquals => status != expected,
				StatusCodeOp::GreaterThan => status > expected,
				StatusCodeOp::LessThan => status < expected,
				StatusCodeOp::InRange => unreachable!(),
			}
		},
	}
}

fn check_json_path(path: &str, op: JsonPathOp, expected: &Value, body: &str) -> bool {
	let Ok(parsed) = serde_json::from_str::<Value>(body) else {
		return false;
	};
	// dot path over objects only; anything else ends the walk
	let mut current = Some(&parsed);
	for segment in path.split('.') {
		current = match current {
			Some(Value::Object(map)) => map.get(segment),
			_ => None,
		};
	}
	match op {
		JsonPathOp::Equals => current == Some(expected),
		JsonPathOp::NotEquals => current != Some(expected),
		JsonPathOp::Exists => current.is_some_and(|v| !v.is_null()),
		JsonPathOp::IsNull => current.is_none_or(|v| v.is_null()),
	}
}

fn check_header(name: &str, op: HeaderOp, expected: &Value, resp: &UpstreamResponse) -> bool {
	let header_value = resp
		.headers
		.get(name)
		.and_then(|v| v.to_str().ok());
	let Some(actual) = header_value else {
		return op == HeaderOp::NotExists;
	};
	let expected_str = match expected {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	};
	match op {
		HeaderOp::Equals => actual == expected_str,
		HeaderOp::NotEquals => actual != expected_str,
		HeaderOp::Contains => actual.contains(&expected_str),
		HeaderOp::LessThan => match (actual.parse::<i64>(), expected_str.parse::<i64>()) {
			(Ok(a), Ok(e)) => a < e,
			_ => false,
		},
		HeaderOp::NotExists => false,
	}
}
