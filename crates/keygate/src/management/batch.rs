use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{AdminError, CreateApiKey};
use crate::proxy::Gateway;
use crate::types::KeyPlacement;

#[derive(Debug, Serialize)]
pub(super) struct BatchResult {
	success_count: usize,
	failed_count: usize,
	errors: Vec<serde_json::Value>,
}

/// Row shape for CSV import/export:
/// `upstream_id,name,key_value,location,param_name,value_prefix,enable_quota,quota_total`
#[derive(Debug, Deserialize, Serialize)]
struct CsvKeyRow {
	upstream_id: i64,
	#[serde(default)]
	name: Option<String>,
	key_value: String,
	#[serde(default)]
	location: Option<String>,
	#[serde(default)]
	param_name: Option<String>,
	#[serde(default)]
	value_prefix: Option<String>,
	#[serde(default)]
	enable_quota: Option<String>,
	#[serde(default)]
	quota_total: Option<i64>,
}

fn parse_placement(location: Option<&str>) -> Result<KeyPlacement, String> {
	match location.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
		None | Some("") | Some("header") => Ok(KeyPlacement::Header),
		Some("query") => Ok(KeyPlacement::Query),
		Some("body") => Ok(KeyPlacement::Body),
		Some(other) => Err(format!("unknown location {other:?}")),
	}
}

fn row_error(result: &mut BatchResult, row: i64, error: String) {
	result.failed_count += 1;
	result
		.errors
		.push(serde_json::json!({ "row": row, "error": error }));
}

fn truthy(value: Option<&str>) -> bool {
	matches!(
		value.map(|s| s.trim().to_ascii_lowercase()).as_deref(),
		Some("true") | Some("1") | Some("yes")
	)
}

pub(super) async fn import_csv(
	State(gateway): State<Arc<Gateway>>,
	body: String,
) -> Result<Response, AdminError> {
	let known: HashSet<i64> = gateway
		.store()
		.list_upstreams()
		.await?
		.into_iter()
		.map(|u| u.id)
		.collect();

	let mut reader = csv::Reader::from_reader(body.as_bytes());
	let mut result = BatchResult {
		success_count: 0,
		failed_count: 0,
		errors: vec![],
	};

	// data rows start at 2, after the header line
	for (row_num, row) in (2..).zip(reader.deserialize::<CsvKeyRow>()) {
		let row = match row {
			Ok(row) => row,
			Err(e) => {
				row_error(&mut result, row_num, e.to_string());
				continue;
			},
		};
		if !known.contains(&row.upstream_id) {
			row_error(
				&mut result,
				row_num,
				format!("upstream {} does not exist", row.upstream_id),
			);
			continue;
		}
		let placement = match parse_placement(row.location.as_deref()) {
			Ok(p) => p,
			Err(e) => {
				row_error(&mut result, row_num, e);
				continue;
			},
		};
		let enable_quota = truthy(row.enable_quota.as_deref());
		let create = CreateApiKey {
			upstream_id: row.upstream_id,
			name: row.name,
			key_value: row.key_value,
			placement: Some(placement),
			param_name: row.param_name.filter(|s| !s.is_empty()),
			value_prefix: row.value_prefix,
			enable_quota,
			quota_total: row.quota_total.filter(|t| *t > 0),
			auto_disable_on_exhaustion: None,
			auto_enable_delay_hours: None,
		};
		match gateway.store().insert_api_key(&create.into_new()).await {
			Ok(_) => result.success_count += 1,
			Err(e) => row_error(&mut result, row_num, e.to_string()),
		}
	}

	info!(
		target: "audit",
		imported = result.success_count,
		failed = result.failed_count,
		"csv key import"
	);
	Ok(Json(result).into_response())
}

#[derive(Debug, Deserialize)]
pub(super) struct JsonImport {
	upstream_id: i64,
	keys: Vec<JsonImportKey>,
}

#[derive(Debug, Deserialize)]
struct JsonImportKey {
	name: Option<String>,
	key_value: String,
	placement: Option<KeyPlacement>,
	param_name: Option<String>,
	value_prefix: Option<String>,
	#[serde(default)]
	enable_quota: bool,
	quota_total: Option<i64>,
}

pub(super) async fn import_json(
	State(gateway): State<Arc<Gateway>>,
	Json(body): Json<JsonImport>,
) -> Result<Response, AdminError> {
	if gateway.store().get_upstream(body.upstream_id).await?.is_none() {
		return Err(AdminError(
			StatusCode::NOT_FOUND,
			format!("upstream {} does not exist", body.upstream_id),
		));
	}

	let mut result = BatchResult {
		success_count: 0,
		failed_count: 0,
		errors: vec![],
	};
	for (index, key) in body.keys.into_iter().enumerate() {
		let create = CreateApiKey {
			upstream_id: body.upstream_id,
			name: key.name,
			key_value: key.key_value,
			placement: key.placement,
			param_name: key.param_name,
			value_prefix: key.value_prefix,
			enable_quota: key.enable_quota,
			quota_total: key.quota_total,
			auto_disable_on_exhaustion: None,
			auto_enable_delay_hours: None,
		};
		match gateway.store().insert_api_key(&create.into_new()).await {
			Ok(_) => result.success_count += 1,
			Err(e) => {
				result.failed_count += 1;
				result
					.errors
					.push(serde_json::json!({ "index": index, "error": e.to_string() }));
			},
		}
	}

	info!(
		target: "audit",
		imported = result.success_count,
		failed = result.failed_count,
		"json key import"
	);
	Ok(Json(result).into_response())
}

#[derive(Debug, Deserialize)]
pub(super) struct ExportFilter {
	upstream_id: Option<i64>,
}

pub(super) async fn export_csv(
	State(gateway): State<Arc<Gateway>>,
	Query(filter): Query<ExportFilter>,
) -> Result<Response, AdminError> {
	let keys = gateway.store().list_api_keys(filter.upstream_id).await?;
	let mut writer = csv::Writer::from_writer(vec![]);
	for key in keys {
		let location = match key.placement {
			KeyPlacement::Header => "header",
			KeyPlacement::Query => "query",
			KeyPlacement::Body => "body",
		};
		writer
			.serialize(CsvKeyRow {
				upstream_id: key.upstream_id,
				name: key.name.clone(),
				key_value: key.key_value.clone(),
				location: Some(location.into()),
				param_name: Some(key.param_name.clone()),
				value_prefix: key.value_prefix.clone(),
				enable_quota: Some(key.enable_quota.to_string()),
				quota_total: key.quota_total,
			})
			.map_err(|e| AdminError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
	}
	let bytes = writer
		.into_inner()
		.map_err(|e| AdminError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
	Ok((
		[(header::CONTENT_TYPE, "text/csv")],
		String::from_utf8_lossy(&bytes).into_owned(),
	)
		.into_response())
}
