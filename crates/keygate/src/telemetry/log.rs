use tracing::error;

use crate::store::{NewRequestLog, Store};

/// Captured bodies are truncated to this many bytes before persisting.
pub const MAX_CAPTURED_BODY: usize = 64 * 1024;

/// Writes the per-attempt audit row. Durability is best-effort: a failed
/// insert is surfaced on the operator channel but never blocks or fails the
/// proxy response.
#[derive(Clone)]
pub struct RequestLogger {
	store: Store,
}

impl RequestLogger {
	pub fn new(store: Store) -> Self {
		Self { store }
	}

	pub async fn log(&self, record: NewRequestLog) -> Option<i64> {
		match self.store.insert_log(&record).await {
			Ok(id) => Some(id),
			Err(e) => {
				error!(
					target: "audit",
					upstream = record.upstream_id,
					error = %e,
					"failed to persist request log"
				);
				None
			},
		}
	}
}

pub fn capture_body(bytes: &[u8]) -> String {
	let slice = &bytes[..bytes.len().min(MAX_CAPTURED_BODY)];
	String::from_utf8_lossy(slice).into_owned()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn capture_truncates_at_the_cap() {
		let big = vec![b'a'; MAX_CAPTURED_BODY + 100];
		assert_eq!(capture_body(&big).len(), MAX_CAPTURED_BODY);
		assert_eq!(capture_body(b"small"), "small");
	}
}
