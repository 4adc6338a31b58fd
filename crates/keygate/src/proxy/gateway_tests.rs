use super::*;

#[test]
fn backoff_schedule_is_capped_exponential() {
	let secs: Vec<u64> = (0..6).map(|n| backoff_delay(n).as_secs()).collect();
	assert_eq!(secs, vec![1, 2, 4, 8, 10, 10]);
}

#[test]
fn notes_fold_into_the_error_column() {
	assert_eq!(error_from_notes(&[]), None);
	assert_eq!(
		error_from_notes(&["a".into(), "b".into()]).as_deref(),
		Some("a; b")
	);
}
