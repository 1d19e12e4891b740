use super::*;
use crate::types::IteratorPosition;
use std::ptr;

/// One bucket per value, oldest first, via the timerless capture path.
fn filled_close(values: &[f64]) -> RingBuffer {
    filled_close_with_capacity(values.len().max(1), values)
}

fn filled_close_with_capacity(capacity: usize, values: &[f64]) -> RingBuffer {
    let options = SamplerOptions::new(1_000, capacity).suppress_auto_sampling();
    let mut buffer = ring(&options, &close_fields());
    for (idx, &price) in values.iter().enumerate() {
        buffer
            .capture(tick(idx as i64 * 1_000, price), None)
            .expect("capture should succeed");
    }
    buffer
}

#[test]
fn window_larger_than_history_is_unavailable() {
    let buffer = filled_close_with_capacity(6, &[1.0, 2.0, 3.0]);
    let close = buffer.series("close").expect("close series");
    assert_eq!(close.available_length(), 3);
    assert_eq!(close.mean(4, 0).expect("valid offset"), None);
    assert_eq!(close.sum(3, -1).expect("valid offset"), None);
    assert_eq!(close.std_dev(4, 0).expect("valid offset"), None);
    assert_eq!(close.mean(3, 0).expect("valid offset"), Some(2.0));
    assert_eq!(close.sum(0, 0).expect("valid offset"), None);
}

#[test]
fn positive_offset_is_rejected_by_every_query() {
    let buffer = filled_close(&[1.0, 2.0]);
    let close = buffer.series("close").expect("close series");
    let expected = Err(QueryError::PositiveOffset { offset: 1 });
    assert_eq!(close.value(1), expected);
    assert_eq!(close.min(1, 1), expected);
    assert_eq!(close.max(1, 1), expected);
    assert_eq!(close.sum(1, 1), expected);
    assert_eq!(close.mean(1, 1), expected);
    assert_eq!(close.std_dev(1, 1), expected);
    assert_eq!(
        close.custom(1, 1, |_, _| panic!("visitor must not run")),
        Err(QueryError::PositiveOffset { offset: 1 })
    );
    // the error wins even when the window would be unavailable anyway
    assert_eq!(close.mean(99, 1), expected);
    assert_eq!(buffer.series_set().value("missing", 2), Err(QueryError::PositiveOffset { offset: 2 }));
}

#[test]
fn std_dev_divides_by_n_minus_one() {
    let buffer = filled_close(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
    let close = buffer.series("close").expect("close series");
    let std = close.std_dev(8, 0).expect("valid offset").expect("full window");
    assert!(approx_eq(std, (32.0_f64 / 7.0).sqrt()));
    assert_eq!(close.mean(8, 0).expect("valid offset"), Some(5.0));
    assert_eq!(close.std_dev(1, 0).expect("valid offset"), Some(0.0));
    assert_eq!(close.std_dev(1, -3).expect("valid offset"), Some(0.0));
}

#[test]
fn shifted_windows_exclude_the_current_bucket() {
    let buffer = filled_close(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
    let close = buffer.series("close").expect("close series");
    assert_eq!(close.value(0).expect("valid offset"), Some(9.0));
    assert_eq!(close.value(-1).expect("valid offset"), Some(7.0));
    assert_eq!(close.value(-8).expect("valid offset"), None);
    assert_eq!(close.mean(2, -1).expect("valid offset"), Some(6.0));
    assert_eq!(close.sum(3, -1).expect("valid offset"), Some(17.0));
    assert_eq!(close.min(3, -1).expect("valid offset"), Some(5.0));
    assert_eq!(close.max(3, -1).expect("valid offset"), Some(7.0));
    assert_eq!(close.max(7, -1).expect("valid offset"), Some(7.0));
    assert_eq!(close.max(8, -1).expect("valid offset"), None);
}

#[test]
fn custom_visits_most_recent_first() {
    let buffer = filled_close(&[1.0, 2.0, 3.0, 4.0]);
    let close = buffer.series("close").expect("close series");
    let mut seen: Vec<(IteratorPosition, Option<f64>)> = Vec::new();
    close
        .custom(3, 0, |pos, value| seen.push((pos, value)))
        .expect("valid offset");

    assert_eq!(
        seen.iter().map(|(pos, value)| (pos.relative, *value)).collect::<Vec<_>>(),
        vec![(0, Some(4.0)), (-1, Some(3.0)), (-2, Some(2.0))]
    );
    assert_eq!(
        seen.iter().map(|(pos, _)| pos.ordinal).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
}

#[test]
fn custom_skips_the_visitor_when_history_is_short() {
    let buffer = filled_close(&[1.0, 2.0]);
    let close = buffer.series("close").expect("close series");
    let mut calls = 0;
    close.custom(3, 0, |_, _| calls += 1).expect("valid offset");
    close.custom(2, -1, |_, _| calls += 1).expect("valid offset");
    close.custom(0, 0, |_, _| calls += 1).expect("valid offset");
    assert_eq!(calls, 0);
}

#[test]
fn series_handles_are_cached_per_field() {
    let buffer = filled_close(&[1.0]);
    let first = buffer.series("close").expect("close series");
    let second = buffer.series("close").expect("close series");
    assert!(ptr::eq(first.handle(), second.handle()));
    assert_eq!(first.field(), "close");
    assert!(buffer.series("volume").is_none());
    assert!(buffer.series_set().get("volume").is_none());
    assert_eq!(buffer.series_set().value("volume", 0), Ok(None));
}

#[test]
fn missing_values_poison_the_window() {
    let fields: FieldDecls = vec![NamedField::new(
        "close",
        FieldDecl::accumulate(|event, _, _| event.number("price")),
    )]
    .into();
    let options = SamplerOptions::new(1_000, 4);
    let mut buffer = ring(&options, &fields);
    buffer.capture(tick(0, 1.0), None).expect("capture should succeed");
    advance_n(&mut buffer, 2);
    buffer.capture(tick(2_000, 3.0), None).expect("capture should succeed");

    let close = buffer.series("close").expect("close series");
    assert_eq!(close.value(-1).expect("valid offset"), None);
    assert!(close.mean(3, 0).expect("valid offset").expect("window").is_nan());
    assert!(close.min(3, 0).expect("valid offset").expect("window").is_nan());
    assert!(close.max(3, 0).expect("valid offset").expect("window").is_nan());
    assert!(close.std_dev(3, 0).expect("valid offset").expect("window").is_nan());
    assert_eq!(close.sum(1, 0).expect("valid offset"), Some(3.0));
}

#[test]
fn available_length_caps_at_capacity() {
    let buffer = filled_close(&[1.0, 2.0, 3.0]);
    assert_eq!(buffer.series_set().available_length(), 3);

    let history: Vec<f64> = (0..10).map(f64::from).collect();
    let wrapped = filled_close_with_capacity(3, &history);
    let close = wrapped.series("close").expect("close series");
    assert_eq!(close.available_length(), 3);
    assert_eq!(close.sum(3, 0).expect("valid offset"), Some(7.0 + 8.0 + 9.0));
    assert_eq!(close.sum(3, -1).expect("valid offset"), None);
}

#[test]
fn expressions_see_declared_field_names() {
    let buffer = filled_close(&[1.0]);
    assert_eq!(buffer.series_set().field_names(), &["close".to_string()]);
}
