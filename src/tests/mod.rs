use crate::catalog::{Catalog, FieldDecl, FieldDecls, NamedField};
use crate::error::QueryError;
use crate::expr::ExpressionSet;
use crate::series::SeriesSet;
use crate::state::RingBuffer;
use crate::types::{AdvanceReason, Event, SampleClock, SamplerOptions};
use std::sync::Arc;

mod series;

/// `close = price`, forward-filled from the previous close.
fn close_fields() -> FieldDecls {
    vec![NamedField::new(
        "close",
        FieldDecl::accumulate(|event, _, _| event.number("price"))
            .with_fill(|previous| previous.get("close")),
    )]
    .into()
}

/// Trade field set: OHLC, side flags, volumes, notional and counts.
fn trade_fields() -> FieldDecls {
    let last_close = |previous: &crate::Bucket| previous.get("close");
    let zero = |_: &crate::Bucket| Some(0.0);
    vec![
        NamedField::from("time"),
        NamedField::new(
            "_buy",
            FieldDecl::accumulate(|event, _, _| {
                if event.number("qty").is_some_and(|qty| qty > 0.0) {
                    event.set("buy", true);
                }
                None
            }),
        ),
        NamedField::new(
            "_sell",
            FieldDecl::accumulate(|event, _, _| {
                if event.number("qty").is_some_and(|qty| qty < 0.0) {
                    event.set("sell", true);
                }
                None
            }),
        ),
        NamedField::new(
            "open",
            FieldDecl::accumulate(|event, current, _| current.or(event.number("price")))
                .with_fill(last_close),
        ),
        NamedField::new(
            "high",
            FieldDecl::accumulate(|event, current, _| {
                let price = event.number("price")?;
                Some(current.map_or(price, |high| high.max(price)))
            })
            .with_fill(last_close),
        ),
        NamedField::new(
            "low",
            FieldDecl::accumulate(|event, current, _| {
                let price = event.number("price")?;
                Some(current.map_or(price, |low| low.min(price)))
            })
            .with_fill(last_close),
        ),
        NamedField::new(
            "close",
            FieldDecl::accumulate(|event, _, _| event.number("price")).with_fill(last_close),
        ),
        NamedField::new(
            "buy_vol",
            FieldDecl::accumulate(|event, current, _| {
                event
                    .flag("buy")
                    .then(|| current.unwrap_or(0.0) + event.number("qty").unwrap_or(0.0))
            })
            .with_fill(zero),
        ),
        NamedField::new(
            "sell_vol",
            FieldDecl::accumulate(|event, current, _| {
                event
                    .flag("sell")
                    .then(|| current.unwrap_or(0.0) + event.number("qty").unwrap_or(0.0))
            })
            .with_fill(zero),
        ),
        NamedField::new(
            "ttl_vol",
            FieldDecl::accumulate(|event, current, _| {
                Some(current.unwrap_or(0.0) + event.number("qty")?.abs())
            })
            .with_fill(zero),
        ),
        NamedField::new(
            "net_vol",
            FieldDecl::accumulate(|event, current, _| {
                Some(current.unwrap_or(0.0) + event.number("qty")?)
            })
            .with_fill(zero),
        ),
        NamedField::new(
            "cum_net_vol",
            FieldDecl::accumulate(|event, current, _| {
                Some(current.unwrap_or(0.0) + event.number("qty")?)
            })
            .cumulative(),
        ),
        NamedField::new(
            "ttl_mv",
            FieldDecl::accumulate(|event, current, _| {
                Some(current.unwrap_or(0.0) + event.number("price")? * event.number("qty")?.abs())
            })
            .with_fill(zero),
        ),
        NamedField::new(
            "vol_wtd_price",
            FieldDecl::accumulate(|_, _, bucket| {
                Some(bucket.get("ttl_mv").unwrap_or(f64::NAN) / bucket.get("ttl_vol").unwrap_or(f64::NAN))
            })
            .with_fill(zero),
        ),
        NamedField::new(
            "ttl_trade_count",
            FieldDecl::accumulate(|_, current, _| Some(current.unwrap_or(0.0) + 1.0))
                .with_fill(zero),
        ),
    ]
    .into()
}

fn ring(options: &SamplerOptions, fields: &FieldDecls) -> RingBuffer {
    ring_with_expressions(options, fields, &ExpressionSet::new())
}

fn ring_with_expressions(
    options: &SamplerOptions,
    fields: &FieldDecls,
    expressions: &ExpressionSet,
) -> RingBuffer {
    let catalog = Catalog::build(fields, expressions).expect("catalog should build");
    RingBuffer::new(
        options.buffer_length,
        Arc::new(catalog),
        SampleClock::from_options(options),
    )
    .expect("buffer should build")
}

fn tick(time: i64, price: f64) -> Event {
    Event::new().with("time", time).with("price", price)
}

fn trade(time: i64, price: f64, qty: f64) -> Event {
    tick(time, price).with("qty", qty)
}

/// Field values in physical bucket order.
fn physical(buffer: &RingBuffer, field: &str) -> Vec<Option<f64>> {
    buffer.buckets().iter().map(|bucket| bucket.get(field)).collect()
}

fn counts(buffer: &RingBuffer) -> Vec<u64> {
    buffer.buckets().iter().map(|bucket| bucket.event_count()).collect()
}

fn start_times(buffer: &RingBuffer) -> Vec<Option<i64>> {
    buffer.buckets().iter().map(|bucket| bucket.start_time()).collect()
}

fn advance_n(buffer: &mut RingBuffer, n: usize) {
    for _ in 0..n {
        buffer.advance(AdvanceReason::Manual);
    }
}

fn close_series_value(series: &SeriesSet<'_>) -> Result<Option<f64>, QueryError> {
    series.value("close", 0)
}

fn approx_eq(lhs: f64, rhs: f64) -> bool {
    (lhs.is_nan() && rhs.is_nan()) || (lhs - rhs).abs() < 1e-9
}
