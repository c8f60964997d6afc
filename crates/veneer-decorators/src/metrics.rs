//! Tracing hooks.
//!
//! Only emits through `tracing`; subscribers are installed by the host
//! application.

#[cfg(feature = "tracing")]
pub fn emit_event(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::span!(tracing::Level::TRACE, "veneer", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn emit_event(_event: &str, _key_values: &[(&str, String)]) { /* no-op */
}

/// Log an emulated full scan, as a warning once it crosses `threshold` rows.
#[cfg(feature = "tracing")]
pub fn full_scan(collection: &str, rows: usize, threshold: usize) {
    if rows > threshold {
        tracing::warn!(
            collection,
            rows,
            threshold,
            "emulated query scanned the whole collection"
        );
    } else {
        tracing::debug!(collection, rows, "emulated full scan");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn full_scan(_collection: &str, _rows: usize, _threshold: usize) { /* no-op */
}
