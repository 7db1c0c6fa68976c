use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static INSTANCES_FIRED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("volley_instances_fired_total", "Window instance firing attempts by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static PENDING_INSTANCES: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("volley_pending_instances", "Window instances waiting to fire").unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static INFLIGHT_INSTANCES: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("volley_inflight_instances", "Window instances currently being fired").unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static FIRE_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "volley_fire_latency_ms",
            "Latency of the downstream fire call per window instance (ms)",
        )
        .buckets(vec![
            0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
        ]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

pub static TICK_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new("volley_tick_latency_ms", "Duration of one scheduler pass (ms)").buckets(vec![
            0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
        ]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

pub static BUFFER_FLUSHES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("volley_buffer_flush_total", "Fire buffer partition flushes by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static FORCED_FIRES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "volley_forced_fires_total",
        "Instances released early because their partition went quiet",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static OBSERVER_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "volley_observer_errors_total",
        "Failed best-effort in-flight notifications",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub fn render_prometheus() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_text_lists_touched_metrics() {
        INSTANCES_FIRED.with_label_values(&["fired"]).inc();
        FORCED_FIRES.inc();
        let text = render_prometheus();
        assert!(text.contains("volley_instances_fired_total"));
        assert!(text.contains("volley_forced_fires_total"));
    }
}
