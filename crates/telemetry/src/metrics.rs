use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Clustering ====
    pub static ref FACE_ENGINE_FACES_ASSIGNED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "face_engine_faces_assigned_total",
                "Faces processed by incremental assignment",
            ),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACE_ENGINE_CLUSTERS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "face_engine_clusters_total",
                "Cluster lifecycle operations",
            ),
            &["operation"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACE_ENGINE_OPERATION_DURATION: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "face_engine_operation_duration_seconds",
                "Duration of clustering and maintenance passes",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["operation"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Recognition ====
    pub static ref FACE_ENGINE_RECOGNITIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "face_engine_recognitions_total",
                "Recognition lookups by result",
            ),
            &["result"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACE_ENGINE_DEDUP_LOOKUPS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "face_engine_dedup_lookups_total",
                "Deduplication cache lookups",
            ),
            &["cache", "result"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACE_ENGINE_ACTIVE_SESSIONS: IntGauge = {
        let metric = IntGauge::new(
            "face_engine_active_sessions",
            "Camera sessions currently running",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Encode the registry in Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clustering_metrics_accessible() {
        let before = FACE_ENGINE_FACES_ASSIGNED
            .with_label_values(&["matched"])
            .get();
        FACE_ENGINE_FACES_ASSIGNED
            .with_label_values(&["matched"])
            .inc();
        assert_eq!(
            FACE_ENGINE_FACES_ASSIGNED
                .with_label_values(&["matched"])
                .get(),
            before + 1
        );
    }

    #[test]
    fn test_encode_metrics_includes_engine_families() {
        FACE_ENGINE_DEDUP_LOOKUPS
            .with_label_values(&["save", "hit"])
            .inc();
        let encoded = encode_metrics().expect("metrics should encode");
        assert!(encoded.contains("face_engine_dedup_lookups_total"));
    }
}
