/// Test clustering configuration
use log_cluster::{
    ClusterConfig, ClusterError, DelimiterPolicy, LogClusterer, SlotRecord, UnmatchedPolicy,
};

const SCENARIO: [&str; 5] = [
    "SSH user1 connect",
    "SSH user2 connect",
    "SSH user1 disconnect",
    "SSH user3 connect",
    "SSH user2 disconnect",
];

#[test]
fn test_default_config() {
    let clusterer = LogClusterer::new();
    let config = clusterer.config();

    println!("Default configuration:");
    println!("  Delimiter: {}", config.delimiter);
    println!("  Literal threshold: {}", config.literal_entropy_threshold);
    println!("  Wildcard threshold: {}", config.wildcard_entropy_threshold);
    println!("  Unmatched policy: {}", config.unmatched_policy);
    println!("  Batch size: {}", config.batch_size);

    assert_eq!(config.delimiter, DelimiterPolicy::Whitespace);
    assert_eq!(config.unmatched_policy, UnmatchedPolicy::Repartition);
    assert_eq!(config.batch_size, 10_000);
}

#[test]
fn test_custom_config() {
    let config = ClusterConfig::new()
        .with_delimiter(DelimiterPolicy::Char('|'))
        .with_literal_threshold(0.5)
        .with_wildcard_threshold(0.8)
        .with_batch_size(5_000);

    let clusterer = LogClusterer::with_config(config).unwrap();

    assert_eq!(clusterer.config().literal_entropy_threshold, 0.5);
    assert_eq!(clusterer.config().batch_size, 5_000);
}

#[test]
fn test_streaming_config() {
    let clusterer = LogClusterer::with_config(ClusterConfig::streaming()).unwrap();

    println!("\nStreaming configuration:");
    println!("  Batch size: {} (lower latency)", clusterer.config().batch_size);

    assert_eq!(clusterer.config().batch_size, 1_000);
    assert_eq!(clusterer.config().unmatched_policy, UnmatchedPolicy::SeedNew);
}

#[test]
fn test_batch_processing_config() {
    let clusterer = LogClusterer::with_config(ClusterConfig::batch_processing()).unwrap();

    assert_eq!(clusterer.config().batch_size, 10_000);
    assert_eq!(
        clusterer.config().unmatched_policy,
        UnmatchedPolicy::Repartition
    );
}

#[test]
fn test_delimiter_affects_tokenization() {
    let config = ClusterConfig::new().with_delimiter("char:|".parse().unwrap());
    let clusterer = LogClusterer::with_config(config).unwrap();

    clusterer.ingest("GET|/index.html|200");
    clusterer.ingest("GET|/about.html|200");

    let snapshot = clusterer.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].length, 3);
    assert_eq!(snapshot[0].event(), "GET * 200");
}

#[test]
fn test_regex_delimiter() {
    let config = ClusterConfig::new().with_delimiter(DelimiterPolicy::Regex(r"[,;]\s*".into()));
    let clusterer = LogClusterer::with_config(config).unwrap();

    clusterer.ingest("a, b; c");
    let snapshot = clusterer.snapshot();
    assert_eq!(snapshot[0].length, 3);
    assert_eq!(snapshot[0].event(), "a b c");
}

#[test]
fn test_zero_literal_threshold_never_splits() {
    // Nothing is homogeneous enough to split on: one broad template
    let config = ClusterConfig::new().with_literal_threshold(0.0);
    let clusterer = LogClusterer::with_config(config).unwrap();

    for line in SCENARIO {
        clusterer.ingest(line);
    }

    let snapshot = clusterer.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].event(), "SSH * *");
    assert_eq!(snapshot[0].count, 5);

    // connect:3 / disconnect:2 sits inside the ambiguous band
    match &snapshot[0].slots[2] {
        SlotRecord::Wildcard {
            values, ambiguous, ..
        } => {
            assert_eq!(values.get("connect"), Some(&3));
            assert_eq!(values.get("disconnect"), Some(&2));
            assert!(ambiguous);
        }
        other => panic!("expected wildcard, got {:?}", other),
    }
}

#[test]
fn test_invalid_configs_rejected() {
    let inverted = ClusterConfig {
        literal_entropy_threshold: 0.9,
        wildcard_entropy_threshold: 0.2,
        ..Default::default()
    };
    assert!(matches!(
        LogClusterer::with_config(inverted),
        Err(ClusterError::InvalidConfig { .. })
    ));

    let bad_regex = ClusterConfig::new().with_delimiter(DelimiterPolicy::Regex("(".into()));
    assert!(matches!(
        LogClusterer::with_config(bad_regex),
        Err(ClusterError::InvalidDelimiter(_))
    ));

    let zero_batch = ClusterConfig {
        batch_size: 0,
        ..Default::default()
    };
    assert!(LogClusterer::with_config(zero_batch).is_err());
}

#[test]
fn test_config_from_json() {
    let config: ClusterConfig = serde_json::from_str(
        r#"{
            "delimiter": {"kind": "any-of", "value": ",;"},
            "literal_entropy_threshold": 0.6,
            "unmatched_policy": "seed-new"
        }"#,
    )
    .unwrap();

    assert_eq!(config.delimiter, DelimiterPolicy::AnyOf(",;".to_string()));
    assert_eq!(config.literal_entropy_threshold, 0.6);
    assert_eq!(config.wildcard_entropy_threshold, 0.9);
    assert_eq!(config.unmatched_policy, UnmatchedPolicy::SeedNew);
    assert!(config.validate().is_ok());
}
