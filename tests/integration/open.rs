use serde_json::json;

use rtxn::api::WriteRequest;
use rtxn::config::{Config, ConfigLayer, merge_layers};
use rtxn::core::StmtId;

use crate::fixtures::ops::{insert, parent, session};

#[test]
fn open_from_config_reuses_the_configured_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.store.path = Some(dir.path().join("store"));
    let request = WriteRequest::retryable(parent(session(1), 1), [insert(json!({ "_id": 1 }))]);

    let first = rtxn::open(&config).unwrap().execute(&request).unwrap();
    let replay = rtxn::open(&config).unwrap().execute(&request).unwrap();

    assert_eq!(replay.without_retry_info(), first);
    assert_eq!(replay.retried_stmt_ids, vec![StmtId::new(0)]);
    assert!(dir.path().join("store").join("sessions.sqlite").exists());
}

#[test]
fn statement_limit_comes_from_config() {
    let layer: ConfigLayer = toml::from_str(
        r#"
        [store]
        in_memory = true

        [limits]
        max_statements_per_request = 1
        "#,
    )
    .unwrap();
    let config = merge_layers(None, Some(layer));
    let retry = rtxn::open(&config).unwrap();

    let request = WriteRequest::retryable(
        parent(session(2), 1),
        [insert(json!({ "_id": 1 })), insert(json!({ "_id": 2 }))],
    );
    let err = retry.execute(&request).unwrap_err();
    assert_eq!(err.code(), rtxn::core::ErrorCode::InvalidRequest);
}
