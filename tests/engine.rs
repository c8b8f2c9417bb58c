use std::sync::Arc;

use datadog_keys::keys::{IssuedCredentialSet, KeyType, ProviderConfig, RoleRequest};
use datadog_keys::provider::testing::{ProviderCall, RecordingFactory, RecordingProvider};
use datadog_keys::storage::MemoryStorage;
use datadog_keys::{EngineError, ErrorKind, KeyEngine};
use serde_json::json;

struct Harness {
    engine: Arc<KeyEngine>,
    provider: Arc<RecordingProvider>,
    factory: Arc<RecordingFactory>,
}

fn harness() -> Harness {
    harness_with_cleanup(false)
}

fn harness_with_cleanup(cleanup: bool) -> Harness {
    let provider = Arc::new(RecordingProvider::new("test-api-key", "test-app-key"));
    let factory = Arc::new(RecordingFactory::new(provider.clone()));
    let engine = KeyEngine::new(Arc::new(MemoryStorage::new()), factory.clone())
        .with_partial_cleanup(cleanup);
    Harness {
        engine: Arc::new(engine),
        provider,
        factory,
    }
}

fn admin_config() -> ProviderConfig {
    ProviderConfig {
        api_key: "admin-api-key".into(),
        app_key: "admin-app-key".into(),
    }
}

fn role_request(key_type: &str) -> RoleRequest {
    serde_json::from_value(json!({
        "key_type": key_type,
        "scopes": ["logs_read"],
        "ttl": 3600,
        "max_ttl": 86400,
    }))
    .unwrap()
}

async fn configured(key_type: &str) -> Harness {
    let h = harness();
    h.engine.write_config(&admin_config()).await.unwrap();
    h.engine
        .write_role("test-role", role_request(key_type))
        .await
        .unwrap();
    h
}

#[tokio::test]
async fn both_role_issues_api_key_then_app_key() {
    let h = configured("both").await;

    let lease = h.engine.issue("test-role", Some("test-keys")).await.unwrap();

    assert_eq!(
        h.provider.calls(),
        vec![
            ProviderCall::CreateApiKey("test-keys".into()),
            ProviderCall::CreateAppKey("test-keys".into(), vec!["logs_read".into()]),
        ]
    );
    assert_eq!(lease.credentials.key_type, KeyType::Both);
    assert_eq!(lease.credentials.api_key.as_deref(), Some("test-api-key"));
    assert_eq!(lease.credentials.app_key.as_deref(), Some("test-app-key"));
    assert_eq!(lease.ttl, 3600);
    assert_eq!(lease.max_ttl, 86400);
    assert!(lease.renewable);
    assert_eq!(
        serde_json::Value::Object(lease.response_data()),
        json!({ "api_key": "test-api-key", "app_key": "test-app-key" })
    );
    assert_eq!(h.factory.configs(), vec![admin_config()]);
}

#[tokio::test]
async fn api_role_never_creates_app_keys() {
    let h = configured("api_key").await;

    let lease = h.engine.issue("test-role", Some("ci")).await.unwrap();

    assert_eq!(h.provider.calls(), vec![ProviderCall::CreateApiKey("ci".into())]);
    assert_eq!(lease.credentials.app_key, None);
    assert_eq!(
        serde_json::Value::Object(lease.response_data()),
        json!({ "api_key": "test-api-key" })
    );
}

#[tokio::test]
async fn app_role_never_creates_api_keys() {
    let h = configured("app_key").await;

    let lease = h.engine.issue("test-role", Some("ci")).await.unwrap();

    assert_eq!(
        h.provider.calls(),
        vec![ProviderCall::CreateAppKey("ci".into(), vec!["logs_read".into()])]
    );
    assert_eq!(lease.credentials.api_key, None);
    assert_eq!(lease.credentials.app_key.as_deref(), Some("test-app-key"));
}

#[tokio::test]
async fn missing_key_name_falls_back_to_a_generated_one() {
    let h = configured("api_key").await;

    h.engine.issue("test-role", None).await.unwrap();
    h.engine.issue("test-role", Some("")).await.unwrap();

    for call in h.provider.calls() {
        match call {
            ProviderCall::CreateApiKey(name) => {
                let suffix = name
                    .strip_prefix("vault-test-role-")
                    .expect("generated name carries the role");
                assert!(suffix.parse::<i64>().is_ok(), "unexpected name {name}");
            }
            other => panic!("unexpected call {other:?}"),
        }
    }
}

#[tokio::test]
async fn issuance_without_configuration_makes_no_provider_calls() {
    let h = harness();
    h.engine
        .write_role("test-role", role_request("both"))
        .await
        .unwrap();

    let err = h.engine.issue("test-role", None).await.unwrap_err();

    assert!(matches!(err, EngineError::NotConfigured));
    assert_eq!(err.kind(), ErrorKind::NotConfigured);
    assert!(h.provider.calls().is_empty());
    assert_eq!(h.factory.builds(), 0);
}

#[tokio::test]
async fn unknown_role_is_not_found() {
    let h = configured("both").await;

    let err = h.engine.issue("missing", None).await.unwrap_err();
    assert!(matches!(err, EngineError::RoleNotFound(ref name) if name == "missing"));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h.engine.issue("", None).await.unwrap_err();
    assert!(matches!(err, EngineError::MissingRoleName));
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn api_key_failure_aborts_before_the_app_key() {
    let h = configured("both").await;
    h.provider.fail_on("create_api_key");

    let err = h.engine.issue("test-role", Some("k")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Provider);
    assert!(err.to_string().contains("error creating API key"));
    assert_eq!(h.provider.calls(), vec![ProviderCall::CreateApiKey("k".into())]);
}

#[tokio::test]
async fn app_key_failure_leaves_the_api_key_by_default() {
    let h = configured("both").await;
    h.provider.fail_on("create_app_key");

    let err = h.engine.issue("test-role", Some("k")).await.unwrap_err();

    assert!(err.to_string().contains("error creating Application key"));
    assert_eq!(
        h.provider.calls(),
        vec![
            ProviderCall::CreateApiKey("k".into()),
            ProviderCall::CreateAppKey("k".into(), vec!["logs_read".into()]),
        ]
    );
}

#[tokio::test]
async fn partial_cleanup_deletes_the_orphaned_api_key() {
    let h = harness_with_cleanup(true);
    h.engine.write_config(&admin_config()).await.unwrap();
    h.engine
        .write_role("test-role", role_request("both"))
        .await
        .unwrap();
    h.provider.fail_on("create_app_key");

    let err = h.engine.issue("test-role", Some("k")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Provider);
    assert_eq!(
        h.provider.calls(),
        vec![
            ProviderCall::CreateApiKey("k".into()),
            ProviderCall::CreateAppKey("k".into(), vec!["logs_read".into()]),
            ProviderCall::DeleteApiKey("test-api-key".into()),
        ]
    );
}

#[tokio::test]
async fn failed_cleanup_keeps_the_original_error() {
    let h = harness_with_cleanup(true);
    h.engine.write_config(&admin_config()).await.unwrap();
    h.engine
        .write_role("test-role", role_request("both"))
        .await
        .unwrap();
    h.provider.fail_on("create_app_key");
    h.provider.fail_on("delete_api_key");

    let err = h.engine.issue("test-role", Some("k")).await.unwrap_err();
    assert!(err.to_string().contains("error creating Application key"));
}

#[tokio::test]
async fn revocation_deletes_recorded_keys_in_order() {
    let h = configured("both").await;
    let credentials = IssuedCredentialSet {
        key_type: KeyType::Both,
        api_key: Some("test-api-key".into()),
        app_key: Some("test-app-key".into()),
    };

    h.engine.revoke(&credentials).await.unwrap();

    assert_eq!(
        h.provider.calls(),
        vec![
            ProviderCall::DeleteApiKey("test-api-key".into()),
            ProviderCall::DeleteAppKey("test-app-key".into()),
        ]
    );
}

#[tokio::test]
async fn revocation_ignores_the_current_role_definition() {
    let h = configured("both").await;
    let lease = h.engine.issue("test-role", Some("k")).await.unwrap();

    h.engine
        .write_role("test-role", role_request("app_key"))
        .await
        .unwrap();
    h.engine.delete_role("test-role").await.unwrap();
    h.engine.revoke(&lease.credentials).await.unwrap();

    let calls = h.provider.calls();
    assert_eq!(
        &calls[2..],
        &[
            ProviderCall::DeleteApiKey("test-api-key".into()),
            ProviderCall::DeleteAppKey("test-app-key".into()),
        ]
    );
}

#[tokio::test]
async fn revocation_only_touches_keys_covered_by_the_recorded_type() {
    let h = configured("both").await;

    h.engine
        .revoke_raw(json!({
            "secret_type": "datadog_keys",
            "key_type": "api_key",
            "api_key": "test-api-key",
            "app_key": "stray-app-key",
        }))
        .await
        .unwrap();
    h.engine
        .revoke_raw(json!({ "key_type": "both", "api_key": "", "app_key": "test-app-key" }))
        .await
        .unwrap();

    assert_eq!(
        h.provider.calls(),
        vec![
            ProviderCall::DeleteApiKey("test-api-key".into()),
            ProviderCall::DeleteAppKey("test-app-key".into()),
        ]
    );
}

#[tokio::test]
async fn revocation_stops_at_the_first_failure() {
    let h = configured("both").await;
    h.provider.fail_on("delete_api_key");
    let credentials = IssuedCredentialSet {
        key_type: KeyType::Both,
        api_key: Some("test-api-key".into()),
        app_key: Some("test-app-key".into()),
    };

    let err = h.engine.revoke(&credentials).await.unwrap_err();

    assert!(err.to_string().contains("error revoking API key"));
    assert_eq!(
        h.provider.calls(),
        vec![ProviderCall::DeleteApiKey("test-api-key".into())]
    );
}

#[tokio::test]
async fn revocation_without_configuration_is_a_hard_error() {
    let h = harness();
    let credentials = IssuedCredentialSet {
        key_type: KeyType::Api,
        api_key: Some("test-api-key".into()),
        app_key: None,
    };

    let err = h.engine.revoke(&credentials).await.unwrap_err();
    assert!(matches!(err, EngineError::NotConfigured));
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn malformed_lease_data_is_rejected_before_any_provider_call() {
    let h = configured("both").await;

    let err = h
        .engine
        .revoke_raw(json!({ "api_key": "test-api-key" }))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.provider.calls().is_empty());
    assert_eq!(h.factory.builds(), 0);
}

#[tokio::test]
async fn provider_client_is_cached_until_configuration_changes() {
    let h = configured("api_key").await;

    h.engine.issue("test-role", None).await.unwrap();
    h.engine.issue("test-role", None).await.unwrap();
    assert_eq!(h.factory.builds(), 1);

    let rotated = ProviderConfig {
        api_key: "rotated-api-key".into(),
        app_key: "rotated-app-key".into(),
    };
    h.engine.write_config(&rotated).await.unwrap();
    h.engine.issue("test-role", None).await.unwrap();

    assert_eq!(h.factory.builds(), 2);
    assert_eq!(h.factory.configs(), vec![admin_config(), rotated]);
}

#[tokio::test]
async fn deleting_configuration_disables_issuance() {
    let h = configured("api_key").await;
    h.engine.issue("test-role", None).await.unwrap();

    h.engine.delete_config().await.unwrap();

    let err = h.engine.issue("test-role", None).await.unwrap_err();
    assert!(matches!(err, EngineError::NotConfigured));
    assert_eq!(h.engine.read_config().await.unwrap(), None);
}

#[tokio::test]
async fn configuration_reads_back_exactly_what_was_written() {
    let h = harness();
    let config = ProviderConfig {
        api_key: "k1".into(),
        app_key: "k2".into(),
    };

    h.engine.write_config(&config).await.unwrap();
    assert_eq!(h.engine.read_config().await.unwrap(), Some(config));

    h.engine.delete_config().await.unwrap();
    assert_eq!(h.engine.read_config().await.unwrap(), None);
}

#[tokio::test]
async fn invalid_roles_are_rejected_without_persisting() {
    let h = harness();

    let err = h
        .engine
        .write_role(
            "test-role",
            serde_json::from_value(json!({ "key_type": "both", "ttl": 90000, "max_ttl": 3600 }))
                .unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TtlExceedsMaxTtl { .. }));

    let err = h
        .engine
        .write_role("test-role", role_request("super_key"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidKeyType(_)));

    assert!(h.engine.list_roles().await.unwrap().is_empty());
    assert_eq!(h.engine.read_role("test-role").await.unwrap(), None);
}

#[tokio::test]
async fn concurrent_issuance_against_one_role_succeeds() {
    let h = configured("api_key").await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.issue("test-role", Some(&format!("key-{i}"))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.provider.calls().len(), 16);
}
