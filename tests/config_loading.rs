use std::sync::Arc;

use agent_governor::config::{EnvConfigSource, MemoryConfigSource};
use agent_governor::{
    ConfigLoader, Enforcement, Error, Governor, ManualClock, MemoryExecutionStore, Spend, TenantRef,
};
use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;

#[tokio::test]
async fn file_and_env_layers_drive_the_governor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("governor.json");
    std::fs::write(
        &path,
        r#"{
            "budget": {"daily_limit": "100", "enforcement": "soft"},
            "tenants": {
                "acme": {"daily_limit": "2.00", "enforcement": "hard"},
                "solo": {"daily_token_limit": 500, "inherit_global_defaults": false}
            },
            "circuit": {"failure_threshold": 4}
        }"#,
    )
    .unwrap();

    let config = ConfigLoader::new()
        .source(EnvConfigSource::new().with_vars([("AGENT_GOVERNOR_KEY_PREFIX", "spend")]))
        .file(&path)
        .load()
        .await
        .unwrap();
    assert_eq!(config.key_prefix, "spend");
    assert_eq!(config.circuit.failure_threshold, 4);

    let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 5, 20, 12, 0, 0).unwrap());
    let governor = Governor::builder()
        .config(config)
        .clock(clock)
        .executions(Arc::new(MemoryExecutionStore::new()))
        .build()
        .unwrap();

    let ledger = governor.ledger();
    assert_eq!(ledger.effective_enforcement("acme"), Enforcement::Hard);
    assert_eq!(ledger.effective_enforcement("other"), Enforcement::Soft);
    assert_eq!(ledger.effective_enforcement(TenantRef::None), Enforcement::Soft);

    ledger
        .record_spend("acme", Spend::new("chat", dec!(2.00), 10))
        .await;
    assert!(matches!(
        ledger.check("acme", "chat", None).await,
        Err(Error::BudgetExceeded { .. })
    ));

    let status = governor.status("solo").await.unwrap();
    assert!(
        status
            .dimensions
            .iter()
            .filter(|d| d.limit.is_some())
            .all(|d| d.dimension.to_string() == "daily tokens")
    );
}

#[tokio::test]
async fn invalid_layers_are_reported() {
    let result = ConfigLoader::new()
        .memory(
            MemoryConfigSource::new()
                .value("retry.base_delay_ms", 1_000)
                .value("retry.max_delay_ms", 10),
        )
        .load()
        .await;

    let err: Error = result.unwrap_err().into();
    assert!(matches!(err, Error::Config(message) if message.contains("retry.max_delay_ms")));
}
