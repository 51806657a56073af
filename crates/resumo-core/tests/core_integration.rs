#![allow(clippy::unwrap_used, clippy::expect_used)]

use resumo_core::*;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// 1. Turn serialization roundtrip
// ---------------------------------------------------------------------------

#[test]
fn turn_serialization_roundtrip() {
    let turn = Turn::new(
        7,
        Role::Tool,
        serde_json::json!({"tool_use_id": "call_1", "content": "42"}),
    );

    let json = serde_json::to_string(&turn).unwrap();
    let deserialized: Turn = serde_json::from_str(&json).unwrap();

    assert_eq!(deserialized, turn);
    assert_eq!(deserialized.sequence, 7);
    assert_eq!(deserialized.role, Role::Tool);
}

// ---------------------------------------------------------------------------
// 2. Record bookkeeping: sequence, activity, summary
// ---------------------------------------------------------------------------

#[test]
fn record_summary_tracks_turns() {
    let mut metadata = BTreeMap::new();
    metadata.insert("project".to_string(), "alpha".to_string());
    let mut record = SessionRecord::new(SessionId::parse("s-1").unwrap(), metadata);

    record.push_turn(Turn::new(0, Role::User, "hello")).unwrap();
    let last = Turn::new(1, Role::Assistant, "hi");
    let last_at = last.timestamp;
    record.push_turn(last).unwrap();

    let summary = record.summary();
    assert_eq!(summary.id.as_str(), "s-1");
    assert_eq!(summary.turn_count, 2);
    assert_eq!(summary.last_active_at, last_at);
    assert!(!summary.closed);
    assert_eq!(summary.metadata["project"], "alpha");
}

// ---------------------------------------------------------------------------
// 3. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let not_found = ResumoError::NotFound("S2".to_string());
    assert_eq!(not_found.to_string(), "Session not found: S2");

    let locked = ResumoError::SessionLocked("S1".to_string());
    assert_eq!(locked.to_string(), "Session is locked by another writer: S1");

    let corrupt = ResumoError::Corrupt {
        id: "S3".to_string(),
        reason: "checksum mismatch".to_string(),
    };
    assert_eq!(corrupt.to_string(), "Corrupt session S3: checksum mismatch");

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: ResumoError = io_err.into();
    assert!(matches!(err, ResumoError::StorageIo(_)));

    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: ResumoError = json_err.into();
    assert!(err.to_string().starts_with("JSON error:"));

    let decode: ResumoError = DecodeError::version_unsupported(9, 1).into();
    assert!(decode.to_string().contains("format version 9"));
}
