//! Tests for error types

use rubric_engine::rule::Rule;
use rubric_engine::Error;

#[test]
fn test_condition_syntax_error() {
    let error = Rule::builder("r1", "R1")
        .condition("x > 0.5")
        .map("x", "x")
        .build()
        .unwrap_err();
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid condition clause"));
    assert!(error_str.contains("x > 0.5"));
}

#[test]
fn test_parse_error() {
    let error = Error::ParseError("unsupported function exec".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Predicate parse error"));
    assert!(error_str.contains("exec"));
}

#[test]
fn test_storage_error() {
    let error = Error::StorageError("file not found".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Storage error"));
    assert!(error_str.contains("file not found"));
}

#[test]
fn test_invalid_input_error() {
    let error = Error::InvalidInput("k must be positive".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid input"));
    assert!(error_str.contains("k must be positive"));
}

#[test]
fn test_analysis_not_found_error() {
    let error = Error::AnalysisNotFound("a-42".to_string());
    assert_eq!(format!("{error}"), "Analysis not found: a-42");
}

#[test]
fn test_invalid_transition_error() {
    let error = Error::InvalidTransition {
        analysis_id: "a-1".to_string(),
        from: "completed".to_string(),
        to: "running".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("a-1"));
    assert!(error_str.contains("completed -> running"));
}

#[test]
fn test_cache_error() {
    let error = Error::CacheError("decode failed".to_string());
    assert!(format!("{error}").contains("Cache error"));
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    let error_str = format!("{error}");
    assert!(error_str.contains("IO error"));
}

#[test]
fn test_json_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error: Error = json_error.into();
    assert!(format!("{error}").contains("JSON error"));
}

#[test]
fn test_other_error() {
    let error = Error::Other("custom error message".to_string());
    assert_eq!(format!("{error}"), "custom error message");
}

#[test]
fn test_error_debug() {
    let error = Error::InvalidInput("test".to_string());
    let debug_str = format!("{error:?}");
    assert!(debug_str.contains("InvalidInput"));
}
