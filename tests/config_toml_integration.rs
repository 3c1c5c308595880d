use progtree::{StrategyConfig, TaskBuilder, TaskConfig, ThreadExecutor};
use std::sync::Arc;
use tempfile::NamedTempFile;

#[test]
fn test_config_serialization_roundtrip() {
    let original_config = TaskConfig {
        name: "export".to_string(),
        event_logging: true,
        default_strategy: StrategyConfig::Constant { parts: 100 },
    };

    let toml_str = original_config
        .to_toml_string()
        .expect("Should be able to serialize config to TOML");
    assert!(toml_str.contains("name = \"export\""));
    assert!(toml_str.contains("[default_strategy]"));
    assert!(toml_str.contains("type = \"constant\""));

    let deserialized_config =
        TaskConfig::from_toml_str(&toml_str).expect("Should be able to deserialize TOML string");
    assert_eq!(original_config, deserialized_config);
}

#[test]
fn test_config_file_operations() {
    let original_config = TaskConfig {
        default_strategy: StrategyConfig::Scale { factor: 0.25 },
        ..TaskConfig::default()
    };

    let temp_file = NamedTempFile::new().expect("Should be able to create temporary file");
    let temp_path = temp_file.path();

    original_config
        .to_toml_file(temp_path)
        .expect("Should be able to save config to file");
    let loaded_config =
        TaskConfig::from_toml_file(temp_path).expect("Should be able to load config from file");

    assert_eq!(original_config, loaded_config);
}

#[test]
fn test_partial_config_uses_defaults() {
    let config = TaskConfig::from_toml_str("name = \"minimal\"").unwrap();
    assert_eq!(config.name, "minimal");
    assert!(!config.event_logging);
    assert_eq!(config.default_strategy, StrategyConfig::All);

    let empty = TaskConfig::from_toml_str("").unwrap();
    assert_eq!(empty, TaskConfig::default());
}

#[test]
fn test_invalid_strategy_rejected() {
    let content = r#"
name = "broken"

[default_strategy]
type = "scale"
factor = 1.5
"#;
    let error = TaskConfig::from_toml_str(content).unwrap_err();
    assert!(format!("{:#}", error).contains("Invalid default strategy"));

    let unknown = r#"
[default_strategy]
type = "geometric"
"#;
    assert!(TaskConfig::from_toml_str(unknown).is_err());
}

#[test]
fn test_missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let error = TaskConfig::from_toml_file(&path).unwrap_err();
    assert!(error.to_string().contains("absent.toml"));
}

#[test]
fn test_builder_from_config_applies_strategy() {
    let config = TaskConfig::from_toml_str(
        r#"
name = "configured"

[default_strategy]
type = "constant"
parts = 40
"#,
    )
    .unwrap();

    let root = TaskBuilder::from_config(Arc::new(ThreadExecutor::new()), &config)
        .unwrap()
        .build(|task| {
            task.spawn(|sub| {
                sub.set_total(3)?;
                sub.increment_by(3)?;
                Ok(())
            })?;
            Ok(())
        });

    assert_eq!(root.name(), "configured");
    assert_eq!(root.status(), "configured");
    root.start().unwrap();
    assert!(root.wait().unwrap());
    assert_eq!(root.total_parts(), 41);
    assert_eq!(root.parts_completed(), 41);
}
