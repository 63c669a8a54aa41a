use std::io::Write;

use tempfile::NamedTempFile;

use stepgraph_core::config::AppConfig;

/// A complete config touching every section.
pub const SAMPLE_CONFIG: &str = r#"
[model]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "sk-test"
max_tokens = 512
temperature = 0.2
timeout_secs = 30

[engine]
parallel = false
deadline_secs = 60
step_limit = 25

[apps.tweet]
max_iterations = 3
"#;

/// Parsed [`SAMPLE_CONFIG`].
pub fn sample_config() -> AppConfig {
    AppConfig::from_toml(SAMPLE_CONFIG).expect("sample config parses")
}

/// Write `content` to a temp file that lives as long as the handle.
pub fn temp_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config");
    file.write_all(content.as_bytes()).expect("write temp config");
    file
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_round_trips_through_file() {
        let file = temp_config(SAMPLE_CONFIG);
        let loaded = AppConfig::load(file.path()).unwrap();
        let expected = sample_config();
        assert_eq!(loaded.model.model_id, expected.model.model_id);
        assert_eq!(loaded.apps.tweet.max_iterations, 3);
        assert!(!loaded.engine.parallel);
    }
}
