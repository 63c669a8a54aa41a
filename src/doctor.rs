use std::sync::Arc;
use std::time::Duration;

use stepgraph_core::config::AppConfig;
use stepgraph_core::traits::TextGenerator;
use stepgraph_core::ChatMessage;
use stepgraph_llm::providers::presets;
use stepgraph_llm::{create_client, LlmGenerator};

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn ok(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Print one line per check and return whether all of them passed.
pub async fn run_doctor(config: &AppConfig) -> bool {
    let mut checks = vec![
        check_provider(config),
        check_api_key(config),
        check_engine(config),
    ];

    // Only worth a round trip if the provider resolves.
    if checks[0].ok {
        checks.push(check_model(config).await);
    }

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count == 0
}

fn check_provider(config: &AppConfig) -> CheckResult {
    let provider = &config.model.provider;
    match (presets::get_preset(provider), &config.model.base_url) {
        (_, Some(url)) => CheckResult::ok("Provider", format!("{} at {}", provider, url)),
        (Some(preset), None) => CheckResult::ok(
            "Provider",
            format!("{} at {}", provider, preset.default_base_url),
        ),
        (None, None) => CheckResult::fail(
            "Provider",
            format!(
                "unknown provider '{}' without base_url (known: {})",
                provider,
                presets::all_preset_names().join(", ")
            ),
        ),
    }
}

fn check_api_key(config: &AppConfig) -> CheckResult {
    let has_key = config
        .model
        .api_key
        .as_ref()
        .is_some_and(|k| !k.is_empty() && !k.starts_with("${"));
    let provider = &config.model.provider;
    let needs_key = presets::get_preset(provider).map_or(false, |p| p.needs_api_key);

    if !needs_key || has_key {
        CheckResult::ok(
            "API Key",
            format!("Configured for {} ({})", config.model.model_id, provider),
        )
    } else {
        CheckResult::fail("API Key", format!("No API key set for provider '{}'", provider))
    }
}

fn check_engine(config: &AppConfig) -> CheckResult {
    let engine = &config.engine;
    if engine.deadline_secs == Some(0) {
        return CheckResult::fail("Engine", "deadline_secs = 0 aborts every run immediately");
    }
    if engine.step_limit == Some(0) {
        return CheckResult::fail("Engine", "step_limit = 0 rejects every run");
    }
    let deadline = engine
        .deadline_secs
        .map_or("no deadline".to_string(), |s| format!("deadline {}s", s));
    let limit = engine
        .step_limit
        .map_or("no step limit".to_string(), |n| format!("step limit {}", n));
    let mode = if engine.parallel { "parallel" } else { "sequential" };
    CheckResult::ok("Engine", format!("{}, {}, {}", mode, deadline, limit))
}

async fn check_model(config: &AppConfig) -> CheckResult {
    let client = match create_client(&config.model) {
        Ok(c) => c,
        Err(e) => return CheckResult::fail("Model", e.to_string()),
    };
    let generator = LlmGenerator::new(Arc::from(client), config.model.clone());
    let probe = generator.generate(vec![ChatMessage::user("Reply with the single word OK.")]);
    let wait = Duration::from_secs(config.model.timeout_secs.min(30));

    match tokio::time::timeout(wait, probe).await {
        Ok(Ok(_)) => CheckResult::ok("Model", format!("{} responded", config.model.model_id)),
        Ok(Err(e)) => CheckResult::fail("Model", format!("{}: {}", config.model.model_id, e)),
        Err(_) => CheckResult::fail(
            "Model",
            format!("{} did not answer within {}s", config.model.model_id, wait.as_secs()),
        ),
    }
}
