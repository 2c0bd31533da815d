//! Adapter capability contract: names, models, and capability flags.

use straylight::providers::anthropic::AnthropicAdapter;
use straylight::providers::google::GoogleAdapter;
use straylight::providers::ollama::OllamaAdapter;
use straylight::providers::openai::OpenAiAdapter;
use straylight::providers::ProviderAdapter;

#[test]
fn anthropic_adapter_reports_name_and_capabilities() {
    let adapter = AnthropicAdapter::new(
        "claude-sonnet-4-5".to_owned(),
        "test-api-key".to_owned(),
    );
    assert_eq!(adapter.provider_name(), "anthropic");
    assert_eq!(adapter.model_id(), "claude-sonnet-4-5");
    let caps = adapter.list_models();
    assert_eq!(caps.len(), 1);
    assert!(caps[0].supports_tools);
    assert!(caps[0].supports_streaming);
    assert!(!caps[0].supports_embeddings);
}

#[test]
fn openai_adapter_reports_name_and_capabilities() {
    let adapter = OpenAiAdapter::new("gpt-4o".to_owned(), "test-api-key".to_owned());
    assert_eq!(adapter.provider_name(), "openai");
    assert_eq!(adapter.model_id(), "gpt-4o");
    assert!(adapter.list_models()[0].supports_embeddings);
}

#[test]
fn xai_rides_the_openai_adapter_with_its_own_name() {
    let adapter = OpenAiAdapter::for_provider(
        "xai".to_owned(),
        "grok-4".to_owned(),
        "test-api-key".to_owned(),
        "https://api.x.ai".to_owned(),
    );
    assert_eq!(adapter.provider_name(), "xai");
    let caps = adapter.list_models();
    assert_eq!(caps[0].provider, "xai");
    // xai has no embeddings endpoint on this surface.
    assert!(!caps[0].supports_embeddings);
}

#[test]
fn google_adapter_reports_name_and_capabilities() {
    let adapter = GoogleAdapter::new("gemini-2.5-flash".to_owned(), "test-api-key".to_owned());
    assert_eq!(adapter.provider_name(), "google");
    assert!(adapter.list_models()[0].supports_embeddings);
}

#[test]
fn ollama_adapter_reports_name_and_capabilities() {
    let adapter = OllamaAdapter::new("qwen3:8b".to_owned());
    assert_eq!(adapter.provider_name(), "ollama");
    assert_eq!(adapter.model_id(), "qwen3:8b");
    let caps = adapter.list_models();
    assert!(!caps[0].supports_search);
}
