mod common;

use std::sync::Arc;

use common::{AsciiCodec, ScriptedModel, special};
use llm_form_service::{
    GenerationRequest, build_prompt,
    error::ServiceError,
    model::{LanguageModel, LoadedModel, Pipeline},
};

fn pipeline(model: impl LanguageModel + 'static, use_template: bool) -> Pipeline {
    let loaded = LoadedModel {
        model: Arc::new(model),
        codec: Arc::new(AsciiCodec),
        special: special(),
    };
    Pipeline::new(loaded, use_template, Some(0))
}

#[test]
fn test_causal_output_drops_echoed_prompt() {
    let pipeline = pipeline(ScriptedModel::causal("Tell me a joke", " Why did the crab cross?"), false);
    let response = pipeline.run(&GenerationRequest::new("Tell me a joke")).unwrap();
    assert_eq!(response.prompt, "Tell me a joke");
    assert_eq!(response.output, "Why did the crab cross?");
    assert_eq!(response.tokens_generated, " Why did the crab cross?".len() + 1);
}

#[test]
fn test_instruction_template_keeps_only_response() {
    let prompt = build_prompt("Capital of France?", None, true);
    let pipeline = pipeline(ScriptedModel::causal(&prompt, "Paris is the capital."), true);
    let response = pipeline.run(&GenerationRequest::new("Capital of France?")).unwrap();
    assert_eq!(response.prompt, prompt);
    assert_eq!(response.output, "Paris is the capital.");
}

#[test]
fn test_context_switches_to_input_template() {
    let prompt = build_prompt("Summarize", Some("Rust is fast."), true);
    let pipeline = pipeline(ScriptedModel::causal(&prompt, "Fast."), true);
    let mut request = GenerationRequest::new("Summarize");
    request.context = Some("Rust is fast.".into());
    let response = pipeline.run(&request).unwrap();
    assert!(response.prompt.contains("### Input:"));
    assert_eq!(response.output, "Fast.");
}

#[test]
fn test_seq2seq_output_strips_pad_and_eos() {
    let pipeline = pipeline(ScriptedModel::seq2seq("Bonjour le monde"), false);
    let mut request = GenerationRequest::new("Translate to French: Hello world");
    request.num_beams = 1;
    let response = pipeline.run(&request).unwrap();
    assert_eq!(response.output, "Bonjour le monde");
}

#[test]
fn test_sampling_option_passes_through() {
    let pipeline = pipeline(ScriptedModel::causal("hi", " there"), false);
    let mut request = GenerationRequest::new("hi");
    request.num_beams = 1;
    request.top_k = 1;
    request
        .options
        .insert("do_sample".into(), serde_json::Value::Bool(true));
    let response = pipeline.run(&request).unwrap();
    assert_eq!(response.output, "there");
}

#[test]
fn test_max_new_tokens_truncates() {
    let pipeline = pipeline(ScriptedModel::causal("count", " one two three"), false);
    let mut request = GenerationRequest::new("count");
    request.max_new_tokens = 4;
    let response = pipeline.run(&request).unwrap();
    assert_eq!(response.output, "one");
    assert_eq!(response.tokens_generated, 4);
}

#[test]
fn test_invalid_request_rejected_before_generation() {
    let pipeline = pipeline(ScriptedModel::causal("x", "y"), false);
    let mut request = GenerationRequest::new("x");
    request.num_beams = 9;
    assert!(matches!(
        pipeline.run(&request).unwrap_err(),
        ServiceError::BadRequest(_)
    ));
}

#[test]
fn test_tokenizer_failure_propagates() {
    let pipeline = pipeline(ScriptedModel::causal("x", "y"), false);
    let err = pipeline.run(&GenerationRequest::new("naïve")).unwrap_err();
    assert!(matches!(err, ServiceError::Tokenizer(_)));
}
