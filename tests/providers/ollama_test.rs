//! Ollama wire-translation round trips.

use serde_json::json;
use straylight::providers::ollama::{convert_messages, convert_tools, parse_response};
use straylight::scri::{
    ContentBlock, FinishReason, Message, MessageContent, Role, ToolDefinition,
};

#[test]
fn text_message_survives_an_echo_round_trip() {
    let original = Message::text(Role::User, "ping");

    let wire = convert_messages(std::slice::from_ref(&original));
    assert_eq!(wire[0]["role"], "user");
    assert_eq!(wire[0]["content"], "ping");

    let echo = json!({
        "model": "qwen3:8b",
        "message": {"role": "assistant", "content": "ping"},
        "done": true,
        "done_reason": "stop",
        "prompt_eval_count": 2,
        "eval_count": 1
    });
    let response = parse_response("qwen3:8b", &echo.to_string()).expect("parses");
    assert_eq!(response.content.len(), 1);
    assert!(matches!(
        &response.content[0],
        ContentBlock::Text { text } if text == "ping"
    ));
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(response.usage.total_tokens, 3);
}

#[test]
fn tool_calls_round_trip_with_minted_ids() {
    let original = Message {
        role: Role::Assistant,
        content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
            id: "call_1".to_owned(),
            name: "lookup".to_owned(),
            input: json!({"q": "drift"}),
        }]),
    };

    let wire = convert_messages(&[original]);
    assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "lookup");

    let echo = json!({
        "model": "qwen3:8b",
        "message": {
            "role": "assistant",
            "content": "",
            "tool_calls": [{"function": {"name": "lookup", "arguments": {"q": "drift"}}}]
        },
        "done": true
    });
    let response = parse_response("qwen3:8b", &echo.to_string()).expect("parses");
    assert!(matches!(
        &response.content[0],
        ContentBlock::ToolUse { name, input, .. }
            if name == "lookup" && input["q"] == "drift"
    ));
    assert_eq!(response.finish_reason, FinishReason::ToolCalls);
    assert!(response.tool_calls[0].id.starts_with("call_"));
}

#[test]
fn length_done_reason_maps_to_length() {
    let echo = json!({
        "model": "qwen3:8b",
        "message": {"role": "assistant", "content": "truncat"},
        "done": true,
        "done_reason": "length"
    });
    let response = parse_response("qwen3:8b", &echo.to_string()).expect("parses");
    assert_eq!(response.finish_reason, FinishReason::Length);
}

#[test]
fn tool_definitions_wrap_as_functions() {
    let tools = vec![ToolDefinition {
        name: "lookup".to_owned(),
        description: "Search".to_owned(),
        parameters: json!({"type": "object"}),
    }];
    let wire = convert_tools(&tools);
    assert_eq!(wire[0]["type"], "function");
    assert_eq!(wire[0]["function"]["name"], "lookup");
}
