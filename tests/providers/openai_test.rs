//! OpenAI-compatible wire-translation round trips.

use serde_json::json;
use straylight::providers::openai::{build_request, convert_messages, parse_response};
use straylight::scri::{
    ChatRequest, ContentBlock, FinishReason, Message, MessageContent, Role, ToolChoice,
    ToolDefinition,
};

#[test]
fn assistant_tool_call_survives_an_echo_round_trip() {
    let original = Message {
        role: Role::Assistant,
        content: MessageContent::Blocks(vec![
            ContentBlock::Text {
                text: "let me look".to_owned(),
            },
            ContentBlock::ToolUse {
                id: "call_1".to_owned(),
                name: "lookup".to_owned(),
                input: json!({"q": "drift"}),
            },
        ]),
    };

    // SCRI -> wire: arguments become a JSON string.
    let wire = convert_messages(std::slice::from_ref(&original));
    let wire_message = &wire.as_array().expect("array")[0];
    let wire_call = &wire_message["tool_calls"][0];
    assert_eq!(wire_call["function"]["name"], "lookup");
    let arguments = wire_call["function"]["arguments"].as_str().expect("string");

    // Synthetic echo response carrying the same content.
    let echo = json!({
        "id": "chatcmpl-echo",
        "model": "gpt-4o",
        "choices": [{
            "message": {
                "content": "let me look",
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "lookup", "arguments": arguments}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 7, "completion_tokens": 3}
    });

    // Wire -> SCRI.
    let response = parse_response("openai", &echo.to_string()).expect("parses");
    assert_eq!(response.content.len(), 2);
    assert!(matches!(
        &response.content[0],
        ContentBlock::Text { text } if text == "let me look"
    ));
    assert!(matches!(
        &response.content[1],
        ContentBlock::ToolUse { id, name, input }
            if id == "call_1" && name == "lookup" && input["q"] == "drift"
    ));
    assert_eq!(response.finish_reason, FinishReason::ToolCalls);
    assert_eq!(response.usage.total_tokens, 10);
}

#[test]
fn request_builder_maps_sampling_and_tool_choice() {
    let mut request = ChatRequest::user("gpt-4o", "q");
    request.temperature = Some(0.3);
    request.top_p = Some(0.9);
    request.max_tokens = Some(256);
    request.tools = vec![ToolDefinition {
        name: "lookup".to_owned(),
        description: "Search".to_owned(),
        parameters: json!({"type": "object"}),
    }];
    request.tool_choice = Some(ToolChoice::Any);

    let wire = build_request("gpt-4o", &request, false);
    let body = serde_json::to_value(&wire).expect("serialize");
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["temperature"], 0.3);
    assert_eq!(body["max_tokens"], 256);
    // `any` maps to the wire's `required`.
    assert_eq!(body["tool_choice"], "required");
    assert_eq!(body["tools"][0]["function"]["name"], "lookup");
    // Non-streaming requests omit the stream flag entirely.
    assert!(body.get("stream").is_none());
}

#[test]
fn reasoning_tokens_surface_in_usage() {
    let body = json!({
        "choices": [{
            "message": {"content": "done", "tool_calls": null},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 5,
            "completion_tokens": 20,
            "completion_tokens_details": {"reasoning_tokens": 12}
        }
    });
    let response = parse_response("openai", &body.to_string()).expect("parses");
    assert_eq!(response.usage.reasoning_tokens, Some(12));
}
