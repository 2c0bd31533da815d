//! Gemini wire-translation round trips.

use serde_json::json;
use straylight::providers::google::{convert_messages, convert_tools, parse_response};
use straylight::scri::{
    ContentBlock, FinishReason, Message, MessageContent, Role, ToolDefinition,
};

#[test]
fn function_call_survives_an_echo_round_trip() {
    let original = Message {
        role: Role::Assistant,
        content: MessageContent::Blocks(vec![
            ContentBlock::Text {
                text: "searching".to_owned(),
            },
            ContentBlock::ToolUse {
                id: "call_1".to_owned(),
                name: "lookup".to_owned(),
                input: json!({"q": "drift"}),
            },
        ]),
    };

    // SCRI -> wire.
    let wire = convert_messages(std::slice::from_ref(&original));
    let parts = wire[0]["parts"].as_array().expect("parts");
    assert_eq!(wire[0]["role"], "model");
    assert_eq!(parts[1]["functionCall"]["name"], "lookup");

    // Synthetic echo response carrying the same parts.
    let echo = json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": "STOP"
        }],
        "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
    });

    // Wire -> SCRI. Gemini drops call ids; the gateway mints fresh unique ones.
    let response = parse_response("gemini-2.5-flash", &echo.to_string()).expect("parses");
    assert_eq!(response.content.len(), 2);
    assert!(matches!(
        &response.content[0],
        ContentBlock::Text { text } if text == "searching"
    ));
    assert!(matches!(
        &response.content[1],
        ContentBlock::ToolUse { name, input, .. }
            if name == "lookup" && input["q"] == "drift"
    ));
    assert_eq!(response.finish_reason, FinishReason::ToolCalls);
    assert_eq!(response.usage.total_tokens, 6);
}

#[test]
fn system_messages_are_excluded_from_contents() {
    let messages = vec![
        Message::text(Role::System, "be terse"),
        Message::text(Role::User, "hi"),
    ];
    let wire = convert_messages(&messages);
    let contents = wire.as_array().expect("array");
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0]["role"], "user");
}

#[test]
fn thinking_blocks_round_trip_as_thought_parts() {
    let message = Message {
        role: Role::Assistant,
        content: MessageContent::Blocks(vec![ContentBlock::Thinking {
            text: "pondering".to_owned(),
            signature: None,
        }]),
    };
    let wire = convert_messages(&[message]);
    assert_eq!(wire[0]["parts"][0]["thought"], true);

    let echo = json!({
        "candidates": [{
            "content": {"role": "model", "parts": [
                {"text": "pondering", "thought": true},
                {"text": "the answer"}
            ]},
            "finishReason": "STOP"
        }]
    });
    let response = parse_response("gemini-2.5-flash", &echo.to_string()).expect("parses");
    assert!(matches!(
        &response.content[0],
        ContentBlock::Thinking { text, .. } if text == "pondering"
    ));
    assert!(matches!(
        &response.content[1],
        ContentBlock::Text { text } if text == "the answer"
    ));
}

#[test]
fn tool_definitions_nest_under_function_declarations() {
    let tools = vec![ToolDefinition {
        name: "lookup".to_owned(),
        description: "Search".to_owned(),
        parameters: json!({"type": "object"}),
    }];
    let wire = convert_tools(&tools);
    assert_eq!(wire[0]["functionDeclarations"][0]["name"], "lookup");
}

#[test]
fn generated_tool_call_ids_are_unique_within_a_response() {
    let echo = json!({
        "candidates": [{
            "content": {"role": "model", "parts": [
                {"functionCall": {"name": "a", "args": {}}},
                {"functionCall": {"name": "b", "args": {}}}
            ]},
            "finishReason": "STOP"
        }]
    });
    let response = parse_response("gemini-2.5-flash", &echo.to_string()).expect("parses");
    assert_eq!(response.tool_calls.len(), 2);
    assert_ne!(response.tool_calls[0].id, response.tool_calls[1].id);
}
