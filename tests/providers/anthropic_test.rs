//! Anthropic wire-translation round trips: SCRI in, synthetic echo out,
//! semantically equal SCRI back.

use serde_json::json;
use straylight::providers::anthropic::{convert_messages, convert_tools, parse_response};
use straylight::scri::{
    ContentBlock, FinishReason, ImageSource, Message, MessageContent, Role, ToolDefinition,
};

fn assistant_blocks() -> Vec<ContentBlock> {
    vec![
        ContentBlock::Thinking {
            text: "weighing options".to_owned(),
            signature: Some("sig-1".to_owned()),
        },
        ContentBlock::Text {
            text: "checking the docs".to_owned(),
        },
        ContentBlock::ToolUse {
            id: "toolu_1".to_owned(),
            name: "lookup".to_owned(),
            input: json!({"q": "drift"}),
        },
    ]
}

#[test]
fn assistant_message_survives_an_echo_round_trip() {
    let original = Message {
        role: Role::Assistant,
        content: MessageContent::Blocks(assistant_blocks()),
    };

    // SCRI -> wire.
    let wire = convert_messages(std::slice::from_ref(&original));
    let wire_message = &wire.as_array().expect("array")[0];
    assert_eq!(wire_message["role"], "assistant");
    let wire_blocks = wire_message["content"].as_array().expect("blocks");
    assert_eq!(wire_blocks.len(), 3);

    // Synthetic echo response carrying the same content.
    let echo = json!({
        "id": "msg_echo",
        "model": "claude-sonnet-4-5",
        "content": wire_blocks,
        "stop_reason": "tool_use",
        "usage": {"input_tokens": 10, "output_tokens": 5}
    });

    // Wire -> SCRI.
    let response = parse_response(&echo.to_string()).expect("parses");
    assert_eq!(response.content.len(), 3);
    assert!(matches!(
        &response.content[0],
        ContentBlock::Thinking { text, .. } if text == "weighing options"
    ));
    assert!(matches!(
        &response.content[1],
        ContentBlock::Text { text } if text == "checking the docs"
    ));
    assert!(matches!(
        &response.content[2],
        ContentBlock::ToolUse { id, name, input }
            if id == "toolu_1" && name == "lookup" && input["q"] == "drift"
    ));
    assert_eq!(response.finish_reason, FinishReason::ToolCalls);
}

#[test]
fn image_blocks_translate_both_source_kinds() {
    use sha2::{Digest, Sha256};

    let message = Message {
        role: Role::User,
        content: MessageContent::Blocks(vec![
            ContentBlock::Image {
                source: ImageSource::from_bytes("image/png", b"fake png bytes"),
            },
            ContentBlock::Image {
                source: ImageSource::Uri {
                    uri: "https://example.com/x.png".to_owned(),
                },
            },
        ]),
    };

    let wire = convert_messages(&[message]);
    let parts = wire[0]["content"].as_array().expect("parts");
    assert_eq!(parts[0]["source"]["type"], "base64");
    assert_eq!(parts[1]["source"]["type"], "url");

    // Image bytes survive translation unchanged, compared by digest.
    let wire_source = ImageSource::Base64 {
        media_type: "image/png".to_owned(),
        data: parts[0]["source"]["data"]
            .as_str()
            .expect("data")
            .to_owned(),
    };
    let wire_bytes = wire_source
        .decoded_bytes()
        .expect("valid base64")
        .expect("inline source");
    assert_eq!(
        Sha256::digest(&wire_bytes),
        Sha256::digest(b"fake png bytes")
    );
}

#[test]
fn tool_result_blocks_become_user_turns() {
    let message = Message {
        role: Role::Tool,
        content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
            tool_use_id: "toolu_1".to_owned(),
            content: "42".to_owned(),
            is_error: false,
        }]),
    };

    let wire = convert_messages(&[message]);
    assert_eq!(wire[0]["role"], "user");
    assert_eq!(wire[0]["content"][0]["type"], "tool_result");
    assert_eq!(wire[0]["content"][0]["tool_use_id"], "toolu_1");
}

#[test]
fn tool_definitions_use_the_input_schema_field() {
    let tools = vec![ToolDefinition {
        name: "lookup".to_owned(),
        description: "Search the index".to_owned(),
        parameters: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
    }];
    let wire = convert_tools(&tools);
    assert_eq!(wire[0]["name"], "lookup");
    assert_eq!(wire[0]["input_schema"]["type"], "object");
}
