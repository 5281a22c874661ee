use serde_json::Value;
use std::collections::HashMap;

use dere_sessions::types::{BlockType, ConversationBlock};

/// Reconstructs the ordered block shape of one assistant turn from a stream
/// of deltas and tool events.
///
/// Consecutive text deltas merge into one block; same for thinking. A
/// tool_use is upserted by id — a late-arriving full-input completes an
/// earlier empty-input announcement instead of appending a duplicate.
#[derive(Default)]
pub struct BlockAssembler {
    blocks: Vec<Draft>,
    tool_use_index: HashMap<String, usize>,
}

enum Draft {
    Text(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Draft::Text(existing)) = self.blocks.last_mut() {
            existing.push_str(text);
            return;
        }
        self.blocks.push(Draft::Text(text.to_string()));
    }

    pub fn push_thinking(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Draft::Thinking(existing)) = self.blocks.last_mut() {
            existing.push_str(text);
            return;
        }
        self.blocks.push(Draft::Thinking(text.to_string()));
    }

    pub fn push_tool_use(&mut self, id: &str, name: &str, input: Value) {
        if !id.is_empty() {
            if let Some(&idx) = self.tool_use_index.get(id) {
                if let Draft::ToolUse {
                    name: existing_name,
                    input: existing_input,
                    ..
                } = &mut self.blocks[idx]
                {
                    if existing_name.is_empty() && !name.is_empty() {
                        *existing_name = name.to_string();
                    }
                    let empty = matches!(existing_input, Value::Null)
                        || existing_input
                            .as_object()
                            .is_some_and(|o| o.is_empty());
                    if empty && input.is_object() {
                        *existing_input = input;
                    }
                }
                return;
            }
            self.tool_use_index.insert(id.to_string(), self.blocks.len());
        }
        self.blocks.push(Draft::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input,
        });
    }

    pub fn push_tool_result(&mut self, tool_use_id: &str, name: &str, output: &str, is_error: bool) {
        self.blocks.push(Draft::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            name: name.to_string(),
            output: output.to_string(),
            is_error,
        });
    }

    /// Response text: text blocks joined by blank lines, so post-tool text
    /// reads cleanly.
    pub fn response_text(&self) -> String {
        let segments: Vec<&str> = self
            .blocks
            .iter()
            .filter_map(|b| match b {
                Draft::Text(text) if !text.is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect();
        segments.join("\n\n")
    }

    /// Finish assembly, producing blocks with their final ordinals.
    pub fn finish(self) -> Vec<ConversationBlock> {
        self.blocks
            .into_iter()
            .enumerate()
            .map(|(ordinal, draft)| {
                let ordinal = ordinal as i64;
                match draft {
                    Draft::Text(text) => ConversationBlock::text(ordinal, text),
                    Draft::Thinking(text) => ConversationBlock::thinking(ordinal, text),
                    Draft::ToolUse { id, name, input } => ConversationBlock {
                        ordinal,
                        block_type: BlockType::ToolUse,
                        tool_use_id: Some(id),
                        tool_name: Some(name),
                        tool_input: Some(input),
                        text: None,
                        is_error: false,
                    },
                    Draft::ToolResult {
                        tool_use_id,
                        name,
                        output,
                        is_error,
                    } => ConversationBlock {
                        ordinal,
                        block_type: BlockType::ToolResult,
                        tool_use_id: Some(tool_use_id),
                        tool_name: Some(name),
                        tool_input: None,
                        text: Some(output),
                        is_error,
                    },
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn consecutive_text_deltas_coalesce() {
        let mut asm = BlockAssembler::new();
        asm.push_text("Hel");
        asm.push_text("lo");
        asm.push_thinking("hmm");
        asm.push_text("world");

        let blocks = asm.finish();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].text.as_deref(), Some("Hello"));
        assert_eq!(blocks[1].block_type, BlockType::Thinking);
        assert_eq!(blocks[2].text.as_deref(), Some("world"));
    }

    #[test]
    fn tool_use_upserts_by_id() {
        let mut asm = BlockAssembler::new();
        // Sandbox runners announce a tool with empty input first, then the
        // full input once the stream completes it.
        asm.push_tool_use("tu_1", "", json!({}));
        asm.push_text("running...");
        asm.push_tool_use("tu_1", "Bash", json!({"cmd": "ls"}));

        let blocks = asm.finish();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].block_type, BlockType::ToolUse);
        assert_eq!(blocks[0].tool_name.as_deref(), Some("Bash"));
        assert_eq!(blocks[0].tool_input, Some(json!({"cmd": "ls"})));
        assert_eq!(blocks[1].text.as_deref(), Some("running..."));
    }

    #[test]
    fn response_text_joins_text_blocks() {
        let mut asm = BlockAssembler::new();
        asm.push_text("first");
        asm.push_tool_use("tu_1", "Read", json!({"path": "/tmp"}));
        asm.push_tool_result("tu_1", "Read", "contents", false);
        asm.push_text("second");
        assert_eq!(asm.response_text(), "first\n\nsecond");
    }

    #[test]
    fn thinking_never_enters_response_text() {
        let mut asm = BlockAssembler::new();
        asm.push_thinking("internal");
        asm.push_text("visible");
        assert_eq!(asm.response_text(), "visible");
    }
}
