//! Locating todo lists inside message content.

use agent_relay_core::{TodoItem, payload::parse_lenient};
use serde_json::{Map, Value};

const TODO_TOOL: &str = "TodoWrite";
const MAX_DEPTH: usize = 8;

/// Todo list carried by a `TodoWrite` tool call in `content`, if any.
///
/// Content is searched depth first; within arrays the last matching call
/// wins since it reflects the latest list.
#[must_use]
pub fn extract_todos(content: &Value) -> Option<Vec<TodoItem>> {
    find(content, 0)
}

fn find(value: &Value, depth: usize) -> Option<Vec<TodoItem>> {
    if depth > MAX_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            if is_todo_write(map) {
                let todos = map.get("input").and_then(|input| input.get("todos"));
                if let Some(items) = todos.and_then(parse_lenient::<Vec<TodoItem>>) {
                    return Some(items);
                }
            }
            map.values().find_map(|v| find(v, depth + 1))
        }
        Value::Array(items) => items.iter().rev().find_map(|v| find(v, depth + 1)),
        _ => None,
    }
}

fn is_todo_write(map: &Map<String, Value>) -> bool {
    map.get("type").and_then(Value::as_str) == Some("tool_use")
        && map.get("name").and_then(Value::as_str) == Some(TODO_TOOL)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn todo_call(items: &Value) -> Value {
        json!({"type": "tool_use", "name": "TodoWrite", "input": {"todos": items}})
    }

    #[test]
    fn test_finds_nested_tool_call() {
        let content = json!({
            "role": "agent",
            "content": {"type": "output", "data": {"message": {"content": [
                {"type": "text", "text": "planning"},
                todo_call(&json!([{"content": "write tests", "status": "in_progress"}])),
            ]}}}
        });

        let todos = extract_todos(&content).unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].content, "write tests");
        assert_eq!(todos[0].status, "in_progress");
    }

    #[test]
    fn test_last_call_wins() {
        let content = json!([
            todo_call(&json!([{"content": "old"}])),
            todo_call(&json!([{"content": "new"}])),
        ]);
        assert_eq!(extract_todos(&content).unwrap()[0].content, "new");
    }

    #[test]
    fn test_ignores_other_tools_and_bad_shapes() {
        assert!(extract_todos(&json!({"type": "tool_use", "name": "Bash", "input": {}})).is_none());
        assert!(extract_todos(&todo_call(&json!("not a list"))).is_none());
        assert!(extract_todos(&json!("plain text")).is_none());
    }
}
