//! Reflection：循环正常结束后的一次有界总结
//!
//! 使用快速模型，输入为本次指令的记录（指令、各回合 Thought 与 Observation），输出截断到 max_chars。

use crate::llm::{ChatRequest, ModelRouter};
use crate::memory::{Message, Role};

const REFLECTION_PREAMBLE: &str = "Review the task transcript below. In at most a few sentences, \
state what worked, what failed, and any risks that remain. Do not propose or run new commands.";

/// 每条记录进入反思上下文的最大字符数
const ENTRY_PREVIEW_CHARS: usize = 600;

/// 反思请求构造器
#[derive(Debug, Clone)]
pub struct Reflector {
    router: ModelRouter,
    max_chars: usize,
}

impl Reflector {
    pub fn new(router: ModelRouter, max_chars: usize) -> Self {
        Self { router, max_chars }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn request(&self, transcript: &[Message]) -> ChatRequest {
        let decision = self.router.fast();
        let mut body = String::new();
        for message in transcript {
            let label = match (message.role, message.action.is_some()) {
                (Role::User, true) => "Observation",
                (Role::User, false) => "Task",
                (Role::Assistant, _) => "Thought",
                (Role::System, _) => continue,
            };
            let preview: String = message.content.chars().take(ENTRY_PREVIEW_CHARS).collect();
            body.push_str(label);
            body.push_str(": ");
            body.push_str(preview.trim());
            body.push('\n');
        }
        ChatRequest::new(
            decision.model,
            decision.temperature,
            vec![Message::system(REFLECTION_PREAMBLE), Message::user(body)],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ActionRef;

    #[test]
    fn test_request_uses_fast_model_and_labels() {
        let reflector = Reflector::new(ModelRouter::default(), 100);
        let transcript = vec![
            Message::user("say hi"),
            Message::assistant("Action: echo hi"),
            Message::user("hi").with_action(ActionRef {
                command: "echo hi".to_string(),
                allowed: true,
                exit_code: Some(0),
            }),
        ];
        let req = reflector.request(&transcript);
        assert_eq!(req.model, ModelRouter::default().models().fast);
        let body = &req.messages[1].content;
        assert!(body.contains("Task: say hi"));
        assert!(body.contains("Thought: Action: echo hi"));
        assert!(body.contains("Observation: hi"));
    }
}
