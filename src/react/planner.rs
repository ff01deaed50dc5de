//! Planner：系统前言、提示上下文与动作指令解析
//!
//! Thought 中第一条非空的 `Action: <command>` 行（大小写不敏感）即为动作；可选的 `Cwd: <dir>` 行给出工作目录。
//! 没有 Action 行的 Thought 视为最终回答。

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::memory::{Message, Role};
use crate::tools::ActionRequest;

static ACTION_RE: OnceLock<Regex> = OnceLock::new();
static CWD_RE: OnceLock<Regex> = OnceLock::new();

/// 内置系统前言；{workspace} 会被替换为工作区根
pub const DEFAULT_PREAMBLE: &str = "You are a careful local assistant that can run shell commands \
inside the workspace {workspace}.\n\
Think step by step. When you need to run a command, end your reply with one line:\n\
Action: <shell command>\n\
Optionally add a line `Cwd: <directory>` to run it in a subdirectory of the workspace.\n\
Only one action per reply. You will receive the command output as an Observation.\n\
Paths outside the workspace and destructive commands are refused.\n\
When the task is finished, reply with the final answer and no Action line.";

/// 解析动作指令：首条非空的 Action 行胜出
pub fn parse_action(text: &str) -> Option<ActionRequest> {
    let re = ACTION_RE.get_or_init(|| Regex::new(r"(?im)^[ \t>*_-]*action[*_]*[ \t]*:[*_]*[ \t]*(.*?)[ \t]*$").unwrap());
    let command = re
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| strip_code_marks(m.as_str()))
        .find(|c| !c.is_empty())?;

    let mut request = ActionRequest::new(command);
    if let Some(cwd) = parse_cwd(text) {
        request = request.with_cwd(cwd);
    }
    Some(request)
}

fn parse_cwd(text: &str) -> Option<String> {
    let re = CWD_RE.get_or_init(|| Regex::new(r"(?im)^[ \t>*_-]*cwd[*_]*[ \t]*:[*_]*[ \t]*(.*?)[ \t]*$").unwrap());
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| strip_code_marks(m.as_str()))
        .find(|c| !c.is_empty())
}

/// 去掉包裹命令的反引号
fn strip_code_marks(raw: &str) -> String {
    raw.trim().trim_matches('`').trim().to_string()
}

/// 渲染系统前言
pub fn render_preamble(template: Option<&str>, workspace: &Path) -> String {
    template
        .unwrap_or(DEFAULT_PREAMBLE)
        .replace("{workspace}", &workspace.display().to_string())
}

/// 提示上下文：系统前言 + 会话历史（历史中的 System 消息不重复发送）
pub fn build_context(preamble: &str, history: &[Message]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(Message::system(preamble));
    messages.extend(history.iter().filter(|m| m.role != Role::System).cloned());
    messages
}

/// Observation 回填给模型时的文本
pub fn observation_message(command: &str, text: &str) -> String {
    format!("Observation for `{}`:\n{}", command, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action_basic() {
        let req = parse_action("I will list files.\nAction: ls -la").unwrap();
        assert_eq!(req.command, "ls -la");
        assert_eq!(req.cwd, None);
    }

    #[test]
    fn test_parse_action_case_insensitive_first_wins() {
        let text = "thinking...\nACTION: echo one\naction: echo two";
        assert_eq!(parse_action(text).unwrap().command, "echo one");
    }

    #[test]
    fn test_parse_action_skips_empty_and_strips_backticks() {
        let text = "Action:\nAction: `cat notes.md`";
        assert_eq!(parse_action(text).unwrap().command, "cat notes.md");
        assert_eq!(parse_action("**Action:** `pwd`").unwrap().command, "pwd");
    }

    #[test]
    fn test_parse_action_requires_line_start() {
        assert!(parse_action("The next action: none needed").is_none());
        assert!(parse_action("All done, the answer is 42.").is_none());
    }

    #[test]
    fn test_parse_cwd_hint() {
        let req = parse_action("Cwd: src\nAction: ls").unwrap();
        assert_eq!(req.cwd.as_deref(), Some("src"));
    }

    #[test]
    fn test_build_context_drops_history_system_messages() {
        let history = vec![
            Message::user("hi"),
            Message::system("old"),
            Message::assistant("hello"),
        ];
        let ctx = build_context("rules", &history);
        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx[0], Message::system("rules"));
        assert_eq!(ctx[2].role, Role::Assistant);
    }

    #[test]
    fn test_render_preamble() {
        let p = render_preamble(None, Path::new("/ws"));
        assert!(p.contains("/ws"));
        assert!(p.contains("Action:"));
        assert_eq!(render_preamble(Some("custom"), Path::new("/ws")), "custom");
    }
}
