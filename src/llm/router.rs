//! 模型路由器
//!
//! 根据指令文本选择模型与采样温度（纯函数，无 I/O）。分类顺序固定，先命中者胜：
//! - 编码意图（code / script / function / class / bug / fix / refactor / compile）→ 编码模型，温度 0.2
//! - 复杂 / 分析意图（长度超过 500 字符，或 analyze / architect / design / reason / logic）→ 推理模型，温度 0.7
//! - 其余 → 快速小模型，温度 0.5
//!
//! 编码检查先于复杂度检查，因此很长的编码请求仍然走编码模型。

use serde::Serialize;

use crate::config::LlmModelsSection;

/// 超过该字符数视为复杂任务
pub const COMPLEX_LENGTH_THRESHOLD: usize = 500;

const CODING_KEYWORDS: &[&str] = &[
    "code", "script", "function", "class", "bug", "fix", "refactor", "compile",
];

const COMPLEX_KEYWORDS: &[&str] = &["analyze", "architect", "design", "reason", "logic"];

/// 任务类别（用于路由决策）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Coding,
    Complex,
    Default,
}

impl TaskCategory {
    pub fn temperature(self) -> f32 {
        match self {
            TaskCategory::Coding => 0.2,
            TaskCategory::Complex => 0.7,
            TaskCategory::Default => 0.5,
        }
    }
}

/// 任务类型检测器
pub struct TaskClassifier;

impl TaskClassifier {
    /// 按固定优先级分类（大小写不敏感的子串匹配）
    pub fn classify(text: &str) -> (TaskCategory, String) {
        let lower = text.to_lowercase();

        if let Some(k) = CODING_KEYWORDS.iter().find(|k| lower.contains(**k)) {
            return (TaskCategory::Coding, format!("coding keyword '{}'", k));
        }

        let chars = text.chars().count();
        if chars > COMPLEX_LENGTH_THRESHOLD {
            return (
                TaskCategory::Complex,
                format!("long instruction ({} chars)", chars),
            );
        }
        if let Some(k) = COMPLEX_KEYWORDS.iter().find(|k| lower.contains(**k)) {
            return (TaskCategory::Complex, format!("analytical keyword '{}'", k));
        }

        (TaskCategory::Default, "no coding or analytical signal".to_string())
    }
}

/// 三个档位的模型标识
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSet {
    pub coding: String,
    pub reasoning: String,
    pub fast: String,
}

impl From<&LlmModelsSection> for ModelSet {
    fn from(section: &LlmModelsSection) -> Self {
        Self {
            coding: section.coding.clone(),
            reasoning: section.reasoning.clone(),
            fast: section.fast.clone(),
        }
    }
}

impl Default for ModelSet {
    fn default() -> Self {
        Self::from(&LlmModelsSection::default())
    }
}

/// 路由结果（瞬时值）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub model: String,
    pub temperature: f32,
    pub category: TaskCategory,
    pub reason: String,
}

/// 模型路由器
#[derive(Debug, Clone, Default)]
pub struct ModelRouter {
    models: ModelSet,
}

impl ModelRouter {
    pub fn new(models: ModelSet) -> Self {
        Self { models }
    }

    pub fn models(&self) -> &ModelSet {
        &self.models
    }

    pub fn route(&self, text: &str) -> RoutingDecision {
        let (category, reason) = TaskClassifier::classify(text);
        self.decision(category, reason)
    }

    /// 自我修正固定使用编码模型
    pub fn coding(&self) -> RoutingDecision {
        self.decision(TaskCategory::Coding, "command correction".to_string())
    }

    /// 反思使用快速模型
    pub fn fast(&self) -> RoutingDecision {
        self.decision(TaskCategory::Default, "reflection".to_string())
    }

    fn decision(&self, category: TaskCategory, reason: String) -> RoutingDecision {
        let model = match category {
            TaskCategory::Coding => &self.models.coding,
            TaskCategory::Complex => &self.models.reasoning,
            TaskCategory::Default => &self.models.fast,
        };
        RoutingDecision {
            model: model.clone(),
            temperature: category.temperature(),
            category,
            reason,
        }
    }
}
