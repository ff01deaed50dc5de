//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WARDEN__*` 覆盖（双下划线表示嵌套，如 `WARDEN__EXECUTOR__TIMEOUT_SECS=10`）。
//! 加载完成后配置只读；各组件在构造时取走自己需要的部分，业务逻辑中不再读取进程级状态。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub orchestrator: OrchestratorSection,
    pub executor: ExecutorSection,
    pub sandbox: SandboxSection,
    pub llm: LlmSection,
    pub storage: StorageSection,
}

/// [app] 段：应用名、工作目录、状态目录、临时目录
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 用户级状态目录，未设置时用 ~/.warden
    pub state_dir: Option<PathBuf>,
    /// 临时目录，未设置时用系统临时目录
    pub scratch_dir: Option<PathBuf>,
}

/// [orchestrator] 段：回合上限与反思长度
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_turns: usize,
    pub reflection_max_chars: usize,
    /// 覆盖内置的系统前言
    pub system_preamble: Option<String>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_turns: 5,
            reflection_max_chars: 1200,
            system_preamble: None,
        }
    }
}

/// [executor] 段：子进程超时、输出上限、自我修正次数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub timeout_secs: u64,
    /// stdout / stderr 各自的字节上限
    pub output_cap_bytes: usize,
    /// 单个动作的最大执行次数（含首次）
    pub max_attempts: usize,
    pub shell: String,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            output_cap_bytes: 16 * 1024,
            max_attempts: 3,
            shell: "sh".to_string(),
        }
    }
}

/// [sandbox] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SandboxSection {
    pub extra_allowed_dirs: Vec<PathBuf>,
    /// 未设置时按平台约定（Windows / macOS 不区分大小写）
    pub case_insensitive: Option<bool>,
}

/// [llm] 段：后端选择、模型与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock
    pub provider: String,
    pub base_url: Option<String>,
    pub api_key_env: String,
    pub models: LlmModelsSection,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            models: LlmModelsSection::default(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmModelsSection {
    pub coding: String,
    pub reasoning: String,
    pub fast: String,
}

impl Default for LlmModelsSection {
    fn default() -> Self {
        Self {
            coding: "qwen2.5-coder".to_string(),
            reasoning: "deepseek-r1".to_string(),
            fast: "llama3.2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 等待首个分片的秒数
    pub request: u64,
    /// 分片之间的最大空闲秒数
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 60,
            stream: 120,
        }
    }
}

/// [storage] 段：会话目录与审计日志路径（默认放在状态目录下）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageSection {
    pub sessions_dir: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
}

/// 展开开头的 `~` / `~/`；无法确定主目录时原样返回
fn expand_home(path: PathBuf) -> PathBuf {
    let rest = match path.to_str().and_then(|raw| raw.strip_prefix('~')) {
        Some("") => String::new(),
        Some(rest) if rest.starts_with('/') || rest.starts_with(std::path::MAIN_SEPARATOR) => {
            rest[1..].to_string()
        }
        _ => return path,
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => path,
    }
}

impl AppConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.app.workspace_root.clone().map(expand_home).unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("workspace")
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.app.state_dir.clone().map(expand_home).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".warden")
        })
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.app
            .scratch_dir
            .clone()
            .map(expand_home)
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.storage
            .sessions_dir
            .clone()
            .map(expand_home)
            .unwrap_or_else(|| self.state_dir().join("sessions"))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.storage
            .audit_log
            .clone()
            .map(expand_home)
            .unwrap_or_else(|| self.state_dir().join("audit.jsonl"))
    }
}

/// 从 config 目录加载配置，环境变量 WARDEN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WARDEN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WARDEN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.max_turns, 5);
        assert_eq!(cfg.executor.timeout_secs, 30);
        assert_eq!(cfg.executor.max_attempts, 3);
        assert_eq!(cfg.llm.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(
            &path,
            "[orchestrator]\nmax_turns = 7\n\n[executor]\ntimeout_secs = 5\n\n[app]\nworkspace_root = \"/srv/ws\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.orchestrator.max_turns, 7);
        assert_eq!(cfg.executor.timeout_secs, 5);
        // 未覆盖的键保持默认
        assert_eq!(cfg.executor.max_attempts, 3);
        assert_eq!(cfg.workspace_root(), PathBuf::from("/srv/ws"));
    }

    #[test]
    fn test_tilde_in_configured_paths_is_expanded() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let mut cfg = AppConfig::default();
        cfg.app.state_dir = Some(PathBuf::from("~/.warden"));
        cfg.app.workspace_root = Some(PathBuf::from("~"));
        assert_eq!(cfg.state_dir(), home.join(".warden"));
        assert_eq!(cfg.sessions_dir(), home.join(".warden").join("sessions"));
        assert_eq!(cfg.audit_log_path(), home.join(".warden").join("audit.jsonl"));
        assert!(cfg.audit_log_path().is_absolute());
        assert_eq!(cfg.workspace_root(), home);

        cfg.storage.audit_log = Some(PathBuf::from("~/logs/audit.jsonl"));
        assert_eq!(cfg.audit_log_path(), home.join("logs").join("audit.jsonl"));

        // 只展开开头的 ~
        cfg.app.scratch_dir = Some(PathBuf::from("/tmp/~cache"));
        assert_eq!(cfg.scratch_dir(), PathBuf::from("/tmp/~cache"));
        cfg.app.scratch_dir = Some(PathBuf::from("~bob/tmp"));
        assert_eq!(cfg.scratch_dir(), PathBuf::from("~bob/tmp"));
    }

    #[test]
    fn test_storage_paths_default_under_state_dir() {
        let mut cfg = AppConfig::default();
        cfg.app.state_dir = Some(PathBuf::from("/var/lib/warden"));
        assert_eq!(cfg.sessions_dir(), PathBuf::from("/var/lib/warden/sessions"));
        assert_eq!(cfg.audit_log_path(), PathBuf::from("/var/lib/warden/audit.jsonl"));
    }
}
