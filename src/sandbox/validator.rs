//! 沙箱路径校验
//!
//! SandboxPolicy 绑定工作区根目录与少量辅助目录（用户状态目录、临时目录）；
//! validate_path 对路径做 `~` / `$HOME` 展开与纯词法规范化（消去 `.` / `..`），当且仅当结果落在某个允许根之下时放行。
//! 受保护路径（审计日志、会话目录）先于允许列表检查：与之重叠（自身、其下或其上级目录）一律拒绝。
//! 不访问文件系统、不读取进程状态（cwd / 环境变量均在构造时注入），任何无法解析的输入一律拒绝。

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

/// 校验结论：纯值，无身份
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SandboxVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub resolved_command: Option<String>,
    pub resolved_path: Option<PathBuf>,
}

impl SandboxVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            resolved_command: None,
            resolved_path: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            resolved_command: None,
            resolved_path: None,
        }
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.resolved_path = Some(path);
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.resolved_command = Some(command.into());
        self
    }
}

/// 沙箱策略：工作区根 + 辅助允许目录
#[derive(Clone, Debug)]
pub struct SandboxPolicy {
    workspace_root: PathBuf,
    allowed_dirs: Vec<PathBuf>,
    protected: Vec<PathBuf>,
    home_dir: Option<PathBuf>,
    case_insensitive: bool,
}

impl SandboxPolicy {
    /// workspace_root 应为绝对路径；home_dir 用于展开 `~`
    pub fn new(workspace_root: impl AsRef<Path>, home_dir: Option<PathBuf>) -> Self {
        Self {
            workspace_root: normalize(workspace_root.as_ref()),
            allowed_dirs: Vec::new(),
            protected: Vec::new(),
            home_dir,
            case_insensitive: cfg!(any(windows, target_os = "macos")),
        }
    }

    /// 追加辅助允许目录（如 ~/.warden、/tmp）
    pub fn with_allowed_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = self.expand_home(&dir.as_ref().to_string_lossy()).unwrap_or_else(|| dir.as_ref().to_path_buf());
        self.allowed_dirs.push(normalize(&dir));
        self
    }

    /// 追加受保护路径（文件或目录）；即使位于允许目录内也拒绝
    pub fn with_protected_path(mut self, path: impl AsRef<Path>) -> Self {
        let path = self.expand_home(&path.as_ref().to_string_lossy()).unwrap_or_else(|| path.as_ref().to_path_buf());
        self.protected.push(normalize(&path));
        self
    }

    pub fn with_case_insensitive(mut self, case_insensitive: bool) -> Self {
        self.case_insensitive = case_insensitive;
        self
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// 校验单个路径；相对路径以工作区根为基准
    pub fn validate_path(&self, raw: &str) -> SandboxVerdict {
        self.validate_path_from(&self.workspace_root, raw)
    }

    /// 校验单个路径；相对路径以 base 为基准（base 本身应已通过校验）
    pub fn validate_path_from(&self, base: &Path, raw: &str) -> SandboxVerdict {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return SandboxVerdict::deny("empty path");
        }
        if trimmed.contains('\0') {
            return SandboxVerdict::deny(format!("malformed path: {:?}", trimmed));
        }
        let Some(expanded) = self.expand_home(trimmed) else {
            return SandboxVerdict::deny(format!("cannot resolve home-relative path: {}", trimmed));
        };
        if expanded.to_string_lossy().contains('$') {
            return SandboxVerdict::deny(format!("cannot resolve shell variable in path: {}", trimmed));
        }
        let absolute = if expanded.has_root() {
            expanded
        } else {
            base.join(expanded)
        };
        let resolved = normalize(&absolute);

        if let Some(protected) = self
            .protected
            .iter()
            .find(|p| self.is_within(&resolved, p) || self.is_within(p, &resolved))
        {
            return SandboxVerdict::deny(format!(
                "path {} overlaps protected path {}",
                resolved.display(),
                protected.display()
            ))
            .with_path(resolved);
        }

        let inside = std::iter::once(&self.workspace_root)
            .chain(self.allowed_dirs.iter())
            .any(|root| self.is_within(&resolved, root));
        if inside {
            SandboxVerdict::allow().with_path(resolved)
        } else {
            SandboxVerdict::deny(format!(
                "path {} is outside the workspace and allowed directories",
                resolved.display()
            ))
            .with_path(resolved)
        }
    }

    /// `~`、`~/x`、`$HOME/x`、`${HOME}/x` 展开为 home；`~user` 形式无法解析，返回 None
    fn expand_home(&self, raw: &str) -> Option<PathBuf> {
        for var in ["${HOME}", "$HOME"] {
            if let Some(rest) = raw.strip_prefix(var) {
                if rest.is_empty() {
                    return self.home_dir.clone();
                }
                if let Some(rest) = rest.strip_prefix('/') {
                    return self.home_dir.as_ref().map(|h| h.join(rest));
                }
            }
        }
        if raw == "~" {
            return self.home_dir.clone();
        }
        if let Some(rest) = raw.strip_prefix("~/") {
            return self.home_dir.as_ref().map(|h| h.join(rest));
        }
        if raw.starts_with('~') {
            return None;
        }
        Some(PathBuf::from(raw))
    }

    /// 按组件比较前缀，避免 /workspace-evil 命中 /workspace
    fn is_within(&self, path: &Path, root: &Path) -> bool {
        if !self.case_insensitive {
            return path.starts_with(root);
        }
        let lower = |p: &Path| -> Vec<String> {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
                .collect()
        };
        let path = lower(path);
        let root = lower(root);
        path.len() >= root.len() && path[..root.len()] == root[..]
    }
}

/// 纯词法规范化：去掉 `.`，`..` 弹出上一级（在根处停住）
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}
