//! Project context for model prompts.
//!
//! Scans a project's sources, picks the handful of files most relevant to the
//! question and renders a compact summary of each (components, hooks, exports,
//! imports). File contents themselves are not included, only their shape.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::workspace::WorkspaceStore;

pub const MAX_FILES: usize = 5;
const MAX_SUMMARY_LEN: usize = 500;

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*import\s+(?:[^'";]+?\s+from\s+)?['"]([^'"]+)['"]"#).expect("valid regex")
});
static COMPONENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?(?:default\s+)?(?:function|const|class)\s+([A-Z][A-Za-z0-9_]*)")
        .expect("valid regex")
});
static HOOK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(use[A-Z][A-Za-z0-9_]*)\s*\(").expect("valid regex"));
static EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*export\s+(?:default\s+)?(?:async\s+)?(?:function|const|let|class|interface|type|enum)?\s*([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex")
});
static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?(?:interface|type)\s+([A-Z][A-Za-z0-9_]*)").expect("valid regex")
});
static CAPITALIZED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][A-Za-z0-9_]*)\b").expect("valid regex"));
static FILE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\w/.-]+)\.(?:tsx?|jsx?|css|json)\b").expect("valid regex"));
static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["`']([\w/.-]+)["`']"#).expect("valid regex"));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuestionType {
    Component,
    Hook,
    Style,
    Function,
    Type,
    Routing,
    State,
    Api,
    General,
}

const QUESTION_KEYWORDS: &[(QuestionType, &[&str])] = &[
    (QuestionType::Component, &["컴포넌트", "component", "ui", "버튼", "button", "카드", "card", "모달", "modal"]),
    (QuestionType::Hook, &["훅", "hook", "usestate", "useeffect"]),
    (QuestionType::Style, &["스타일", "style", "css", "디자인", "색상", "color", "레이아웃", "layout"]),
    (QuestionType::Function, &["함수", "function", "로직", "계산", "처리"]),
    (QuestionType::Type, &["타입", "type", "interface", "인터페이스", "모델"]),
    (QuestionType::Routing, &["라우팅", "routing", "페이지", "page", "경로", "route"]),
    (QuestionType::State, &["상태", "state", "데이터", "data", "관리"]),
    (QuestionType::Api, &["api", "서버", "server", "통신", "요청", "request"]),
];

impl QuestionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Component => "component",
            Self::Hook => "hook",
            Self::Style => "style",
            Self::Function => "function",
            Self::Type => "type",
            Self::Routing => "routing",
            Self::State => "state",
            Self::Api => "api",
            Self::General => "general",
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        QUESTION_KEYWORDS
            .iter()
            .find(|(t, _)| *t == self)
            .map(|(_, k)| *k)
            .unwrap_or(&[])
    }
}

/// Highest keyword score wins; ties go to the earlier type.
pub fn question_type(question: &str) -> QuestionType {
    let lower = question.to_lowercase();
    let mut best = (QuestionType::General, 0);
    for (kind, keywords) in QUESTION_KEYWORDS {
        let score = keywords.iter().filter(|k| lower.contains(*k)).count();
        if score > best.1 {
            best = (*kind, score);
        }
    }
    best.0
}

/// Component-like names, file stems and quoted identifiers in the question.
pub fn mentioned_entities(question: &str) -> Vec<String> {
    let mut out = BTreeSet::new();
    for c in CAPITALIZED_RE.captures_iter(question) {
        out.insert(c[1].to_string());
    }
    for c in FILE_NAME_RE.captures_iter(question) {
        if let Some(stem) = c[1].rsplit('/').next() {
            out.insert(stem.to_string());
        }
    }
    for c in QUOTED_RE.captures_iter(question) {
        out.insert(c[1].to_string());
    }
    out.into_iter().collect()
}

#[derive(Clone, Debug, Default)]
pub struct FileShape {
    pub path: String,
    pub components: Vec<String>,
    pub hooks: Vec<String>,
    pub exports: Vec<String>,
    pub types: Vec<String>,
    pub imports: Vec<String>,
}

fn unique(re: &Regex, content: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    re.captures_iter(content)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

pub fn analyze(path: &str, content: &str) -> FileShape {
    FileShape {
        path: path.to_string(),
        components: unique(&COMPONENT_RE, content),
        hooks: unique(&HOOK_RE, content),
        exports: unique(&EXPORT_RE, content)
            .into_iter()
            .filter(|e| e != "default")
            .collect(),
        types: unique(&TYPE_RE, content),
        imports: unique(&IMPORT_RE, content),
    }
}

impl FileShape {
    fn extension(&self) -> &str {
        self.path.rsplit_once('.').map(|(_, e)| e).unwrap_or("")
    }

    fn weight(&self) -> f32 {
        match self.extension() {
            "tsx" => 1.0,
            "jsx" => 0.9,
            "ts" => 0.7,
            "js" => 0.6,
            "css" => 0.3,
            _ => 0.5,
        }
    }

    /// Project-relative paths this file imports, without extension.
    fn local_imports(&self) -> Vec<String> {
        let dir = self.path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        self.imports
            .iter()
            .filter(|m| m.starts_with('.'))
            .filter_map(|m| join_module(dir, m))
            .collect()
    }

    fn summary(&self) -> String {
        let mut parts = vec![format!("{} ({})", self.path, self.extension())];
        if !self.components.is_empty() {
            parts.push(format!("components: {}", first(&self.components, 3)));
        }
        if !self.hooks.is_empty() {
            parts.push(format!("hooks: {}", first(&self.hooks, 5)));
        }
        if !self.exports.is_empty() {
            parts.push(format!("exports: {}", first(&self.exports, 5)));
        }
        if !self.imports.is_empty() {
            parts.push(format!("imports: {}", first(&self.imports, 5)));
        }
        if !self.types.is_empty() {
            parts.push(format!("types: {}", first(&self.types, 3)));
        }
        let mut summary = parts.join(" | ");
        if summary.len() > MAX_SUMMARY_LEN {
            let mut cut = MAX_SUMMARY_LEN - 3;
            while !summary.is_char_boundary(cut) {
                cut -= 1;
            }
            summary.truncate(cut);
            summary.push_str("...");
        }
        summary
    }
}

fn first(items: &[String], n: usize) -> String {
    items.iter().take(n).cloned().collect::<Vec<_>>().join(", ")
}

fn join_module(dir: &str, module: &str) -> Option<String> {
    let mut parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty()).collect();
    for seg in module.split('/') {
        match seg {
            "." | "" => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    Some(parts.join("/"))
}

fn strip_extension(path: &str) -> &str {
    match path.rsplit_once('.') {
        Some((stem, ext)) if matches!(ext, "ts" | "tsx" | "js" | "jsx") => stem,
        _ => path,
    }
}

fn imports_path(from: &FileShape, target: &str) -> bool {
    let target = strip_extension(target);
    from.local_imports()
        .iter()
        .any(|m| m == target || format!("{}/index", m) == target)
}

#[derive(Clone, Debug)]
pub struct ScoredFile {
    pub shape: FileShape,
    pub score: f32,
}

#[derive(Clone, Debug)]
pub struct ProjectContext {
    pub question_type: QuestionType,
    pub entities: Vec<String>,
    pub files: Vec<ScoredFile>,
}

fn score(shape: &FileShape, question: &str, kind: QuestionType, entities: &[String], selected: Option<&FileShape>) -> f32 {
    let question = question.to_lowercase();
    let path = shape.path.to_lowercase();
    let mut score = 0.0;

    for entity in entities {
        if path.contains(&entity.to_lowercase()) {
            score += 2.0;
        }
    }
    for component in &shape.components {
        let name = component.to_lowercase();
        if question.contains(&name) {
            score += 3.0;
        }
        if entities.iter().any(|e| e.to_lowercase() == name) {
            score += 2.0;
        }
    }

    score += match kind {
        QuestionType::Component if !shape.components.is_empty() => 1.0,
        QuestionType::Hook if !shape.hooks.is_empty() => 1.0,
        QuestionType::Type if !shape.types.is_empty() => 1.0,
        QuestionType::Style if shape.extension() == "css" => 1.0,
        _ => 0.0,
    };

    let names = shape
        .components
        .iter()
        .chain(&shape.hooks)
        .chain(&shape.exports)
        .chain(&shape.types)
        .map(|n| n.to_lowercase())
        .collect::<Vec<_>>();
    for keyword in kind.keywords() {
        score += 0.5 * names.iter().filter(|n| n.contains(keyword)).count() as f32;
    }

    if let Some(selected) = selected {
        if imports_path(selected, &shape.path) || imports_path(shape, &selected.path) {
            score += 1.0;
        }
    }

    score * shape.weight()
}

impl ProjectContext {
    /// Rank `shapes` against the question. The selected file, when present,
    /// always comes first.
    pub fn rank(shapes: Vec<FileShape>, question: &str, selected: Option<&str>, max_files: usize) -> Self {
        let kind = question_type(question);
        let entities = mentioned_entities(question);
        let selected = selected.map(|s| s.trim_start_matches("./").trim_start_matches('/'));
        let selected_shape = selected.and_then(|s| shapes.iter().find(|f| f.path == s).cloned());

        let mut scored: Vec<ScoredFile> = shapes
            .into_iter()
            .map(|shape| {
                let score = score(&shape, question, kind, &entities, selected_shape.as_ref());
                ScoredFile { shape, score }
            })
            .filter(|f| f.score > 0.0 || Some(f.shape.path.as_str()) == selected)
            .collect();
        scored.sort_by(|a, b| {
            let a_sel = Some(a.shape.path.as_str()) == selected;
            let b_sel = Some(b.shape.path.as_str()) == selected;
            b_sel
                .cmp(&a_sel)
                .then(b.score.total_cmp(&a.score))
                .then(a.shape.path.cmp(&b.shape.path))
        });
        scored.truncate(max_files);

        Self {
            question_type: kind,
            entities,
            files: scored,
        }
    }

    pub async fn build(store: &WorkspaceStore, project: &str, question: &str, selected: Option<&str>) -> Self {
        let mut shapes = Vec::new();
        for path in store.source_files(project) {
            if let Ok(content) = store.read_file(project, &path).await {
                shapes.push(analyze(&path, &content));
            }
        }
        let ctx = Self::rank(shapes, question, selected, MAX_FILES);
        debug!(
            project,
            kind = ctx.question_type.as_str(),
            files = ctx.files.len(),
            "Built project context"
        );
        ctx
    }

    pub fn render(&self) -> String {
        let mut out = vec![format!("Question type: {}", self.question_type.as_str())];
        if self.files.is_empty() {
            out.push("No related files found.".to_string());
        }
        for file in &self.files {
            out.push(format!("--- {}", file.shape.summary()));
        }
        if !self.entities.is_empty() {
            out.push(format!("Mentioned: {}", self.entities.join(", ")));
        }
        out.join("\n")
    }
}
