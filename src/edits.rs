//! Turning a model reply into a concrete file edit.
//!
//! A reply is free text with (ideally) one fenced code block holding the full
//! new file. The target path comes from the fence header
//! (```` ```tsx title=src/pages/About.tsx ````) or a `FILEPATH:` line; when
//! neither is present the edit applies to the selected file.

use std::sync::LazyLock;

use regex::Regex;

use crate::workspace::{normalize_relative, slash_path};

static HEADER_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)```(?:typescript|javascript|tsx|jsx)[^\n]*?(?:path|file(?:name)?|title)\s*[:=]\s*([^\s`]+)")
        .expect("valid regex")
});

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:FILEPATH|FILE|FILENAME|PATH)\s*[:=]\s*(.+)$").expect("valid regex")
});

static CODE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:typescript|javascript|tsx|jsx)[^\n]*\n(.*?)\n?```").expect("valid regex")
});

static CATCH_ALL_ROUTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<Route\s+path="\*""#).expect("valid regex"));

const FALLBACK_DISPLAY: &str = "Generated the code changes and applied them.";

/// Directories new files may be created in.
const NEW_FILE_ROOTS: &[&str] = &["src/pages/", "src/components/"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedEdit {
    /// Reply with code blocks and path directives removed.
    pub display: String,
    pub file_path: Option<String>,
    pub content: Option<String>,
}

pub fn parse_reply(reply: &str) -> ProposedEdit {
    let raw_path = HEADER_PATH_RE
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| {
            DIRECTIVE_RE
                .captures(reply)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        });
    let file_path = raw_path
        .map(|p| normalize_model_path(&p))
        .filter(|p| !p.is_empty());

    let content = CODE_BLOCK_RE
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());

    let display = if content.is_some() {
        let stripped = CODE_BLOCK_RE.replace_all(reply, "");
        let stripped = DIRECTIVE_RE.replace_all(&stripped, "");
        let stripped = stripped.trim();
        if stripped.chars().count() < 10 {
            FALLBACK_DISPLAY.to_string()
        } else {
            stripped.to_string()
        }
    } else {
        reply.trim().to_string()
    };

    ProposedEdit {
        display,
        file_path,
        content,
    }
}

/// Map whatever path the model produced onto the project layout.
///
/// `client/...` and `src/client/...` fold into `src/`, bare `pages/` and
/// `components/` get the `src/` prefix, and page file names are PascalCased.
pub fn normalize_model_path(raw: &str) -> String {
    let path = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                // Escaping the project keeps its `..` so callers reject it.
                if matches!(segments.last(), None | Some(&"..")) {
                    segments.push("..");
                } else {
                    segments.pop();
                }
            }
            s => segments.push(s),
        }
    }
    let mut path = segments.join("/");

    if let Some(rest) = path.strip_prefix("src/client/") {
        path = format!("src/{}", rest);
    } else if let Some(rest) = path.strip_prefix("client/") {
        path = format!("src/{}", rest);
    } else if path.starts_with("pages/") || path.starts_with("components/") {
        path = format!("src/{}", path);
    }

    if path.starts_with("src/pages/") {
        if let Some((dir, file)) = path.rsplit_once('/') {
            let renamed = match file.split_once('.') {
                Some((base, ext)) => format!("{}.{}", to_pascal_case(base), ext),
                None => to_pascal_case(file),
            };
            path = format!("{}/{}", dir, renamed);
        }
    }
    path
}

pub fn to_pascal_case(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|p| !p.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

pub fn to_kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_lower {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            if !out.ends_with('-') {
                out.push('-');
            }
            prev_lower = false;
        }
    }
    out.trim_matches('-').to_string()
}

/// Whether a file that does not exist yet may be created at `path`. The check
/// runs on the path the store will actually write to.
pub fn is_allowed_new_file(path: &str) -> bool {
    let Ok(resolved) = normalize_relative(path) else {
        return false;
    };
    let resolved = slash_path(&resolved);
    NEW_FILE_ROOTS
        .iter()
        .any(|root| resolved.len() > root.len() && resolved.starts_with(root))
}

pub fn is_page(path: &str) -> bool {
    path.starts_with("src/pages/")
}

/// Add the import and `<Route>` for a new page to the app entry source.
///
/// Returns `None` when the app has no `<Routes>` block or already has both.
pub fn inject_route(app: &str, page_path: &str) -> Option<String> {
    if !app.contains("<Routes>") {
        return None;
    }
    let module = page_path.strip_prefix("src/")?;
    let module = module.rsplit_once('.').map(|(m, _)| m).unwrap_or(module);
    let file = module.rsplit('/').next()?;
    let component = to_pascal_case(file);
    if component.is_empty() {
        return None;
    }

    let import = format!("import {} from \"./{}\";", component, module);
    let route = format!(
        "          <Route path=\"/{}\" element={{<{} />}} />",
        to_kebab_case(&component),
        component
    );

    let mut text = app.to_string();
    if !text.contains(&import) {
        let mut lines: Vec<&str> = text.lines().collect();
        let insert_at = lines
            .iter()
            .rposition(|l| l.trim_start().starts_with("import "))
            .map(|i| i + 1)
            .unwrap_or(0);
        lines.insert(insert_at, &import);
        let mut joined = lines.join("\n");
        if app.ends_with('\n') {
            joined.push('\n');
        }
        text = joined;
    }

    if !text.contains(route.trim()) {
        if let Some(m) = CATCH_ALL_ROUTE_RE.find(&text) {
            let line_start = text[..m.start()].rfind('\n').map(|i| i + 1).unwrap_or(0);
            text.insert_str(line_start, &format!("{}\n", route));
        } else {
            text = text.replacen("<Routes>", &format!("<Routes>\n{}", route), 1);
        }
    }

    if text == app {
        None
    } else {
        Some(text)
    }
}
