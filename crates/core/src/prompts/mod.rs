use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::PromptConfig;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

pub type PromptArguments = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("failed to parse prompt file `{path}`: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(
        "required key `{argument}` declared for prompt `{key}` but no matching placeholder was found"
    )]
    InvalidRequired { key: String, argument: String },
}

/// One workflow directive as a `{placeholder}` template. Arguments listed
/// under `required` must be supplied; any other placeholder renders as the
/// empty string when absent, which is how the chapter directive keeps its
/// revision note optional. `{{` and `}}` escape literal braces for the
/// inline JSON examples in the outline directives.
#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    segments: Vec<Segment>,
    required: BTreeSet<String>,
}

#[derive(Clone, Debug)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

impl PromptTemplate {
    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        for required in &self.required {
            if !arguments.contains_key(required) {
                return Err(PromptError::MissingArgument {
                    key: self.key.clone(),
                    argument: required.clone(),
                });
            }
        }

        let mut output = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Placeholder(name) => {
                    if let Some(value) = arguments.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }

        Ok(output)
    }

    pub fn render_with<I, K, V>(&self, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = arguments
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.render(&map)
    }

    fn compile(key: String, raw: RawPrompt) -> Result<Self, PromptError> {
        let (segments, placeholders) = split_segments(&raw.template);
        let required = if raw.required.is_empty() {
            placeholders
        } else {
            let mut set = BTreeSet::new();
            for argument in raw.required {
                let trimmed = argument.trim().to_string();
                if !placeholders.contains(&trimmed) {
                    return Err(PromptError::InvalidRequired {
                        key,
                        argument: trimmed,
                    });
                }
                set.insert(trimmed);
            }
            set
        };

        Ok(Self {
            key,
            segments,
            required,
        })
    }
}

/// The workflow's directives: the built-in document, with same-key
/// overrides from any configured custom TOML directories.
#[derive(Debug)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptTemplate>,
}

impl PromptRegistry {
    pub fn new() -> Result<Self, PromptError> {
        Self::from_directories(&[])
    }

    pub fn from_prompt_config(config: &PromptConfig) -> Result<Self, PromptError> {
        Self::from_directories(&config.custom_directories)
    }

    pub fn with_custom_directories<P: AsRef<Path>>(directories: &[P]) -> Result<Self, PromptError> {
        let dirs: Vec<PathBuf> = directories
            .iter()
            .map(|p| p.as_ref().to_path_buf())
            .collect();
        Self::from_directories(&dirs)
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompts.get(key)
    }

    pub fn format(&self, key: &str, args: &PromptArguments) -> Result<String, PromptError> {
        let template = self
            .get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?;
        template.render(args)
    }

    pub fn format_with<I, K, V>(&self, key: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let template = self
            .get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?;
        template.render_with(arguments)
    }

    fn from_directories(directories: &[PathBuf]) -> Result<Self, PromptError> {
        let mut prompts = BTreeMap::new();
        merge_document(BUILT_IN_PROMPTS, None, &mut prompts)?;

        for dir in directories {
            for path in toml_files_in(dir)? {
                let contents = fs::read_to_string(&path).map_err(|source| PromptError::Io {
                    path: path.clone(),
                    source,
                })?;
                merge_document(&contents, Some(&path), &mut prompts)?;
            }
        }

        Ok(Self { prompts })
    }
}

fn toml_files_in(dir: &Path) -> Result<Vec<PathBuf>, PromptError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|source| PromptError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PromptError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        if path.is_file() && is_toml {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

fn merge_document(
    source: &str,
    path: Option<&Path>,
    prompts: &mut BTreeMap<String, PromptTemplate>,
) -> Result<(), PromptError> {
    let document: PromptDocument = toml::from_str(source).map_err(|err| match path {
        Some(path) => PromptError::ParseToml {
            path: path.to_path_buf(),
            source: err,
        },
        None => PromptError::ParseBuiltIn(err),
    })?;

    for (key, raw) in document.prompts {
        let template = PromptTemplate::compile(key.clone(), raw)?;
        prompts.insert(key, template);
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    template: String,
    #[serde(default)]
    required: Vec<String>,
}

fn split_segments(template: &str) -> (Vec<Segment>, BTreeSet<String>) {
    let mut segments = Vec::new();
    let mut placeholders = BTreeSet::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let (head, tail) = rest.split_at(open);
        literal.push_str(head);

        if let Some(after) = tail.strip_prefix("{{") {
            literal.push('{');
            rest = after;
            continue;
        }

        let Some(close) = tail[1..].find('}') else {
            // Unclosed brace stays literal text.
            literal.push_str(tail);
            rest = "";
            break;
        };

        let name = tail[1..1 + close].trim();
        if name.is_empty() {
            literal.push_str("{}");
        } else {
            flush_literal(&mut literal, &mut segments);
            placeholders.insert(name.to_string());
            segments.push(Segment::Placeholder(name.to_string()));
        }
        rest = &tail[close + 2..];
    }

    literal.push_str(rest);
    flush_literal(&mut literal, &mut segments);

    (segments, placeholders)
}

fn flush_literal(literal: &mut String, segments: &mut Vec<Segment>) {
    if literal.is_empty() {
        return;
    }
    let text = std::mem::take(literal).replace("}}", "}");
    segments.push(Segment::Literal(text));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn renders_outline_prompt_with_literal_json_braces() {
        let registry = PromptRegistry::new().expect("registry");
        let output = registry
            .format_with(
                "outline",
                [
                    ("title", "时间旅人"),
                    ("idea", "修表匠发现倒转时间的怀表"),
                    ("chapter_count", "3"),
                ],
            )
            .expect("rendered");
        assert!(output.contains("标题：时间旅人"));
        assert!(output.contains("章节数：3"));
        assert!(output.contains(r#"[{"name""#));
        assert!(output.contains("只输出JSON数组"));
    }

    #[test]
    fn chapter_prompt_revision_note_is_optional() {
        let registry = PromptRegistry::new().expect("registry");
        let plain = registry
            .format_with(
                "chapter",
                [("chapter_name", "第1章"), ("chapter_summary", "开端")],
            )
            .expect("rendered");
        assert!(plain.contains("章节名：第1章"));
        assert!(!plain.contains("人类修订建议"));

        let with_note = registry
            .format_with(
                "chapter",
                [
                    ("chapter_name", "第1章"),
                    ("chapter_summary", "开端"),
                    ("revision_note", "人类修订建议：节奏更快\n"),
                ],
            )
            .expect("rendered");
        assert!(with_note.contains("人类修订建议：节奏更快"));
    }

    #[test]
    fn missing_argument_fails() {
        let registry = PromptRegistry::new().expect("registry");
        let template = registry.get("outline").expect("outline available");
        let args = PromptArguments::from([("title".into(), "时间旅人".into())]);
        let error = template.render(&args).expect_err("missing args");
        match error {
            PromptError::MissingArgument { argument, .. } => {
                assert!(argument == "idea" || argument == "chapter_count");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn custom_directory_overrides_builtin() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("custom.toml"),
            "[prompts.outline]\ntemplate = \"定制 {title}\"\n",
        )
        .unwrap();

        let registry = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap();
        let output = registry.format_with("outline", [("title", "悬疑")]).unwrap();
        assert_eq!(output, "定制 悬疑");
    }

    #[test]
    fn non_toml_files_are_ignored() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "not a prompt file").unwrap();

        let registry = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap();
        assert!(registry.get("outline").is_some());
    }

    #[test]
    fn declared_required_subset_is_honored() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("custom.toml"),
            "[prompts.partial]\ntemplate = \"{a}|{b}\"\nrequired = [\"a\"]\n",
        )
        .unwrap();

        let registry = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap();
        let output = registry.format_with("partial", [("a", "x")]).unwrap();
        assert_eq!(output, "x|");
    }

    #[test]
    fn required_key_without_placeholder_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("custom.toml"),
            "[prompts.broken]\ntemplate = \"{a}\"\nrequired = [\"b\"]\n",
        )
        .unwrap();

        let error =
            PromptRegistry::with_custom_directories(&[dir.path()]).expect_err("invalid required");
        assert!(matches!(error, PromptError::InvalidRequired { .. }));
    }

    #[test]
    fn unclosed_brace_stays_literal() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("custom.toml"),
            "[prompts.odd]\ntemplate = \"悬而未决{tail\"\n",
        )
        .unwrap();

        let registry = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap();
        let output = registry.format("odd", &PromptArguments::new()).unwrap();
        assert_eq!(output, "悬而未决{tail");
    }

    #[test]
    fn unknown_prompt_key_fails() {
        let registry = PromptRegistry::new().expect("registry");
        let error = registry
            .format("missing", &PromptArguments::new())
            .expect_err("not found");
        assert!(matches!(error, PromptError::NotFound(_)));
    }
}
