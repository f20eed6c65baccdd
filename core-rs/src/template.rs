//! Command template registry
//!
//! A command template declares, for one command identifier, how to
//! synthesize its arguments and which output lines prove it ran correctly.
//! Templates are loaded once from `*.tc` YAML files:
//!
//! ```yaml
//! templates:
//!   - name: /testbin/add
//!     input:
//!       - "{{randInt 1 100}} {{randInt 1 100}}"
//!     output:
//!       - text: "{{$x := index .Args 0 | atoi}}{{$y := index .Args 1 | atoi}}{{add $x $y}}"
//!     panics: no
//!     timesout: no
//!     timeout: 0
//! ```

use crate::errors::{Result, Test161Error};
use crate::expression::{self, TemplateData};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Extension of command template files
pub const TEMPLATE_FILE_EXT: &str = "tc";

/// Whether a command may, must, or must not panic / time out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    No,
    Maybe,
    Yes,
}

impl Policy {
    /// Anything other than `maybe` or `yes` is `no`.
    fn from_yaml(value: Option<&serde_yaml::Value>) -> Self {
        match value {
            Some(serde_yaml::Value::Bool(true)) => Policy::Yes,
            Some(serde_yaml::Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "yes" | "true" => Policy::Yes,
                "maybe" => Policy::Maybe,
                _ => Policy::No,
            },
            _ => Policy::No,
        }
    }

    /// True when the observed behavior is acceptable under this policy.
    pub fn permits(&self, happened: bool) -> bool {
        match self {
            Policy::No => !happened,
            Policy::Maybe => true,
            Policy::Yes => happened,
        }
    }
}

/// One declared output line of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateOutputLine {
    pub text: String,
    pub trusted: bool,
    pub external: bool,
}

/// A loaded command template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub name: String,
    pub input: Vec<String>,
    pub output: Vec<TemplateOutputLine>,
    pub panics: Policy,
    pub timesout: Policy,
    /// Seconds; 0 inherits the test's prompt timeout.
    pub timeout: f64,
}

/// An expanded expected-output line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedOutputLine {
    pub text: String,
    pub trusted: bool,
    /// Identifier of the template whose key signs this line
    pub key_name: String,
}

#[derive(Debug, Deserialize)]
struct RawTemplateFile {
    #[serde(default)]
    templates: Vec<RawTemplate>,
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    name: String,
    #[serde(default)]
    input: Vec<String>,
    #[serde(default)]
    output: Vec<RawOutputLine>,
    #[serde(default)]
    panics: Option<serde_yaml::Value>,
    #[serde(default)]
    timesout: Option<serde_yaml::Value>,
    #[serde(default)]
    timeout: f64,
}

#[derive(Debug, Deserialize)]
struct RawOutputLine {
    text: String,
    trusted: Option<bool>,
    external: Option<bool>,
}

impl From<RawTemplate> for CommandTemplate {
    fn from(raw: RawTemplate) -> Self {
        let mut output: Vec<TemplateOutputLine> = raw
            .output
            .into_iter()
            .map(|l| TemplateOutputLine {
                text: l.text,
                trusted: l.trusted.unwrap_or(true),
                external: l.external.unwrap_or(false),
            })
            .collect();

        if output.is_empty() {
            output.push(TemplateOutputLine {
                text: format!("{}: SUCCESS", raw.name),
                trusted: true,
                external: false,
            });
        }

        CommandTemplate {
            panics: Policy::from_yaml(raw.panics.as_ref()),
            timesout: Policy::from_yaml(raw.timesout.as_ref()),
            timeout: raw.timeout.max(0.0),
            name: raw.name,
            input: raw.input,
            output,
        }
    }
}

/// Registry of command templates keyed by identifier
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, CommandTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one template file's contents and add its templates.
    pub fn load_str(&mut self, yaml: &str, origin: &str) -> Result<()> {
        let file: RawTemplateFile = serde_yaml::from_str(yaml)
            .map_err(|e| Test161Error::ConfigParse(format!("{}: {}", origin, e)))?;

        let mut errors = Vec::new();
        for raw in file.templates {
            if raw.name.trim().is_empty() {
                errors.push(Test161Error::ConfigParse(format!(
                    "{}: template with empty name",
                    origin
                )));
                continue;
            }
            if self.templates.contains_key(&raw.name) {
                errors.push(Test161Error::ConfigParse(format!(
                    "{}: duplicate template {}",
                    origin, raw.name
                )));
                continue;
            }
            let tmpl = CommandTemplate::from(raw);
            self.templates.insert(tmpl.name.clone(), tmpl);
        }
        Test161Error::from_batch(errors)
    }

    /// Load every `*.tc` file below `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::new();
        let mut errors = Vec::new();

        if !dir.exists() {
            return Err(Test161Error::ConfigParse(format!(
                "commands directory not found: {}",
                dir.display()
            )));
        }

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    errors.push(Test161Error::ConfigParse(e.to_string()));
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_FILE_EXT)
            {
                continue;
            }

            debug!(file = %path.display(), "loading command templates");
            match fs::read_to_string(path) {
                Ok(text) => {
                    if let Err(e) = registry.load_str(&text, &path.display().to_string()) {
                        errors.push(e);
                    }
                }
                Err(e) => errors.push(e.into()),
            }
        }

        Test161Error::from_batch(errors)?;
        Ok(registry)
    }

    pub fn insert(&mut self, template: CommandTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, id: &str) -> Option<&CommandTemplate> {
        self.templates.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandTemplate> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Evaluate a template's input generators into an argument list.
    /// Returns `None` when the template declares no generators.
    pub fn generate_args(&self, id: &str, rng: &mut StdRng) -> Result<Option<Vec<String>>> {
        let tmpl = match self.templates.get(id) {
            Some(t) if !t.input.is_empty() => t,
            _ => return Ok(None),
        };

        let empty = TemplateData::default();
        let mut args = Vec::new();
        for line in &tmpl.input {
            let rendered = expression::render(line, &empty, rng)?;
            args.extend(rendered.split_whitespace().map(str::to_string));
        }
        Ok(Some(args))
    }

    /// Expand a template's output into expected lines.
    ///
    /// External lines expand the referenced template in place. Visiting the
    /// same identifier twice on one expansion path fails with
    /// `CycleInTemplateExpansion`.
    pub fn expand(
        &self,
        id: &str,
        data: &TemplateData,
        rng: &mut StdRng,
    ) -> Result<Vec<ExpectedOutputLine>> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut lines = Vec::new();
        self.expand_into(id, data, rng, &mut visited, &mut path, &mut lines)?;
        Ok(lines)
    }

    fn expand_into(
        &self,
        id: &str,
        data: &TemplateData,
        rng: &mut StdRng,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
        lines: &mut Vec<ExpectedOutputLine>,
    ) -> Result<()> {
        path.push(id.to_string());
        if !visited.insert(id.to_string()) {
            return Err(Test161Error::CycleInTemplateExpansion(path.join(" -> ")));
        }

        let tmpl = self
            .templates
            .get(id)
            .ok_or_else(|| Test161Error::UnknownTemplate(id.to_string()))?;

        for line in &tmpl.output {
            if line.external {
                self.expand_into(line.text.trim(), data, rng, visited, path, lines)?;
                continue;
            }

            let rendered = expression::render(&line.text, data, rng)?;
            for text in rendered.split('\n') {
                let text = text.trim_end_matches('\r');
                if text.trim().is_empty() {
                    continue;
                }
                lines.push(ExpectedOutputLine {
                    text: text.to_string(),
                    trusted: line.trusted,
                    key_name: if line.trusted {
                        tmpl.name.clone()
                    } else {
                        String::new()
                    },
                });
            }
        }

        visited.remove(id);
        path.pop();
        Ok(())
    }
}
