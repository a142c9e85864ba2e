//! Template resolution over recorded outputs.
//!
//! Two placeholder syntaxes are understood:
//!
//! - `${workflow.input.<path>}` and `${<stageId>.output.<path>}` for workflow
//!   stages,
//! - `{{<taskUuid>.output.<path>}}` for board tasks.
//!
//! A placeholder is parsed into a [`TemplateRef`] holding a plain path list;
//! nothing is evaluated. Traversal of a path that does not exist yields
//! `null`.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use uuid::Uuid;
use weft_core::{WeftError, WeftResult};

static STAGE_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\$\{\s*([^{}]*?)\s*\}").expect("valid stage placeholder regex")
});

static TASK_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("valid task placeholder regex")
});

/// One step of a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef {
    WorkflowInput(Vec<PathSegment>),
    StageOutput {
        stage_id: String,
        path: Vec<PathSegment>,
    },
    TaskOutput {
        task_uuid: Uuid,
        path: Vec<PathSegment>,
    },
}

/// Which placeholder grammar a template uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    /// `${...}`
    Stage,
    /// `{{...}}`
    Task,
}

impl Syntax {
    fn regex(self) -> &'static Regex {
        match self {
            Syntax::Stage => &STAGE_PLACEHOLDER,
            Syntax::Task => &TASK_PLACEHOLDER,
        }
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_path(segments: &[&str], expr: &str) -> WeftResult<Vec<PathSegment>> {
    segments
        .iter()
        .map(|seg| {
            if !is_identifier(seg) {
                return Err(WeftError::Resolution(format!(
                    "invalid path segment '{seg}' in '{expr}'"
                )));
            }
            Ok(match seg.parse::<usize>() {
                Ok(i) => PathSegment::Index(i),
                Err(_) => PathSegment::Key((*seg).to_string()),
            })
        })
        .collect()
}

/// Parse the inside of a placeholder (without the delimiters).
pub fn parse_expression(expr: &str, syntax: Syntax) -> WeftResult<TemplateRef> {
    let parts: Vec<&str> = expr.trim().split('.').collect();
    if parts.len() < 2 {
        return Err(WeftError::Resolution(format!(
            "template reference '{expr}' is too short"
        )));
    }

    match syntax {
        Syntax::Stage => {
            if parts[0] == "workflow" {
                if parts[1] != "input" {
                    return Err(WeftError::Resolution(format!(
                        "unsupported workflow reference '{expr}', expected workflow.input.<path>"
                    )));
                }
                return Ok(TemplateRef::WorkflowInput(parse_path(&parts[2..], expr)?));
            }
            if !is_identifier(parts[0]) || parts[1] != "output" {
                return Err(WeftError::Resolution(format!(
                    "unsupported stage reference '{expr}', expected <stageId>.output.<path>"
                )));
            }
            Ok(TemplateRef::StageOutput {
                stage_id: parts[0].to_string(),
                path: parse_path(&parts[2..], expr)?,
            })
        }
        Syntax::Task => {
            let task_uuid = Uuid::parse_str(parts[0]).map_err(|_| {
                WeftError::Resolution(format!("'{}' is not a task uuid in '{expr}'", parts[0]))
            })?;
            if parts[1] != "output" {
                return Err(WeftError::Resolution(format!(
                    "unsupported task reference '{expr}', expected <taskUuid>.output.<path>"
                )));
            }
            Ok(TemplateRef::TaskOutput {
                task_uuid,
                path: parse_path(&parts[2..], expr)?,
            })
        }
    }
}

/// All references found in a template value, in document order.
pub fn references(template: &Value, syntax: Syntax) -> WeftResult<Vec<TemplateRef>> {
    let mut refs = Vec::new();
    collect_references(template, syntax, &mut refs)?;
    Ok(refs)
}

fn collect_references(value: &Value, syntax: Syntax, out: &mut Vec<TemplateRef>) -> WeftResult<()> {
    match value {
        Value::String(s) => {
            for cap in syntax.regex().captures_iter(s) {
                out.push(parse_expression(&cap[1], syntax)?);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, syntax, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, syntax, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Walk `path` into `root`. Missing keys and out-of-range indices give `null`.
pub fn lookup_path(root: &Value, path: &[PathSegment]) -> Value {
    let mut current = root;
    for segment in path {
        let next = match (segment, current) {
            (PathSegment::Key(k), Value::Object(map)) => map.get(k),
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
            (PathSegment::Index(i), Value::Object(map)) => map.get(&i.to_string()),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Data a stage template may reference.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub workflow_input: &'a Value,
    /// Outputs of stages recorded `completed`, keyed by stage id.
    pub completed_outputs: &'a HashMap<String, Value>,
}

impl<'a> StageContext<'a> {
    pub fn new(workflow_input: &'a Value, completed_outputs: &'a HashMap<String, Value>) -> Self {
        Self {
            workflow_input,
            completed_outputs,
        }
    }

    fn lookup(&self, reference: &TemplateRef) -> WeftResult<Value> {
        match reference {
            TemplateRef::WorkflowInput(path) => Ok(lookup_path(self.workflow_input, path)),
            TemplateRef::StageOutput { stage_id, path } => {
                let output = self.completed_outputs.get(stage_id).ok_or_else(|| {
                    WeftError::Resolution(format!(
                        "template references stage '{stage_id}' which has not completed"
                    ))
                })?;
                Ok(lookup_path(output, path))
            }
            TemplateRef::TaskOutput { .. } => Err(WeftError::Resolution(
                "task references are not valid in workflow templates".to_string(),
            )),
        }
    }
}

/// Resolve a workflow stage template.
///
/// Referencing a stage that is not in `completed_outputs` is a configuration
/// error; an unknown path inside a known output resolves to `null`.
pub fn resolve(template: &Value, ctx: &StageContext<'_>) -> WeftResult<Value> {
    resolve_with(template, Syntax::Stage, &|r| ctx.lookup(r))
}

/// Resolve a board task template against the outputs of its dependencies.
///
/// A dependency without an output (or an unknown task) resolves to `null`.
pub fn resolve_task(template: &Value, outputs: &HashMap<Uuid, Value>) -> WeftResult<Value> {
    resolve_with(template, Syntax::Task, &|r| match r {
        TemplateRef::TaskOutput { task_uuid, path } => Ok(outputs
            .get(task_uuid)
            .map(|out| lookup_path(out, path))
            .unwrap_or(Value::Null)),
        _ => Err(WeftError::Resolution(
            "only task output references are valid in task templates".to_string(),
        )),
    })
}

fn resolve_with<F>(template: &Value, syntax: Syntax, lookup: &F) -> WeftResult<Value>
where
    F: Fn(&TemplateRef) -> WeftResult<Value>,
{
    match template {
        Value::String(s) => resolve_string(s, syntax, lookup),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_with(item, syntax, lookup))
            .collect::<WeftResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_with(item, syntax, lookup)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string<F>(s: &str, syntax: Syntax, lookup: &F) -> WeftResult<Value>
where
    F: Fn(&TemplateRef) -> WeftResult<Value>,
{
    let re = syntax.regex();

    // A lone placeholder keeps the referenced value's JSON type.
    if let Some(m) = re.find(s) {
        if m.start() == 0 && m.end() == s.len() {
            let caps = re.captures(s).ok_or_else(|| {
                WeftError::Resolution(format!("malformed placeholder in '{s}'"))
            })?;
            return lookup(&parse_expression(&caps[1], syntax)?);
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&s[last..whole.start()]);
        match lookup(&parse_expression(&caps[1], syntax)?)? {
            Value::String(text) => out.push_str(&text),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}
