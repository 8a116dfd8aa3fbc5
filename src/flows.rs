//! Flow catalog and compilation.
//!
//! A flow is a named executable graph plus a description of which node
//! inputs user parameters and uploaded files bind to. Compiling a flow for
//! a task produces the task's private copy of the graph and its declared
//! outputs. Executing the graph is someone else's job.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::cache::TtlCache;
use crate::error::{Error, Result};
use crate::model::{InputFile, PreparedTask, TaskId, TaskOutput};

/// How long a directory listing of installed flows stays fresh.
pub const INSTALLED_FLOWS_TTL: Duration = Duration::from_secs(10);

/// Node classes that produce result files, and the output type each declares.
pub const SUPPORTED_OUTPUTS: &[(&str, &str)] = &[("SaveImage", "image"), ("VHS_VideoCombine", "video")];

/// Everything needed to compile a flow for one task.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub task_id: TaskId,
    pub name: &'a str,
    pub params: &'a Value,
    pub input_files: &'a [InputFile],
}

/// Turns a flow name and user parameters into an executable graph.
///
/// Failures are `Validation` (bad parameters or a broken flow) or
/// `NotFound` (no such flow installed).
#[async_trait]
pub trait FlowCompiler: Send + Sync {
    async fn compile(&self, request: CompileRequest<'_>) -> Result<PreparedTask>;
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    #[default]
    Text,
    Number,
    /// Value is a key into `options`; the mapped value is what gets bound.
    List,
    Bool,
}

/// A user-facing parameter and the node inputs it binds to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowParam {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ParamKind,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub options: Option<Map<String, Value>>,
    /// node id -> input key
    pub nodes: BTreeMap<String, String>,
}

/// An input-file slot. Slots are filled in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileParam {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
    pub nodes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// node id -> `{ "class_type": ..., "inputs": { ... } }`
    pub graph: Map<String, Value>,
    #[serde(default)]
    pub params: Vec<FlowParam>,
    #[serde(default)]
    pub file_params: Vec<FileParam>,
}

impl FlowDefinition {
    /// Bind parameters and files into a copy of the graph and declare outputs.
    pub fn compile(
        &self,
        task_id: TaskId,
        params: &Value,
        input_files: &[InputFile],
    ) -> Result<PreparedTask> {
        let supplied = match params {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(Error::Validation(format!(
                    "flow parameters must be an object, got {other}"
                )));
            }
        };
        if let Some(unknown) = supplied.keys().find(|k| !self.params.iter().any(|p| &p.name == *k)) {
            return Err(Error::Validation(format!(
                "unknown parameter `{unknown}` for flow `{}`",
                self.name
            )));
        }

        let mut graph = self.graph.clone();

        for param in &self.params {
            let Some(value) = resolve_param(param, supplied.get(&param.name))? else {
                continue;
            };
            for (node_id, input) in &param.nodes {
                set_node_input(&mut graph, node_id, input, value.clone())?;
            }
        }

        let required = self.file_params.iter().filter(|p| !p.optional).count();
        if input_files.len() < required {
            return Err(Error::Validation(format!(
                "{} files given, but at least {required} required",
                input_files.len()
            )));
        }
        if input_files.len() > self.file_params.len() {
            return Err(Error::Validation(format!(
                "{} files given, but flow `{}` accepts at most {}",
                input_files.len(),
                self.name,
                self.file_params.len()
            )));
        }
        for (slot, file) in input_files.iter().enumerate() {
            for (node_id, input) in &self.file_params[slot].nodes {
                set_node_input(&mut graph, node_id, input, Value::String(file.file_name.clone()))?;
            }
        }
        for unused in &self.file_params[input_files.len()..] {
            for node_id in unused.nodes.keys() {
                disconnect_node(&mut graph, node_id);
            }
        }

        let outputs = declare_outputs(task_id, &mut graph)?;
        if outputs.is_empty() {
            return Err(Error::Validation(format!(
                "flow `{}` has no supported output nodes",
                self.name
            )));
        }

        Ok(PreparedTask {
            flow_comfy: Value::Object(graph),
            outputs,
            input_files: input_files.to_vec(),
        })
    }
}

fn resolve_param(param: &FlowParam, supplied: Option<&Value>) -> Result<Option<Value>> {
    let value = match supplied.filter(|v| !v.is_null()).or(param.default.as_ref()) {
        Some(v) => v.clone(),
        None if param.optional => return Ok(None),
        None => {
            return Err(Error::Validation(format!(
                "missing `{}` parameter",
                param.name
            )));
        }
    };

    let bound = match param.kind {
        ParamKind::Text | ParamKind::Number => value,
        ParamKind::List => {
            let key = match &value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            param
                .options
                .as_ref()
                .and_then(|options| options.get(&key))
                .cloned()
                .ok_or_else(|| {
                    Error::Validation(format!("`{key}` is not an option of `{}`", param.name))
                })?
        }
        ParamKind::Bool => Value::Bool(match &value {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            Value::String(s) => s.parse::<i64>().map(|n| n != 0).map_err(|_| {
                Error::Validation(format!("`{}` expects a boolean", param.name))
            })?,
            _ => {
                return Err(Error::Validation(format!(
                    "`{}` expects a boolean",
                    param.name
                )));
            }
        }),
    };
    Ok(Some(bound))
}

fn set_node_input(graph: &mut Map<String, Value>, node_id: &str, input: &str, value: Value) -> Result<()> {
    let inputs = graph
        .get_mut(node_id)
        .and_then(|node| node.as_object_mut())
        .map(|node| node.entry("inputs").or_insert_with(|| Value::Object(Map::new())))
        .and_then(|inputs| inputs.as_object_mut())
        .ok_or_else(|| Error::Validation(format!("bad flow: node `{node_id}` can not be found")))?;
    inputs.insert(input.to_string(), value);
    Ok(())
}

/// Remove a node and every input edge that points at it.
fn disconnect_node(graph: &mut Map<String, Value>, node_id: &str) {
    graph.remove(node_id);
    for node in graph.values_mut() {
        if let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) {
            inputs.retain(|_, edge| {
                edge.as_array()
                    .and_then(|link| link.first())
                    .and_then(Value::as_str)
                    != Some(node_id)
            });
        }
    }
}

fn declare_outputs(task_id: TaskId, graph: &mut Map<String, Value>) -> Result<Vec<TaskOutput>> {
    let mut outputs = Vec::new();
    for (node_id, node) in graph.iter_mut() {
        let class_type = node.get("class_type").and_then(Value::as_str).unwrap_or_default();
        let Some((_, output_type)) = SUPPORTED_OUTPUTS.iter().find(|(class, _)| *class == class_type) else {
            continue;
        };
        let numeric_id: i64 = node_id
            .parse()
            .map_err(|_| Error::Validation(format!("bad flow: output node id `{node_id}` is not numeric")))?;
        if let Some(node) = node.as_object_mut() {
            let inputs = node.entry("inputs").or_insert_with(|| Value::Object(Map::new()));
            if let Some(inputs) = inputs.as_object_mut() {
                inputs.insert("filename_prefix".into(), Value::String(format!("{task_id}_{node_id}")));
            }
        }
        outputs.push(TaskOutput::pending(numeric_id, *output_type));
    }
    outputs.sort_by_key(|o| o.node_id);
    Ok(outputs)
}

// ---------------------------------------------------------------------------
// Directory-backed catalog
// ---------------------------------------------------------------------------

type Catalog = Arc<BTreeMap<String, FlowDefinition>>;

/// Installed flows, one `{name}.json` file each.
pub struct FlowDirectory {
    dir: PathBuf,
    cache: TtlCache<(), Catalog>,
}

impl FlowDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: TtlCache::new(),
        }
    }

    /// All installed flows, keyed by name.
    pub async fn installed(&self) -> Result<Catalog> {
        self.cache
            .get_or_refresh((), INSTALLED_FLOWS_TTL, || load_catalog(self.dir.clone()))
            .await
    }

    pub async fn get(&self, name: &str) -> Result<FlowDefinition> {
        self.installed()
            .await?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("flow `{name}` is not installed")))
    }

    pub async fn install(&self, flow: &FlowDefinition) -> Result<()> {
        check_flow_name(&flow.name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(flow)?;
        tokio::fs::write(self.dir.join(format!("{}.json", flow.name)), body).await?;
        self.cache.invalidate_all();
        info!(flow = %flow.name, version = %flow.version, "flow installed");
        Ok(())
    }

    pub async fn uninstall(&self, name: &str) -> Result<()> {
        check_flow_name(name)?;
        match tokio::fs::remove_file(self.dir.join(format!("{name}.json"))).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("flow `{name}` is not installed")));
            }
            Err(e) => return Err(e.into()),
        }
        self.cache.invalidate_all();
        info!(flow = %name, "flow uninstalled");
        Ok(())
    }
}

#[async_trait]
impl FlowCompiler for FlowDirectory {
    async fn compile(&self, request: CompileRequest<'_>) -> Result<PreparedTask> {
        let flow = self.get(request.name).await?;
        flow.compile(request.task_id, request.params, request.input_files)
    }
}

fn check_flow_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid flow name: {name:?}")))
    }
}

async fn load_catalog(dir: PathBuf) -> Result<Catalog> {
    let mut flows = BTreeMap::new();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Arc::new(flows)),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = tokio::fs::read(&path).await?;
        match serde_json::from_slice::<FlowDefinition>(&content) {
            Ok(flow) => {
                flows.insert(flow.name.clone(), flow);
            }
            Err(e) => warn!(path = %path.display(), "skipping unreadable flow definition: {e}"),
        }
    }
    Ok(Arc::new(flows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow() -> FlowDefinition {
        serde_json::from_value(json!({
            "name": "upscale",
            "version": "1.0.0",
            "graph": {
                "3": { "class_type": "CLIPTextEncode", "inputs": { "text": "" } },
                "5": { "class_type": "LoadImage", "inputs": { "image": "" } },
                "6": { "class_type": "LoadImage", "inputs": { "image": "" } },
                "7": { "class_type": "ImageBlend", "inputs": { "a": ["5", 0], "b": ["6", 0] } },
                "8": { "class_type": "Sampler", "inputs": { "steps": 20, "fast": false } },
                "9": { "class_type": "SaveImage", "inputs": { "images": ["7", 0] } }
            },
            "params": [
                { "name": "prompt", "nodes": { "3": "text" } },
                { "name": "quality", "type": "list", "options": { "fast": 10, "best": 40 },
                  "default": "fast", "nodes": { "8": "steps" } },
                { "name": "turbo", "type": "bool", "optional": true, "nodes": { "8": "fast" } }
            ],
            "file_params": [
                { "name": "image", "nodes": { "5": "image" } },
                { "name": "mask", "optional": true, "nodes": { "6": "image" } }
            ]
        }))
        .unwrap()
    }

    fn one_file() -> Vec<InputFile> {
        vec![InputFile {
            file_name: "12_0_cat.png".into(),
            file_size: 3,
        }]
    }

    #[test]
    fn binds_params_files_and_outputs() {
        let prepared = flow()
            .compile(TaskId(12), &json!({"prompt": "a cat", "quality": "best", "turbo": "1"}), &one_file())
            .unwrap();

        let graph = &prepared.flow_comfy;
        assert_eq!(graph["3"]["inputs"]["text"], "a cat");
        assert_eq!(graph["8"]["inputs"]["steps"], 40);
        assert_eq!(graph["8"]["inputs"]["fast"], true);
        assert_eq!(graph["5"]["inputs"]["image"], "12_0_cat.png");
        assert_eq!(graph["9"]["inputs"]["filename_prefix"], "12_9");

        // The optional mask slot was not filled: its loader is gone and so is the edge.
        assert!(graph.get("6").is_none());
        assert!(graph["7"]["inputs"].get("b").is_none());

        assert_eq!(prepared.outputs, vec![TaskOutput::pending(9, "image")]);
        assert_eq!(prepared.input_files, one_file());
    }

    #[test]
    fn rejects_bad_parameters() {
        let f = flow();
        let missing = f.compile(TaskId(1), &json!({}), &one_file()).unwrap_err();
        assert!(matches!(missing, Error::Validation(ref m) if m.contains("prompt")));

        let unknown = f
            .compile(TaskId(1), &json!({"prompt": "x", "seed": 1}), &one_file())
            .unwrap_err();
        assert!(matches!(unknown, Error::Validation(ref m) if m.contains("seed")));

        let no_file = f.compile(TaskId(1), &json!({"prompt": "x"}), &[]).unwrap_err();
        assert!(matches!(no_file, Error::Validation(_)));
    }

    #[tokio::test]
    async fn install_invalidates_cached_listing() {
        let dir = tempfile::tempdir().unwrap();
        let flows = FlowDirectory::new(dir.path());
        assert!(flows.installed().await.unwrap().is_empty());

        flows.install(&flow()).await.unwrap();
        assert!(flows.installed().await.unwrap().contains_key("upscale"));

        flows.uninstall("upscale").await.unwrap();
        assert!(matches!(flows.get("upscale").await, Err(Error::NotFound(_))));
        assert!(matches!(flows.uninstall("upscale").await, Err(Error::NotFound(_))));
    }
}
