//! Workload definitions: task DAGs, workflow files, invocation traces,
//! and synthetic generators.
//!
//! A workflow is a directed acyclic graph of function invocations. Three
//! sources produce them: workflow definition JSON files (`dag` mode),
//! serialized DAG bundles (`trace` mode), and the in-process balanced-tree
//! generator (`benchmark` mode). All loaders qualify node names so that
//! functions of different workflows never collide, which lets the engine
//! address DAG nodes and functions by the same string.

use std::collections::BTreeMap;
use std::path::Path;

use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::WorkloadError;

// ─── Task DAG ───────────────────────────────────────────────────────

/// Resource footprint of one function node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub duration_milli: u64,
    pub memory_mib: u64,
    pub vcpu: u32,
}

/// A directed acyclic graph of function invocations.
///
/// Node identity is the (qualified) function name. Edges point from a
/// function to the functions released by its completion.
#[derive(Debug, Clone)]
pub struct Dag {
    name: String,
    nodes: Vec<String>,
    specs: BTreeMap<String, FunctionSpec>,
    succs: BTreeMap<String, Vec<String>>,
    preds: BTreeMap<String, Vec<String>>,
}

impl Dag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            specs: BTreeMap::new(),
            succs: BTreeMap::new(),
            preds: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_node(&mut self, name: impl Into<String>, spec: FunctionSpec) {
        let name = name.into();
        if self.specs.insert(name.clone(), spec).is_none() {
            self.nodes.push(name.clone());
            self.succs.entry(name.clone()).or_default();
            self.preds.entry(name).or_default();
        }
    }

    /// Add an edge between two existing nodes.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        debug_assert!(self.specs.contains_key(from) && self.specs.contains_key(to));
        self.succs.get_mut(from).expect("unknown source node").push(to.to_string());
        self.preds.get_mut(to).expect("unknown target node").push(from.to_string());
    }

    /// Node names in insertion order.
    #[inline]
    pub fn node_names(&self) -> &[String] {
        &self.nodes
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.succs.values().map(Vec::len).sum()
    }

    pub fn spec(&self, name: &str) -> Option<&FunctionSpec> {
        self.specs.get(name)
    }

    pub fn successors(&self, name: &str) -> &[String] {
        self.succs.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, name: &str) -> &[String] {
        self.preds.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes without predecessors.
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.predecessors(n).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Nodes without successors.
    pub fn leaves(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.successors(n).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Kahn's algorithm: the graph is cyclic iff a topological sort cannot
    /// consume every node.
    pub fn is_cyclic(&self) -> bool {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.predecessors(n).len()))
            .collect();
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut visited = 0;
        while let Some(node) = ready.pop() {
            visited += 1;
            for succ in self.successors(node) {
                let d = in_degree.get_mut(succ.as_str()).expect("unknown successor");
                *d -= 1;
                if *d == 0 {
                    ready.push(succ);
                }
            }
        }
        visited != self.nodes.len()
    }

    /// The single root, or an error when the DAG is not single-rooted.
    pub fn single_root(&self) -> Result<&str, WorkloadError> {
        let roots = self.roots();
        if roots.len() == 1 {
            Ok(roots[0])
        } else {
            Err(WorkloadError::BadRootCount(self.name.clone(), roots.len()))
        }
    }
}

// ─── Workflow Definition Files ──────────────────────────────────────

/// One function entry in a workflow definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFunction {
    #[serde(rename = "Next")]
    pub next: Vec<String>,
    #[serde(rename = "DurationMilli")]
    pub duration_milli: Vec<u64>,
    #[serde(rename = "MemoryMib")]
    pub memory_mib: Vec<u64>,
}

/// On-disk workflow definition (`dag` mode input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFile {
    #[serde(rename = "Comment", default)]
    pub comment: String,
    #[serde(rename = "StartAt", default)]
    pub start_at: Vec<String>,
    #[serde(rename = "Functions")]
    pub functions: BTreeMap<String, WorkflowFunction>,
}

/// Load one workflow definition. Node names are qualified as
/// `"<stem>-<idx>_<name>"` so multiple workflow files never collide.
pub fn load_workflow(idx: usize, path: &Path) -> Result<(String, Dag), WorkloadError> {
    let text = std::fs::read_to_string(path).map_err(|source| WorkloadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: WorkflowFile = serde_json::from_str(&text)?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string());
    let qualify = |name: &str| format!("{stem}-{idx}_{name}");

    let mut dag = Dag::new(stem.clone());
    for (func, meta) in &file.functions {
        dag.add_node(
            qualify(func),
            FunctionSpec {
                duration_milli: meta.duration_milli.first().copied().unwrap_or(1_000),
                memory_mib: meta.memory_mib.first().copied().unwrap_or(170),
                vcpu: 1,
            },
        );
    }
    for (func, meta) in &file.functions {
        for next in &meta.next {
            dag.add_edge(&qualify(func), &qualify(next));
        }
    }

    if dag.is_cyclic() {
        return Err(WorkloadError::CyclicDag(stem));
    }
    debug!(
        workflow = %stem,
        functions = dag.num_nodes(),
        edges = dag.num_edges(),
        "loaded workflow"
    );
    Ok((stem, dag))
}

/// Load all workflow definitions under `path` (a single file or a
/// directory of `*.json` files, in sorted order).
pub fn load_workflows(path: &Path) -> Result<BTreeMap<String, Dag>, WorkloadError> {
    let mut dags = BTreeMap::new();

    if path.is_dir() {
        let mut files: Vec<_> = std::fs::read_dir(path)
            .map_err(|source| WorkloadError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        for (idx, file) in files.iter().enumerate() {
            let (name, dag) = load_workflow(idx, file)?;
            dags.insert(name, dag);
        }
    } else if path.is_file() {
        let (name, dag) = load_workflow(0, path)?;
        dags.insert(name, dag);
    } else {
        return Err(WorkloadError::BadPath(path.to_path_buf()));
    }
    info!(workflows = dags.len(), path = %path.display(), "workflows loaded");
    Ok(dags)
}

// ─── Serialized DAG Bundles ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleFunction {
    pub name: String,
    pub duration_milli: u64,
    pub memory_mib: u64,
    pub vcpu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDag {
    pub name: String,
    pub functions: Vec<BundleFunction>,
    pub edges: Vec<(String, String)>,
}

/// Serialized DAG bundle (`trace` mode input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagBundle {
    pub dags: Vec<BundleDag>,
}

impl DagBundle {
    pub fn load(path: &Path) -> Result<Vec<Dag>, WorkloadError> {
        let text = std::fs::read_to_string(path).map_err(|source| WorkloadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let bundle: DagBundle = serde_json::from_str(&text)?;
        info!(dags = bundle.dags.len(), path = %path.display(), "DAG bundle loaded");
        bundle.dags.iter().map(BundleDag::to_dag).collect()
    }
}

impl BundleDag {
    /// Materialize with `"<dag_name>-<node>"`-qualified function names.
    pub fn to_dag(&self) -> Result<Dag, WorkloadError> {
        let qualify = |name: &str| format!("{}-{name}", self.name);

        let mut dag = Dag::new(self.name.clone());
        for function in &self.functions {
            dag.add_node(
                qualify(&function.name),
                FunctionSpec {
                    duration_milli: function.duration_milli,
                    memory_mib: function.memory_mib,
                    vcpu: function.vcpu,
                },
            );
        }
        for (from, to) in &self.edges {
            dag.add_edge(&qualify(from), &qualify(to));
        }

        if dag.is_cyclic() {
            return Err(WorkloadError::CyclicDag(self.name.clone()));
        }
        Ok(dag)
    }
}

// ─── Invocation Traces ──────────────────────────────────────────────

/// One row of an invocation trace CSV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub timestamp: u64,
    pub dag_name: String,
    pub num_invocations: u32,
}

/// Load an invocation trace, sorted by timestamp ascending.
pub fn load_invocation_trace(path: &Path) -> Result<Vec<InvocationRecord>, WorkloadError> {
    let file = std::fs::File::open(path).map_err(|source| WorkloadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::Reader::from_reader(file);
    let mut records = reader
        .deserialize()
        .collect::<Result<Vec<InvocationRecord>, _>>()?;
    records.sort_by_key(|r| r.timestamp);
    Ok(records)
}

// ─── Synthetic Generators ───────────────────────────────────────────

/// Build a balanced-tree DAG with a join node appended after the leaves.
///
/// Nodes are numbered breadth-first and labelled `F0..Fn`; the join node is
/// `F<n>`. `width == 1` degenerates to a chain of `depth + 1` stages. Every
/// node carries the same constant footprint.
pub fn generate_balanced_dag(
    dag_name: &str,
    width: usize,
    depth: usize,
    duration_milli: u64,
    memory_mib: u64,
) -> Result<Dag, WorkloadError> {
    if width == 0 || depth == 0 {
        return Err(WorkloadError::BadDimensions(format!(
            "width={width} depth={depth}"
        )));
    }

    let num_tree_nodes = if width == 1 {
        depth + 1
    } else {
        (width.pow(depth as u32 + 1) - 1) / (width - 1)
    };
    let spec = FunctionSpec {
        duration_milli,
        memory_mib,
        vcpu: 1,
    };

    let mut dag = Dag::new(dag_name);
    for i in 0..num_tree_nodes {
        dag.add_node(format!("F{i}"), spec);
    }
    for i in 0..num_tree_nodes {
        for child in (width * i + 1)..=(width * i + width) {
            if child < num_tree_nodes {
                dag.add_edge(&format!("F{i}"), &format!("F{child}"));
            }
        }
    }

    // Fan the leaves into a terminal join node.
    let leaves: Vec<String> = dag.leaves().iter().map(|s| s.to_string()).collect();
    let end = format!("F{num_tree_nodes}");
    dag.add_node(end.clone(), spec);
    for leaf in leaves {
        dag.add_edge(&leaf, &end);
    }
    Ok(dag)
}

/// Serial-chain workflow definition (`F0 -> F1 -> ... -> F<stages-1>`).
pub fn serial_workflow(stages: usize, duration_milli: u64, memory_mib: u64) -> WorkflowFile {
    let mut functions = BTreeMap::new();
    for i in 0..stages {
        let next = if i + 1 < stages {
            vec![format!("F{}", i + 1)]
        } else {
            vec![]
        };
        functions.insert(
            format!("F{i}"),
            WorkflowFunction {
                next,
                duration_milli: vec![duration_milli],
                memory_mib: vec![memory_mib],
            },
        );
    }
    WorkflowFile {
        comment: "serial".to_string(),
        start_at: vec!["F0".to_string()],
        functions,
    }
}

/// Parallel fan-out/fan-in workflow definition: a source stage fans out to
/// `stages` parallel functions which all join into a sink stage.
pub fn parallel_workflow(stages: usize, duration_milli: u64, memory_mib: u64) -> WorkflowFile {
    let mut functions = BTreeMap::new();
    let sink = format!("F{}", stages + 1);

    functions.insert(
        "F0".to_string(),
        WorkflowFunction {
            next: (1..=stages).map(|i| format!("F{i}")).collect(),
            duration_milli: vec![duration_milli],
            memory_mib: vec![memory_mib],
        },
    );
    for i in 1..=stages {
        functions.insert(
            format!("F{i}"),
            WorkflowFunction {
                next: vec![sink.clone()],
                duration_milli: vec![duration_milli],
                memory_mib: vec![memory_mib],
            },
        );
    }
    functions.insert(
        sink,
        WorkflowFunction {
            next: vec![],
            duration_milli: vec![duration_milli],
            memory_mib: vec![memory_mib],
        },
    );
    WorkflowFile {
        comment: "parallel".to_string(),
        start_at: vec!["F0".to_string()],
        functions,
    }
}

/// Cumulative Poisson arrival times [ms]: `total` arrivals starting at 0
/// with exponential interarrivals at `rps` requests per second.
pub fn generate_exp_arrival_times_milli(rng: &mut StdRng, rps: f64, total: usize) -> Vec<u64> {
    let rate_per_milli = rps / 1_000.0;
    let exp = Exp::new(rate_per_milli).expect("arrival rate must be positive");

    let mut times = Vec::with_capacity(total);
    let mut now = 0u64;
    times.push(0);
    for _ in 1..total {
        now += exp.sample(rng) as u64;
        times.push(now);
    }
    times
}

/// Cumulative Poisson arrival times from a mean interarrival [ms].
pub fn generate_poisson_trace_milli(rng: &mut StdRng, mean_milli: f64, total: usize) -> Vec<u64> {
    let exp = Exp::new(1.0 / mean_milli).expect("mean interarrival must be positive");
    let mut times = Vec::with_capacity(total);
    let mut now = 0u64;
    for _ in 0..total {
        now += exp.sample(rng) as u64;
        times.push(now);
    }
    // Shift so the trace starts at zero.
    let first = times.first().copied().unwrap_or(0);
    for t in &mut times {
        *t -= first;
    }
    times
}

/// Uniformly sample `k` DAG indices with replacement.
pub fn sample_with_replacement(rng: &mut StdRng, len: usize, k: usize) -> Vec<usize> {
    (0..k).map(|_| rng.gen_range(0..len)).collect()
}

// ─── Tests ──────────────────────────────────────────────────────────
