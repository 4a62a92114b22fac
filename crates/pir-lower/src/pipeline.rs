//! One-call entry points: read a source graph, lower it into a fresh [`Network`].

use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use tracing::info;

use crate::config::LowerOptions;
use crate::lowering::{builtin_registry, translate, ConverterRegistry, Translation};
use crate::source::SourceGraph;
use crate::target::Network;

/// A finished translation together with the network it populated.
#[derive(Debug)]
pub struct Lowered {
    pub network: Network,
    pub translation: Translation,
}

/// Lowers `graph` with the built-in converters.
pub fn lower_graph(graph: &SourceGraph, options: &LowerOptions) -> Result<Lowered> {
    let registry = builtin_registry().context("failed to collect built-in converters")?;
    lower_graph_with(graph, registry, options)
}

/// Lowers `graph` with a caller-supplied registry.
pub fn lower_graph_with(
    graph: &SourceGraph,
    registry: &ConverterRegistry,
    options: &LowerOptions,
) -> Result<Lowered> {
    let mut network = Network::new().with_implicit_batch(options.implicit_batch);
    let translation = translate(graph, &mut network, registry, options).with_context(|| {
        format!(
            "failed to lower graph with {} nodes for target {}",
            graph.nodes().len(),
            options.target_version
        )
    })?;
    ensure!(
        network.outputs().len() == graph.outputs().len(),
        "network marks {} outputs, graph declares {}",
        network.outputs().len(),
        graph.outputs().len()
    );
    Ok(Lowered {
        network,
        translation,
    })
}

/// Parses a JSON graph and lowers it.
pub fn lower_json(text: &str, options: &LowerOptions) -> Result<Lowered> {
    let graph = SourceGraph::from_json_str(text).context("failed to parse source graph")?;
    lower_graph(&graph, options)
}

/// Reads a JSON graph from `path` and lowers it.
pub fn lower_graph_file(path: impl AsRef<Path>, options: &LowerOptions) -> Result<Lowered> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read source graph {}", path.display()))?;
    let lowered =
        lower_json(&text, options).with_context(|| format!("while lowering {}", path.display()))?;
    info!(
        path = %path.display(),
        layers = lowered.network.layers().len(),
        "lowered graph file"
    );
    Ok(lowered)
}
