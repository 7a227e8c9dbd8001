//! Tree of data sources connected through operator child edges.
//!
//! Data sources and operators live in two flat arenas indexed by
//! [`DataSourceId`] and [`OperatorId`]. Removed slots become `None` and are
//! never reused.
//!
//! ```text
//! Root ── [Invert] ── [Threshold] ══Staging══► Output
//!                  └─ [Fork] ══Explicit══► Fork (Copy) ── [Linear] ══Staging══► Output
//! ```

use crate::buffer::VolumeBuffer;
use crate::error::{PipelineError, Result};
use crate::operator::Operator;
use crate::pipeline::id::{DataSourceId, OperatorId};
use std::sync::Arc;

/// Whether a data source is written out when the pipeline state is saved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Persistence {
    #[default]
    Saved,
    /// Recomputed on every run
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataKind {
    #[default]
    Volume,
    TiltSeries,
}

impl DataKind {
    pub fn of(buffer: &VolumeBuffer) -> Self {
        if buffer.tilt_angles().is_some() {
            DataKind::TiltSeries
        } else {
            DataKind::Volume
        }
    }
}

/// How an operator's child data source came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEdge {
    /// The implicit "Output" of the chain up to this operator; follows the
    /// tail when operators are added or removed
    Staging(DataSourceId),
    /// Created by the operator itself; lives and dies with it
    Explicit(DataSourceId),
}

impl ChildEdge {
    pub fn data_source(&self) -> DataSourceId {
        match self {
            ChildEdge::Staging(id) | ChildEdge::Explicit(id) => *id,
        }
    }

    pub fn is_staging(&self) -> bool {
        matches!(self, ChildEdge::Staging(_))
    }
}

#[derive(Debug, Clone)]
pub struct DataSource {
    pub id: DataSourceId,
    pub label: String,
    pub buffer: VolumeBuffer,
    /// Execution order
    pub operators: Vec<OperatorId>,
    pub persistence: Persistence,
    pub forkable: bool,
    /// The user set the spacing; root spacing no longer flows here
    pub spacing_modified: bool,
    pub kind: DataKind,
    /// Operator this data source hangs off, `None` for the root
    pub parent: Option<OperatorId>,
}

impl DataSource {
    fn new(id: DataSourceId, label: impl Into<String>, buffer: VolumeBuffer) -> Self {
        let kind = DataKind::of(&buffer);
        Self {
            id,
            label: label.into(),
            buffer,
            operators: Vec::new(),
            persistence: Persistence::Saved,
            forkable: true,
            spacing_modified: false,
            kind,
            parent: None,
        }
    }

    /// Replace the data, keeping `kind` in sync
    pub fn set_data(&mut self, buffer: VolumeBuffer) {
        self.kind = DataKind::of(&buffer);
        self.buffer = buffer;
    }
}

#[derive(Debug, Clone)]
pub struct OperatorNode {
    pub id: OperatorId,
    pub op: Arc<Operator>,
    pub owner: DataSourceId,
    pub child: Option<ChildEdge>,
}

/// Arena of data sources and operators
#[derive(Debug)]
pub struct DataSourceTree {
    data_sources: Vec<Option<DataSource>>,
    operators: Vec<Option<OperatorNode>>,
}

impl DataSourceTree {
    /// Tree with a single root data source
    pub fn new(label: impl Into<String>, buffer: VolumeBuffer) -> Self {
        let root = DataSource::new(DataSourceId(0), label, buffer);
        Self {
            data_sources: vec![Some(root)],
            operators: Vec::new(),
        }
    }

    pub fn root(&self) -> DataSourceId {
        DataSourceId(0)
    }

    pub fn data_source(&self, id: DataSourceId) -> Option<&DataSource> {
        self.data_sources.get(id.index()).and_then(Option::as_ref)
    }

    pub fn data_source_mut(&mut self, id: DataSourceId) -> Option<&mut DataSource> {
        self.data_sources.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn operator(&self, id: OperatorId) -> Option<&OperatorNode> {
        self.operators.get(id.index()).and_then(Option::as_ref)
    }

    fn operator_mut(&mut self, id: OperatorId) -> Option<&mut OperatorNode> {
        self.operators.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn get(&self, id: DataSourceId) -> Result<&DataSource> {
        self.data_source(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    fn node(&self, id: OperatorId) -> Result<&OperatorNode> {
        self.operator(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    /// Live data source ids, root first
    pub fn data_source_ids(&self) -> Vec<DataSourceId> {
        self.data_sources.iter().flatten().map(|ds| ds.id).collect()
    }

    pub fn len(&self) -> usize {
        self.data_sources.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a data source, attached to `parent` if given (without an edge)
    pub fn add_data_source(
        &mut self,
        label: impl Into<String>,
        buffer: VolumeBuffer,
        parent: Option<OperatorId>,
    ) -> DataSourceId {
        let id = DataSourceId(self.data_sources.len() as u32);
        let mut ds = DataSource::new(id, label, buffer);
        ds.parent = parent;
        self.data_sources.push(Some(ds));
        id
    }

    /// Append `op` to the end of `ds`'s chain
    pub fn push_operator(&mut self, ds: DataSourceId, op: Arc<Operator>) -> Result<OperatorId> {
        self.get(ds)?;
        let id = OperatorId(self.operators.len() as u32);
        self.operators.push(Some(OperatorNode {
            id,
            op,
            owner: ds,
            child: None,
        }));
        if let Some(ds) = self.data_source_mut(ds) {
            ds.operators.push(id);
        }
        Ok(id)
    }

    /// Detach an operator from its chain. Its child edge is returned with
    /// the node and the child data source is left in place.
    pub fn remove_operator(&mut self, id: OperatorId) -> Result<OperatorNode> {
        let node = self
            .operators
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        if let Some(ds) = self.data_source_mut(node.owner) {
            ds.operators.retain(|op| *op != id);
        }
        Ok(node)
    }

    /// Remove a data source with its operators and everything below them.
    /// Returns the removed data source ids, top first.
    pub fn remove_data_source(&mut self, id: DataSourceId) -> Vec<DataSourceId> {
        let mut removed = Vec::new();
        let Some(ds) = self.data_sources.get_mut(id.index()).and_then(Option::take) else {
            return removed;
        };
        removed.push(id);

        if let Some(parent) = ds.parent.and_then(|p| self.operator_mut(p)) {
            if parent.child.map(|c| c.data_source()) == Some(id) {
                parent.child = None;
            }
        }

        for op in ds.operators {
            if let Some(node) = self.operators.get_mut(op.index()).and_then(Option::take) {
                if let Some(child) = node.child {
                    removed.extend(self.remove_data_source(child.data_source()));
                }
            }
        }
        removed
    }

    pub fn operator_ids(&self, ds: DataSourceId) -> Vec<OperatorId> {
        self.data_source(ds)
            .map(|ds| ds.operators.clone())
            .unwrap_or_default()
    }

    /// Operators of `ds` in execution order
    pub fn operators_of(&self, ds: DataSourceId) -> Vec<Arc<Operator>> {
        self.operator_ids(ds)
            .into_iter()
            .filter_map(|id| self.operator(id).map(|node| node.op.clone()))
            .collect()
    }

    pub fn last_operator(&self, ds: DataSourceId) -> Option<OperatorId> {
        self.data_source(ds).and_then(|ds| ds.operators.last().copied())
    }

    /// Position of `op` in its owner's chain
    pub fn index_of(&self, op: OperatorId) -> Option<usize> {
        let node = self.operator(op)?;
        self.data_source(node.owner)?
            .operators
            .iter()
            .position(|id| *id == op)
    }

    /// Id of an operator handle held somewhere in the tree
    pub fn find_operator(&self, op: &Arc<Operator>) -> Option<OperatorId> {
        self.operators
            .iter()
            .flatten()
            .find(|node| Arc::ptr_eq(&node.op, op))
            .map(|node| node.id)
    }

    pub fn child(&self, op: OperatorId) -> Option<ChildEdge> {
        self.operator(op).and_then(|node| node.child)
    }

    /// Point `op` at `edge`, updating the child's parent link
    pub fn set_child(&mut self, op: OperatorId, edge: Option<ChildEdge>) -> Result<()> {
        self.node(op)?;
        if let Some(edge) = edge {
            let ds = self
                .data_source_mut(edge.data_source())
                .ok_or_else(|| PipelineError::NotFound(edge.data_source().to_string()))?;
            ds.parent = Some(op);
        }
        if let Some(node) = self.operator_mut(op) {
            node.child = edge;
        }
        Ok(())
    }

    /// Operator of `ds`'s own chain that currently holds the staging output
    pub fn find_staging_operator(&self, ds: DataSourceId) -> Option<OperatorId> {
        self.operator_ids(ds)
            .into_iter()
            .rev()
            .find(|op| self.child(*op).map(|c| c.is_staging()).unwrap_or(false))
    }

    /// Deepest data source holding the transformed data of `ds`'s chain
    ///
    /// Walks the chain from the tail; a child that has operators of its own
    /// is followed further down. Falls back to `ds` itself.
    pub fn transformed_data_source(&self, ds: DataSourceId) -> DataSourceId {
        for op in self.operator_ids(ds).into_iter().rev() {
            if let Some(edge) = self.child(op) {
                let child = edge.data_source();
                let has_operators = self
                    .data_source(child)
                    .map(|c| !c.operators.is_empty())
                    .unwrap_or(false);
                return if has_operators {
                    self.transformed_data_source(child)
                } else {
                    child
                };
            }
        }
        ds
    }

    /// Child data sources of `ds`'s operators
    pub fn children(&self, ds: DataSourceId) -> Vec<DataSourceId> {
        self.operator_ids(ds)
            .into_iter()
            .filter_map(|op| self.child(op).map(|edge| edge.data_source()))
            .collect()
    }
}
