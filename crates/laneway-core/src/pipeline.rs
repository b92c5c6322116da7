//! Stage graph declaration and segmentation
//!
//! A pipeline is an ordered list of stages. Consecutive parallel-eligible
//! stages with no dependency among each other form a batch for the worker
//! pool; every other stage runs inline in declared order.

use crate::error::{ConfigError, EngineError};
use crate::stage::{CommandStage, StageBody};
use crate::types::{StageId, StageKey};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// One declared stage
#[derive(Clone)]
pub struct StageDescriptor {
    /// Identifier, unique within the pipeline
    pub id: StageId,
    /// Declared number (1-based, increasing)
    pub number: u32,
    /// Display name
    pub name: String,
    /// May run in a pool batch with its neighbours
    pub parallel: bool,
    /// May be skipped by recovery
    pub optional: bool,
    /// Earlier stages this one needs
    pub depends_on: Vec<StageId>,
    /// Body
    pub body: Arc<dyn StageBody>,
}

impl StageDescriptor {
    /// Create a sequential, mandatory stage
    #[must_use]
    pub fn new(
        id: impl Into<StageId>,
        number: u32,
        name: impl Into<String>,
        body: Arc<dyn StageBody>,
    ) -> Self {
        Self {
            id: id.into(),
            number,
            name: name.into(),
            parallel: false,
            optional: false,
            depends_on: Vec::new(),
            body,
        }
    }

    /// Mark parallel-eligible
    #[inline]
    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Mark optional
    #[inline]
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Add a dependency
    #[must_use]
    pub fn depends_on(mut self, stage: impl Into<StageId>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    /// Identity carried through the pool
    #[must_use]
    pub fn key(&self) -> StageKey {
        StageKey::new(self.id.clone(), self.number, self.name.clone())
    }
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("id", &self.id)
            .field("number", &self.number)
            .field("name", &self.name)
            .field("parallel", &self.parallel)
            .field("optional", &self.optional)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Execution unit of the orchestrator, as indices into the stage list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// One stage run outside the pool
    Inline(usize),
    /// Stages dispatched together to the pool
    Batch(Vec<usize>),
}

impl Segment {
    /// Stage indices in the segment
    #[must_use]
    pub fn indices(&self) -> &[usize] {
        match self {
            Self::Inline(i) => std::slice::from_ref(i),
            Self::Batch(v) => v,
        }
    }
}

/// Validated stage graph
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<StageDescriptor>,
}

impl Pipeline {
    /// Validate and build
    ///
    /// # Errors
    /// Returns `InvalidPipeline` when the list is empty, ids repeat, numbers
    /// do not increase from 1, or a dependency names a stage not declared earlier.
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, EngineError> {
        if stages.is_empty() {
            return Err(EngineError::InvalidPipeline("pipeline has no stages".into()));
        }
        let mut seen: HashSet<&StageId> = HashSet::new();
        let mut last_number = 0;
        for s in &stages {
            if s.id.as_str().trim().is_empty() {
                return Err(EngineError::InvalidPipeline("stage id must not be empty".into()));
            }
            if s.number <= last_number {
                return Err(EngineError::InvalidPipeline(format!(
                    "stage {} has number {}; numbers must start at 1 and increase",
                    s.id, s.number
                )));
            }
            if let Some(dep) = s.depends_on.iter().find(|d| !seen.contains(d)) {
                return Err(EngineError::InvalidPipeline(format!(
                    "stage {} depends on {dep}, which is not declared before it",
                    s.id
                )));
            }
            if !seen.insert(&s.id) {
                return Err(EngineError::InvalidPipeline(format!("duplicate stage id: {}", s.id)));
            }
            last_number = s.number;
        }
        Ok(Self { stages })
    }

    /// Stages in declared order
    #[inline]
    #[must_use]
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Stage by index
    #[inline]
    #[must_use]
    pub fn stage(&self, index: usize) -> Option<&StageDescriptor> {
        self.stages.get(index)
    }

    /// Index of a stage id
    #[must_use]
    pub fn position(&self, id: &StageId) -> Option<usize> {
        self.stages.iter().position(|s| &s.id == id)
    }

    /// Number of stages
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false for a validated pipeline
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Split into inline stages and pool batches, in declared order
    #[must_use]
    pub fn segments(&self) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut batch: Vec<usize> = Vec::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if !stage.parallel {
                if !batch.is_empty() {
                    segments.push(Segment::Batch(std::mem::take(&mut batch)));
                }
                segments.push(Segment::Inline(i));
                continue;
            }
            let depends_on_batch = batch
                .iter()
                .any(|&j| stage.depends_on.contains(&self.stages[j].id));
            if depends_on_batch {
                segments.push(Segment::Batch(std::mem::take(&mut batch)));
            }
            batch.push(i);
        }
        if !batch.is_empty() {
            segments.push(Segment::Batch(batch));
        }
        segments
    }
}

/// Pipeline declared in a TOML file; every stage is a shell command
///
/// ```toml
/// [[stage]]
/// id = "lint"
/// command = "cargo clippy -- -D warnings"
/// parallel = true
///
/// [[stage]]
/// id = "test"
/// command = "cargo test"
/// depends_on = ["lint"]
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    /// Stages in order
    #[serde(rename = "stage")]
    pub stages: Vec<CommandStageSpec>,
}

/// One command stage of a [`PipelineFile`]
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandStageSpec {
    /// Identifier
    pub id: String,
    /// Display name (defaults to the id)
    #[serde(default)]
    pub name: Option<String>,
    /// Shell command line
    pub command: String,
    /// Parallel-eligible
    #[serde(default)]
    pub parallel: bool,
    /// Skippable
    #[serde(default)]
    pub optional: bool,
    /// Dependencies
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Working directory relative to the workspace
    #[serde(default)]
    pub workdir: Option<String>,
    /// Extra environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl PipelineFile {
    /// Parse TOML text
    ///
    /// # Errors
    /// Returns `ConfigError::Toml` on syntax or schema errors.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a file
    ///
    /// # Errors
    /// Returns `ConfigError::Read` or `ConfigError::Toml`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Build a validated pipeline; stages are numbered in file order
    ///
    /// # Errors
    /// Returns `InvalidPipeline` on graph errors.
    pub fn into_pipeline(self) -> Result<Pipeline, EngineError> {
        let stages = self
            .stages
            .into_iter()
            .zip(1u32..)
            .map(|(spec, number)| {
                let mut body = CommandStage::new(spec.command);
                if let Some(dir) = spec.workdir {
                    body = body.with_workdir(dir);
                }
                for (k, v) in spec.env {
                    body = body.with_env(k, v);
                }
                let name = spec.name.unwrap_or_else(|| spec.id.clone());
                let mut stage = StageDescriptor::new(spec.id, number, name, Arc::new(body));
                stage.parallel = spec.parallel;
                stage.optional = spec.optional;
                stage.depends_on = spec.depends_on.into_iter().map(StageId::from).collect();
                stage
            })
            .collect();
        Pipeline::new(stages)
    }
}
