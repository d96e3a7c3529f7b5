//! Sequential model: an ordered layer list compiled into a symbolic graph with
//! an owned parameter store.
//!
//! `add` is only legal before compilation. `compile` walks the layers once,
//! performing shape inference and parameter registration, then freezes the
//! sequence; compiling again with identical settings is a no-op, anything else
//! is a configuration error.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{bail, Context as _, Result};
use tracing::debug;

use crate::engine::spec::{Bindings, ExecMode, TensorEngine};
use crate::error::ConfigError;
use crate::graph::{Graph, GraphBuilder, OpKind};
use crate::nn::layers::{BuildContext, Layer};
use crate::params::{LoadOptions, ParameterStore};
use crate::tensor::{Context, Shape, Tensor};
use crate::train::data::DataSource;
use crate::train::loss::Loss;
use crate::train::metric::Metric;
use crate::train::optim::Optimizer;
use crate::train::trainer::{FitReport, TrainOptions, Trainer};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompileSettings {
    loss: Loss,
    optimizer: String,
    metrics: Vec<String>,
}

/// Everything produced by a successful compile.
pub(crate) struct Compiled {
    pub(crate) graph: Graph,
    pub(crate) store: ParameterStore,
    pub(crate) optimizer: Box<dyn Optimizer>,
    pub(crate) metrics: Vec<Box<dyn Metric>>,
    pub(crate) settings: CompileSettings,
}

pub struct Model {
    input_shape: Shape,
    ctx: Context,
    seed: u64,
    layers: Vec<Box<dyn Layer>>,
    compiled: Option<Compiled>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("input_shape", &self.input_shape)
            .field("ctx", &self.ctx)
            .field("seed", &self.seed)
            .field("num_layers", &self.layers.len())
            .field("compiled", &self.compiled.is_some())
            .finish()
    }
}

impl Model {
    /// A model over per-example inputs of `input_shape`, placed on `ctx`.
    pub fn new(input_shape: Shape, ctx: Context) -> Self {
        Model {
            input_shape,
            ctx,
            seed: ParameterStore::DEFAULT_SEED,
            layers: Vec::new(),
            compiled: None,
        }
    }

    /// Overrides the initialization seed used by the owned parameter store.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn ctx(&self) -> Context {
        self.ctx
    }

    pub fn input_shape(&self) -> &Shape {
        &self.input_shape
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Appends a layer. Fails once the model has been compiled.
    pub fn add(&mut self, layer: impl Layer + 'static) -> Result<&mut Self> {
        if self.compiled.is_some() {
            bail!(ConfigError::ModelFrozen);
        }
        self.layers.push(Box::new(layer));
        Ok(self)
    }

    /// Builds the graph, registers parameters, attaches the loss node, and
    /// binds the optimizer and metrics.
    pub fn compile(
        &mut self,
        optimizer: Box<dyn Optimizer>,
        loss: Loss,
        metrics: Vec<Box<dyn Metric>>,
    ) -> Result<()> {
        let settings = CompileSettings {
            loss,
            optimizer: optimizer.name().to_string(),
            metrics: metrics.iter().map(|m| m.name().to_string()).collect(),
        };
        if let Some(existing) = &self.compiled {
            if existing.settings == settings {
                debug!("compile repeated with identical settings; keeping existing graph");
                return Ok(());
            }
            bail!(ConfigError::RecompileMismatch {
                reason: format!("{:?} vs {:?}", existing.settings, settings),
            });
        }
        if self.layers.is_empty() {
            bail!(ConfigError::EmptyModel);
        }

        let mut builder = GraphBuilder::new();
        let input = builder.add("data", OpKind::Input, &[], self.input_shape.clone())?;
        let label = builder.add("label", OpKind::Label, &[], Shape::new([1]))?;
        let store = ParameterStore::new("").with_seed(self.seed);

        let mut counters: HashMap<&'static str, usize> = HashMap::new();
        let mut node = input;
        for layer in &self.layers {
            let ordinal = counters.entry(layer.kind()).or_insert(0);
            *ordinal += 1;
            let name = format!("{}{}", layer.kind(), ordinal);
            let mut build_ctx = BuildContext::new(&mut builder, &store, name.clone());
            node = layer
                .build(&mut build_ctx, node)
                .with_context(|| format!("compiling layer '{name}'"))?;
        }

        let prediction = node;
        let loss_node = builder.add(
            "loss",
            OpKind::Loss { loss },
            &[prediction, label],
            Shape::new([1]),
        )?;
        let graph = builder.finish(input, label, prediction, loss_node);
        debug!(
            layers = self.layers.len(),
            parameters = store.len(),
            "compiled model"
        );

        self.compiled = Some(Compiled {
            graph,
            store,
            optimizer,
            metrics,
            settings,
        });
        Ok(())
    }

    pub(crate) fn compiled(&self) -> Result<&Compiled> {
        self.compiled
            .as_ref()
            .ok_or_else(|| ConfigError::NotCompiled.into())
    }

    pub(crate) fn compiled_mut(&mut self) -> Result<&mut Compiled> {
        self.compiled
            .as_mut()
            .ok_or_else(|| ConfigError::NotCompiled.into())
    }

    /// The store owning this model's parameters. Available after compile.
    pub fn parameters(&self) -> Result<&ParameterStore> {
        Ok(&self.compiled()?.store)
    }

    /// Per-example output shape of the compiled graph's prediction node.
    pub fn output_shape(&self) -> Result<&Shape> {
        let compiled = self.compiled()?;
        Ok(&compiled.graph.node(compiled.graph.prediction()).shape)
    }

    /// Trains with default options; see [`Trainer`] for policy control.
    pub fn fit(
        &mut self,
        engine: &dyn TensorEngine,
        train: &mut dyn DataSource,
        epochs: usize,
        batch_size: usize,
        val: Option<&mut dyn DataSource>,
    ) -> Result<FitReport> {
        Trainer::new(self, engine).fit(train, epochs, batch_size, val)
    }

    pub fn fit_with_options(
        &mut self,
        engine: &dyn TensorEngine,
        options: TrainOptions,
        train: &mut dyn DataSource,
        epochs: usize,
        batch_size: usize,
        val: Option<&mut dyn DataSource>,
    ) -> Result<FitReport> {
        Trainer::new(self, engine)
            .with_options(options)
            .fit(train, epochs, batch_size, val)
    }

    /// Forward-plus-metrics pass over a data source; no gradients or updates.
    pub fn evaluate(
        &mut self,
        engine: &dyn TensorEngine,
        data: &mut dyn DataSource,
        batch_size: usize,
    ) -> Result<Vec<(String, f32)>> {
        Trainer::new(self, engine).evaluate(data, batch_size)
    }

    /// Runs the compiled graph on one input batch and returns the predictions.
    pub fn predict(&mut self, engine: &dyn TensorEngine, data: &Tensor) -> Result<Tensor> {
        let ctx = self.ctx;
        let compiled = self.compiled_mut()?;
        compiled.store.initialize(None, Some(ctx), false, false)?;

        let mut bindings = Bindings::new();
        bindings.bind("data", data.clone());
        for (name, param) in compiled.store.params() {
            let value = param
                .read()
                .value()
                .with_context(|| format!("binding parameter '{name}'"))?
                .clone();
            bindings.bind(name, value);
        }
        let artifacts = engine.forward(&compiled.graph, &bindings, ExecMode::Eval)?;
        Ok(artifacts.value(compiled.graph.prediction())?.clone())
    }

    /// Saves every parameter to a sorted tensor archive.
    pub fn save_parameters(&self, path: impl AsRef<Path>) -> Result<()> {
        self.parameters()?.save(path, "")
    }

    /// Restores parameters from an archive written by [`save_parameters`].
    ///
    /// [`save_parameters`]: Model::save_parameters
    pub fn load_parameters(&self, path: impl AsRef<Path>, opts: LoadOptions) -> Result<()> {
        self.parameters()?.load(path, Some(self.ctx), opts)
    }

    /// Renders a layer/output-shape/parameter-count table.
    pub fn summary(&self) -> Result<String> {
        let compiled = self.compiled()?;
        let mut out = String::new();
        writeln!(out, "{:<24} {:<20} {:>12}", "node", "output shape", "params").ok();
        let mut total = 0usize;
        for node in compiled.graph.nodes() {
            if matches!(
                node.op,
                OpKind::Input | OpKind::Label | OpKind::Parameter | OpKind::Loss { .. }
            ) {
                continue;
            }
            let params: usize = node
                .inputs
                .iter()
                .filter(|&&id| matches!(compiled.graph.node(id).op, OpKind::Parameter))
                .map(|&id| compiled.graph.node(id).shape.num_elements())
                .sum();
            total += params;
            writeln!(
                out,
                "{:<24} {:<20} {:>12}",
                node.name,
                format!("{:?}", node.shape.dims()),
                params
            )
            .ok();
        }
        writeln!(out, "total parameters: {total}").ok();
        Ok(out)
    }
}
