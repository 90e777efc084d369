//! Evaluation of self-describing ONNX graphs

use crate::model_loader::ImageModel;
use binsight_core::{Error, Result};
use candle_core::Tensor;
use candle_onnx::onnx::ModelProto;
use std::collections::{HashMap, HashSet};

/// An ONNX graph with a single image input and a single logits output
pub struct OnnxModel {
    proto: ModelProto,
    input_name: String,
    output_name: String,
}

impl OnnxModel {
    /// Validate the graph's signature
    pub fn new(proto: ModelProto) -> Result<Self> {
        let graph = proto
            .graph
            .as_ref()
            .ok_or_else(|| Error::model_load("ONNX model has no graph"))?;

        // Initializers may also be listed as inputs
        let initializers: HashSet<&str> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
        let input_name = graph
            .input
            .iter()
            .map(|i| i.name.as_str())
            .find(|name| !initializers.contains(name))
            .ok_or_else(|| Error::model_load("ONNX graph declares no input"))?
            .to_string();
        let output_name = graph
            .output
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| Error::model_load("ONNX graph declares no output"))?;

        tracing::debug!(input = %input_name, output = %output_name, "ONNX graph signature");

        Ok(Self {
            proto,
            input_name,
            output_name,
        })
    }
}

impl ImageModel for OnnxModel {
    fn forward(&self, batch: &Tensor) -> Result<Tensor> {
        let inputs = HashMap::from([(self.input_name.clone(), batch.clone())]);
        let mut outputs = candle_onnx::simple_eval(&self.proto, inputs)
            .map_err(|e| Error::inference(format!("ONNX evaluation failed: {}", e)))?;

        outputs.remove(&self.output_name).ok_or_else(|| {
            Error::inference(format!("ONNX graph produced no '{}' output", self.output_name))
        })
    }
}
