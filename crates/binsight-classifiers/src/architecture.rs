//! Architecture inference from weight names
//!
//! A raw weight dictionary does not say which network it belongs to. The rules below
//! look at the key names (and a few tensor shapes) to pick an architecture the weights
//! can be loaded into. Rules are tried in order; the last rule always matches.

use crate::model_loader::{CandleModel, ImageModel};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use candle_transformers::models::{efficientnet, resnet};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Names and shapes of the tensors in a weight dictionary
#[derive(Debug, Clone, Default)]
pub struct WeightIndex {
    shapes: BTreeMap<String, Vec<usize>>,
}

impl WeightIndex {
    /// Index the given named tensors
    pub fn new<'a>(weights: impl IntoIterator<Item = (&'a str, &'a Tensor)>) -> Self {
        Self {
            shapes: weights
                .into_iter()
                .map(|(name, tensor)| (name.to_string(), tensor.dims().to_vec()))
                .collect(),
        }
    }

    /// Index bare names with their shapes
    pub fn from_shapes<S: Into<String>>(shapes: impl IntoIterator<Item = (S, Vec<usize>)>) -> Self {
        Self {
            shapes: shapes.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Whether any key contains `fragment`
    pub fn contains_fragment(&self, fragment: &str) -> bool {
        self.shapes.keys().any(|k| k.contains(fragment))
    }

    /// Whether `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.shapes.contains_key(key)
    }

    /// Shape of `key`
    pub fn shape(&self, key: &str) -> Option<&[usize]> {
        self.shapes.get(key).map(Vec::as_slice)
    }

    /// Number of distinct numeric children directly under `prefix`.
    ///
    /// `count_children("layer3")` over `layer3.0.conv1.weight`, `layer3.1.conv1.weight`
    /// returns 2.
    pub fn count_children(&self, prefix: &str) -> usize {
        let prefix = format!("{}.", prefix);
        self.shapes
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('.').next())
            .filter(|segment| segment.parse::<usize>().is_ok())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Number of indexed tensors
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Whether nothing is indexed
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

/// Supported classification networks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// EfficientNet feature extractor plus `classifier.1` linear head; variant 0..=7
    EfficientNet { variant: u8 },
    /// ResNet backbone plus `fc` linear head; depth 18, 34, 50, 101 or 152
    ResNet { depth: u16 },
}

impl Architecture {
    /// Key of the final classification layer's weight matrix
    pub fn head_weight_key(&self) -> &'static str {
        match self {
            Self::EfficientNet { .. } => "classifier.1.weight",
            Self::ResNet { .. } => "fc.weight",
        }
    }

    /// Output width of the head found in `index`, if present
    pub fn head_width(&self, index: &WeightIndex) -> Option<usize> {
        index
            .shape(self.head_weight_key())
            .and_then(|dims| dims.first().copied())
    }

    /// Resolve the architecture named by a pickled module class
    pub fn from_class_name(class_name: &str, index: &WeightIndex) -> Option<Self> {
        let short = class_name.rsplit('.').next().unwrap_or(class_name);
        if short.starts_with("EfficientNet") {
            Some(efficientnet_variant(index))
        } else if short.starts_with("ResNet") {
            Some(resnet_depth(index))
        } else {
            None
        }
    }

    /// Instantiate the network with a head of `num_classes` outputs.
    ///
    /// Every tensor is requested through `vb`, so a `VarMap`-backed builder yields a
    /// default-initialized network that weights can then be copied into.
    pub fn build(
        &self,
        vb: VarBuilder<'static>,
        num_classes: usize,
    ) -> candle_core::Result<Box<dyn ImageModel>> {
        match *self {
            Self::EfficientNet { variant } => {
                let configs = match variant {
                    0 => efficientnet::MBConvConfig::b0(),
                    1 => efficientnet::MBConvConfig::b1(),
                    2 => efficientnet::MBConvConfig::b2(),
                    3 => efficientnet::MBConvConfig::b3(),
                    4 => efficientnet::MBConvConfig::b4(),
                    5 => efficientnet::MBConvConfig::b5(),
                    6 => efficientnet::MBConvConfig::b6(),
                    _ => efficientnet::MBConvConfig::b7(),
                };
                let model = efficientnet::EfficientNet::new(vb, configs, num_classes)?;
                Ok(Box::new(CandleModel::new(model)))
            }
            Self::ResNet { depth } => {
                let model = match depth {
                    34 => resnet::resnet34(num_classes, vb)?,
                    50 => resnet::resnet50(num_classes, vb)?,
                    101 => resnet::resnet101(num_classes, vb)?,
                    152 => resnet::resnet152(num_classes, vb)?,
                    _ => resnet::resnet18(num_classes, vb)?,
                };
                Ok(Box::new(CandleModel::new(model)))
            }
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EfficientNet { variant } => write!(f, "efficientnet_b{}", variant),
            Self::ResNet { depth } => write!(f, "resnet{}", depth),
        }
    }
}

/// One entry of the architecture detection table
pub struct ArchitectureRule {
    /// Rule name, for logs
    pub name: &'static str,
    /// Whether the weights look like this family
    pub matches: fn(&WeightIndex) -> bool,
    /// Pick the concrete variant
    pub resolve: fn(&WeightIndex) -> Architecture,
}

/// Detection rules, most specific first
pub const ARCHITECTURE_RULES: &[ArchitectureRule] = &[
    ArchitectureRule {
        name: "efficientnet",
        matches: has_features_and_classifier,
        resolve: efficientnet_variant,
    },
    ArchitectureRule {
        name: "resnet",
        matches: always,
        resolve: resnet_depth,
    },
];

/// Infer the architecture of a weight dictionary
pub fn detect_architecture(index: &WeightIndex) -> Architecture {
    detect_with(ARCHITECTURE_RULES, index)
}

/// Infer the architecture using an explicit rule table
pub fn detect_with(rules: &[ArchitectureRule], index: &WeightIndex) -> Architecture {
    for rule in rules {
        if (rule.matches)(index) {
            let architecture = (rule.resolve)(index);
            tracing::debug!(rule = rule.name, %architecture, "Architecture rule matched");
            return architecture;
        }
    }
    resnet_depth(index)
}

fn has_features_and_classifier(index: &WeightIndex) -> bool {
    index.contains_fragment("features") && index.contains_fragment("classifier")
}

fn always(_: &WeightIndex) -> bool {
    true
}

// Input width of classifier.1 per variant: 4x the last stage's channels
const EFFICIENTNET_HEAD_INPUTS: [(usize, u8); 6] = [
    (1408, 2),
    (1536, 3),
    (1792, 4),
    (2048, 5),
    (2304, 6),
    (2560, 7),
];

// B0 has 16 MBConv blocks across stages 1..=7; B1 shares its widths but has 23
const EFFICIENTNET_B0_BLOCKS: usize = 16;

fn efficientnet_variant(index: &WeightIndex) -> Architecture {
    let width = index
        .shape("classifier.1.weight")
        .and_then(|dims| dims.get(1).copied());

    let variant = match width {
        Some(1280) => {
            let blocks: usize = (1..=7)
                .map(|stage| index.count_children(&format!("features.{}", stage)))
                .sum();
            if blocks > EFFICIENTNET_B0_BLOCKS {
                1
            } else {
                0
            }
        }
        Some(width) => EFFICIENTNET_HEAD_INPUTS
            .iter()
            .find(|(w, _)| *w == width)
            .map(|(_, v)| *v)
            .unwrap_or(0),
        None => 0,
    };

    Architecture::EfficientNet { variant }
}

fn resnet_depth(index: &WeightIndex) -> Architecture {
    let bottleneck = index.contains_fragment("layer1.0.conv3");
    let layer3 = index.count_children("layer3");

    let depth = match (bottleneck, layer3) {
        (false, 6) => 34,
        (false, _) => 18,
        (true, 23) => 101,
        (true, 36) => 152,
        (true, _) => 50,
    };

    Architecture::ResNet { depth }
}
