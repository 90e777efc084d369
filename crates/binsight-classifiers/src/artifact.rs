//! Decoding of serialized model artifacts
//!
//! Model files arrive in several containers (SafeTensors, PyTorch zip archives, ONNX
//! graphs) and, inside PyTorch archives, in several shapes: a bare `state_dict`, a
//! training checkpoint nesting the `state_dict` under some key, or a whole pickled
//! module. Everything is decoded once into an [`Artifact`] tree so the loading strategies
//! can inspect structure without touching the file again.

use binsight_core::{Error, Result};
use candle_core::pickle::{Object, Stack, TensorInfo};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Fraction of mapping entries that must be tensors for the mapping to count as weights
pub const WEIGHT_MAPPING_MIN_FRACTION: f64 = 0.6;

/// Decoded model artifact
#[derive(Debug, Clone)]
pub enum Artifact {
    /// A numeric tensor
    Tensor(Tensor),

    /// An ordered string-keyed mapping
    Mapping(Vec<(String, Artifact)>),

    /// A pickled module object with its parameters and buffers flattened to dotted names
    Module {
        class_name: String,
        state: Vec<(String, Tensor)>,
    },

    /// A computation graph that can be evaluated without knowing the architecture
    #[cfg(feature = "onnx")]
    Graph(Box<candle_onnx::onnx::ModelProto>),

    /// Any other value (numbers, strings, optimizer state objects, ...)
    Opaque(String),
}

impl Artifact {
    /// Short description of the node kind, for logs and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tensor(_) => "tensor",
            Self::Mapping(_) => "mapping",
            Self::Module { .. } => "module",
            #[cfg(feature = "onnx")]
            Self::Graph(_) => "graph",
            Self::Opaque(_) => "opaque",
        }
    }

    /// Entries of a mapping node
    pub fn as_mapping(&self) -> Option<&[(String, Artifact)]> {
        match self {
            Self::Mapping(entries) => Some(entries),
            _ => None,
        }
    }

    /// Value stored under `key` in a mapping node
    pub fn get(&self, key: &str) -> Option<&Artifact> {
        self.as_mapping()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Whether this is a mapping whose values are almost entirely tensors.
    ///
    /// Checkpoints written by `torch.save(model.state_dict())` carry an extra `_metadata`
    /// entry next to the tensors, so an exact all-tensors test would reject them.
    pub fn looks_like_weights(&self) -> bool {
        let Some(entries) = self.as_mapping() else {
            return false;
        };
        if entries.is_empty() {
            return false;
        }

        let tensors = entries
            .iter()
            .filter(|(_, v)| matches!(v, Artifact::Tensor(_)))
            .count();
        let required = ((WEIGHT_MAPPING_MIN_FRACTION * entries.len() as f64) as usize).max(1);
        tensors >= required
    }

    /// Tensor entries of a mapping node, in order
    pub fn tensor_entries(&self) -> Vec<(String, Tensor)> {
        self.as_mapping()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(k, v)| match v {
                        Artifact::Tensor(t) => Some((k.clone(), t.clone())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Container format of an artifact file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// SafeTensors (recommended)
    SafeTensors,
    /// PyTorch zip archive (`torch.save`)
    TorchArchive,
    /// ONNX protobuf graph
    Onnx,
}

impl ArtifactFormat {
    /// Sniff the format from the file header, falling back to the extension
    pub fn detect(path: &Path) -> Result<Self> {
        let mut header = [0u8; 9];
        let mut file = File::open(path)?;
        let read = read_up_to(&mut file, &mut header)?;
        let header = &header[..read];

        if header.starts_with(b"PK\x03\x04") {
            return Ok(Self::TorchArchive);
        }

        // SafeTensors: little-endian u64 header length followed by a JSON object
        if header.len() == 9 && header[8] == b'{' {
            return Ok(Self::SafeTensors);
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some("onnx") => Ok(Self::Onnx),
            _ => Err(Error::model_load(format!(
                "Unrecognized artifact format: {}",
                path.display()
            ))),
        }
    }
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Decode the artifact at `path`. Tensors are materialized on the CPU as f32.
pub fn read_artifact(path: impl AsRef<Path>) -> Result<Artifact> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::model_load(format!(
            "Model file not found: {}",
            path.display()
        )));
    }

    let format = ArtifactFormat::detect(path)?;
    tracing::debug!(path = %path.display(), ?format, "Decoding model artifact");

    match format {
        ArtifactFormat::SafeTensors => read_safetensors(path),
        ArtifactFormat::TorchArchive => TorchArchive::open(path)?.decode(),
        ArtifactFormat::Onnx => read_onnx(path),
    }
}

fn read_safetensors(path: &Path) -> Result<Artifact> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .map_err(|e| Error::model_load(format!("Failed to load SafeTensors: {}", e)))?;

    let mut entries = tensors
        .into_iter()
        .map(|(name, tensor)| Ok((name, Artifact::Tensor(to_f32(tensor)?))))
        .collect::<Result<Vec<_>>>()?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(Artifact::Mapping(entries))
}

#[cfg(feature = "onnx")]
fn read_onnx(path: &Path) -> Result<Artifact> {
    let proto = candle_onnx::read_file(path)
        .map_err(|e| Error::model_load(format!("Failed to read ONNX graph: {}", e)))?;
    Ok(Artifact::Graph(Box::new(proto)))
}

#[cfg(not(feature = "onnx"))]
fn read_onnx(path: &Path) -> Result<Artifact> {
    Err(Error::model_load(format!(
        "{} is an ONNX graph; rebuild with the 'onnx' feature to evaluate it",
        path.display()
    )))
}

fn to_f32(tensor: Tensor) -> Result<Tensor> {
    if tensor.dtype() == DType::F32 {
        return Ok(tensor);
    }
    tensor
        .to_dtype(DType::F32)
        .map_err(|e| Error::model_load(format!("Failed to convert tensor to f32: {}", e)))
}

/// A `torch.save` zip archive: one `data.pkl` pickle plus one entry per tensor storage
struct TorchArchive {
    zip: zip::ZipArchive<BufReader<File>>,
    pickle_name: String,
    dir_name: PathBuf,
    storages: HashMap<String, Vec<u8>>,
}

impl TorchArchive {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let zip = zip::ZipArchive::new(BufReader::new(file))
            .map_err(|e| Error::model_load(format!("Failed to open PyTorch archive: {}", e)))?;

        let pickle_name = zip
            .file_names()
            .find(|name| name.ends_with("data.pkl"))
            .map(str::to_string)
            .ok_or_else(|| Error::model_load("PyTorch archive has no data.pkl"))?;

        // torch.save keeps storages next to the pickle: archive/data.pkl -> archive/data/<key>
        let dir_name = pickle_name
            .strip_suffix(".pkl")
            .map(PathBuf::from)
            .ok_or_else(|| Error::model_load("PyTorch archive has no data.pkl"))?;

        Ok(Self {
            zip,
            pickle_name,
            dir_name,
            storages: HashMap::new(),
        })
    }

    fn decode(mut self) -> Result<Artifact> {
        let object = {
            let entry = self
                .zip
                .by_name(&self.pickle_name)
                .map_err(|e| Error::model_load(format!("Failed to read data.pkl: {}", e)))?;
            let mut reader = BufReader::new(entry);
            let mut stack = Stack::empty();
            stack
                .read_loop(&mut reader)
                .map_err(|e| Error::model_load(format!("Failed to parse pickle: {}", e)))?;
            stack
                .finalize()
                .map_err(|e| Error::model_load(format!("Malformed pickle: {}", e)))?
        };

        self.convert(object)
    }

    fn convert(&mut self, object: Object) -> Result<Artifact> {
        if let Some(tensor) = self.try_tensor(&object)? {
            return Ok(Artifact::Tensor(tensor));
        }

        match object {
            Object::Dict(entries) => {
                let mut mapping = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    if let Some(key) = key_string(&key) {
                        mapping.push((key, self.convert(value)?));
                    }
                }
                Ok(Artifact::Mapping(mapping))
            }
            Object::Build { callable, args } => match module_class_name(&callable) {
                Some(class_name) => {
                    let mut state = Vec::new();
                    self.flatten_module(*args, "", &mut state)?;
                    Ok(Artifact::Module { class_name, state })
                }
                None => Ok(Artifact::Opaque("object".to_string())),
            },
            Object::Int(v) => Ok(Artifact::Opaque(format!("int({})", v))),
            Object::Float(v) => Ok(Artifact::Opaque(format!("float({})", v))),
            Object::Bool(v) => Ok(Artifact::Opaque(format!("bool({})", v))),
            Object::Unicode(_) => Ok(Artifact::Opaque("str".to_string())),
            Object::None => Ok(Artifact::Opaque("None".to_string())),
            Object::List(_) | Object::Tuple(_) => Ok(Artifact::Opaque("sequence".to_string())),
            _ => Ok(Artifact::Opaque("object".to_string())),
        }
    }

    /// Walk `_parameters`, `_buffers` and `_modules` of a pickled `nn.Module` state
    fn flatten_module(
        &mut self,
        state: Object,
        prefix: &str,
        out: &mut Vec<(String, Tensor)>,
    ) -> Result<()> {
        let Object::Dict(attributes) = state else {
            return Ok(());
        };

        for (attribute, value) in attributes {
            let Some(attribute) = key_string(&attribute) else {
                continue;
            };
            let Object::Dict(entries) = value else {
                continue;
            };

            match attribute.as_str() {
                "_parameters" | "_buffers" => {
                    for (name, value) in entries {
                        let Some(name) = key_string(&name) else {
                            continue;
                        };
                        if let Some(tensor) = self.try_tensor(&value)? {
                            out.push((join_key(prefix, &name), tensor));
                        }
                    }
                }
                "_modules" => {
                    for (name, child) in entries {
                        let Some(name) = key_string(&name) else {
                            continue;
                        };
                        if let Object::Build { args, .. } = child {
                            self.flatten_module(*args, &join_key(prefix, &name), out)?;
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn try_tensor(&mut self, object: &Object) -> Result<Option<Tensor>> {
        if !matches!(object, Object::Reduce { .. }) {
            return Ok(None);
        }

        let info = object
            .clone()
            .into_tensor_info(Object::Unicode(String::new()), &self.dir_name)
            .map_err(|e| Error::model_load(format!("Malformed tensor record: {}", e)))?;

        match info {
            Some(info) => self.read_tensor(&info).map(Some),
            None => Ok(None),
        }
    }

    fn read_tensor(&mut self, info: &TensorInfo) -> Result<Tensor> {
        if !self.storages.contains_key(&info.path) {
            let mut entry = self.zip.by_name(&info.path).map_err(|e| {
                Error::model_load(format!("Missing tensor storage {}: {}", info.path, e))
            })?;
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            self.storages.insert(info.path.clone(), bytes);
        }
        let bytes = &self.storages[&info.path];

        let elem_size = info.dtype.size_in_bytes();
        let shape = info.layout.shape();
        let start = info.layout.start_offset() * elem_size;
        let end = start + shape.elem_count() * elem_size;
        if end > bytes.len() {
            return Err(Error::model_load(format!(
                "Tensor storage {} too small: need {} bytes, have {}",
                info.path,
                end,
                bytes.len()
            )));
        }
        let data = &bytes[start..end];

        let tensor = if info.layout.is_contiguous() {
            Tensor::from_raw_buffer(data, info.dtype, shape.dims(), &Device::Cpu)
        } else if info.layout.is_fortran_contiguous() {
            let mut dims = shape.dims().to_vec();
            dims.reverse();
            let order: Vec<usize> = (0..dims.len()).rev().collect();
            Tensor::from_raw_buffer(data, info.dtype, &dims, &Device::Cpu)
                .and_then(|t| t.permute(order))
                .and_then(|t| t.contiguous())
        } else {
            return Err(Error::model_load(format!(
                "Unsupported strided tensor layout in {}",
                info.path
            )));
        }
        .map_err(|e| Error::model_load(format!("Failed to rebuild tensor: {}", e)))?;

        to_f32(tensor)
    }
}

fn key_string(key: &Object) -> Option<String> {
    match key {
        Object::Unicode(s) => Some(s.clone()),
        Object::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Fully qualified class of a pickled object, e.g. `torchvision.models.resnet.ResNet`
fn module_class_name(callable: &Object) -> Option<String> {
    match callable {
        Object::Class {
            module_name,
            class_name,
        } => Some(format!("{}.{}", module_name, class_name)),
        Object::Reduce { callable, args } => match callable.as_ref() {
            // Protocol 2 objects are rebuilt with copyreg._reconstructor(cls, base, state)
            Object::Class {
                module_name,
                class_name,
            } if module_name == "copyreg" && class_name == "_reconstructor" => match args.as_ref() {
                Object::Tuple(items) => items.first().and_then(module_class_name),
                _ => None,
            },
            other => module_class_name(other),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(dims: &[usize]) -> Artifact {
        Artifact::Tensor(Tensor::zeros(dims, DType::F32, &Device::Cpu).unwrap())
    }

    #[test]
    fn test_looks_like_weights_threshold() {
        // 3 tensors out of 5 entries is exactly 60%
        let mapping = Artifact::Mapping(vec![
            ("a".into(), tensor(&[2])),
            ("b".into(), tensor(&[2])),
            ("c".into(), tensor(&[2])),
            ("epoch".into(), Artifact::Opaque("int(3)".into())),
            ("_metadata".into(), Artifact::Mapping(vec![])),
        ]);
        assert!(mapping.looks_like_weights());

        // floor(0.6 * 3) = 1, so a single tensor is enough
        let mapping = Artifact::Mapping(vec![
            ("a".into(), tensor(&[2])),
            ("epoch".into(), Artifact::Opaque("int(3)".into())),
            ("lr".into(), Artifact::Opaque("float(0.1)".into())),
        ]);
        assert!(mapping.looks_like_weights());

        // floor(0.6 * 4) = 2
        let mapping = Artifact::Mapping(vec![
            ("a".into(), tensor(&[2])),
            ("epoch".into(), Artifact::Opaque("int(3)".into())),
            ("lr".into(), Artifact::Opaque("float(0.1)".into())),
            ("step".into(), Artifact::Opaque("int(9)".into())),
        ]);
        assert!(!mapping.looks_like_weights());
    }

    #[test]
    fn test_empty_and_non_mapping_are_not_weights() {
        assert!(!Artifact::Mapping(vec![]).looks_like_weights());
        assert!(!tensor(&[3]).looks_like_weights());
        assert!(!Artifact::Opaque("str".into()).looks_like_weights());
    }

    #[test]
    fn test_get_and_tensor_entries() {
        let mapping = Artifact::Mapping(vec![
            ("fc.weight".into(), tensor(&[4, 2])),
            ("step".into(), Artifact::Opaque("int(1)".into())),
        ]);
        assert_eq!(mapping.get("step").map(Artifact::kind), Some("opaque"));
        assert!(mapping.get("missing").is_none());

        let entries = mapping.tensor_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "fc.weight");
        assert_eq!(entries[0].1.dims(), &[4, 2]);
    }

    #[test]
    fn test_module_class_name_from_reconstructor() {
        let callable = Object::Reduce {
            callable: Box::new(Object::Class {
                module_name: "copyreg".into(),
                class_name: "_reconstructor".into(),
            }),
            args: Box::new(Object::Tuple(vec![
                Object::Class {
                    module_name: "torchvision.models.resnet".into(),
                    class_name: "ResNet".into(),
                },
                Object::Class {
                    module_name: "builtins".into(),
                    class_name: "object".into(),
                },
                Object::None,
            ])),
        };
        assert_eq!(
            module_class_name(&callable).as_deref(),
            Some("torchvision.models.resnet.ResNet")
        );
    }

    /// Pickle (protocol 2) of `OrderedDict({"fc.bias": <FloatStorage "0", shape [3]>})`
    /// as `torch.save` writes it
    fn state_dict_pickle() -> Vec<u8> {
        fn unicode(out: &mut Vec<u8>, s: &str) {
            out.push(b'X');
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        fn ordered_dict(out: &mut Vec<u8>) {
            out.extend_from_slice(b"ccollections\nOrderedDict\n)R");
        }

        let mut out = vec![0x80, 2];
        ordered_dict(&mut out);
        out.push(b'(');
        unicode(&mut out, "fc.bias");
        out.extend_from_slice(b"ctorch._utils\n_rebuild_tensor_v2\n(");
        // persistent id: ("storage", FloatStorage, key, location, numel)
        out.push(b'(');
        unicode(&mut out, "storage");
        out.extend_from_slice(b"ctorch\nFloatStorage\n");
        unicode(&mut out, "0");
        unicode(&mut out, "cpu");
        out.extend_from_slice(&[b'K', 3, b't', b'Q']);
        // offset, size, stride, requires_grad, backward hooks
        out.extend_from_slice(&[b'K', 0, b'K', 3, 0x85, b'K', 1, 0x85, 0x89]);
        ordered_dict(&mut out);
        out.extend_from_slice(b"tRu.");
        out
    }

    fn write_torch_archive(path: &Path, storage: &[f32]) {
        use std::io::Write;
        use zip::write::SimpleFileOptions;
        use zip::CompressionMethod;

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        zip.start_file("archive/data.pkl", options).unwrap();
        zip.write_all(&state_dict_pickle()).unwrap();
        zip.start_file("archive/data/0", options).unwrap();
        for value in storage {
            zip.write_all(&value.to_le_bytes()).unwrap();
        }
        zip.start_file("archive/version", options).unwrap();
        zip.write_all(b"3\n").unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn test_read_torch_archive_state_dict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier.pth");
        write_torch_archive(&path, &[0.5, -1.0, 2.0]);

        assert_eq!(
            ArtifactFormat::detect(&path).unwrap(),
            ArtifactFormat::TorchArchive
        );
        let artifact = read_artifact(&path).unwrap();
        assert!(artifact.looks_like_weights());
        let bias = match artifact.get("fc.bias") {
            Some(Artifact::Tensor(t)) => t.to_vec1::<f32>().unwrap(),
            other => panic!("expected tensor, got {:?}", other.map(Artifact::kind)),
        };
        assert_eq!(bias, vec![0.5, -1.0, 2.0]);
    }

    #[test]
    fn test_torch_archive_short_storage_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.pth");
        write_torch_archive(&path, &[0.5]);

        let err = read_artifact(&path).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
        assert!(err.to_string().contains("too small"), "{}", err);
    }

    #[test]
    fn test_detect_rejects_unknown_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"not a model").unwrap();

        assert!(ArtifactFormat::detect(&path).is_err());
    }

    #[test]
    fn test_read_safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let mut tensors = HashMap::new();
        tensors.insert(
            "fc.bias".to_string(),
            Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        assert_eq!(
            ArtifactFormat::detect(&path).unwrap(),
            ArtifactFormat::SafeTensors
        );
        let artifact = read_artifact(&path).unwrap();
        assert!(artifact.looks_like_weights());
        let bias = match artifact.get("fc.bias") {
            Some(Artifact::Tensor(t)) => t.to_vec1::<f32>().unwrap(),
            other => panic!("expected tensor, got {:?}", other.map(Artifact::kind)),
        };
        assert_eq!(bias, vec![1., 2., 3.]);
    }
}
