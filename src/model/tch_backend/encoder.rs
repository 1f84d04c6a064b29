//! BERT-family encoders (BERT, RoBERTa, ALBERT) evaluated with libtorch.
//!
//! Only the encoder stack is built; task heads stored in the checkpoints are
//! ignored. Inputs are single unpadded sequences, so no attention mask is
//! applied.

use std::{collections::HashMap, fmt, path::Path};

use serde::Deserialize;
use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;

use crate::model::registry::Architecture;

#[derive(Debug, Error)]
pub enum WeightError {
    #[error("missing tensor {0}")]
    Missing(String),
    #[error("invalid model config: {0}")]
    Config(String),
    #[error(transparent)]
    Tch(#[from] TchError),
}

/// The subset of `config.json` the encoder needs.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    pub hidden_size: i64,
    pub num_hidden_layers: i64,
    pub num_attention_heads: i64,
    pub intermediate_size: i64,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    pub max_position_embeddings: i64,
    #[serde(default)]
    pub pad_token_id: i64,
    /// ALBERT factorizes the embedding matrix to this width.
    #[serde(default)]
    pub embedding_size: Option<i64>,
    #[serde(default = "one")]
    pub num_hidden_groups: i64,
    #[serde(default = "one")]
    pub inner_group_num: i64,
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn one() -> i64 {
    1
}

impl EncoderConfig {
    fn validate(&self) -> Result<(), WeightError> {
        if self.num_attention_heads <= 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(WeightError::Config(format!(
                "hidden_size {} is not divisible by {} attention heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_hidden_layers <= 0 {
            return Err(WeightError::Config("num_hidden_layers must be positive".into()));
        }
        if self.num_hidden_groups <= 0 || self.num_hidden_groups > self.num_hidden_layers {
            return Err(WeightError::Config(format!(
                "num_hidden_groups {} out of range for {} layers",
                self.num_hidden_groups, self.num_hidden_layers
            )));
        }
        if self.inner_group_num <= 0 {
            return Err(WeightError::Config("inner_group_num must be positive".into()));
        }
        Ok(())
    }
}

/// Fails unless `tensor` has `expected` entries along `dim`.
fn check_dim(tensor: &Tensor, dim: usize, expected: i64, what: &str) -> Result<(), WeightError> {
    let actual = tensor.size().get(dim).copied();
    if actual == Some(expected) {
        Ok(())
    } else {
        Err(WeightError::Config(format!(
            "{what}: config says {expected}, checkpoint has {actual:?}"
        )))
    }
}

/// Named tensors read from a checkpoint file.
pub struct WeightMap {
    tensors: HashMap<String, Tensor>,
}

impl WeightMap {
    /// Reads `.safetensors` or libtorch `.ot` checkpoints onto `device` as f32.
    pub fn load(path: &Path, device: Device) -> Result<Self, WeightError> {
        let named = match path.extension().and_then(|ext| ext.to_str()) {
            Some("safetensors") => Tensor::read_safetensors(path)?,
            _ => Tensor::load_multi_with_device(path, device)?,
        };
        let tensors = named
            .into_iter()
            .map(|(name, tensor)| (name, tensor.to_device(device).to_kind(Kind::Float)))
            .collect();
        Ok(Self { tensors })
    }

    pub fn from_tensors(tensors: impl IntoIterator<Item = (String, Tensor)>) -> Self {
        Self {
            tensors: tensors.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn root(&self, prefix: &str) -> Scope<'_> {
        Scope {
            map: self,
            path: prefix.to_string(),
        }
    }
}

/// A dotted path into a [`WeightMap`].
struct Scope<'a> {
    map: &'a WeightMap,
    path: String,
}

impl<'a> Scope<'a> {
    fn pp(&self, name: impl fmt::Display) -> Scope<'a> {
        Scope {
            map: self.map,
            path: self.join(&name.to_string()),
        }
    }

    fn join(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.path)
        }
    }

    fn has(&self, name: &str) -> bool {
        self.map.contains(&self.join(name))
    }

    fn get(&self, name: &str) -> Result<Tensor, WeightError> {
        let full = self.join(name);
        self.map
            .tensors
            .get(&full)
            .map(Tensor::shallow_clone)
            .ok_or(WeightError::Missing(full))
    }

    /// First tensor found among alternative names.
    fn get_any(&self, names: &[&str]) -> Result<Tensor, WeightError> {
        names
            .iter()
            .find_map(|name| self.get(name).ok())
            .ok_or_else(|| WeightError::Missing(self.join(&names.join("|"))))
    }
}

struct Linear {
    weight: Tensor,
    bias: Tensor,
}

impl Linear {
    fn load(scope: &Scope) -> Result<Self, WeightError> {
        Ok(Self {
            weight: scope.get("weight")?,
            bias: scope.get("bias")?,
        })
    }

    /// The feed-forward expansion, whose width must match `intermediate_size`.
    fn intermediate(scope: &Scope, config: &EncoderConfig) -> Result<Self, WeightError> {
        let linear = Self::load(scope)?;
        check_dim(&linear.weight, 0, config.intermediate_size, "intermediate_size")?;
        Ok(linear)
    }

    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.linear(&self.weight, Some(&self.bias))
    }
}

struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    size: i64,
    eps: f64,
}

impl LayerNorm {
    // Older checkpoints still name the parameters gamma/beta.
    fn load(scope: &Scope, eps: f64) -> Result<Self, WeightError> {
        let weight = scope.get_any(&["weight", "gamma"])?;
        let bias = scope.get_any(&["bias", "beta"])?;
        let size = weight.size().first().copied().unwrap_or_default();
        Ok(Self {
            weight,
            bias,
            size,
            eps,
        })
    }

    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.layer_norm([self.size], Some(&self.weight), Some(&self.bias), self.eps, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Gelu,
    GeluTanh,
    Relu,
}

impl Activation {
    fn parse(raw: &str) -> Result<Self, WeightError> {
        match raw {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_fast" | "gelu_pytorch_tanh" => Ok(Activation::GeluTanh),
            "relu" => Ok(Activation::Relu),
            other => Err(WeightError::Config(format!("unsupported activation {other:?}"))),
        }
    }

    fn forward(self, xs: &Tensor) -> Tensor {
        match self {
            Activation::Gelu => xs.gelu("none"),
            Activation::GeluTanh => xs.gelu("tanh"),
            Activation::Relu => xs.relu(),
        }
    }
}

struct Embeddings {
    word: Tensor,
    position: Tensor,
    token_type: Tensor,
    norm: LayerNorm,
    position_offset: i64,
}

impl Embeddings {
    fn load(scope: &Scope, config: &EncoderConfig, position_offset: i64) -> Result<Self, WeightError> {
        let word = scope.pp("word_embeddings").get("weight")?;
        let width = config.embedding_size.unwrap_or(config.hidden_size);
        check_dim(&word, 1, width, "embedding width")?;
        Ok(Self {
            word,
            position: scope.pp("position_embeddings").get("weight")?,
            token_type: scope.pp("token_type_embeddings").get("weight")?,
            norm: LayerNorm::load(&scope.pp("LayerNorm"), config.layer_norm_eps)?,
            position_offset,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Tensor {
        let len = input_ids.size()[1];
        let positions = Tensor::arange_start(
            self.position_offset,
            self.position_offset + len,
            (Kind::Int64, input_ids.device()),
        )
        .unsqueeze(0);
        let token_types = input_ids.zeros_like();

        let embedded = Tensor::embedding(&self.word, input_ids, -1, false, false)
            + Tensor::embedding(&self.position, &positions, -1, false, false)
            + Tensor::embedding(&self.token_type, &token_types, -1, false, false);
        self.norm.forward(&embedded)
    }
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    norm: LayerNorm,
    heads: i64,
    head_dim: i64,
}

impl SelfAttention {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let (batch, len) = (size[0], size[1]);
        let split_heads =
            |t: Tensor| t.view([batch, len, self.heads, self.head_dim]).transpose(1, 2);

        let query = split_heads(self.query.forward(xs));
        let key = split_heads(self.key.forward(xs));
        let value = split_heads(self.value.forward(xs));

        let scores = query.matmul(&key.transpose(-1, -2)) / (self.head_dim as f64).sqrt();
        let probs = scores.softmax(-1, Kind::Float);
        let context = probs
            .matmul(&value)
            .transpose(1, 2)
            .contiguous()
            .view([batch, len, self.heads * self.head_dim]);

        self.norm.forward(&(self.output.forward(&context) + xs))
    }
}

struct TransformerLayer {
    attention: SelfAttention,
    intermediate: Linear,
    output: Linear,
    norm: LayerNorm,
    activation: Activation,
}

impl TransformerLayer {
    /// `encoder.layer.N` in BERT and RoBERTa checkpoints.
    fn load_bert(scope: &Scope, config: &EncoderConfig) -> Result<Self, WeightError> {
        let eps = config.layer_norm_eps;
        let attention = scope.pp("attention");
        let heads = config.num_attention_heads;
        Ok(Self {
            attention: SelfAttention {
                query: Linear::load(&attention.pp("self").pp("query"))?,
                key: Linear::load(&attention.pp("self").pp("key"))?,
                value: Linear::load(&attention.pp("self").pp("value"))?,
                output: Linear::load(&attention.pp("output").pp("dense"))?,
                norm: LayerNorm::load(&attention.pp("output").pp("LayerNorm"), eps)?,
                heads,
                head_dim: config.hidden_size / heads,
            },
            intermediate: Linear::intermediate(&scope.pp("intermediate").pp("dense"), config)?,
            output: Linear::load(&scope.pp("output").pp("dense"))?,
            norm: LayerNorm::load(&scope.pp("output").pp("LayerNorm"), eps)?,
            activation: Activation::parse(&config.hidden_act)?,
        })
    }

    /// `albert_layer_groups.G.albert_layers.N` in ALBERT checkpoints.
    fn load_albert(scope: &Scope, config: &EncoderConfig) -> Result<Self, WeightError> {
        let eps = config.layer_norm_eps;
        let attention = scope.pp("attention");
        let heads = config.num_attention_heads;
        Ok(Self {
            attention: SelfAttention {
                query: Linear::load(&attention.pp("query"))?,
                key: Linear::load(&attention.pp("key"))?,
                value: Linear::load(&attention.pp("value"))?,
                output: Linear::load(&attention.pp("dense"))?,
                norm: LayerNorm::load(&attention.pp("LayerNorm"), eps)?,
                heads,
                head_dim: config.hidden_size / heads,
            },
            intermediate: Linear::intermediate(&scope.pp("ffn"), config)?,
            output: Linear::load(&scope.pp("ffn_output"))?,
            norm: LayerNorm::load(&scope.pp("full_layer_layer_norm"), eps)?,
            activation: Activation::parse(&config.hidden_act)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Tensor {
        let attended = self.attention.forward(xs);
        let hidden = self.activation.forward(&self.intermediate.forward(&attended));
        self.norm.forward(&(self.output.forward(&hidden) + &attended))
    }
}

enum Stack {
    Layers(Vec<TransformerLayer>),
    /// ALBERT: an embedding projection, then `num_layers` passes over a few
    /// shared layer groups.
    Shared {
        projection: Linear,
        groups: Vec<Vec<TransformerLayer>>,
        num_layers: i64,
    },
}

pub struct Encoder {
    embeddings: Embeddings,
    stack: Stack,
    hidden_size: i64,
    max_input_tokens: i64,
}

impl Encoder {
    pub fn load(
        weights: &WeightMap,
        config: &EncoderConfig,
        architecture: Architecture,
    ) -> Result<Self, WeightError> {
        config.validate()?;

        let prefix = [architecture.weight_prefix(), ""]
            .into_iter()
            .find(|prefix| weights.root(prefix).has("embeddings.word_embeddings.weight"))
            .ok_or_else(|| WeightError::Missing("embeddings.word_embeddings.weight".into()))?;
        let root = weights.root(prefix);

        let position_offset = architecture.position_offset(config.pad_token_id);
        let embeddings = Embeddings::load(&root.pp("embeddings"), config, position_offset)?;

        let encoder = root.pp("encoder");
        let stack = match architecture {
            Architecture::Bert | Architecture::Roberta => {
                let layers = (0..config.num_hidden_layers)
                    .map(|i| TransformerLayer::load_bert(&encoder.pp("layer").pp(i), config))
                    .collect::<Result<Vec<_>, _>>()?;
                Stack::Layers(layers)
            }
            Architecture::Albert => {
                let groups = (0..config.num_hidden_groups)
                    .map(|g| {
                        let group = encoder.pp("albert_layer_groups").pp(g).pp("albert_layers");
                        (0..config.inner_group_num)
                            .map(|j| TransformerLayer::load_albert(&group.pp(j), config))
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Stack::Shared {
                    projection: Linear::load(&encoder.pp("embedding_hidden_mapping_in"))?,
                    groups,
                    num_layers: config.num_hidden_layers,
                }
            }
        };

        Ok(Self {
            embeddings,
            stack,
            hidden_size: config.hidden_size,
            max_input_tokens: config.max_position_embeddings - position_offset,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size as usize
    }

    /// Longest sequence the position table can address.
    pub fn max_input_tokens(&self) -> usize {
        self.max_input_tokens.max(0) as usize
    }

    /// Last hidden state, `[batch, tokens, hidden_size]`, for `[batch, tokens]` ids.
    pub fn forward(&self, input_ids: &Tensor) -> Tensor {
        let mut hidden = self.embeddings.forward(input_ids);
        match &self.stack {
            Stack::Layers(layers) => {
                for layer in layers {
                    hidden = layer.forward(&hidden);
                }
            }
            Stack::Shared {
                projection,
                groups,
                num_layers,
            } => {
                hidden = projection.forward(&hidden);
                let per_group = (*num_layers / groups.len() as i64).max(1);
                for i in 0..*num_layers {
                    let group = ((i / per_group) as usize).min(groups.len() - 1);
                    for layer in &groups[group] {
                        hidden = layer.forward(&hidden);
                    }
                }
            }
        }
        hidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HIDDEN: i64 = 8;
    const HEADS: i64 = 2;
    const FFN: i64 = 16;
    const VOCAB: i64 = 30;
    const POSITIONS: i64 = 20;

    fn config(architecture: Architecture) -> EncoderConfig {
        EncoderConfig {
            hidden_size: HIDDEN,
            num_hidden_layers: 2,
            num_attention_heads: HEADS,
            intermediate_size: FFN,
            hidden_act: if architecture == Architecture::Albert {
                "gelu_new".into()
            } else {
                "gelu".into()
            },
            layer_norm_eps: 1e-12,
            max_position_embeddings: POSITIONS,
            pad_token_id: if architecture == Architecture::Roberta { 1 } else { 0 },
            embedding_size: (architecture == Architecture::Albert).then_some(4),
            num_hidden_groups: 1,
            inner_group_num: 1,
        }
    }

    fn scoped(prefix: &str, rest: &str) -> String {
        if prefix.is_empty() {
            rest.to_string()
        } else {
            format!("{prefix}.{rest}")
        }
    }

    fn push(tensors: &mut Vec<(String, Tensor)>, name: String, shape: &[i64]) {
        tensors.push((name, Tensor::randn(shape, (Kind::Float, Device::Cpu)) * 0.02));
    }

    fn push_linear(tensors: &mut Vec<(String, Tensor)>, scope: &str, out: i64, inp: i64) {
        push(tensors, format!("{scope}.weight"), &[out, inp]);
        push(tensors, format!("{scope}.bias"), &[out]);
    }

    fn push_norm(tensors: &mut Vec<(String, Tensor)>, scope: &str, size: i64, legacy: bool) {
        let (w, b) = if legacy { ("gamma", "beta") } else { ("weight", "bias") };
        tensors.push((format!("{scope}.{w}"), Tensor::ones([size], (Kind::Float, Device::Cpu))));
        tensors.push((format!("{scope}.{b}"), Tensor::zeros([size], (Kind::Float, Device::Cpu))));
    }

    fn embeddings(tensors: &mut Vec<(String, Tensor)>, prefix: &str, width: i64, legacy: bool) {
        let name = |rest: &str| scoped(prefix, &format!("embeddings.{rest}"));
        push(tensors, name("word_embeddings.weight"), &[VOCAB, width]);
        push(tensors, name("position_embeddings.weight"), &[POSITIONS, width]);
        push(tensors, name("token_type_embeddings.weight"), &[2, width]);
        push_norm(tensors, &name("LayerNorm"), width, legacy);
    }

    fn bert_weights(prefix: &str, legacy: bool) -> WeightMap {
        let mut tensors = Vec::new();
        embeddings(&mut tensors, prefix, HIDDEN, legacy);
        for i in 0..2 {
            let layer = scoped(prefix, &format!("encoder.layer.{i}"));
            for proj in ["query", "key", "value"] {
                push_linear(&mut tensors, &format!("{layer}.attention.self.{proj}"), HIDDEN, HIDDEN);
            }
            push_linear(&mut tensors, &format!("{layer}.attention.output.dense"), HIDDEN, HIDDEN);
            push_norm(&mut tensors, &format!("{layer}.attention.output.LayerNorm"), HIDDEN, legacy);
            push_linear(&mut tensors, &format!("{layer}.intermediate.dense"), FFN, HIDDEN);
            push_linear(&mut tensors, &format!("{layer}.output.dense"), HIDDEN, FFN);
            push_norm(&mut tensors, &format!("{layer}.output.LayerNorm"), HIDDEN, legacy);
        }
        push_linear(&mut tensors, "cls.predictions.transform.dense", HIDDEN, HIDDEN);
        WeightMap::from_tensors(tensors)
    }

    fn albert_weights() -> WeightMap {
        let mut tensors = Vec::new();
        embeddings(&mut tensors, "albert", 4, false);
        push_linear(&mut tensors, "albert.encoder.embedding_hidden_mapping_in", HIDDEN, 4);
        let layer = "albert.encoder.albert_layer_groups.0.albert_layers.0";
        for proj in ["query", "key", "value", "dense"] {
            push_linear(&mut tensors, &format!("{layer}.attention.{proj}"), HIDDEN, HIDDEN);
        }
        push_norm(&mut tensors, &format!("{layer}.attention.LayerNorm"), HIDDEN, false);
        push_linear(&mut tensors, &format!("{layer}.ffn"), FFN, HIDDEN);
        push_linear(&mut tensors, &format!("{layer}.ffn_output"), HIDDEN, FFN);
        push_norm(&mut tensors, &format!("{layer}.full_layer_layer_norm"), HIDDEN, false);
        WeightMap::from_tensors(tensors)
    }

    fn run(encoder: &Encoder, tokens: i64) -> Vec<i64> {
        let ids = Tensor::arange(tokens, (Kind::Int64, Device::Cpu)).unsqueeze(0);
        tch::no_grad(|| encoder.forward(&ids)).size()
    }

    #[test]
    fn bert_output_is_tokens_by_hidden() {
        let weights = bert_weights("bert", true);
        let encoder = Encoder::load(&weights, &config(Architecture::Bert), Architecture::Bert).unwrap();
        assert_eq!(run(&encoder, 5), vec![1, 5, HIDDEN]);
        assert_eq!(encoder.hidden_size(), HIDDEN as usize);
        assert_eq!(encoder.max_input_tokens(), POSITIONS as usize);
    }

    #[test]
    fn roberta_offsets_positions() {
        let weights = bert_weights("roberta", false);
        let encoder =
            Encoder::load(&weights, &config(Architecture::Roberta), Architecture::Roberta).unwrap();
        assert_eq!(encoder.max_input_tokens(), (POSITIONS - 2) as usize);
        assert_eq!(run(&encoder, 3), vec![1, 3, HIDDEN]);
    }

    #[test]
    fn unprefixed_checkpoints_are_accepted() {
        let weights = bert_weights("", false);
        assert!(!weights.is_empty());
        assert!(Encoder::load(&weights, &config(Architecture::Bert), Architecture::Bert).is_ok());
    }

    #[test]
    fn albert_shares_layers_across_depth() {
        let weights = albert_weights();
        let encoder =
            Encoder::load(&weights, &config(Architecture::Albert), Architecture::Albert).unwrap();
        assert_eq!(run(&encoder, 4), vec![1, 4, HIDDEN]);
    }

    #[test]
    fn missing_tensors_are_reported() {
        let weights = bert_weights("bert", false);
        let err = Encoder::load(&weights, &config(Architecture::Albert), Architecture::Albert)
            .err()
            .unwrap();
        assert!(matches!(err, WeightError::Missing(_)));
    }

    #[test]
    fn config_widths_must_match_checkpoint() {
        let weights = bert_weights("bert", false);

        let mut wide_ffn = config(Architecture::Bert);
        wide_ffn.intermediate_size = FFN * 2;
        assert!(matches!(
            Encoder::load(&weights, &wide_ffn, Architecture::Bert),
            Err(WeightError::Config(_))
        ));

        let mut narrow_embeddings = config(Architecture::Albert);
        narrow_embeddings.embedding_size = Some(2);
        assert!(matches!(
            Encoder::load(&albert_weights(), &narrow_embeddings, Architecture::Albert),
            Err(WeightError::Config(_))
        ));
    }

    #[test]
    fn config_is_checked() {
        let mut bad = config(Architecture::Bert);
        bad.num_attention_heads = 3;
        let weights = bert_weights("bert", false);
        assert!(matches!(
            Encoder::load(&weights, &bad, Architecture::Bert),
            Err(WeightError::Config(_))
        ));
    }
}
