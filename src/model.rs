use candle_core::{Device, Result, Tensor};
use candle_nn::{
    embedding, layer_norm, linear, Dropout, Embedding, LayerNorm, LayerNormConfig, Linear, Module,
    ModuleT, VarBuilder,
};
use serde::{Deserialize, Serialize};

use crate::config::{ModelType, TrainConfig};
use crate::dataset::Vocabulary;

/// Everything needed to rebuild (or verify) the network: persisted as
/// `model_spec.json` in the run directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model_type: ModelType,
    pub d_model: usize,
    pub layers: usize,
    pub heads: usize,
    pub dropout: f32,
    pub vocab_size: usize,
    pub phoneme_size: usize,
    pub seq_len: usize,
}

impl ModelSpec {
    pub fn from_config(cfg: &TrainConfig, vocab: &Vocabulary) -> Self {
        Self {
            model_type: cfg.model_type,
            d_model: cfg.d_model,
            layers: cfg.layers,
            heads: cfg.heads,
            dropout: cfg.dropout,
            vocab_size: vocab.vocab_size(),
            phoneme_size: vocab.phoneme_size(),
            seq_len: vocab.seq_len,
        }
    }

    /// Parameter table of the network, in VarBuilder naming order. The export
    /// verifier checks the serialized artifact against exactly this.
    pub fn expected_tensors(&self) -> Vec<(String, Vec<usize>)> {
        let d = self.d_model;
        let mut tensors = vec![
            ("tok_emb.weight".to_string(), vec![self.vocab_size, d]),
            ("pos_emb.weight".to_string(), vec![self.seq_len, d]),
        ];
        for i in 0..self.layers {
            for proj in ["q", "k", "v", "o"] {
                tensors.push((format!("blocks.{i}.attn.{proj}.weight"), vec![d, d]));
                tensors.push((format!("blocks.{i}.attn.{proj}.bias"), vec![d]));
            }
            tensors.push((format!("blocks.{i}.ln1.weight"), vec![d]));
            tensors.push((format!("blocks.{i}.ln1.bias"), vec![d]));
            tensors.push((format!("blocks.{i}.ffn.fc1.weight"), vec![4 * d, d]));
            tensors.push((format!("blocks.{i}.ffn.fc1.bias"), vec![4 * d]));
            tensors.push((format!("blocks.{i}.ffn.fc2.weight"), vec![d, 4 * d]));
            tensors.push((format!("blocks.{i}.ffn.fc2.bias"), vec![d]));
            tensors.push((format!("blocks.{i}.ln2.weight"), vec![d]));
            tensors.push((format!("blocks.{i}.ln2.bias"), vec![d]));
        }
        tensors.push(("head.weight".to_string(), vec![self.phoneme_size, d]));
        tensors.push(("head.bias".to_string(), vec![self.phoneme_size]));
        tensors
    }
}

#[derive(Debug)]
struct MultiHeadAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    heads: usize,
    scale: f64,
}

impl MultiHeadAttention {
    fn new(d_model: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        let q = linear(d_model, d_model, vb.pp("q"))?;
        let k = linear(d_model, d_model, vb.pp("k"))?;
        let v = linear(d_model, d_model, vb.pp("v"))?;
        let o = linear(d_model, d_model, vb.pp("o"))?;
        let scale = 1.0 / ((d_model / heads) as f64).sqrt();
        Ok(Self {
            q,
            k,
            v,
            o,
            heads,
            scale,
        })
    }

    fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, t, d) = x.dims3()?;
        let head_dim = d / self.heads;

        let q = self
            .q
            .forward(x)?
            .reshape((b, t, self.heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k
            .forward(x)?
            .reshape((b, t, self.heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v
            .forward(x)?
            .reshape((b, t, self.heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let mut scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, d))?;
        self.o.forward(&context)
    }
}

#[derive(Debug)]
struct EncoderBlock {
    attn: MultiHeadAttention,
    ln1: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    ln2: LayerNorm,
    drop: Dropout,
}

impl EncoderBlock {
    fn new(d_model: usize, heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let ln_cfg = LayerNormConfig {
            eps: 1e-6,
            ..Default::default()
        };
        let attn = MultiHeadAttention::new(d_model, heads, vb.pp("attn"))?;
        let ln1 = layer_norm(d_model, ln_cfg, vb.pp("ln1"))?;
        let fc1 = linear(d_model, 4 * d_model, vb.pp("ffn").pp("fc1"))?;
        let fc2 = linear(4 * d_model, d_model, vb.pp("ffn").pp("fc2"))?;
        let ln2 = layer_norm(d_model, ln_cfg, vb.pp("ln2"))?;
        Ok(Self {
            attn,
            ln1,
            fc1,
            fc2,
            ln2,
            drop: Dropout::new(dropout),
        })
    }

    fn forward_t(&self, x: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        // Post-norm residual blocks.
        let attn = self.attn.forward(x, mask)?;
        let attn = self.drop.forward_t(&attn, train)?;
        let x = self.ln1.forward(&(x + attn)?)?;

        let ffn = self.fc2.forward(&self.fc1.forward(&x)?.relu()?)?;
        let ffn = self.drop.forward_t(&ffn, train)?;
        self.ln2.forward(&(x + ffn)?)
    }
}

/// Encoder transformer sized by the derived vocabulary. `forward` attends
/// over the whole word; `autoregressive` applies a causal mask.
#[derive(Debug)]
pub struct G2pTransformer {
    tok_emb: Embedding,
    pos_emb: Embedding,
    blocks: Vec<EncoderBlock>,
    head: Linear,
    drop: Dropout,
    causal: bool,
}

impl G2pTransformer {
    pub fn new(spec: &ModelSpec, vb: VarBuilder) -> Result<Self> {
        let tok_emb = embedding(spec.vocab_size, spec.d_model, vb.pp("tok_emb"))?;
        let pos_emb = embedding(spec.seq_len, spec.d_model, vb.pp("pos_emb"))?;
        let mut blocks = Vec::with_capacity(spec.layers);
        for i in 0..spec.layers {
            blocks.push(EncoderBlock::new(
                spec.d_model,
                spec.heads,
                spec.dropout,
                vb.pp("blocks").pp(i.to_string()),
            )?);
        }
        let head = linear(spec.d_model, spec.phoneme_size, vb.pp("head"))?;
        Ok(Self {
            tok_emb,
            pos_emb,
            blocks,
            head,
            drop: Dropout::new(spec.dropout),
            causal: spec.model_type == ModelType::Autoregressive,
        })
    }

    /// `input_ids`: `(batch, seq_len)` of u32 char ids. Returns per-position
    /// logits `(batch, seq_len, phoneme_size)`.
    pub fn forward_t(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_b, t) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, t as u32, input_ids.device())?;
        let x = self
            .tok_emb
            .forward(input_ids)?
            .broadcast_add(&self.pos_emb.forward(&positions)?)?;
        let mut x = self.drop.forward_t(&x, train)?;

        let mask = if self.causal {
            Some(causal_mask(t, input_ids.device())?)
        } else {
            None
        };
        for block in &self.blocks {
            x = block.forward_t(&x, mask.as_ref(), train)?;
        }
        self.head.forward(&x)
    }
}

fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; t * t];
    for i in 0..t {
        for j in (i + 1)..t {
            // Large negative instead of -inf keeps softmax finite.
            data[i * t + j] = -1e9;
        }
    }
    Tensor::from_vec(data, (t, t), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn tiny_spec(model_type: ModelType) -> ModelSpec {
        ModelSpec {
            model_type,
            d_model: 16,
            layers: 2,
            heads: 2,
            dropout: 0.0,
            vocab_size: 12,
            phoneme_size: 9,
            seq_len: 6,
        }
    }

    fn forward_shape(model_type: ModelType) -> candle_core::Result<Vec<usize>> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = G2pTransformer::new(&tiny_spec(model_type), vb)?;
        let input = Tensor::zeros((3, 6), DType::U32, &device)?;
        Ok(model.forward_t(&input, false)?.dims().to_vec())
    }

    #[test]
    fn forward_model_produces_per_position_logits() {
        assert_eq!(forward_shape(ModelType::Forward).unwrap(), vec![3, 6, 9]);
    }

    #[test]
    fn autoregressive_model_produces_per_position_logits() {
        assert_eq!(
            forward_shape(ModelType::Autoregressive).unwrap(),
            vec![3, 6, 9]
        );
    }

    #[test]
    fn expected_tensors_match_varmap_contents() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let spec = tiny_spec(ModelType::Forward);
        let _model = G2pTransformer::new(&spec, vb).unwrap();

        let data = varmap.data().lock().unwrap();
        let expected = spec.expected_tensors();
        assert_eq!(data.len(), expected.len());
        for (name, dims) in &expected {
            let var = data.get(name).unwrap_or_else(|| panic!("missing {name}"));
            assert_eq!(var.dims(), dims.as_slice(), "shape mismatch for {name}");
        }
    }
}
