use candle_core::{bail, IndexOp, Module, Result, Tensor};
use candle_nn::{conv2d, layer_norm, linear, Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};

use super::AstConfig;

const BACKBONE_NORM_EPS: f64 = 1e-6;
const HEAD_NORM_EPS: f64 = 1e-5;

struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn new(config: &AstConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.embed_dim;
        #[allow(clippy::cast_precision_loss)]
        let scale = (config.head_dim() as f64).powf(-0.5);
        Ok(Self {
            qkv: linear(dim, 3 * dim, vb.pp("qkv"))?,
            proj: linear(dim, dim, vb.pp("proj"))?,
            num_heads: config.num_heads,
            scale,
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let head_dim = c / self.num_heads;

        // [3, B, heads, N, head_dim]
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.t()?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let attn = (q.matmul(&k)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;

        let out = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        self.proj.forward(&out)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(config: &AstConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.embed_dim * config.mlp_ratio;
        Ok(Self {
            fc1: linear(config.embed_dim, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, config.embed_dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.gelu_erf()?)
    }
}

struct Block {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(config: &AstConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(config.embed_dim, BACKBONE_NORM_EPS, vb.pp("norm1"))?,
            attn: Attention::new(config, vb.pp("attn"))?,
            norm2: layer_norm(config.embed_dim, BACKBONE_NORM_EPS, vb.pp("norm2"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
        })
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.norm1.forward(xs)?)?)?;
        &xs + self.mlp.forward(&self.norm2.forward(&xs)?)?
    }
}

/// Audio Spectrogram Transformer
///
/// A DeiT backbone over overlapping filter-bank patches. The prediction is
/// taken from the mean of the class and distillation tokens.
pub struct AstModel {
    config: AstConfig,
    patch_embed: Conv2d,
    cls_token: Tensor,
    dist_token: Tensor,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: LayerNorm,
    head_norm: LayerNorm,
    head: Linear,
}

impl AstModel {
    /// Builds the network, pulling every parameter from `vb`
    ///
    /// # Errors
    /// Returns error if the config is inconsistent or a parameter is missing
    /// or mis-shaped
    pub fn new(config: &AstConfig, vb: VarBuilder) -> Result<Self> {
        if let Err(reason) = config.check() {
            bail!("invalid AST config: {reason}");
        }
        if config.fstride != config.tstride {
            bail!(
                "unequal patch strides are not supported (fstride {}, tstride {})",
                config.fstride,
                config.tstride
            );
        }

        let d = config.embed_dim;
        let backbone = vb.pp("v");

        let conv_config = Conv2dConfig {
            stride: config.fstride,
            ..Default::default()
        };
        let patch_embed = conv2d(
            1,
            d,
            config.patch_size,
            conv_config,
            backbone.pp("patch_embed").pp("proj"),
        )?;

        let cls_token = backbone.get((1, 1, d), "cls_token")?;
        let dist_token = backbone.get((1, 1, d), "dist_token")?;
        let pos_embed = backbone.get((1, config.num_patches() + 2, d), "pos_embed")?;

        let blocks = (0..config.depth)
            .map(|i| Block::new(config, backbone.pp("blocks").pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let norm = layer_norm(d, BACKBONE_NORM_EPS, backbone.pp("norm"))?;
        let head_norm = layer_norm(d, HEAD_NORM_EPS, vb.pp("mlp_head").pp(0))?;
        let head = linear(d, config.label_dim, vb.pp("mlp_head").pp(1))?;

        Ok(Self {
            config: config.clone(),
            patch_embed,
            cls_token,
            dist_token,
            pos_embed,
            blocks,
            norm,
            head_norm,
            head,
        })
    }

    /// Hyper-parameters the network was built with
    #[must_use]
    pub const fn config(&self) -> &AstConfig {
        &self.config
    }

    /// Maps a normalized filter-bank batch `[B, T, F]` to logits `[B, label_dim]`
    ///
    /// # Errors
    /// Returns error if the input shape doesn't match the config
    pub fn forward(&self, fbank: &Tensor) -> Result<Tensor> {
        let (b, t, f) = fbank.dims3()?;
        if t != self.config.input_tdim || f != self.config.input_fdim {
            bail!(
                "expected input [B, {}, {}], got [{b}, {t}, {f}]",
                self.config.input_tdim,
                self.config.input_fdim
            );
        }
        let d = self.config.embed_dim;

        // [B, 1, F, T]: frequency is the image height
        let xs = fbank.unsqueeze(1)?.transpose(2, 3)?.contiguous()?;
        let xs = self.patch_embed.forward(&xs)?;
        let xs = xs.flatten_from(2)?.transpose(1, 2)?.contiguous()?;

        let cls = self.cls_token.broadcast_as((b, 1, d))?.contiguous()?;
        let dist = self.dist_token.broadcast_as((b, 1, d))?.contiguous()?;
        let mut xs = Tensor::cat(&[&cls, &dist, &xs], 1)?.broadcast_add(&self.pos_embed)?;

        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        let xs = self.norm.forward(&xs)?;

        let pooled = ((xs.i((.., 0))? + xs.i((.., 1))?)? / 2.0)?;
        self.head.forward(&self.head_norm.forward(&pooled)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    fn constant_tensors(config: &AstConfig, value: f32) -> HashMap<String, Tensor> {
        config
            .parameter_shapes()
            .into_iter()
            .map(|(name, shape)| {
                let tensor = Tensor::full(value, shape, &Device::Cpu).unwrap();
                (name, tensor)
            })
            .collect()
    }

    fn build(config: &AstConfig, tensors: HashMap<String, Tensor>) -> Result<AstModel> {
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
        AstModel::new(config, vb)
    }

    #[test]
    fn test_forward_output_shape() {
        let config = AstConfig::tiny();
        let model = build(&config, constant_tensors(&config, 0.01)).unwrap();

        let input = Tensor::zeros((3, 32, 16), DType::F32, &Device::Cpu).unwrap();
        let logits = model.forward(&input).unwrap();

        assert_eq!(logits.dims(), &[3, 527]);
    }

    #[test]
    fn test_forward_rejects_wrong_input_shape() {
        let config = AstConfig::tiny();
        let model = build(&config, constant_tensors(&config, 0.01)).unwrap();

        let input = Tensor::zeros((1, 30, 16), DType::F32, &Device::Cpu).unwrap();
        let err = model.forward(&input).unwrap_err();

        assert!(err.to_string().contains("expected input"));
    }

    #[test]
    fn test_zero_weights_produce_head_bias() {
        // With every other weight and bias at zero, LayerNorm outputs zeros and
        // the logits equal the classifier bias.
        let config = AstConfig::tiny();
        let mut tensors = constant_tensors(&config, 0.0);
        tensors.insert(
            "mlp_head.1.bias".to_owned(),
            Tensor::full(0.25_f32, 527, &Device::Cpu).unwrap(),
        );
        let model = build(&config, tensors).unwrap();

        let input = Tensor::ones((1, 32, 16), DType::F32, &Device::Cpu).unwrap();
        let logits = model.forward(&input).unwrap().to_vec2::<f32>().unwrap();

        assert!(logits[0].iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_batch_rows_are_independent() {
        let config = AstConfig::tiny();
        let model = build(&config, constant_tensors(&config, 0.02)).unwrap();

        let a = Tensor::arange(0_f32, 512.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 32, 16))
            .unwrap();
        let a = (a / 512.0).unwrap();
        let b = Tensor::zeros((1, 32, 16), DType::F32, &Device::Cpu).unwrap();

        let single = model.forward(&a).unwrap().to_vec2::<f32>().unwrap();
        let batch = model
            .forward(&Tensor::cat(&[&a, &b], 0).unwrap())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        for (x, y) in single[0].iter().zip(&batch[0]) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_missing_parameter_fails_to_build() {
        let config = AstConfig::tiny();
        let mut tensors = constant_tensors(&config, 0.01);
        tensors.remove("v.blocks.0.attn.qkv.weight");

        assert!(build(&config, tensors).is_err());
    }

    #[test]
    fn test_unequal_strides_rejected() {
        let config = AstConfig {
            input_tdim: 48,
            tstride: 8,
            ..AstConfig::tiny()
        };

        let err = build(&config, HashMap::new()).err().unwrap();
        assert!(err.to_string().contains("unequal patch strides"));
    }
}
