use serde::{Deserialize, Serialize};

/// Width of the ImageNet heads the DeiT backbone is created with
pub const BACKBONE_CLASSES: usize = 1000;

/// Audio Spectrogram Transformer hyper-parameters
///
/// Defaults describe the AudioSet checkpoint `audioset_10_10_0.4593`: a
/// DeiT-base backbone over 16x16 patches taken every 10 bins in both
/// frequency and time of a 1024 x 128 filter bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AstConfig {
    /// Number of output classes
    pub label_dim: usize,
    /// Mel bins per frame
    pub input_fdim: usize,
    /// Frames per input
    pub input_tdim: usize,
    /// Square patch side
    pub patch_size: usize,
    /// Patch stride along frequency
    pub fstride: usize,
    /// Patch stride along time
    pub tstride: usize,
    /// Token width
    pub embed_dim: usize,
    /// Number of transformer blocks
    pub depth: usize,
    /// Attention heads per block
    pub num_heads: usize,
    /// Hidden width of the block MLP relative to `embed_dim`
    pub mlp_ratio: usize,
}

impl Default for AstConfig {
    fn default() -> Self {
        Self {
            label_dim: 527,
            input_fdim: 128,
            input_tdim: 1024,
            patch_size: 16,
            fstride: 10,
            tstride: 10,
            embed_dim: 768,
            depth: 12,
            num_heads: 12,
            mlp_ratio: 4,
        }
    }
}

impl AstConfig {
    /// Patches along the frequency axis
    #[must_use]
    pub const fn f_dim(&self) -> usize {
        (self.input_fdim - self.patch_size) / self.fstride + 1
    }

    /// Patches along the time axis
    #[must_use]
    pub const fn t_dim(&self) -> usize {
        (self.input_tdim - self.patch_size) / self.tstride + 1
    }

    /// Patch tokens per input
    #[must_use]
    pub const fn num_patches(&self) -> usize {
        self.f_dim() * self.t_dim()
    }

    /// Width of a single attention head
    #[must_use]
    pub const fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Checks that the dimensions describe a buildable network
    ///
    /// # Errors
    /// Returns a description of the first inconsistent field
    pub fn check(&self) -> Result<(), String> {
        if self.patch_size == 0 || self.fstride == 0 || self.tstride == 0 {
            return Err("patch_size and strides must be > 0".to_owned());
        }
        if self.input_fdim < self.patch_size || self.input_tdim < self.patch_size {
            return Err(format!(
                "input {}x{} is smaller than patch size {}",
                self.input_tdim, self.input_fdim, self.patch_size
            ));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(format!(
                "embed_dim {} is not divisible by num_heads {}",
                self.embed_dim, self.num_heads
            ));
        }
        if self.label_dim == 0 || self.depth == 0 || self.mlp_ratio == 0 {
            return Err("label_dim, depth and mlp_ratio must be > 0".to_owned());
        }
        Ok(())
    }

    /// Every parameter the network expects, with its shape
    ///
    /// Names follow the PyTorch module layout (`v.` is the ViT backbone,
    /// `mlp_head.0` the head LayerNorm, `mlp_head.1` the classifier).
    #[must_use]
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let d = self.embed_dim;
        let hidden = d * self.mlp_ratio;
        let p = self.patch_size;

        let mut shapes = vec![
            ("v.cls_token".to_owned(), vec![1, 1, d]),
            ("v.dist_token".to_owned(), vec![1, 1, d]),
            ("v.pos_embed".to_owned(), vec![1, self.num_patches() + 2, d]),
            ("v.patch_embed.proj.weight".to_owned(), vec![d, 1, p, p]),
            ("v.patch_embed.proj.bias".to_owned(), vec![d]),
        ];

        for i in 0..self.depth {
            let block = format!("v.blocks.{i}");
            shapes.extend([
                (format!("{block}.norm1.weight"), vec![d]),
                (format!("{block}.norm1.bias"), vec![d]),
                (format!("{block}.attn.qkv.weight"), vec![3 * d, d]),
                (format!("{block}.attn.qkv.bias"), vec![3 * d]),
                (format!("{block}.attn.proj.weight"), vec![d, d]),
                (format!("{block}.attn.proj.bias"), vec![d]),
                (format!("{block}.norm2.weight"), vec![d]),
                (format!("{block}.norm2.bias"), vec![d]),
                (format!("{block}.mlp.fc1.weight"), vec![hidden, d]),
                (format!("{block}.mlp.fc1.bias"), vec![hidden]),
                (format!("{block}.mlp.fc2.weight"), vec![d, hidden]),
                (format!("{block}.mlp.fc2.bias"), vec![d]),
            ]);
        }

        shapes.extend([
            ("v.norm.weight".to_owned(), vec![d]),
            ("v.norm.bias".to_owned(), vec![d]),
            ("mlp_head.0.weight".to_owned(), vec![d]),
            ("mlp_head.0.bias".to_owned(), vec![d]),
            ("mlp_head.1.weight".to_owned(), vec![self.label_dim, d]),
            ("mlp_head.1.bias".to_owned(), vec![self.label_dim]),
        ]);

        shapes
    }

    /// DeiT classifier heads a checkpoint carries but the network never reads
    ///
    /// The backbone is created with its ImageNet `head` and `head_dist`, so
    /// pretrained checkpoints hold them next to the AST `mlp_head`.
    #[must_use]
    pub fn backbone_head_shapes(&self) -> Vec<(String, Vec<usize>)> {
        ["v.head", "v.head_dist"]
            .into_iter()
            .flat_map(|head| {
                [
                    (format!("{head}.weight"), vec![BACKBONE_CLASSES, self.embed_dim]),
                    (format!("{head}.bias"), vec![BACKBONE_CLASSES]),
                ]
            })
            .collect()
    }
}

#[cfg(test)]
impl AstConfig {
    /// Smallest network with the real head width, for fast tests
    pub(crate) fn tiny() -> Self {
        Self {
            label_dim: 527,
            input_fdim: 16,
            input_tdim: 32,
            patch_size: 16,
            fstride: 16,
            tstride: 16,
            embed_dim: 8,
            depth: 1,
            num_heads: 2,
            mlp_ratio: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patch_grid() {
        let config = AstConfig::default();
        assert_eq!(config.f_dim(), 12);
        assert_eq!(config.t_dim(), 101);
        assert_eq!(config.num_patches(), 1212);
        assert_eq!(config.head_dim(), 64);
    }

    #[test]
    fn test_default_parameter_count() {
        let config = AstConfig::default();
        let shapes = config.parameter_shapes();

        // 5 embedding tensors, 12 per block, 6 for the final norm and head
        assert_eq!(shapes.len(), 5 + 12 * 12 + 6);

        let pos_embed = shapes.iter().find(|(name, _)| name == "v.pos_embed").unwrap();
        assert_eq!(pos_embed.1, vec![1, 1214, 768]);

        let classifier = shapes
            .iter()
            .find(|(name, _)| name == "mlp_head.1.weight")
            .unwrap();
        assert_eq!(classifier.1, vec![527, 768]);
    }

    #[test]
    fn test_parameter_names_are_unique() {
        let shapes = AstConfig::default().parameter_shapes();
        let names: std::collections::HashSet<_> = shapes.iter().map(|(name, _)| name).collect();
        assert_eq!(names.len(), shapes.len());
    }

    #[test]
    fn test_backbone_heads_stay_out_of_the_manifest() {
        let config = AstConfig::default();
        let heads = config.backbone_head_shapes();
        let manifest = config.parameter_shapes();

        assert_eq!(heads.len(), 4);
        assert!(heads.contains(&("v.head_dist.weight".to_owned(), vec![1000, 768])));
        assert!(heads
            .iter()
            .all(|(name, _)| manifest.iter().all(|(known, _)| known != name)));
    }

    #[test]
    fn test_tiny_patch_grid() {
        let config = AstConfig::tiny();
        assert_eq!(config.f_dim(), 1);
        assert_eq!(config.t_dim(), 2);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_check_accepts_default() {
        assert!(AstConfig::default().check().is_ok());
    }

    #[test]
    fn test_check_rejects_indivisible_heads() {
        let config = AstConfig {
            num_heads: 5,
            ..AstConfig::default()
        };
        assert!(config.check().unwrap_err().contains("not divisible"));
    }

    #[test]
    fn test_check_rejects_small_input() {
        let config = AstConfig {
            input_tdim: 8,
            ..AstConfig::default()
        };
        assert!(config.check().unwrap_err().contains("smaller than patch size"));
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = AstConfig {
            depth: 2,
            ..AstConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AstConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
