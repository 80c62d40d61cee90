/// Checkpoint fetch-if-absent
pub mod download;
/// State dict loading, key normalization and validation
pub mod state_dict;

pub use download::{ensure_checkpoint, DownloadError, Fetch, HttpFetcher};
pub use state_dict::{
    drop_backbone_heads, load_state_dict, strip_prefix, validate, StateDict, StateDictError,
};

/// AudioSet-pretrained AST checkpoint (mAP 0.4593)
pub const DEFAULT_CHECKPOINT_URL: &str =
    "https://www.dropbox.com/s/cv4knew8mvbrnvq/audioset_0.4593.pth?dl=1";

/// Where the checkpoint is kept between runs
pub const DEFAULT_CHECKPOINT_PATH: &str = "./pretrained_models/audioset_10_10_0.4593.pth";

/// Prefix added to every parameter name by the data-parallel training wrapper
pub const DEFAULT_PREFIX: &str = "module.";
