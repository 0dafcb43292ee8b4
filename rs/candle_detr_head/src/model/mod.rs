pub mod attention_map;
pub mod head;
pub mod mask_head;
pub mod mlp;

pub use attention_map::MultiHeadAttentionMap;
pub use head::{DetrHead, HeadOutput, Mode, Predictions, Supervision, TransformerOutput};
pub use mask_head::MaskHeadFpnConv;
pub use mlp::Mlp;
