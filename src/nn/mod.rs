use crate::io::StateDict;
use crate::tensor::Tensor;

pub mod layers;

pub use layers::{concat_channels, BatchNorm2d, Conv2d, LeakyReLU, Padding, Upsample2d};

pub trait Module {
    fn forward(&self, x: &Tensor) -> Tensor;
    fn parameters(&self) -> Vec<Tensor>;

    // State dict methods
    fn state_dict(&self) -> StateDict;
    fn load_state_dict(&mut self, state: &StateDict);
}

/// Extract the entries of `state` under `prefix.` with the prefix stripped.
///
/// Composite modules use this to route a flat state dict down to their
/// children.
pub fn sub_state(state: &StateDict, prefix: &str) -> StateDict {
    let prefix = format!("{prefix}.");
    let mut sub = StateDict::new();
    for (key, value) in state {
        if let Some(sub_key) = key.strip_prefix(&prefix) {
            if !sub_key.is_empty() {
                sub.insert(sub_key.to_string(), value.clone());
            }
        }
    }
    sub
}

/// Merge a child's state dict into `state` under `prefix.`.
pub fn extend_state(state: &mut StateDict, prefix: &str, child: StateDict) {
    for (key, value) in child {
        state.insert(format!("{prefix}.{key}"), value);
    }
}
