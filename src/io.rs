use crate::error::{ConvertError, Result};
use crate::tensor::{RawTensor, Tensor};
use bincode::{config, Decode, Encode};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Flat map of parameter name -> tensor data, the checkpoint payload.
pub type StateDict = BTreeMap<String, TensorData>;

// Serializable representation of tensor data
#[derive(Encode, Decode, Clone)]
pub struct TensorData {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl TensorData {
    pub fn from_tensor(t: &Tensor) -> Self {
        let borrowed = t.borrow();
        TensorData {
            data: borrowed.data.clone(),
            shape: borrowed.shape.clone(),
        }
    }

    pub fn to_tensor(&self) -> Tensor {
        RawTensor::new(self.data.clone(), &self.shape)
    }
}

/// Summary of differences between two state dicts.
///
/// Used by the conversion driver after writing a checkpoint: `expected` is
/// the live model's state dict, `loaded` is what came back off disk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateDictDiff {
    /// Keys that exist in `expected` but are missing from `loaded`.
    pub missing_keys: Vec<String>,
    /// Keys that exist in `loaded` but not in `expected`.
    pub unexpected_keys: Vec<String>,
    /// Keys present in both, but with differing shapes:
    /// `(key, expected_shape, loaded_shape)`.
    pub shape_mismatches: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl StateDictDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_keys.is_empty()
            && self.unexpected_keys.is_empty()
            && self.shape_mismatches.is_empty()
    }
}

/// Compute a diff between an "expected" and a "loaded" state dict.
///
/// This function does not mutate any tensors and is purely informational.
pub fn diff_state_dict(expected: &StateDict, loaded: &StateDict) -> StateDictDiff {
    let mut diff = StateDictDiff::default();

    for (key, expected_td) in expected.iter() {
        match loaded.get(key) {
            None => diff.missing_keys.push(key.clone()),
            Some(actual_td) => {
                if expected_td.shape != actual_td.shape {
                    diff.shape_mismatches.push((
                        key.clone(),
                        expected_td.shape.clone(),
                        actual_td.shape.clone(),
                    ));
                }
            }
        }
    }

    for key in loaded.keys() {
        if !expected.contains_key(key) {
            diff.unexpected_keys.push(key.clone());
        }
    }

    diff
}

pub fn save_state_dict<P: AsRef<Path>>(state: &StateDict, path: P) -> Result<()> {
    let mut file = File::create(path)?;
    let encoded = bincode::encode_to_vec(state, config::standard())
        .map_err(|e| ConvertError::Serialization(e.to_string()))?;
    file.write_all(&encoded)?;
    Ok(())
}

pub fn load_state_dict<P: AsRef<Path>>(path: P) -> Result<StateDict> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    let (state, _): (StateDict, _) = bincode::decode_from_slice(&buffer, config::standard())
        .map_err(|e| ConvertError::Serialization(e.to_string()))?;
    Ok(state)
}

#[cfg(test)]
mod io_tests {
    use super::*;

    fn sample_state() -> StateDict {
        let mut state = StateDict::new();
        state.insert(
            "conv.weight".to_string(),
            TensorData {
                data: vec![0.5; 12],
                shape: vec![1, 1, 3, 4],
            },
        );
        state.insert(
            "conv.bias".to_string(),
            TensorData {
                data: vec![0.0; 4],
                shape: vec![4],
            },
        );
        state
    }

    #[test]
    fn test_save_load_roundtrip() {
        let state = sample_state();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.bin");

        save_state_dict(&state, &path).unwrap();
        let loaded = load_state_dict(&path).unwrap();

        assert_eq!(loaded.len(), state.len());
        for (key, td) in &state {
            let other = loaded.get(key).unwrap();
            assert_eq!(other.shape, td.shape);
            assert_eq!(other.data, td.data);
        }
        assert!(diff_state_dict(&state, &loaded).is_empty());
    }

    #[test]
    fn test_state_dict_diff_reports_mismatches() {
        let expected = sample_state();
        let mut loaded = expected.clone();

        // One missing key, one unexpected key, one shape mismatch.
        loaded.remove("conv.bias");
        loaded.insert(
            "extra".to_string(),
            TensorData {
                data: vec![0.0],
                shape: vec![1],
            },
        );
        if let Some(td) = loaded.get_mut("conv.weight") {
            td.shape = vec![999];
        }

        let diff = diff_state_dict(&expected, &loaded);
        assert!(!diff.is_empty());
        assert!(diff.missing_keys.contains(&"conv.bias".to_string()));
        assert!(diff.unexpected_keys.contains(&"extra".to_string()));
        assert!(
            diff.shape_mismatches
                .iter()
                .any(|(k, _exp, _act)| k == "conv.weight")
        );
    }
}
