use crate::io::{StateDict, TensorData};
use crate::nn::Module;
use crate::tensor::{RawTensor, Tensor};

/// Inference-mode batch normalization over the channel (last) axis.
///
/// There is no training path here: the converter only ever runs the
/// normalization with the running statistics read from the weight file.
pub struct BatchNorm2d {
    num_features: usize,
    eps: f32,
    gamma: Tensor,
    beta: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
}

impl BatchNorm2d {
    pub fn new(num_features: usize) -> Self {
        Self::new_with_eps(num_features, 1e-3)
    }

    pub fn new_with_eps(num_features: usize, eps: f32) -> Self {
        BatchNorm2d {
            num_features,
            eps,
            gamma: RawTensor::ones(&[num_features]),
            beta: RawTensor::zeros(&[num_features]),
            running_mean: RawTensor::zeros(&[num_features]),
            running_var: RawTensor::ones(&[num_features]),
        }
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn gamma(&self) -> &Tensor {
        &self.gamma
    }

    pub fn beta(&self) -> &Tensor {
        &self.beta
    }

    pub fn running_mean(&self) -> &Tensor {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Tensor {
        &self.running_var
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        let x_b = x.borrow();
        assert_eq!(
            x_b.shape.len(),
            4,
            "BatchNorm2d expected 4D input (B,H,W,C)"
        );
        assert_eq!(
            *x_b.shape.last().unwrap(),
            self.num_features,
            "Channel mismatch"
        );

        let gamma = self.gamma.borrow();
        let beta = self.beta.borrow();
        let mean = self.running_mean.borrow();
        let var = self.running_var.borrow();

        // Precompute per-channel scale/shift:
        // y = gamma * (x - mean) / sqrt(var + eps) + beta
        let scale: Vec<f32> = (0..self.num_features)
            .map(|c| gamma.data[c] / (var.data[c] + self.eps).sqrt())
            .collect();
        let shift: Vec<f32> = (0..self.num_features)
            .map(|c| beta.data[c] - mean.data[c] * scale[c])
            .collect();

        let nf = self.num_features;
        let data: Vec<f32> = x_b
            .data
            .iter()
            .enumerate()
            .map(|(i, &v)| v * scale[i % nf] + shift[i % nf])
            .collect();
        RawTensor::new(data, &x_b.shape)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.gamma.clone(), self.beta.clone()]
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("gamma".to_string(), TensorData::from_tensor(&self.gamma));
        state.insert("beta".to_string(), TensorData::from_tensor(&self.beta));
        state.insert(
            "running_mean".to_string(),
            TensorData::from_tensor(&self.running_mean),
        );
        state.insert(
            "running_var".to_string(),
            TensorData::from_tensor(&self.running_var),
        );
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        for (key, tensor) in [
            ("gamma", &self.gamma),
            ("beta", &self.beta),
            ("running_mean", &self.running_mean),
            ("running_var", &self.running_var),
        ] {
            if let Some(t) = state.get(key) {
                let mut b = tensor.borrow_mut();
                b.data = t.data.clone();
                b.shape = t.shape.clone();
            }
        }
    }
}
