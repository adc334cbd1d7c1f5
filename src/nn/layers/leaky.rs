use crate::io::StateDict;
use crate::nn::Module;
use crate::tensor::{RawTensor, Tensor};

/// Leaky ReLU with a fixed negative slope (Darknet uses 0.1).
pub struct LeakyReLU {
    slope: f32,
}

impl LeakyReLU {
    pub fn new(slope: f32) -> Self {
        LeakyReLU { slope }
    }
}

impl Module for LeakyReLU {
    fn forward(&self, x: &Tensor) -> Tensor {
        let x_b = x.borrow();
        let data: Vec<f32> = x_b
            .data
            .iter()
            .map(|&v| if v > 0.0 { v } else { self.slope * v })
            .collect();
        RawTensor::new(data, &x_b.shape)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![] // No learnable params
    }

    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }

    fn load_state_dict(&mut self, _state: &StateDict) {
        // Stateless
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_values_scaled() {
        let act = LeakyReLU::new(0.1);
        let x = RawTensor::new(vec![-2.0, 0.0, 3.0], &[3]);
        let y = act.forward(&x);
        let y = y.borrow();
        assert!((y.data[0] + 0.2).abs() < 1e-6);
        assert_eq!(y.data[1], 0.0);
        assert_eq!(y.data[2], 3.0);
    }
}
