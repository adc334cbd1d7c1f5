use crate::io::StateDict;
use crate::nn::Module;
use crate::tensor::{RawTensor, Tensor};

/// Nearest-neighbour spatial upsampling for channel-last input.
pub struct Upsample2d {
    factor: usize,
}

impl Upsample2d {
    pub fn new(factor: usize) -> Self {
        Upsample2d { factor }
    }
}

impl Module for Upsample2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        let x_b = x.borrow();
        assert_eq!(x_b.shape.len(), 4, "Upsample2d expected 4D input (B,H,W,C)");
        let (b, h, w, c) = (x_b.shape[0], x_b.shape[1], x_b.shape[2], x_b.shape[3]);
        let f = self.factor;
        let (oh, ow) = (h * f, w * f);

        let mut out = vec![0.0f32; b * oh * ow * c];
        for bi in 0..b {
            for oy in 0..oh {
                for ox in 0..ow {
                    let src = ((bi * h + oy / f) * w + ox / f) * c;
                    let dst = ((bi * oh + oy) * ow + ox) * c;
                    out[dst..dst + c].copy_from_slice(&x_b.data[src..src + c]);
                }
            }
        }
        RawTensor::new(out, &[b, oh, ow, c])
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }

    fn load_state_dict(&mut self, _state: &StateDict) {
        // Stateless
    }
}

/// Concatenate two channel-last tensors along the channel axis.
///
/// # Panics
/// Panics if the batch or spatial dimensions differ.
pub fn concat_channels(a: &Tensor, b: &Tensor) -> Tensor {
    let a = a.borrow();
    let b = b.borrow();
    assert_eq!(a.shape.len(), 4, "concat expects 4D tensors");
    assert_eq!(b.shape.len(), 4, "concat expects 4D tensors");
    assert_eq!(&a.shape[..3], &b.shape[..3], "Spatial dims must match");

    let (bt, h, w) = (a.shape[0], a.shape[1], a.shape[2]);
    let (ca, cb) = (a.shape[3], b.shape[3]);
    let mut out = Vec::with_capacity(bt * h * w * (ca + cb));
    for px in 0..bt * h * w {
        out.extend_from_slice(&a.data[px * ca..(px + 1) * ca]);
        out.extend_from_slice(&b.data[px * cb..(px + 1) * cb]);
    }
    RawTensor::new(out, &[bt, h, w, ca + cb])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsample_repeats_pixels() {
        let up = Upsample2d::new(2);
        let x = RawTensor::new(vec![1.0, 2.0], &[1, 1, 2, 1]);
        let y = up.forward(&x);
        assert_eq!(y.borrow().shape, vec![1, 2, 4, 1]);
        assert_eq!(
            y.borrow().data,
            vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]
        );
    }

    #[test]
    fn test_concat_interleaves_channels() {
        let a = RawTensor::new(vec![1.0, 2.0], &[1, 1, 2, 1]);
        let b = RawTensor::new(vec![10.0, 20.0, 30.0, 40.0], &[1, 1, 2, 2]);
        let y = concat_channels(&a, &b);
        assert_eq!(y.borrow().shape, vec![1, 1, 2, 3]);
        assert_eq!(y.borrow().data, vec![1.0, 10.0, 20.0, 2.0, 30.0, 40.0]);
    }
}
