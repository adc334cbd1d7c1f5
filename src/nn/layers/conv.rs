use crate::io::{StateDict, TensorData};
use crate::nn::Module;
use crate::tensor::{RawTensor, Tensor};

/// Spatial padding rule for a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// 'same' padding: (k-1)/2 zeros on every side, output keeps the
    /// input resolution at stride 1.
    Same,
    /// One row/column of zeros on the top and left only, none on the
    /// bottom/right. This is how Darknet pads its 3x3 stride-2
    /// downsample convolutions.
    TopLeft,
}

/// 2D convolution over channel-last input.
///
/// Input is `[batch, height, width, in_channels]` and the kernel is
/// `[kernel_h, kernel_w, in_channels, out_channels]` -- the layout the
/// converter produces, so loaded weights are used as-is.
pub struct Conv2d {
    weight: Tensor,       // [kernel_h, kernel_w, in_channels, out_channels]
    bias: Option<Tensor>, // [out_channels]
    stride: usize,
    padding: Padding,
}

impl Conv2d {
    /// Create a conv layer with zeroed parameters.
    ///
    /// Parameters are zero-initialized because every layer in this crate
    /// is populated from a weight file before use.
    pub fn new(in_ch: usize, out_ch: usize, kernel: usize, stride: usize, use_bias: bool) -> Self {
        let weight = RawTensor::zeros(&[kernel, kernel, in_ch, out_ch]);
        let bias = use_bias.then(|| RawTensor::zeros(&[out_ch]));
        let padding = if stride == 1 {
            Padding::Same
        } else {
            Padding::TopLeft
        };
        Conv2d {
            weight,
            bias,
            stride,
            padding,
        }
    }

    // Shape metadata is read off the kernel tensor itself.
    pub fn kernel_size(&self) -> usize {
        self.weight.borrow().shape[0]
    }

    pub fn in_channels(&self) -> usize {
        self.weight.borrow().shape[2]
    }

    pub fn filters(&self) -> usize {
        self.weight.borrow().shape[3]
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn pad_amounts(&self, k: usize) -> (usize, usize, usize, usize) {
        match self.padding {
            Padding::Same => {
                let p = (k - 1) / 2;
                (p, p, p, p)
            }
            Padding::TopLeft => (1, 0, 1, 0),
        }
    }
}

impl Module for Conv2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        let x_b = x.borrow();
        assert_eq!(x_b.shape.len(), 4, "Conv2d expected 4D input (B,H,W,C)");
        let (b, h, w, c) = (x_b.shape[0], x_b.shape[1], x_b.shape[2], x_b.shape[3]);
        assert_eq!(c, self.in_channels(), "Channel mismatch");

        let k = self.kernel_size();
        let s = self.stride;
        let out_c = self.filters();
        let (pt, pb, pl, pr) = self.pad_amounts(k);
        let oh = (h + pt + pb - k) / s + 1;
        let ow = (w + pl + pr - k) / s + 1;

        let wgt = self.weight.borrow();
        let mut out = vec![0.0f32; b * oh * ow * out_c];

        // weight strides for [k, k, in, out]
        let ws0 = k * c * out_c;
        let ws1 = c * out_c;

        for bi in 0..b {
            for oy in 0..oh {
                for ox in 0..ow {
                    let o_base = ((bi * oh + oy) * ow + ox) * out_c;
                    for ky in 0..k {
                        let iy = (oy * s + ky) as isize - pt as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for kx in 0..k {
                            let ix = (ox * s + kx) as isize - pl as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            let x_base = ((bi * h + iy as usize) * w + ix as usize) * c;
                            let w_row = ky * ws0 + kx * ws1;
                            for ic in 0..c {
                                let xv = x_b.data[x_base + ic];
                                let w_base = w_row + ic * out_c;
                                for oc in 0..out_c {
                                    out[o_base + oc] += xv * wgt.data[w_base + oc];
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Some(ref bias) = self.bias {
            let bias = bias.borrow();
            for (i, v) in out.iter_mut().enumerate() {
                *v += bias.data[i % out_c];
            }
        }

        RawTensor::new(out, &[b, oh, ow, out_c])
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = vec![self.weight.clone()];
        if let Some(ref b) = self.bias {
            p.push(b.clone());
        }
        p
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("weight".to_string(), TensorData::from_tensor(&self.weight));
        if let Some(ref b) = self.bias {
            state.insert("bias".to_string(), TensorData::from_tensor(b));
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        if let Some(t) = state.get("weight") {
            let mut b = self.weight.borrow_mut();
            b.data = t.data.clone();
            b.shape = t.shape.clone();
        }
        if let (Some(t), Some(bias)) = (state.get("bias"), self.bias.as_ref()) {
            let mut b = bias.borrow_mut();
            b.data = t.data.clone();
            b.shape = t.shape.clone();
        }
    }
}
