use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;

/// Type alias for a reference-counted, interior-mutable tensor.
///
/// We use `Rc<RefCell<RawTensor>>` so the weight loader can assign into
/// tensors that the model already owns, and so skip routes can hand the
/// same activation to more than one consumer.
///
/// **Note**: single-threaded only, which is all a one-shot converter needs.
pub type Tensor = Rc<RefCell<RawTensor>>;

// ===== RAW TENSOR STRUCTURE =====

/// The core tensor structure.
///
/// Fields:
/// - `data`: flat Vec<f32> of actual values (row-major order)
/// - `shape`: dimensions, e.g. [batch, height, width, channels]
#[derive(Clone)]
pub struct RawTensor {
    pub data: Vec<f32>, // flat data vec, len = prod shape dims
    pub shape: Vec<usize>,
}

impl std::fmt::Debug for RawTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("len", &self.data.len())
            .finish()
    }
}

// ===== TENSOR CONSTRUCTORS =====
impl RawTensor {
    /// Create a new tensor from data and shape
    ///
    /// # Panics
    /// Panics if data.len() != shape.product()
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Tensor {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "Data length must match shape"
        );
        let raw = RawTensor {
            data,
            shape: shape.to_vec(),
        };
        Rc::new(RefCell::new(raw))
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: &[usize]) -> Tensor {
        let size = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with ones
    pub fn ones(shape: &[usize]) -> Tensor {
        let size = shape.iter().product();
        Self::new(vec![1.0; size], shape)
    }

    /// Create a tensor with random values uniformly distributed in [0, 1)
    pub fn rand(shape: &[usize]) -> Tensor {
        let size = shape.iter().product();
        let mut rng = rand::rng();
        let data: Vec<f32> = (0..size).map(|_| rng.random::<f32>()).collect();
        Self::new(data, shape)
    }
}

// ===== SHAPE / INDEX HELPERS =====
impl RawTensor {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Row-major strides for a shape
    pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Value at the given multi-dimensional coordinates
    ///
    /// # Panics
    /// Panics if the coordinate rank does not match the tensor rank.
    pub fn at(&self, coords: &[usize]) -> f32 {
        assert_eq!(coords.len(), self.shape.len(), "Coordinate rank mismatch");
        let strides = Self::compute_strides(&self.shape);
        let idx: usize = coords.iter().zip(&strides).map(|(c, s)| c * s).sum();
        self.data[idx]
    }
}

// ===== MOVEMENT OPS =====
impl RawTensor {
    /// Permute (reorder) tensor axes
    ///
    /// # Arguments
    /// * `axes` - New ordering of axes (must be a valid permutation of 0..rank)
    pub fn permute(self_t: &Tensor, axes: &[usize]) -> Tensor {
        let (data, shape) = {
            let s = self_t.borrow();
            (s.data.clone(), s.shape.clone())
        };
        assert_eq!(axes.len(), shape.len(), "Axes length must match rank");

        // Verify axes is a valid permutation
        let mut sorted_axes = axes.to_vec();
        sorted_axes.sort_unstable();
        for (i, &ax) in sorted_axes.iter().enumerate() {
            assert_eq!(i, ax, "Invalid permutation axes");
        }

        let new_shape: Vec<usize> = axes.iter().map(|&i| shape[i]).collect();
        let old_strides = Self::compute_strides(&shape);
        let new_strides = Self::compute_strides(&new_shape);
        let mut new_data = vec![0.0; data.len()];

        for (new_idx, val) in new_data.iter_mut().enumerate() {
            // Convert linear index to coordinates in the permuted shape
            let mut old_idx = 0;
            let mut rem = new_idx;
            for (i, &ax) in axes.iter().enumerate() {
                let coord = (rem / new_strides[i]) % new_shape[i];
                rem %= new_strides[i];
                old_idx += coord * old_strides[ax];
            }
            *val = data[old_idx];
        }
        Self::new(new_data, &new_shape)
    }

    /// Change shape while preserving element order
    ///
    /// # Panics
    /// Panics if element counts differ.
    pub fn reshape(self_t: &Tensor, new_shape: &[usize]) -> Tensor {
        let s = self_t.borrow();
        assert_eq!(
            s.data.len(),
            new_shape.iter().product::<usize>(),
            "Reshape must preserve element count"
        );
        Self::new(s.data.clone(), new_shape)
    }
}

// ===== ELEMENTWISE OPS =====
impl RawTensor {
    /// Elementwise sum of two same-shaped tensors
    pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
        let a = a.borrow();
        let b = b.borrow();
        assert_eq!(a.shape, b.shape, "Add requires matching shapes");
        let data: Vec<f32> = a.data.iter().zip(&b.data).map(|(x, y)| x + y).collect();
        Self::new(data, &a.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "Data length must match shape")]
    fn new_rejects_bad_length() {
        RawTensor::new(vec![1.0, 2.0], &[3]);
    }

    #[test]
    fn strides_are_row_major() {
        assert_eq!(RawTensor::compute_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(RawTensor::compute_strides(&[5]), vec![1]);
    }

    #[test]
    fn at_indexes_row_major() {
        let t = RawTensor::new((0..24).map(|i| i as f32).collect(), &[2, 3, 4]);
        let t = t.borrow();
        assert_eq!(t.at(&[0, 0, 0]), 0.0);
        assert_eq!(t.at(&[1, 2, 3]), 23.0);
        assert_eq!(t.at(&[1, 0, 2]), 14.0);
    }

    #[test]
    fn permute_maps_every_index() {
        // Shape (out, in, h, w) -> (h, w, in, out), the conversion layout.
        let (o, i, h, w) = (4, 3, 2, 2);
        let src = RawTensor::new((0..o * i * h * w).map(|v| v as f32).collect(), &[o, i, h, w]);
        let dst = RawTensor::permute(&src, &[2, 3, 1, 0]);
        assert_eq!(dst.borrow().shape, vec![h, w, i, o]);
        let src = src.borrow();
        let dst = dst.borrow();
        for co in 0..o {
            for ci in 0..i {
                for y in 0..h {
                    for x in 0..w {
                        assert_eq!(dst.at(&[y, x, ci, co]), src.at(&[co, ci, y, x]));
                    }
                }
            }
        }
    }

    #[test]
    fn permute_identity_is_noop() {
        let t = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let p = RawTensor::permute(&t, &[0, 1]);
        assert_eq!(p.borrow().data, t.borrow().data);
    }

    #[test]
    fn reshape_preserves_order() {
        let t = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let r = RawTensor::reshape(&t, &[3, 2]);
        assert_eq!(r.borrow().shape, vec![3, 2]);
        assert_eq!(r.borrow().data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn add_is_elementwise() {
        let a = RawTensor::new(vec![1.0, 2.0], &[2]);
        let b = RawTensor::new(vec![10.0, 20.0], &[2]);
        assert_eq!(RawTensor::add(&a, &b).borrow().data, vec![11.0, 22.0]);
    }
}
