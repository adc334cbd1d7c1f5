//! Convert Darknet YOLOv3 weight files into channel-last state-dict
//! checkpoints.
//!
//! The weight file is a flat, order-dependent stream of f32 blocks; this
//! crate walks it against a fixed model traversal, permutes each kernel
//! from Darknet's (out, in, h, w) layout to (h, w, in, out), reorders the
//! batch-norm vectors, and serializes the populated model.

pub mod convert;
pub mod darknet;
pub mod error;
pub mod io;
pub mod logger;
pub mod nn;
pub mod tensor;
pub mod yolo;

pub use error::{ConvertError, Result};
pub use tensor::{RawTensor, Tensor};
pub use yolo::YoloV3;
