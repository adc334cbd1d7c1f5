//! Darknet weight-file parsing and in-place weight injection.
//!
//! A Darknet weight file is a 20-byte header (5 little-endian i32 words)
//! followed by raw f32 blocks, one per convolution, in network definition
//! order. Each block is either `filters` bias floats or `4*filters`
//! batch-norm floats, then the `filters*in*k*k` kernel. Nothing in the
//! stream is self-describing: the reader has to already know the layer
//! order and shapes, which it takes from the model being populated.

use log::{debug, info};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use crate::error::{ConvertError, Result};
use crate::tensor::{RawTensor, Tensor};
use crate::yolo::{DarknetConv, YoloV3};

/// Version words and image counter from the file header. Consumed and
/// logged, never interpreted.
#[derive(Debug, Clone, Copy)]
pub struct DarknetHeader {
    pub major: i32,
    pub minor: i32,
    pub revision: i32,
    pub seen: i32,
}

/// Counted reader over a Darknet weight stream.
///
/// Tracks how many bytes have been consumed so the caller can verify the
/// file was read exactly to the end.
pub struct WeightReader<R: Read> {
    inner: R,
    consumed: usize,
}

impl WeightReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> WeightReader<R> {
    pub fn new(inner: R) -> Self {
        WeightReader { inner, consumed: 0 }
    }

    pub fn bytes_consumed(&self) -> usize {
        self.consumed
    }

    fn read_bytes(&mut self, buf: &mut [u8], what: &'static str) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                ConvertError::TruncatedFile {
                    what,
                    needed: buf.len(),
                }
            } else {
                ConvertError::Io(e)
            }
        })?;
        self.consumed += buf.len();
        Ok(())
    }

    /// Read the 5-word header.
    pub fn read_header(&mut self) -> Result<DarknetHeader> {
        let mut buf = [0u8; 20];
        self.read_bytes(&mut buf, "header")?;
        let word = |i: usize| i32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        // The fifth word pads `seen` to 64 bits in newer Darknet versions;
        // it is consumed with the rest and ignored.
        Ok(DarknetHeader {
            major: word(0),
            minor: word(4),
            revision: word(8),
            seen: word(12),
        })
    }

    /// Read `count` little-endian f32 values.
    pub fn read_f32s(&mut self, count: usize, what: &'static str) -> Result<Vec<f32>> {
        let mut buf = vec![0u8; count * 4];
        self.read_bytes(&mut buf, what)?;
        Ok(buf
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Verify the stream is exhausted and return the total bytes consumed.
    ///
    /// Trailing bytes mean the layer walk and the file disagree; that is a
    /// hard error because every preceding assignment is then suspect.
    pub fn finish(mut self) -> Result<usize> {
        let mut rest = Vec::new();
        self.inner.read_to_end(&mut rest)?;
        if !rest.is_empty() {
            return Err(ConvertError::TrailingData { extra: rest.len() });
        }
        Ok(self.consumed)
    }
}

/// Replace a tensor's contents, keeping its constructed shape.
fn assign(tensor: &Tensor, data: Vec<f32>) -> Result<()> {
    let mut t = tensor.borrow_mut();
    let elements = t.numel();
    if data.len() != elements {
        return Err(ConvertError::ShapeDataMismatch {
            shape: t.shape.clone(),
            elements,
            len: data.len(),
        });
    }
    t.data = data;
    Ok(())
}

/// Split a raw batch-norm block into (gamma, beta, mean, variance).
///
/// Darknet stores the four per-channel vectors as (beta, gamma, mean,
/// variance); the first two swap places in the target layout.
fn reorder_batch_norm(raw: &[f32], filters: usize) -> [Vec<f32>; 4] {
    let row = |i: usize| raw[i * filters..(i + 1) * filters].to_vec();
    [row(1), row(0), row(2), row(3)]
}

/// Read one convolution block's parameters and assign them in place.
fn load_conv_block<R: Read>(
    reader: &mut WeightReader<R>,
    name: &str,
    block: &DarknetConv,
) -> Result<()> {
    let filters = block.filters();
    let size = block.kernel_size();
    let in_dim = block.in_channels();

    info!(
        "{} {}",
        name,
        if block.batch_norm().is_some() {
            "bn"
        } else {
            "bias"
        }
    );

    match block.batch_norm() {
        Some(bn) => {
            let raw = reader.read_f32s(4 * filters, "batch norm parameters")?;
            let [gamma, beta, mean, var] = reorder_batch_norm(&raw, filters);
            assign(bn.gamma(), gamma)?;
            assign(bn.beta(), beta)?;
            assign(bn.running_mean(), mean)?;
            assign(bn.running_var(), var)?;
        }
        None => {
            let bias = reader.read_f32s(filters, "conv bias")?;
            let bias_tensor = block.conv().bias().ok_or_else(|| {
                ConvertError::InvalidParameter(format!(
                    "{name} has neither batch norm nor bias"
                ))
            })?;
            assign(bias_tensor, bias)?;
        }
    }

    // Kernel arrives as (out, in, h, w); the model wants (h, w, in, out).
    let count = filters * in_dim * size * size;
    let raw = reader.read_f32s(count, "conv weights")?;
    let darknet_kernel = RawTensor::new(raw, &[filters, in_dim, size, size]);
    let kernel = RawTensor::permute(&darknet_kernel, &[2, 3, 1, 0]);
    let data = kernel.borrow().data.clone();
    assign(block.conv().weight(), data)
}

/// Walk an ordered list of named convolution blocks, assigning each one's
/// parameters from the reader.
pub fn load_weights<R: Read>(
    reader: &mut WeightReader<R>,
    blocks: &[(String, &DarknetConv)],
) -> Result<()> {
    for (name, block) in blocks {
        load_conv_block(reader, name, block)?;
    }
    Ok(())
}

/// Populate a YOLOv3 model from a Darknet weight file.
///
/// The file must contain exactly the blocks the model's conversion order
/// names, nothing more and nothing less.
pub fn load_darknet_weights<P: AsRef<Path>>(model: &YoloV3, path: P) -> Result<()> {
    let mut reader = WeightReader::open(path)?;
    let header = reader.read_header()?;
    debug!(
        "weight file version {}.{}.{}, {} images seen",
        header.major, header.minor, header.revision, header.seen
    );

    load_weights(&mut reader, &model.conversion_order())?;

    let total = reader.finish()?;
    debug!("consumed {total} bytes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yolo::DarknetConv;
    use std::io::Cursor;

    /// Serialize a header plus per-block floats the way Darknet writes them.
    fn build_file(blocks: &[(&DarknetConv, &[f32])]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for word in [0i32, 2, 0, 32013312, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        for (_, floats) in blocks {
            for v in *floats {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        bytes
    }

    fn bias_conv_floats(block: &DarknetConv, seed: f32) -> Vec<f32> {
        let n = block.filters()
            + block.filters() * block.in_channels() * block.kernel_size() * block.kernel_size();
        (0..n).map(|i| seed + i as f32).collect()
    }

    #[test]
    fn test_header_parse() {
        let block = DarknetConv::new(1, 1, 1, 1, false);
        let floats = bias_conv_floats(&block, 0.0);
        let bytes = build_file(&[(&block, &floats)]);

        let mut reader = WeightReader::new(Cursor::new(bytes));
        let header = reader.read_header().unwrap();
        assert_eq!(header.major, 0);
        assert_eq!(header.minor, 2);
        assert_eq!(header.seen, 32013312);
        assert_eq!(reader.bytes_consumed(), 20);
    }

    #[test]
    fn test_consumes_exact_byte_count() {
        let block = DarknetConv::new(2, 4, 3, 1, true);
        let n = 4 * 4 + 4 * 2 * 9;
        let floats: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let bytes = build_file(&[(&block, &floats)]);
        let expected = bytes.len();

        let mut reader = WeightReader::new(Cursor::new(bytes));
        reader.read_header().unwrap();
        load_weights(&mut reader, &[("test.conv_0".to_string(), &block)]).unwrap();
        let consumed = reader.finish().unwrap();
        assert_eq!(consumed, expected);
        assert_eq!(consumed, 20 + n * 4);
    }

    #[test]
    fn test_batch_norm_reorder_is_index_swap() {
        let filters = 3;
        // Rows: beta, gamma, mean, variance.
        let raw: Vec<f32> = (0..4 * filters).map(|i| i as f32).collect();
        let [gamma, beta, mean, var] = reorder_batch_norm(&raw, filters);
        assert_eq!(gamma, vec![3.0, 4.0, 5.0]); // was row 1
        assert_eq!(beta, vec![0.0, 1.0, 2.0]); // was row 0
        assert_eq!(mean, vec![6.0, 7.0, 8.0]);
        assert_eq!(var, vec![9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_batch_norm_values_land_in_layer() {
        let block = DarknetConv::new(1, 2, 1, 1, true);
        // beta=[10,11] gamma=[20,21] mean=[30,31] var=[40,41], then 2 kernel taps.
        let floats = vec![10.0, 11.0, 20.0, 21.0, 30.0, 31.0, 40.0, 41.0, 1.0, 2.0];
        let bytes = build_file(&[(&block, &floats)]);

        let mut reader = WeightReader::new(Cursor::new(bytes));
        reader.read_header().unwrap();
        load_weights(&mut reader, &[("t.conv_0".to_string(), &block)]).unwrap();
        reader.finish().unwrap();

        let bn = block.batch_norm().unwrap();
        assert_eq!(bn.gamma().borrow().data, vec![20.0, 21.0]);
        assert_eq!(bn.beta().borrow().data, vec![10.0, 11.0]);
        assert_eq!(bn.running_mean().borrow().data, vec![30.0, 31.0]);
        assert_eq!(bn.running_var().borrow().data, vec![40.0, 41.0]);
    }

    #[test]
    fn test_kernel_permuted_to_channel_last() {
        // 2 filters, 3 input channels, 2x2 kernel, bias block.
        let block = DarknetConv::new(3, 2, 2, 1, false);
        let (o, i, k) = (2usize, 3usize, 2usize);
        let kernel: Vec<f32> = (0..o * i * k * k).map(|v| v as f32).collect();
        let mut floats = vec![0.0; o]; // bias
        floats.extend_from_slice(&kernel);
        let bytes = build_file(&[(&block, &floats)]);

        let mut reader = WeightReader::new(Cursor::new(bytes));
        reader.read_header().unwrap();
        load_weights(&mut reader, &[("t.conv_0".to_string(), &block)]).unwrap();
        reader.finish().unwrap();

        let weight = block.conv().weight().borrow();
        assert_eq!(weight.shape, vec![k, k, i, o]);
        // result[y,x,ci,co] == source[co,ci,y,x]
        for co in 0..o {
            for ci in 0..i {
                for y in 0..k {
                    for x in 0..k {
                        let src = ((co * i + ci) * k + y) * k + x;
                        assert_eq!(weight.at(&[y, x, ci, co]), kernel[src]);
                    }
                }
            }
        }
    }

    #[test]
    fn test_truncated_file_errors_early() {
        let block = DarknetConv::new(2, 4, 3, 1, true);
        let floats: Vec<f32> = (0..10).map(|i| i as f32).collect(); // far too short
        let bytes = build_file(&[(&block, &floats)]);

        let mut reader = WeightReader::new(Cursor::new(bytes));
        reader.read_header().unwrap();
        let err = load_weights(&mut reader, &[("t.conv_0".to_string(), &block)]).unwrap_err();
        assert!(matches!(err, ConvertError::TruncatedFile { .. }));
    }

    #[test]
    fn test_trailing_bytes_fail_finish() {
        let block = DarknetConv::new(1, 1, 1, 1, false);
        let floats = bias_conv_floats(&block, 0.0);
        let mut bytes = build_file(&[(&block, &floats)]);
        bytes.extend_from_slice(&[0xAB; 7]);

        let mut reader = WeightReader::new(Cursor::new(bytes));
        reader.read_header().unwrap();
        load_weights(&mut reader, &[("t.conv_0".to_string(), &block)]).unwrap();
        let err = reader.finish().unwrap_err();
        assert!(matches!(err, ConvertError::TrailingData { extra: 7 }));
    }

    #[test]
    fn test_truncated_header() {
        let mut reader = WeightReader::new(Cursor::new(vec![0u8; 12]));
        let err = reader.read_header().unwrap_err();
        assert!(matches!(
            err,
            ConvertError::TruncatedFile { what: "header", .. }
        ));
    }
}
