//! YOLOv3 model graph, channel-last.
//!
//! The structure mirrors the network the Darknet weight file was trained
//! on: a Darknet-53 backbone followed by three detection head groups with
//! upsample + concat routing between scales. The fixed weight-file
//! traversal lives in [`YoloV3::conversion_order`]; every convolution the
//! file contains appears there exactly once, in file order.

use crate::io::StateDict;
use crate::nn::{
    concat_channels, extend_state, sub_state, BatchNorm2d, Conv2d, LeakyReLU, Module, Upsample2d,
};
use crate::tensor::{RawTensor, Tensor};

/// Anchor boxes per output scale.
pub const ANCHORS_PER_SCALE: usize = 3;

/// Box coordinates + objectness per anchor, before class scores.
pub const BOX_PARAMS: usize = 5;

/// Sub-module names in weight-file order. This order must match the order
/// the original training framework wrote the file in; changing it silently
/// corrupts every layer that follows.
pub const SUB_MODULES: [&str; 7] = [
    "darknet-53",
    "yolo_conv_0",
    "yolo_output_0",
    "yolo_conv_1",
    "yolo_output_1",
    "yolo_conv_2",
    "yolo_output_2",
];

// ===== BUILDING BLOCKS =====

/// Darknet's standard convolution block: conv, then batch norm + leaky
/// ReLU, or a plain bias when `batch_norm` is false.
///
/// Coupling the conv and its normalization in one struct makes the
/// weight-file layout a property of the block: a block with batch norm
/// stores 4*filters normalization floats, one without stores `filters`
/// bias floats, and both are followed by the kernel.
pub struct DarknetConv {
    conv: Conv2d,
    bn: Option<BatchNorm2d>,
    act: Option<LeakyReLU>,
}

impl DarknetConv {
    pub fn new(in_ch: usize, filters: usize, size: usize, stride: usize, batch_norm: bool) -> Self {
        let conv = Conv2d::new(in_ch, filters, size, stride, !batch_norm);
        let bn = batch_norm.then(|| BatchNorm2d::new(filters));
        let act = batch_norm.then(|| LeakyReLU::new(0.1));
        DarknetConv { conv, bn, act }
    }

    pub fn conv(&self) -> &Conv2d {
        &self.conv
    }

    pub fn batch_norm(&self) -> Option<&BatchNorm2d> {
        self.bn.as_ref()
    }

    pub fn filters(&self) -> usize {
        self.conv.filters()
    }

    pub fn kernel_size(&self) -> usize {
        self.conv.kernel_size()
    }

    pub fn in_channels(&self) -> usize {
        self.conv.in_channels()
    }
}

impl Module for DarknetConv {
    fn forward(&self, x: &Tensor) -> Tensor {
        let mut y = self.conv.forward(x);
        if let Some(ref bn) = self.bn {
            y = bn.forward(&y);
        }
        if let Some(ref act) = self.act {
            y = act.forward(&y);
        }
        y
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = self.conv.parameters();
        if let Some(ref bn) = self.bn {
            p.extend(bn.parameters());
        }
        p
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        extend_state(&mut state, "conv", self.conv.state_dict());
        if let Some(ref bn) = self.bn {
            extend_state(&mut state, "bn", bn.state_dict());
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        self.conv.load_state_dict(&sub_state(state, "conv"));
        if let Some(ref mut bn) = self.bn {
            bn.load_state_dict(&sub_state(state, "bn"));
        }
    }
}

/// 1x1 squeeze + 3x3 expand with a skip connection around both.
pub struct DarknetResidual {
    conv_0: DarknetConv,
    conv_1: DarknetConv,
}

impl DarknetResidual {
    pub fn new(filters: usize) -> Self {
        DarknetResidual {
            conv_0: DarknetConv::new(filters, filters / 2, 1, 1, true),
            conv_1: DarknetConv::new(filters / 2, filters, 3, 1, true),
        }
    }

    fn conv_blocks(&self) -> [&DarknetConv; 2] {
        [&self.conv_0, &self.conv_1]
    }
}

impl Module for DarknetResidual {
    fn forward(&self, x: &Tensor) -> Tensor {
        let y = self.conv_1.forward(&self.conv_0.forward(x));
        RawTensor::add(x, &y)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = self.conv_0.parameters();
        p.extend(self.conv_1.parameters());
        p
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        extend_state(&mut state, "conv_0", self.conv_0.state_dict());
        extend_state(&mut state, "conv_1", self.conv_1.state_dict());
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        self.conv_0.load_state_dict(&sub_state(state, "conv_0"));
        self.conv_1.load_state_dict(&sub_state(state, "conv_1"));
    }
}

/// One backbone stage: a 3x3 stride-2 downsample conv followed by a run
/// of residual blocks at the new resolution.
pub struct DarknetBlock {
    down: DarknetConv,
    residuals: Vec<DarknetResidual>,
}

impl DarknetBlock {
    pub fn new(in_ch: usize, filters: usize, repeats: usize) -> Self {
        DarknetBlock {
            down: DarknetConv::new(in_ch, filters, 3, 2, true),
            residuals: (0..repeats).map(|_| DarknetResidual::new(filters)).collect(),
        }
    }

    fn conv_blocks(&self) -> Vec<&DarknetConv> {
        let mut blocks = vec![&self.down];
        for res in &self.residuals {
            blocks.extend(res.conv_blocks());
        }
        blocks
    }
}

impl Module for DarknetBlock {
    fn forward(&self, x: &Tensor) -> Tensor {
        let mut y = self.down.forward(x);
        for res in &self.residuals {
            y = res.forward(&y);
        }
        y
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = self.down.parameters();
        for res in &self.residuals {
            p.extend(res.parameters());
        }
        p
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        extend_state(&mut state, "down", self.down.state_dict());
        for (i, res) in self.residuals.iter().enumerate() {
            extend_state(&mut state, &format!("res_{i}"), res.state_dict());
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        self.down.load_state_dict(&sub_state(state, "down"));
        for (i, res) in self.residuals.iter_mut().enumerate() {
            res.load_state_dict(&sub_state(state, &format!("res_{i}")));
        }
    }
}

// ===== BACKBONE =====

/// Darknet-53 feature extractor.
///
/// Returns the 256- and 512-channel stage outputs alongside the final
/// feature map; the detection heads concat back into them.
pub struct Darknet53 {
    conv_0: DarknetConv,
    blocks: Vec<DarknetBlock>,
}

impl Darknet53 {
    pub fn new() -> Self {
        Darknet53 {
            conv_0: DarknetConv::new(3, 32, 3, 1, true),
            blocks: vec![
                DarknetBlock::new(32, 64, 1),
                DarknetBlock::new(64, 128, 2),
                DarknetBlock::new(128, 256, 8),
                DarknetBlock::new(256, 512, 8),
                DarknetBlock::new(512, 1024, 4),
            ],
        }
    }

    /// Forward pass returning (route_256, route_512, features).
    pub fn forward(&self, x: &Tensor) -> (Tensor, Tensor, Tensor) {
        let mut y = self.conv_0.forward(x);
        y = self.blocks[0].forward(&y);
        y = self.blocks[1].forward(&y);
        let route_36 = self.blocks[2].forward(&y);
        let route_61 = self.blocks[3].forward(&route_36);
        let out = self.blocks[4].forward(&route_61);
        (route_36, route_61, out)
    }

    fn conv_blocks(&self) -> Vec<&DarknetConv> {
        let mut blocks = vec![&self.conv_0];
        for b in &self.blocks {
            blocks.extend(b.conv_blocks());
        }
        blocks
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = self.conv_0.parameters();
        for b in &self.blocks {
            p.extend(b.parameters());
        }
        p
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        extend_state(&mut state, "conv_0", self.conv_0.state_dict());
        for (i, b) in self.blocks.iter().enumerate() {
            extend_state(&mut state, &format!("block_{i}"), b.state_dict());
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        self.conv_0.load_state_dict(&sub_state(state, "conv_0"));
        for (i, b) in self.blocks.iter_mut().enumerate() {
            b.load_state_dict(&sub_state(state, &format!("block_{i}")));
        }
    }
}

impl Default for Darknet53 {
    fn default() -> Self {
        Self::new()
    }
}

// ===== DETECTION HEADS =====

/// Head trunk: optionally squeeze + upsample + concat a skip route, then
/// five alternating 1x1/3x3 convolutions.
pub struct YoloConv {
    route: Option<(DarknetConv, Upsample2d)>,
    convs: Vec<DarknetConv>,
}

impl YoloConv {
    /// Trunk fed directly from the backbone output.
    pub fn new(in_ch: usize, filters: usize) -> Self {
        YoloConv {
            route: None,
            convs: Self::trunk(in_ch, filters),
        }
    }

    /// Trunk that first squeezes to `filters`, upsamples 2x, and concats
    /// with a `skip_ch`-channel route from the backbone.
    pub fn with_route(in_ch: usize, skip_ch: usize, filters: usize) -> Self {
        YoloConv {
            route: Some((
                DarknetConv::new(in_ch, filters, 1, 1, true),
                Upsample2d::new(2),
            )),
            convs: Self::trunk(filters + skip_ch, filters),
        }
    }

    fn trunk(in_ch: usize, filters: usize) -> Vec<DarknetConv> {
        vec![
            DarknetConv::new(in_ch, filters, 1, 1, true),
            DarknetConv::new(filters, filters * 2, 3, 1, true),
            DarknetConv::new(filters * 2, filters, 1, 1, true),
            DarknetConv::new(filters, filters * 2, 3, 1, true),
            DarknetConv::new(filters * 2, filters, 1, 1, true),
        ]
    }

    /// # Panics
    /// Panics if a skip tensor is supplied to a trunk without a route
    /// (or withheld from one that has it).
    pub fn forward(&self, x: &Tensor, skip: Option<&Tensor>) -> Tensor {
        let mut y = match (&self.route, skip) {
            (None, None) => x.clone(),
            (Some((squeeze, upsample)), Some(skip)) => {
                let squeezed = upsample.forward(&squeeze.forward(x));
                concat_channels(&squeezed, skip)
            }
            _ => panic!("Skip route presence must match the trunk shape"),
        };
        for conv in &self.convs {
            y = conv.forward(&y);
        }
        y
    }

    fn conv_blocks(&self) -> Vec<&DarknetConv> {
        let mut blocks = Vec::new();
        if let Some((squeeze, _)) = &self.route {
            blocks.push(squeeze);
        }
        blocks.extend(self.convs.iter());
        blocks
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = Vec::new();
        if let Some((squeeze, _)) = &self.route {
            p.extend(squeeze.parameters());
        }
        for conv in &self.convs {
            p.extend(conv.parameters());
        }
        p
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        if let Some((squeeze, _)) = &self.route {
            extend_state(&mut state, "route", squeeze.state_dict());
        }
        for (i, conv) in self.convs.iter().enumerate() {
            extend_state(&mut state, &format!("conv_{i}"), conv.state_dict());
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        if let Some((squeeze, _)) = &mut self.route {
            squeeze.load_state_dict(&sub_state(state, "route"));
        }
        for (i, conv) in self.convs.iter_mut().enumerate() {
            conv.load_state_dict(&sub_state(state, &format!("conv_{i}")));
        }
    }
}

/// Head output: a 3x3 expand conv and the linear 1x1 prediction conv.
///
/// The prediction conv is the only kind of layer in the network without
/// batch norm; its per-filter bias comes straight from the weight file.
pub struct YoloOutput {
    conv_0: DarknetConv,
    conv_1: DarknetConv,
}

impl YoloOutput {
    pub fn new(filters: usize, classes: usize) -> Self {
        let predictions = ANCHORS_PER_SCALE * (classes + BOX_PARAMS);
        YoloOutput {
            conv_0: DarknetConv::new(filters, filters * 2, 3, 1, true),
            conv_1: DarknetConv::new(filters * 2, predictions, 1, 1, false),
        }
    }

    fn conv_blocks(&self) -> [&DarknetConv; 2] {
        [&self.conv_0, &self.conv_1]
    }
}

impl Module for YoloOutput {
    fn forward(&self, x: &Tensor) -> Tensor {
        self.conv_1.forward(&self.conv_0.forward(x))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = self.conv_0.parameters();
        p.extend(self.conv_1.parameters());
        p
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        extend_state(&mut state, "conv_0", self.conv_0.state_dict());
        extend_state(&mut state, "conv_1", self.conv_1.state_dict());
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        self.conv_0.load_state_dict(&sub_state(state, "conv_0"));
        self.conv_1.load_state_dict(&sub_state(state, "conv_1"));
    }
}

// ===== FULL MODEL =====

/// YOLOv3 detector parameterized only by class count.
pub struct YoloV3 {
    classes: usize,
    darknet: Darknet53,
    yolo_conv_0: YoloConv,
    yolo_output_0: YoloOutput,
    yolo_conv_1: YoloConv,
    yolo_output_1: YoloOutput,
    yolo_conv_2: YoloConv,
    yolo_output_2: YoloOutput,
}

impl YoloV3 {
    pub fn new(classes: usize) -> Self {
        YoloV3 {
            classes,
            darknet: Darknet53::new(),
            yolo_conv_0: YoloConv::new(1024, 512),
            yolo_output_0: YoloOutput::new(512, classes),
            yolo_conv_1: YoloConv::with_route(512, 512, 256),
            yolo_output_1: YoloOutput::new(256, classes),
            yolo_conv_2: YoloConv::with_route(256, 256, 128),
            yolo_output_2: YoloOutput::new(128, classes),
        }
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    /// Raw prediction maps at the three scales, coarsest first.
    pub fn forward(&self, x: &Tensor) -> [Tensor; 3] {
        let (route_36, route_61, features) = self.darknet.forward(x);
        let x0 = self.yolo_conv_0.forward(&features, None);
        let out_0 = self.yolo_output_0.forward(&x0);
        let x1 = self.yolo_conv_1.forward(&x0, Some(&route_61));
        let out_1 = self.yolo_output_1.forward(&x1);
        let x2 = self.yolo_conv_2.forward(&x1, Some(&route_36));
        let out_2 = self.yolo_output_2.forward(&x2);
        [out_0, out_1, out_2]
    }

    /// Every convolution block in weight-file order, named
    /// `submodule.conv_N`. This is the single place the file layout is
    /// defined; the loader walks it front to back.
    pub fn conversion_order(&self) -> Vec<(String, &DarknetConv)> {
        let groups: [(&str, Vec<&DarknetConv>); 7] = [
            (SUB_MODULES[0], self.darknet.conv_blocks()),
            (SUB_MODULES[1], self.yolo_conv_0.conv_blocks()),
            (SUB_MODULES[2], self.yolo_output_0.conv_blocks().to_vec()),
            (SUB_MODULES[3], self.yolo_conv_1.conv_blocks()),
            (SUB_MODULES[4], self.yolo_output_1.conv_blocks().to_vec()),
            (SUB_MODULES[5], self.yolo_conv_2.conv_blocks()),
            (SUB_MODULES[6], self.yolo_output_2.conv_blocks().to_vec()),
        ];

        let mut order = Vec::new();
        for (name, blocks) in groups {
            for (i, block) in blocks.into_iter().enumerate() {
                order.push((format!("{name}.conv_{i}"), block));
            }
        }
        order
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        let mut p = self.darknet.parameters();
        p.extend(self.yolo_conv_0.parameters());
        p.extend(self.yolo_output_0.parameters());
        p.extend(self.yolo_conv_1.parameters());
        p.extend(self.yolo_output_1.parameters());
        p.extend(self.yolo_conv_2.parameters());
        p.extend(self.yolo_output_2.parameters());
        p
    }

    pub fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        extend_state(&mut state, SUB_MODULES[0], self.darknet.state_dict());
        extend_state(&mut state, SUB_MODULES[1], self.yolo_conv_0.state_dict());
        extend_state(&mut state, SUB_MODULES[2], self.yolo_output_0.state_dict());
        extend_state(&mut state, SUB_MODULES[3], self.yolo_conv_1.state_dict());
        extend_state(&mut state, SUB_MODULES[4], self.yolo_output_1.state_dict());
        extend_state(&mut state, SUB_MODULES[5], self.yolo_conv_2.state_dict());
        extend_state(&mut state, SUB_MODULES[6], self.yolo_output_2.state_dict());
        state
    }

    pub fn load_state_dict(&mut self, state: &StateDict) {
        self.darknet.load_state_dict(&sub_state(state, SUB_MODULES[0]));
        self.yolo_conv_0
            .load_state_dict(&sub_state(state, SUB_MODULES[1]));
        self.yolo_output_0
            .load_state_dict(&sub_state(state, SUB_MODULES[2]));
        self.yolo_conv_1
            .load_state_dict(&sub_state(state, SUB_MODULES[3]));
        self.yolo_output_1
            .load_state_dict(&sub_state(state, SUB_MODULES[4]));
        self.yolo_conv_2
            .load_state_dict(&sub_state(state, SUB_MODULES[5]));
        self.yolo_output_2
            .load_state_dict(&sub_state(state, SUB_MODULES[6]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Darknet float count for one conv block.
    fn block_floats(block: &DarknetConv) -> usize {
        let filters = block.filters();
        let kernel = filters * block.in_channels() * block.kernel_size() * block.kernel_size();
        let head = if block.batch_norm().is_some() {
            4 * filters
        } else {
            filters
        };
        head + kernel
    }

    #[test]
    fn test_conversion_order_shape() {
        let model = YoloV3::new(80);
        let order = model.conversion_order();
        assert_eq!(order.len(), 75);

        // First block is the 3->32 stem conv.
        let (name, first) = &order[0];
        assert_eq!(name, "darknet-53.conv_0");
        assert_eq!(first.in_channels(), 3);
        assert_eq!(first.filters(), 32);
        assert_eq!(first.kernel_size(), 3);

        // Only the three prediction convs lack batch norm.
        let no_bn: Vec<&str> = order
            .iter()
            .filter(|(_, b)| b.batch_norm().is_none())
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(
            no_bn,
            vec![
                "yolo_output_0.conv_1",
                "yolo_output_1.conv_1",
                "yolo_output_2.conv_1"
            ]
        );

        // Prediction convs are 1x1 with 3*(classes+5) filters.
        let (_, last) = order.last().unwrap();
        assert_eq!(last.filters(), 3 * (80 + 5));
        assert_eq!(last.kernel_size(), 1);
    }

    #[test]
    fn test_weight_file_float_count_matches_reference() {
        // The released yolov3.weights (80 classes) is 248,007,048 bytes:
        // a 20-byte header plus 62,001,757 f32 values.
        let model = YoloV3::new(80);
        let total: usize = model
            .conversion_order()
            .iter()
            .map(|(_, b)| block_floats(b))
            .sum();
        assert_eq!(total, 62_001_757);
    }

    #[test]
    fn test_state_dict_covers_all_params() {
        let model = YoloV3::new(1);
        let state = model.state_dict();
        // 72 batch-normed blocks: weight + gamma/beta/mean/var = 5 entries.
        // 3 prediction blocks: weight + bias = 2 entries.
        assert_eq!(state.len(), 72 * 5 + 3 * 2);
        assert!(state.contains_key("darknet-53.conv_0.conv.weight"));
        assert!(state.contains_key("darknet-53.block_4.res_3.conv_1.bn.gamma"));
        assert!(state.contains_key("yolo_output_2.conv_1.conv.bias"));
    }

    #[test]
    fn test_residual_preserves_shape() {
        let res = DarknetResidual::new(4);
        let x = RawTensor::rand(&[1, 2, 2, 4]);
        let y = res.forward(&x);
        assert_eq!(y.borrow().shape, vec![1, 2, 2, 4]);
    }

    #[test]
    fn test_yolo_conv_route_concat() {
        // Squeeze 8 -> 4, upsample 2x, concat with a 6-channel skip.
        let head = YoloConv::with_route(8, 6, 4);
        let x = RawTensor::rand(&[1, 2, 2, 8]);
        let skip = RawTensor::rand(&[1, 4, 4, 6]);
        let y = head.forward(&x, Some(&skip));
        assert_eq!(y.borrow().shape, vec![1, 4, 4, 4]);
    }

    #[test]
    fn test_yolo_output_prediction_channels() {
        let head = YoloOutput::new(4, 2);
        let x = RawTensor::rand(&[1, 2, 2, 4]);
        let y = head.forward(&x);
        assert_eq!(y.borrow().shape, vec![1, 2, 2, 3 * (2 + 5)]);
    }

    #[test]
    #[should_panic(expected = "Skip route presence must match")]
    fn test_yolo_conv_rejects_missing_skip() {
        let head = YoloConv::with_route(8, 6, 4);
        let x = RawTensor::rand(&[1, 2, 2, 8]);
        head.forward(&x, None);
    }
}
