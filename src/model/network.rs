use candle_core::{Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::config::{Activation, Wav2LetterConfig};
use crate::error::{Result, Wav2LetterError};
use crate::model::layers::{apply_activation, SameConv1d};

const WAVE_CONV_WIDTH: usize = 250;
const WAVE_CONV_STRIDE: usize = 160;
const STRIDING_CONV_WIDTH: usize = 48;
const STRIDING_CONV_STRIDE: usize = 2;
const INNER_CONV_COUNT: usize = 7;
const INNER_CONV_WIDTH: usize = 7;
const BIG_CONV_WIDTH: usize = 32;

/// One convolution of the stack. Dropout, when present, is applied to the
/// layer's input in training mode only.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub name: String,
    pub filter_count: usize,
    pub filter_width: usize,
    pub stride: usize,
    pub activation: Activation,
    pub dropout: Option<f32>,
    pub trainable: bool,
}

impl LayerSpec {
    pub fn new(
        name: impl Into<String>,
        filter_count: usize,
        filter_width: usize,
        stride: usize,
        activation: Activation,
    ) -> Self {
        Self {
            name: name.into(),
            filter_count,
            filter_width,
            stride,
            activation,
            dropout: None,
            trainable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSpec {
    input_size: usize,
    layers: Vec<LayerSpec>,
}

impl NetworkSpec {
    pub fn new(input_size: usize, layers: Vec<LayerSpec>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Wav2LetterError::configuration("network needs at least one layer"));
        }
        if let Some(bad) = layers
            .iter()
            .find(|l| l.filter_count == 0 || l.filter_width == 0 || l.stride == 0)
        {
            return Err(Wav2LetterError::configuration(format!(
                "layer {} has a zero filter count, width or stride",
                bad.name
            )));
        }
        Ok(Self { input_size, layers })
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Channels of the last layer, i.e. the grapheme set size.
    pub fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.filter_count).unwrap_or(0)
    }

    /// Factor by which the output is shorter than the input.
    pub fn total_stride(&self) -> usize {
        self.layers.iter().map(|l| l.stride).product()
    }

    pub fn frozen_layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().filter(|l| !l.trainable).map(|l| l.name.as_str())
    }
}

/// Lays out the wav2letter convolution stack for a given configuration.
#[derive(Debug, Clone)]
pub struct AcousticNetworkBuilder {
    input_size_per_time_step: usize,
    grapheme_set_size: usize,
    use_raw_wave_input: bool,
    activation: Activation,
    output_activation: Activation,
    dropout: Option<f32>,
    frozen_layer_count: usize,
    main_filter_count: usize,
    output_filter_count: usize,
}

impl AcousticNetworkBuilder {
    pub fn new(input_size_per_time_step: usize, grapheme_set_size: usize) -> Self {
        Self {
            input_size_per_time_step,
            grapheme_set_size,
            use_raw_wave_input: false,
            activation: Activation::Relu,
            output_activation: Activation::Softmax,
            dropout: None,
            frozen_layer_count: 0,
            main_filter_count: Wav2LetterConfig::DEFAULT_MAIN_FILTER_COUNT,
            output_filter_count: Wav2LetterConfig::DEFAULT_OUTPUT_FILTER_COUNT,
        }
    }

    pub fn from_config(config: &Wav2LetterConfig, grapheme_set_size: usize) -> Self {
        Self::new(config.input_size_per_time_step, grapheme_set_size)
            .with_raw_wave_input(config.use_raw_wave_input)
            .with_activations(config.activation, config.output_activation)
            .with_dropout(config.dropout)
            .with_frozen_layer_count(config.frozen_layer_count)
            .with_filter_counts(config.main_filter_count, config.output_filter_count)
    }

    pub fn with_raw_wave_input(mut self, use_raw_wave_input: bool) -> Self {
        self.use_raw_wave_input = use_raw_wave_input;
        self
    }

    pub fn with_activations(
        mut self,
        activation: Activation,
        output_activation: Activation,
    ) -> Self {
        self.activation = activation;
        self.output_activation = output_activation;
        self
    }

    pub fn with_dropout(mut self, dropout: Option<f32>) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_frozen_layer_count(mut self, frozen_layer_count: usize) -> Self {
        self.frozen_layer_count = frozen_layer_count;
        self
    }

    pub fn with_filter_counts(
        mut self,
        main_filter_count: usize,
        output_filter_count: usize,
    ) -> Self {
        self.main_filter_count = main_filter_count;
        self.output_filter_count = output_filter_count;
        self
    }

    pub fn spec(&self) -> Result<NetworkSpec> {
        let main = self.main_filter_count;
        let hidden = |name: String, width: usize, stride: usize| LayerSpec {
            dropout: self.dropout,
            ..LayerSpec::new(name, main, width, stride, self.activation)
        };

        let mut layers = Vec::with_capacity(INNER_CONV_COUNT + 5);
        if self.use_raw_wave_input {
            layers.push(hidden("wave_conv".to_string(), WAVE_CONV_WIDTH, WAVE_CONV_STRIDE));
        }
        layers.push(hidden(
            "striding_conv".to_string(),
            STRIDING_CONV_WIDTH,
            STRIDING_CONV_STRIDE,
        ));
        for i in 1..=INNER_CONV_COUNT {
            layers.push(hidden(format!("inner_conv_{i}"), INNER_CONV_WIDTH, 1));
        }
        // The output stage never gets dropout.
        let output = self.output_filter_count;
        layers.push(LayerSpec::new("big_conv_1", output, BIG_CONV_WIDTH, 1, self.activation));
        layers.push(LayerSpec::new("big_conv_2", output, 1, 1, self.activation));
        layers.push(LayerSpec::new(
            "output_conv",
            self.grapheme_set_size,
            1,
            1,
            self.output_activation,
        ));

        if self.frozen_layer_count > layers.len() {
            return Err(Wav2LetterError::configuration(format!(
                "cannot freeze {} of {} layers",
                self.frozen_layer_count,
                layers.len()
            )));
        }
        for layer in layers.iter_mut().take(self.frozen_layer_count) {
            layer.trainable = false;
        }

        NetworkSpec::new(self.input_size_per_time_step, layers)
    }

    pub fn build(&self, vb: VarBuilder) -> Result<AcousticNetwork> {
        AcousticNetwork::load(self.spec()?, vb)
            .map_err(|e| Wav2LetterError::runtime("build network", e))
    }
}

struct ConvLayer {
    spec: LayerSpec,
    conv: SameConv1d,
}

impl ConvLayer {
    fn load(in_c: usize, spec: LayerSpec, vb: VarBuilder) -> candle_core::Result<Self> {
        let conv = SameConv1d::load(
            in_c,
            spec.filter_count,
            spec.filter_width,
            spec.stride,
            vb.pp(&spec.name),
        )?;
        Ok(Self { spec, conv })
    }

    fn pre_activation(&self, xs: &Tensor, training: bool) -> candle_core::Result<Tensor> {
        match self.spec.dropout {
            Some(rate) if training && rate > 0.0 => {
                self.conv.forward(&candle_nn::ops::dropout(xs, rate)?)
            }
            _ => self.conv.forward(xs),
        }
    }
}

pub struct AcousticNetwork {
    spec: NetworkSpec,
    layers: Vec<ConvLayer>,
}

impl AcousticNetwork {
    pub(crate) fn load(spec: NetworkSpec, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(spec.layers().len());
        let mut in_c = spec.input_size();
        for layer in spec.layers() {
            layers.push(ConvLayer::load(in_c, layer.clone(), vb.clone())?);
            in_c = layer.filter_count;
        }
        Ok(Self { spec, layers })
    }

    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    pub fn total_stride(&self) -> usize {
        self.spec.total_stride()
    }

    pub fn output_activation(&self) -> Activation {
        self.spec.layers.last().map(|l| l.activation).unwrap_or(Activation::Linear)
    }

    /// (batch, time, features) -> (batch, time / stride, graphemes), before the
    /// output activation.
    pub fn forward_logits(&self, xs: &Tensor, training: bool) -> candle_core::Result<Tensor> {
        let mut h = xs.transpose(1, 2)?.contiguous()?;
        let last = self.layers.len().saturating_sub(1);
        for (index, layer) in self.layers.iter().enumerate() {
            h = layer.pre_activation(&h, training)?;
            if index != last {
                h = apply_activation(layer.spec.activation, &h)?;
            }
        }
        h.transpose(1, 2)?.contiguous()
    }

    /// Per-frame grapheme scores with the output activation applied.
    /// Dropout is active only when `training` is set.
    pub fn forward(&self, xs: &Tensor, training: bool) -> candle_core::Result<Tensor> {
        self.apply_output_activation(&self.forward_logits(xs, training)?)
    }

    /// Applies the output layer's activation to `(batch, time, graphemes)`.
    pub fn apply_output_activation(&self, logits: &Tensor) -> candle_core::Result<Tensor> {
        match self.output_activation() {
            Activation::Softmax => candle_nn::ops::softmax_last_dim(logits),
            other => {
                let h = apply_activation(other, &logits.transpose(1, 2)?)?;
                h.transpose(1, 2)?.contiguous()
            }
        }
    }

    /// Variables of the layers an optimizer may update.
    pub fn trainable_vars(&self, varmap: &VarMap) -> Result<Vec<Var>> {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| Wav2LetterError::runtime("lock parameters", e))?;
        let trainable_prefixes: Vec<String> = self
            .spec
            .layers()
            .iter()
            .filter(|l| l.trainable)
            .map(|l| format!("{}.", l.name))
            .collect();
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| trainable_prefixes.iter().any(|p| name.starts_with(p.as_str())))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars.into_iter().map(|(_, var)| var).collect())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    fn small_builder() -> AcousticNetworkBuilder {
        AcousticNetworkBuilder::new(4, 3).with_filter_counts(6, 8)
    }

    #[test]
    fn default_stack_layout() {
        let spec = AcousticNetworkBuilder::new(128, 29).spec().unwrap();
        let names: Vec<&str> = spec.layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names[0], "striding_conv");
        let inner: Vec<String> = (1..=7).map(|i| format!("inner_conv_{i}")).collect();
        assert_eq!(names[1..8].to_vec(), inner);
        assert_eq!(names[8..], ["big_conv_1", "big_conv_2", "output_conv"]);
        assert_eq!(spec.total_stride(), 2);
        assert_eq!(spec.output_size(), 29);
        assert_eq!(spec.layers()[0].filter_count, 250);
        assert_eq!(spec.layers()[8].filter_count, 2000);
        assert_eq!(spec.layers()[8].filter_width, 32);
        assert_eq!(spec.layers()[10].activation, Activation::Softmax);
    }

    #[test]
    fn raw_wave_input_prepends_wide_strided_conv() {
        let spec = AcousticNetworkBuilder::new(1, 29)
            .with_raw_wave_input(true)
            .spec()
            .unwrap();
        assert_eq!(spec.layers().len(), 12);
        assert_eq!(spec.layers()[0].name, "wave_conv");
        assert_eq!(spec.layers()[0].filter_width, 250);
        assert_eq!(spec.total_stride(), 320);
    }

    #[test]
    fn total_stride_is_product_of_strides() {
        let strides = [2, 1, 1, 1, 1, 1, 1, 1, 1, 32, 1, 1];
        let layers = strides
            .iter()
            .enumerate()
            .map(|(i, &s)| LayerSpec::new(format!("conv_{i}"), 4, 3, s, Activation::Relu))
            .collect();
        let spec = NetworkSpec::new(4, layers).unwrap();
        assert_eq!(spec.total_stride(), 64);
        assert_eq!(crate::batch::expected_output_lengths(&[640], spec.total_stride()), vec![10]);
    }

    #[test]
    fn dropout_skips_output_stage() {
        let spec = small_builder().with_dropout(Some(0.2)).spec().unwrap();
        let layers = spec.layers();
        assert!(layers[..layers.len() - 3].iter().all(|l| l.dropout == Some(0.2)));
        assert!(layers[layers.len() - 3..].iter().all(|l| l.dropout.is_none()));
    }

    #[test]
    fn frozen_layers_are_marked_from_the_front() {
        let spec = small_builder().with_frozen_layer_count(3).spec().unwrap();
        let frozen: Vec<&str> = spec.frozen_layer_names().collect();
        assert_eq!(frozen, ["striding_conv", "inner_conv_1", "inner_conv_2"]);
        assert!(small_builder().with_frozen_layer_count(11).spec().is_ok());
        assert!(matches!(
            small_builder().with_frozen_layer_count(12).spec(),
            Err(Wav2LetterError::Configuration { .. })
        ));
    }

    #[test]
    fn forward_shapes_and_probabilities() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = small_builder().build(vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 20, 4), &Device::Cpu).unwrap();
        let probs = network.forward(&xs, false).unwrap();
        assert_eq!(probs.dims3().unwrap(), (2, 10, 3));
        let sums: Vec<Vec<f32>> = probs.sum(2).unwrap().to_vec2().unwrap();
        for s in sums.iter().flatten() {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn inference_is_deterministic_with_dropout_configured() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = small_builder().with_dropout(Some(0.5)).build(vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (1, 16, 4), &Device::Cpu).unwrap();
        let run = || -> Vec<f32> {
            let probs = network.forward(&xs, false).unwrap();
            probs.flatten_all().unwrap().to_vec1().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn training_forward_applies_dropout() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = small_builder().with_dropout(Some(0.5)).build(vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (1, 16, 4), &Device::Cpu).unwrap();
        let run = |training: bool| -> Vec<f32> {
            let probs = network.forward(&xs, training).unwrap();
            probs.flatten_all().unwrap().to_vec1().unwrap()
        };
        assert_ne!(run(true), run(true));
        assert_ne!(run(true), run(false));
    }

    #[test]
    fn raw_wave_network_downsamples_by_320() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = AcousticNetworkBuilder::new(1, 3)
            .with_raw_wave_input(true)
            .with_filter_counts(4, 6)
            .build(vb)
            .unwrap();
        assert_eq!(network.total_stride(), 320);
        for k in [1, 3] {
            let xs = Tensor::randn(0f32, 1.0, (2, 640 * k, 1), &Device::Cpu).unwrap();
            let probs = network.forward(&xs, false).unwrap();
            assert_eq!(probs.dims3().unwrap(), (2, 2 * k, 3));
        }
    }

    #[test]
    fn trainable_vars_exclude_frozen_layers() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = small_builder().with_frozen_layer_count(2).build(vb).unwrap();
        let trainable = network.trainable_vars(&varmap).unwrap();
        // weight + bias for each of the 9 unfrozen layers
        assert_eq!(trainable.len(), 18);
        assert_eq!(varmap.all_vars().len(), 22);
    }
}
