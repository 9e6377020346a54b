//! Reference engine: a stack of fully-connected layers over f32 tensors.
//!
//! Model file layout (little-endian):
//!
//! ```text
//! "SWNM" | version u8 | layer_count u8 | input_width u16
//! per layer: op u8 | activation u8 | width u16
//!            | weights f32[width * inputs] (row-major) | bias f32[width]
//! ```
//!
//! `op` is always `FULLY_CONNECTED`; `activation` is 0 for none or an
//! [`Operator`] code. Tensors are planned back to back in the arena:
//! the input, then each layer's output.

use crate::engine::{
    EngineBuilder, InferenceEngine, OpResolver, Operator, ScratchArena, TensorRegion,
};
use crate::error::NodeError;

pub const MAGIC: &[u8; 4] = b"SWNM";
pub const FORMAT_VERSION: u8 = 1;
pub const MAX_LAYERS: usize = 8;

const LAYER_HEADER_LEN: usize = 4;
const F32_LEN: usize = 4;

struct DenseLayer {
    inputs: usize,
    width: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
    activation: Option<Operator>,
}

pub struct DenseEngine {
    layers: Vec<DenseLayer>,
    /// Input tensor followed by one output tensor per layer.
    tensors: Vec<TensorRegion>,
    bound: bool,
}

impl DenseEngine {
    pub fn parse(model: &[u8], resolver: &OpResolver) -> Result<Self, NodeError> {
        let mut cursor = Cursor { data: model, pos: 0 };

        if cursor.take(MAGIC.len())? != MAGIC {
            return Err(NodeError::InvalidModel("bad magic"));
        }
        if cursor.u8()? != FORMAT_VERSION {
            return Err(NodeError::InvalidModel("unsupported version"));
        }
        let layer_count = usize::from(cursor.u8()?);
        if layer_count == 0 || layer_count > MAX_LAYERS {
            return Err(NodeError::InvalidModel("bad layer count"));
        }
        let mut inputs = usize::from(cursor.u16()?);
        if inputs == 0 {
            return Err(NodeError::InvalidModel("zero input width"));
        }

        let mut layers = Vec::with_capacity(layer_count);
        let mut tensors = Vec::with_capacity(layer_count + 1);
        let mut offset = inputs * F32_LEN;
        tensors.push(TensorRegion { offset: 0, len: offset });

        for _ in 0..layer_count {
            let op = Operator::from_code(cursor.u8()?)
                .ok_or(NodeError::InvalidModel("unknown operator"))?;
            if op != Operator::FullyConnected {
                return Err(NodeError::InvalidModel("layer must be fully connected"));
            }
            resolver.require(op)?;

            let activation = match cursor.u8()? {
                0 => None,
                code => {
                    let act = Operator::from_code(code)
                        .ok_or(NodeError::InvalidModel("unknown activation"))?;
                    resolver.require(act)?;
                    Some(act)
                }
            };

            let width = usize::from(cursor.u16()?);
            if width == 0 {
                return Err(NodeError::InvalidModel("zero layer width"));
            }
            let weights = cursor.f32s(width * inputs)?;
            let bias = cursor.f32s(width)?;

            tensors.push(TensorRegion {
                offset,
                len: width * F32_LEN,
            });
            offset += width * F32_LEN;
            layers.push(DenseLayer {
                inputs,
                width,
                weights,
                bias,
                activation,
            });
            inputs = width;
        }

        if cursor.pos != model.len() {
            return Err(NodeError::InvalidModel("trailing bytes"));
        }

        Ok(Self {
            layers,
            tensors,
            bound: false,
        })
    }
}

impl InferenceEngine for DenseEngine {
    fn arena_required(&self) -> usize {
        self.tensors.last().map_or(0, TensorRegion::end)
    }

    fn allocate_tensors(&mut self, arena: &mut ScratchArena) -> Result<(), NodeError> {
        let required = self.arena_required();
        if arena.len() < required {
            return Err(NodeError::TensorAllocation {
                required,
                available: arena.len(),
            });
        }
        arena.as_mut_slice()[..required].fill(0);
        self.bound = true;
        Ok(())
    }

    fn input(&self) -> TensorRegion {
        self.tensors.first().copied().unwrap_or_default()
    }

    fn output(&self) -> TensorRegion {
        self.tensors.last().copied().unwrap_or_default()
    }

    fn invoke(&mut self, arena: &mut ScratchArena) -> Result<(), NodeError> {
        if !self.bound || arena.len() < self.arena_required() {
            return Err(NodeError::InferenceFailed("tensors not allocated".into()));
        }

        for (index, layer) in self.layers.iter().enumerate() {
            let src = self.tensors[index];
            let dst = self.tensors[index + 1];
            // Tensors are laid out in order, so the source lies wholly
            // before the destination.
            let (head, tail) = arena.as_mut_slice().split_at_mut(dst.offset);
            let src = &head[src.offset..src.end()];
            let dst = &mut tail[..dst.len];

            for row in 0..layer.width {
                let weights = &layer.weights[row * layer.inputs..(row + 1) * layer.inputs];
                let mut acc = layer.bias[row];
                for (k, w) in weights.iter().enumerate() {
                    acc += w * load_f32(src, k);
                }
                if let Some(act) = layer.activation {
                    acc = act.activate(acc);
                }
                if !acc.is_finite() {
                    return Err(NodeError::InferenceFailed(format!(
                        "non-finite activation in layer {index}"
                    )));
                }
                dst[row * F32_LEN..(row + 1) * F32_LEN].copy_from_slice(&acc.to_le_bytes());
            }
        }
        Ok(())
    }
}

fn load_f32(bytes: &[u8], index: usize) -> f32 {
    let at = index * F32_LEN;
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], NodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(NodeError::InvalidModel("truncated"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, NodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, NodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn f32s(&mut self, count: usize) -> Result<Vec<f32>, NodeError> {
        let len = count
            .checked_mul(F32_LEN)
            .ok_or(NodeError::InvalidModel("truncated"))?;
        let bytes = self.take(len)?;
        Ok((0..count).map(|i| load_f32(bytes, i)).collect())
    }
}

/// [`EngineBuilder`] for the dense model format.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseBuilder;

impl EngineBuilder for DenseBuilder {
    fn build(
        &self,
        model: &[u8],
        resolver: &OpResolver,
    ) -> Result<Box<dyn InferenceEngine>, NodeError> {
        Ok(Box::new(DenseEngine::parse(model, resolver)?))
    }
}

// ── Encoder ──────────────────────────────────────────────────────────

struct LayerSpec {
    width: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
    activation: Option<Operator>,
}

/// Encodes dense model files.
pub struct DenseModelBuilder {
    input_width: usize,
    layers: Vec<LayerSpec>,
}

impl DenseModelBuilder {
    pub fn new(input_width: usize) -> Self {
        Self {
            input_width,
            layers: Vec::new(),
        }
    }

    /// Append a layer. `weights` is row-major, `width` rows of the previous
    /// layer's width.
    pub fn layer(
        mut self,
        width: usize,
        weights: Vec<f32>,
        bias: Vec<f32>,
        activation: Option<Operator>,
    ) -> Self {
        self.layers.push(LayerSpec {
            width,
            weights,
            bias,
            activation,
        });
        self
    }

    /// Single `tanh` layer with pseudo-random weights scaled by fan-in.
    /// Same seed, same model.
    pub fn seeded_projection(input_width: usize, output_width: usize, seed: u32) -> Self {
        let mut state = match seed ^ 0x9E37_79B9 {
            0 => 1,
            s => s,
        };
        let scale = 1.0 / (input_width.max(1) as f32).sqrt();
        let mut next = move || {
            // xorshift32
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            ((state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0) * scale
        };
        let weights = (0..input_width * output_width).map(|_| next()).collect();
        let bias = (0..output_width).map(|_| next()).collect();
        Self::new(input_width).layer(output_width, weights, bias, Some(Operator::Tanh))
    }

    pub fn encode(&self) -> Result<Vec<u8>, NodeError> {
        if self.layers.is_empty() || self.layers.len() > MAX_LAYERS {
            return Err(NodeError::InvalidModel("bad layer count"));
        }
        let input_width =
            u16::try_from(self.input_width).map_err(|_| NodeError::InvalidModel("input too wide"))?;

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.push(self.layers.len() as u8);
        out.extend_from_slice(&input_width.to_le_bytes());

        let mut inputs = self.input_width;
        for layer in &self.layers {
            let width =
                u16::try_from(layer.width).map_err(|_| NodeError::InvalidModel("layer too wide"))?;
            if layer.weights.len() != layer.width * inputs || layer.bias.len() != layer.width {
                return Err(NodeError::InvalidModel("layer shape mismatch"));
            }
            out.reserve(LAYER_HEADER_LEN + (layer.weights.len() + layer.bias.len()) * F32_LEN);
            out.push(Operator::FullyConnected.code());
            out.push(layer.activation.map_or(0, Operator::code));
            out.extend_from_slice(&width.to_le_bytes());
            for v in layer.weights.iter().chain(&layer.bias) {
                out.extend_from_slice(&v.to_le_bytes());
            }
            inputs = layer.width;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn bytes_f32(bytes: &[u8]) -> Vec<f32> {
        (0..bytes.len() / F32_LEN).map(|i| load_f32(bytes, i)).collect()
    }

    fn run(engine: &mut DenseEngine, input: &[f32]) -> Result<Vec<f32>, NodeError> {
        let mut arena = ScratchArena::allocate(engine.arena_required()).unwrap();
        engine.allocate_tensors(&mut arena)?;
        arena
            .region_mut(engine.input())
            .unwrap()
            .copy_from_slice(&f32_bytes(input));
        engine.invoke(&mut arena)?;
        Ok(bytes_f32(arena.region(engine.output()).unwrap()))
    }

    #[test]
    fn two_layer_network_computes_expected_output() {
        // Layer 1: identity + bias, relu. Layer 2: sum of both inputs.
        let model = DenseModelBuilder::new(2)
            .layer(2, vec![1.0, 0.0, 0.0, 1.0], vec![1.0, -1.0], Some(Operator::Relu))
            .layer(1, vec![1.0, 1.0], vec![0.0], None)
            .encode()
            .unwrap();

        let mut engine = DenseEngine::parse(&model, &OpResolver::with_defaults()).unwrap();
        assert_eq!(engine.input().len, 8);
        assert_eq!(engine.output().len, 4);
        assert_eq!(engine.arena_required(), 4 * (2 + 2 + 1));

        // relu(2 + 1) + relu(0.5 - 1) = 3
        assert_eq!(run(&mut engine, &[2.0, 0.5]).unwrap(), vec![3.0]);
    }

    #[test]
    fn small_arena_fails_tensor_allocation() {
        let model = DenseModelBuilder::seeded_projection(64, 32, 7).encode().unwrap();
        let mut engine = DenseEngine::parse(&model, &OpResolver::with_defaults()).unwrap();

        let mut arena = ScratchArena::allocate(100).unwrap();
        assert_eq!(
            engine.allocate_tensors(&mut arena),
            Err(NodeError::TensorAllocation {
                required: 4 * (64 + 32),
                available: 100
            })
        );
        assert!(engine.invoke(&mut arena).is_err());
    }

    #[test]
    fn unregistered_activation_is_unsupported() {
        let model = DenseModelBuilder::seeded_projection(4, 2, 1).encode().unwrap();
        let mut resolver = OpResolver::new();
        resolver.add(Operator::FullyConnected).unwrap();

        assert_eq!(
            DenseEngine::parse(&model, &resolver).err(),
            Some(NodeError::UnsupportedOperator("TANH"))
        );
    }

    #[test]
    fn malformed_models_are_rejected() {
        let resolver = OpResolver::with_defaults();
        let model = DenseModelBuilder::seeded_projection(4, 2, 1).encode().unwrap();

        let mut bad_magic = model.clone();
        bad_magic[0] = b'X';
        assert_eq!(
            DenseEngine::parse(&bad_magic, &resolver).err(),
            Some(NodeError::InvalidModel("bad magic"))
        );
        assert_eq!(
            DenseEngine::parse(&model[..model.len() - 1], &resolver).err(),
            Some(NodeError::InvalidModel("truncated"))
        );
        let mut trailing = model.clone();
        trailing.push(0);
        assert_eq!(
            DenseEngine::parse(&trailing, &resolver).err(),
            Some(NodeError::InvalidModel("trailing bytes"))
        );
        assert!(DenseEngine::parse(&[], &resolver).is_err());
    }

    #[test]
    fn non_finite_output_fails_inference() {
        let model = DenseModelBuilder::new(1)
            .layer(1, vec![1.0], vec![f32::INFINITY], None)
            .encode()
            .unwrap();
        let mut engine = DenseEngine::parse(&model, &OpResolver::with_defaults()).unwrap();
        assert!(matches!(run(&mut engine, &[0.0]), Err(NodeError::InferenceFailed(_))));
    }

    #[test]
    fn seeded_projection_is_deterministic_and_bounded() {
        let a = DenseModelBuilder::seeded_projection(64, 32, 42).encode().unwrap();
        let b = DenseModelBuilder::seeded_projection(64, 32, 42).encode().unwrap();
        let c = DenseModelBuilder::seeded_projection(64, 32, 43).encode().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut engine = DenseEngine::parse(&a, &OpResolver::with_defaults()).unwrap();
        let input: Vec<f32> = (0..64).map(|i| i as f32 / 64.0).collect();
        let output = run(&mut engine, &input).unwrap();
        assert_eq!(output.len(), 32);
        assert!(output.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn encoder_checks_layer_shapes() {
        let result = DenseModelBuilder::new(3).layer(2, vec![0.0; 5], vec![0.0; 2], None).encode();
        assert_eq!(result, Err(NodeError::InvalidModel("layer shape mismatch")));
        assert!(DenseModelBuilder::new(3).encode().is_err());
    }
}
