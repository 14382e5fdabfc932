use candle_core::{Device, Result, Shape, Tensor};

/// Default PCG32 stream selector.
pub const DEFAULT_STREAM: u64 = 1442695040888963407;

/// Source of standard-Gaussian noise for one sampling call.
///
/// Implementors carry mutable generator state, so a source must not be shared
/// between concurrent sampling calls. Each call borrows its own source
/// mutably and advances it.
pub trait NoiseSource {
    /// Draw an `F32` tensor of i.i.d. N(0, 1) values with the given shape.
    fn standard_normal(&mut self, shape: &Shape, device: &Device) -> Result<Tensor>;
}

const PCG_MULTIPLIER: u64 = 6364136223846793005;
const F32_UNIT: f32 = 1.0 / (1u32 << 24) as f32;

/// PCG-XSH-RR generator: 64-bit LCG state, 32-bit output.
///
/// Normal draws use Box-Muller and consume two uniforms per pair of values,
/// so the stream for a given seed is fixed by the number of elements drawn.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    increment: u64,
}

impl Pcg32 {
    /// Generator for `seed` on `stream`. Different streams never overlap.
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            increment: (stream << 1) | 1,
        };
        rng.advance();
        rng.state = rng.state.wrapping_add(seed);
        rng.advance();
        rng
    }

    /// Generator on the default stream.
    pub fn seeded(seed: u64) -> Self {
        Self::new(seed, DEFAULT_STREAM)
    }

    /// Step the LCG and return the state it left.
    fn advance(&mut self) -> u64 {
        let old = self.state;
        self.state = old
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.increment);
        old
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.advance();
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        xorshifted.rotate_right((old >> 59) as u32)
    }

    /// Uniform in [0, 1) from the top 24 bits.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * F32_UNIT
    }

    /// Uniform in (0, 1); safe to take the log of.
    fn next_open_f32(&mut self) -> f32 {
        ((self.next_u32() >> 8) as f32 + 0.5) * F32_UNIT
    }

    /// Two independent N(0, 1) values.
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let radius = (-2.0 * self.next_open_f32().ln()).sqrt();
        let (sin, cos) = (std::f32::consts::TAU * self.next_f32()).sin_cos();
        (radius * cos, radius * sin)
    }

    /// Fill `out` with N(0, 1) values. An odd tail drops the second value of
    /// its pair.
    pub fn fill_normal(&mut self, out: &mut [f32]) {
        for pair in out.chunks_mut(2) {
            let (z0, z1) = self.next_gaussian();
            pair[0] = z0;
            if let Some(second) = pair.get_mut(1) {
                *second = z1;
            }
        }
    }

    /// `F32` tensor of N(0, 1) values.
    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let mut data = vec![0f32; shape.elem_count()];
        self.fill_normal(&mut data);
        Tensor::from_vec(data, shape, device)
    }
}

impl NoiseSource for Pcg32 {
    fn standard_normal(&mut self, shape: &Shape, device: &Device) -> Result<Tensor> {
        self.randn(shape.clone(), device)
    }
}

/// One independent generator per batch element.
///
/// Element `i` of every draw comes from generator `i` alone, so a batch drawn
/// with seeds `[a, b]` matches two single-element batches drawn with `[a]`
/// and `[b]`.
#[derive(Debug, Clone)]
pub struct PerSampleRng {
    rngs: Vec<Pcg32>,
}

impl PerSampleRng {
    pub fn from_seeds(seeds: &[u64]) -> Self {
        Self {
            rngs: seeds.iter().map(|&s| Pcg32::seeded(s)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rngs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rngs.is_empty()
    }
}

impl NoiseSource for PerSampleRng {
    fn standard_normal(&mut self, shape: &Shape, device: &Device) -> Result<Tensor> {
        let dims = shape.dims();
        if dims.first() != Some(&self.rngs.len()) {
            candle_core::bail!(
                "PerSampleRng holds {} generators but was asked for shape {:?}",
                self.rngs.len(),
                dims
            );
        }
        let item_shape = Shape::from(&dims[1..]);
        let items = self
            .rngs
            .iter_mut()
            .map(|rng| rng.randn(item_shape.clone(), device))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&items, 0)
    }
}
