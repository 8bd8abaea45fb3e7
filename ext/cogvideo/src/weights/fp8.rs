use candle_core::{DType, Device, Module, Result as CandleResult, Tensor};

/// FP8 E4M3FN value (sign 1, exponent 4, mantissa 3, bias 7).
///
/// The "fn" variant has no infinities: `S.1111.111` is NaN and the largest
/// finite magnitude is 448.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fp8E4M3(pub u8);

impl Fp8E4M3 {
    pub const MAX: f32 = 448.0;
    pub const NAN: Fp8E4M3 = Fp8E4M3(0x7F);

    pub fn to_f32(self) -> f32 {
        let bits = self.0;
        let sign = (bits >> 7) & 1;
        let exponent = (bits >> 3) & 0xF;
        let mantissa = bits & 0x7;

        if exponent == 0xF && mantissa == 0x7 {
            return f32::NAN;
        }

        let value = if exponent == 0 {
            // subnormal, m * 2^-9
            mantissa as f32 * 2.0f32.powi(-9)
        } else {
            (1.0 + mantissa as f32 / 8.0) * 2.0f32.powi(exponent as i32 - 7)
        };

        if sign == 1 {
            -value
        } else {
            value
        }
    }

    /// Round-to-nearest-even conversion, saturating at ±448.
    pub fn from_f32(x: f32) -> Self {
        if x.is_nan() {
            return Self::NAN;
        }
        let sign: u8 = if x.is_sign_negative() { 0x80 } else { 0 };
        let a = x.abs();
        if a >= Self::MAX {
            return Self(sign | 0x7E);
        }

        // below the smallest normal (2^-6) the grid is uniform with step 2^-9;
        // a result of 8 lands exactly on the smallest normal encoding
        if a < 2.0f32.powi(-6) {
            let m = (a * 512.0).round_ties_even() as u8;
            return Self(sign | m);
        }

        let raw = a.to_bits();
        let mut exponent = ((raw >> 23) & 0xFF) as i32 - 127;
        let fraction = f32::from_bits((raw & 0x007F_FFFF) | 0x3F80_0000) - 1.0;
        let mut mantissa = (fraction * 8.0).round_ties_even() as u8;
        if mantissa == 8 {
            mantissa = 0;
            exponent += 1;
        }

        let biased = exponent + 7;
        if biased > 15 || (biased == 15 && mantissa == 7) {
            return Self(sign | 0x7E);
        }
        Self(sign | ((biased as u8) << 3) | mantissa)
    }
}

/// A tensor stored as float8 e4m3fn bit patterns.
///
/// candle has no native fp8 arithmetic, so the payload lives in a `U8` tensor
/// on the target device and is widened whenever it is used.
#[derive(Debug, Clone)]
pub struct Fp8Tensor {
    bits: Tensor,
}

impl Fp8Tensor {
    /// Wrap raw e4m3fn bytes, as stored in `F8_E4M3` safetensors views.
    pub fn from_raw(data: &[u8], shape: &[usize], device: &Device) -> CandleResult<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(candle_core::Error::Msg(format!(
                "fp8 payload has {} bytes, shape {:?} needs {}",
                data.len(),
                shape,
                expected
            )));
        }
        let bits = Tensor::from_vec(data.to_vec(), shape, device)?;
        Ok(Self { bits })
    }

    pub fn quantize(tensor: &Tensor) -> CandleResult<Self> {
        let bytes: Vec<u8> = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|x| Fp8E4M3::from_f32(x).0)
            .collect();
        let bits = Tensor::from_vec(bytes, tensor.dims(), tensor.device())?;
        Ok(Self { bits })
    }

    pub fn dequantize(&self, dtype: DType) -> CandleResult<Tensor> {
        let values: Vec<f32> = self
            .bits
            .flatten_all()?
            .to_vec1::<u8>()?
            .into_iter()
            .map(|byte| Fp8E4M3(byte).to_f32())
            .collect();
        Tensor::from_vec(values, self.bits.dims(), self.bits.device())?.to_dtype(dtype)
    }

    pub fn dims(&self) -> &[usize] {
        self.bits.dims()
    }

    pub fn device(&self) -> &Device {
        self.bits.device()
    }

    /// The raw `U8` bit tensor
    pub fn bits(&self) -> &Tensor {
        &self.bits
    }

    pub fn to_device(&self, device: &Device) -> CandleResult<Self> {
        Ok(Self {
            bits: self.bits.to_device(device)?,
        })
    }
}

/// Linear layer over an fp8 weight.
///
/// The weight is widened to `compute_dtype` per call. In fast mode the input
/// is rounded through fp8 too, so the product sees fp8 operands on both sides.
#[derive(Debug, Clone)]
pub struct Fp8Linear {
    weight: Fp8Tensor,
    bias: Option<Tensor>,
    compute_dtype: DType,
    fast: bool,
}

impl Fp8Linear {
    pub fn new(weight: Fp8Tensor, bias: Option<Tensor>, compute_dtype: DType, fast: bool) -> Self {
        Self {
            weight,
            bias,
            compute_dtype,
            fast,
        }
    }

    pub fn is_fast(&self) -> bool {
        self.fast
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }
}

impl Module for Fp8Linear {
    fn forward(&self, xs: &Tensor) -> CandleResult<Tensor> {
        let xs = if self.fast {
            Fp8Tensor::quantize(xs)?.dequantize(self.compute_dtype)?
        } else {
            xs.to_dtype(self.compute_dtype)?
        };
        let weight = self.weight.dequantize(self.compute_dtype)?;
        let bias = self
            .bias
            .as_ref()
            .map(|b| b.to_dtype(self.compute_dtype))
            .transpose()?;
        candle_nn::Linear::new(weight, bias).forward(&xs)
    }
}
