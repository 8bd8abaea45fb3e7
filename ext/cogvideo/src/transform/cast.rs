use candle_core::{DType, Device};
use tracing::debug;

use crate::error::Result;
use crate::transformer::Transformer;

/// Cast every floating parameter to `dtype` and move all parameters to `device`.
pub fn cast_and_place(transformer: &mut Transformer, dtype: DType, device: &Device) -> Result<()> {
    transformer.weights_mut().cast(dtype)?;
    transformer.set_compute_dtype(dtype);
    transformer.to_device(device)?;
    debug!("transformer cast to {:?} on {:?}", dtype, device);
    Ok(())
}
