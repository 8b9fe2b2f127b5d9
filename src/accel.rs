/* ------------------------------------------------------------------ */
/* Metal GPU device and batched matmul (feature = "metal")            */
/* ------------------------------------------------------------------ */

use std::panic::{self, AssertUnwindSafe};

use candle_core::{Device, Result as CandleResult, Tensor};
use log::{info, warn};

/// Below this many rows the transfer costs more than the CPU path.
pub const MIN_ROWS: usize = 64;

lazy_static::lazy_static! {
    pub static ref METAL_DEVICE: Option<Device> = {
        let result = panic::catch_unwind(AssertUnwindSafe(|| Device::new_metal(0)));
        match result {
            Ok(Ok(dev)) => {
                info!("Metal GPU enabled on device: {:?}", dev);
                Some(dev)
            }
            Ok(Err(e)) => {
                warn!("Metal GPU unavailable: {}", e);
                None
            }
            Err(_) => {
                warn!("Metal GPU unavailable (initialization panicked)");
                None
            }
        }
    };
}

fn matmul_on(device: &Device, x: &[f32], w: &[f32], rows: usize, nin: usize, nout: usize) -> CandleResult<Vec<f32>> {
    let x_t = Tensor::from_slice(x, (rows, nin), device)?;
    let w_t = Tensor::from_slice(w, (nout, nin), device)?;
    x_t.matmul(&w_t.t()?)?.flatten_all()?.to_vec1::<f32>()
}

/// x [rows × nin] · Wᵀ [nin × nout] → [rows × nout]. None when no device is
/// available or the kernel fails; callers fall back to the CPU path.
pub fn matmul(x: &[f32], w: &[f32], rows: usize, nin: usize, nout: usize) -> Option<Vec<f32>> {
    let device = METAL_DEVICE.as_ref()?;
    match matmul_on(device, x, w, rows, nin, nout) {
        Ok(y) => Some(y),
        Err(e) => {
            warn!("metal matmul failed, using CPU: {e}");
            None
        }
    }
}
