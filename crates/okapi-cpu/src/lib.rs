//! Reference CPU backend.
//!
//! Implements the full device contract with real asynchrony: every context
//! stream is a dedicated worker thread, so the engine's stream/event ordering
//! discipline is exercised for real, not simulated. This is the backend the
//! engine's semantics are tested against; numerical kernels are plain host
//! loops.

pub mod stream;

pub use stream::{CpuEvent, CpuStream};

use okapi_core::backend::{
    Backend, BackendDevice, BackendStorage, HostCallback, Trans, TransferCallback, View,
};
use okapi_core::dtype::DType;
use okapi_core::error::{Error, Result};
use okapi_core::matrix::HostData;
use okapi_core::{bail, Context, Matrix};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

pub type CpuContext = Context<CpuBackend>;
pub type CpuMatrix = Matrix<CpuBackend>;

/// The single CPU device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDevice;

impl CpuDevice {
    pub fn new() -> Self {
        CpuDevice
    }
}

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }

    fn ordinal(&self) -> usize {
        0
    }
}

/// Host memory behind a shared-mutable handle. Queued tasks lock it only for
/// the duration of a read-out or a write-back, never across a computation,
/// so aliasing operands (in-place nonlinearities, sub-views of one buffer)
/// cannot deadlock.
#[derive(Clone)]
pub enum CpuStorage {
    F32(Arc<Mutex<Vec<f32>>>),
    I32(Arc<Mutex<Vec<i32>>>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::I32(_) => DType::I32,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.lock().unwrap_or_else(|e| e.into_inner()).len(),
            CpuStorage::I32(v) => v.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }
}

/// A validated f32 region, ready to be captured by a queued task.
#[derive(Clone)]
struct Slot {
    buf: Arc<Mutex<Vec<f32>>>,
    offset: usize,
    len: usize,
}

impl Slot {
    /// Copy the region out. Lock held only for the memcpy.
    fn read(&self) -> Vec<f32> {
        let guard = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        guard[self.offset..self.offset + self.len].to_vec()
    }

    /// Copy `data` into the region. Lock held only for the memcpy.
    fn write(&self, data: &[f32]) {
        let mut guard = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        guard[self.offset..self.offset + self.len].copy_from_slice(data);
    }

    /// Mutate the region in place under a single lock acquisition.
    fn update(&self, f: impl FnOnce(&mut [f32])) {
        let mut guard = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard[self.offset..self.offset + self.len]);
    }
}

/// Validate an f32 view at enqueue time and detach it from the borrow so the
/// queued closure can own it.
fn f32_slot(view: &View<CpuStorage>) -> Result<Slot> {
    let buf = match view.storage {
        CpuStorage::F32(v) => v.clone(),
        CpuStorage::I32(_) => {
            return Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: DType::I32,
            })
        }
    };
    let total = buf.lock().unwrap_or_else(|e| e.into_inner()).len();
    if view.offset + view.len > total {
        bail!(
            "region {}..{} out of bounds for a buffer of {} elements",
            view.offset,
            view.offset + view.len,
            total
        );
    }
    Ok(Slot {
        buf,
        offset: view.offset,
        len: view.len,
    })
}

fn check_same_len(a: &Slot, b: &Slot) -> Result<()> {
    if a.len != b.len {
        bail!("operand length mismatch: {} vs {}", a.len, b.len);
    }
    Ok(())
}

fn sigmoid_val(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Marker type implementing [`Backend`] over worker-thread streams.
#[derive(Debug, Clone, Copy)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Stream = CpuStream;
    type Event = CpuEvent;
    type Storage = CpuStorage;

    fn new_stream(_device: &CpuDevice) -> Result<CpuStream> {
        Ok(CpuStream::new())
    }

    fn record_event(stream: &CpuStream) -> Result<CpuEvent> {
        stream.record()
    }

    fn wait_event(stream: &CpuStream, event: &CpuEvent) -> Result<()> {
        stream.wait(event)
    }

    fn add_callback(stream: &CpuStream, f: HostCallback) -> Result<()> {
        stream.submit(Box::new(move || {
            // A panicking callback must not take the stream's worker down
            // with it.
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                tracing::warn!("host callback panicked; stream continues");
            }
        }))
    }

    fn synchronize(stream: &CpuStream) -> Result<()> {
        stream.synchronize()
    }

    fn alloc(nelems: usize, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(match dtype {
            DType::F32 => CpuStorage::F32(Arc::new(Mutex::new(vec![0.0; nelems]))),
            DType::I32 => CpuStorage::I32(Arc::new(Mutex::new(vec![0; nelems]))),
        })
    }

    fn from_host(data: &HostData, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(match data {
            HostData::F32(v) => CpuStorage::F32(Arc::new(Mutex::new(v.clone()))),
            HostData::I32(v) => CpuStorage::I32(Arc::new(Mutex::new(v.clone()))),
        })
    }

    fn to_host(src: View<CpuStorage>, dtype: DType) -> Result<HostData> {
        if src.storage.dtype() != dtype {
            return Err(Error::DTypeMismatch {
                expected: dtype,
                got: src.storage.dtype(),
            });
        }
        match src.storage {
            CpuStorage::F32(v) => {
                let guard = v.lock().unwrap_or_else(|e| e.into_inner());
                if src.offset + src.len > guard.len() {
                    bail!("host read out of bounds");
                }
                Ok(HostData::F32(
                    guard[src.offset..src.offset + src.len].to_vec(),
                ))
            }
            CpuStorage::I32(v) => {
                let guard = v.lock().unwrap_or_else(|e| e.into_inner());
                if src.offset + src.len > guard.len() {
                    bail!("host read out of bounds");
                }
                Ok(HostData::I32(
                    guard[src.offset..src.offset + src.len].to_vec(),
                ))
            }
        }
    }

    fn htod_async(stream: &CpuStream, dst: View<CpuStorage>, data: HostData) -> Result<()> {
        if dst.storage.dtype() != data.dtype() {
            return Err(Error::DTypeMismatch {
                expected: dst.storage.dtype(),
                got: data.dtype(),
            });
        }
        if data.len() != dst.len {
            bail!(
                "host upload of {} elements into a region of {}",
                data.len(),
                dst.len
            );
        }
        match (dst.storage, data) {
            (CpuStorage::F32(buf), HostData::F32(v)) => {
                let buf = buf.clone();
                let (offset, len) = (dst.offset, dst.len);
                stream.submit(Box::new(move || {
                    let mut guard = buf.lock().unwrap_or_else(|e| e.into_inner());
                    guard[offset..offset + len].copy_from_slice(&v);
                }))
            }
            (CpuStorage::I32(buf), HostData::I32(v)) => {
                let buf = buf.clone();
                let (offset, len) = (dst.offset, dst.len);
                stream.submit(Box::new(move || {
                    let mut guard = buf.lock().unwrap_or_else(|e| e.into_inner());
                    guard[offset..offset + len].copy_from_slice(&v);
                }))
            }
            _ => unreachable!("dtype checked above"),
        }
    }

    fn dtoh_async(
        stream: &CpuStream,
        src: View<CpuStorage>,
        dtype: DType,
        done: TransferCallback,
    ) -> Result<()> {
        if src.storage.dtype() != dtype {
            return Err(Error::DTypeMismatch {
                expected: dtype,
                got: src.storage.dtype(),
            });
        }
        let storage = src.storage.clone();
        let (offset, len) = (src.offset, src.len);
        stream.submit(Box::new(move || {
            let data = match &storage {
                CpuStorage::F32(v) => {
                    let guard = v.lock().unwrap_or_else(|e| e.into_inner());
                    HostData::F32(guard[offset..offset + len].to_vec())
                }
                CpuStorage::I32(v) => {
                    let guard = v.lock().unwrap_or_else(|e| e.into_inner());
                    HostData::I32(guard[offset..offset + len].to_vec())
                }
            };
            if catch_unwind(AssertUnwindSafe(move || done(data))).is_err() {
                tracing::warn!("transfer callback panicked; stream continues");
            }
        }))
    }

    fn copy(stream: &CpuStream, src: View<CpuStorage>, dst: View<CpuStorage>) -> Result<()> {
        let src = f32_slot(&src)?;
        let dst = f32_slot(&dst)?;
        check_same_len(&src, &dst)?;
        stream.submit(Box::new(move || {
            let tmp = src.read();
            dst.write(&tmp);
        }))
    }

    fn fill(stream: &CpuStream, dst: View<CpuStorage>, val: f32) -> Result<()> {
        let dst = f32_slot(&dst)?;
        stream.submit(Box::new(move || {
            dst.update(|d| {
                for x in d.iter_mut() {
                    *x = val;
                }
            });
        }))
    }

    fn scale(
        stream: &CpuStream,
        alpha: f32,
        src: View<CpuStorage>,
        dst: View<CpuStorage>,
    ) -> Result<()> {
        let src = f32_slot(&src)?;
        let dst = f32_slot(&dst)?;
        check_same_len(&src, &dst)?;
        stream.submit(Box::new(move || {
            let mut tmp = src.read();
            for x in tmp.iter_mut() {
                *x *= alpha;
            }
            dst.write(&tmp);
        }))
    }

    fn axpy(
        stream: &CpuStream,
        alpha: f32,
        x: View<CpuStorage>,
        y: View<CpuStorage>,
    ) -> Result<()> {
        let x = f32_slot(&x)?;
        let y = f32_slot(&y)?;
        check_same_len(&x, &y)?;
        stream.submit(Box::new(move || {
            let xv = x.read();
            y.update(|yv| {
                for (yi, xi) in yv.iter_mut().zip(xv.iter()) {
                    *yi += alpha * xi;
                }
            });
        }))
    }

    fn hprod2(
        stream: &CpuStream,
        a: View<CpuStorage>,
        b: View<CpuStorage>,
        dst: View<CpuStorage>,
    ) -> Result<()> {
        let a = f32_slot(&a)?;
        let b = f32_slot(&b)?;
        let dst = f32_slot(&dst)?;
        check_same_len(&a, &dst)?;
        check_same_len(&b, &dst)?;
        stream.submit(Box::new(move || {
            let av = a.read();
            let bv = b.read();
            dst.update(|d| {
                for i in 0..d.len() {
                    d[i] = av[i] * bv[i];
                }
            });
        }))
    }

    fn hprod3(
        stream: &CpuStream,
        a: View<CpuStorage>,
        b: View<CpuStorage>,
        c: View<CpuStorage>,
        dst: View<CpuStorage>,
    ) -> Result<()> {
        let a = f32_slot(&a)?;
        let b = f32_slot(&b)?;
        let c = f32_slot(&c)?;
        let dst = f32_slot(&dst)?;
        check_same_len(&a, &dst)?;
        check_same_len(&b, &dst)?;
        check_same_len(&c, &dst)?;
        stream.submit(Box::new(move || {
            let av = a.read();
            let bv = b.read();
            let cv = c.read();
            dst.update(|d| {
                for i in 0..d.len() {
                    d[i] = av[i] * bv[i] * cv[i];
                }
            });
        }))
    }

    fn add_hprod3(
        stream: &CpuStream,
        a: View<CpuStorage>,
        b: View<CpuStorage>,
        c: View<CpuStorage>,
        dst: View<CpuStorage>,
    ) -> Result<()> {
        let a = f32_slot(&a)?;
        let b = f32_slot(&b)?;
        let c = f32_slot(&c)?;
        let dst = f32_slot(&dst)?;
        check_same_len(&a, &dst)?;
        check_same_len(&b, &dst)?;
        check_same_len(&c, &dst)?;
        stream.submit(Box::new(move || {
            let av = a.read();
            let bv = b.read();
            let cv = c.read();
            dst.update(|d| {
                for i in 0..d.len() {
                    d[i] += av[i] * bv[i] * cv[i];
                }
            });
        }))
    }

    fn add_hprod(
        stream: &CpuStream,
        a: View<CpuStorage>,
        b: View<CpuStorage>,
        alpha: f32,
        dst: View<CpuStorage>,
    ) -> Result<()> {
        let a = f32_slot(&a)?;
        let b = f32_slot(&b)?;
        let dst = f32_slot(&dst)?;
        check_same_len(&a, &dst)?;
        check_same_len(&b, &dst)?;
        stream.submit(Box::new(move || {
            let av = a.read();
            let bv = b.read();
            dst.update(|d| {
                for i in 0..d.len() {
                    d[i] = av[i] * bv[i] + alpha * d[i];
                }
            });
        }))
    }

    fn sum_hprod4(
        stream: &CpuStream,
        a: View<CpuStorage>,
        b: View<CpuStorage>,
        c: View<CpuStorage>,
        d: View<CpuStorage>,
        dst: View<CpuStorage>,
    ) -> Result<()> {
        let a = f32_slot(&a)?;
        let b = f32_slot(&b)?;
        let c = f32_slot(&c)?;
        let d = f32_slot(&d)?;
        let dst = f32_slot(&dst)?;
        for s in [&a, &b, &c, &d] {
            check_same_len(s, &dst)?;
        }
        stream.submit(Box::new(move || {
            let av = a.read();
            let bv = b.read();
            let cv = c.read();
            let dv = d.read();
            dst.update(|out| {
                for i in 0..out.len() {
                    out[i] = av[i] * bv[i] + cv[i] * dv[i];
                }
            });
        }))
    }

    fn tanh(
        stream: &CpuStream,
        src: View<CpuStorage>,
        dst: View<CpuStorage>,
        der: Option<View<CpuStorage>>,
    ) -> Result<()> {
        let src = f32_slot(&src)?;
        let dst = f32_slot(&dst)?;
        check_same_len(&src, &dst)?;
        let der = der.map(|d| f32_slot(&d)).transpose()?;
        if let Some(d) = &der {
            check_same_len(d, &dst)?;
        }
        stream.submit(Box::new(move || {
            let mut out = src.read();
            let mut dv = der.as_ref().map(|_| vec![0.0; out.len()]);
            for (i, x) in out.iter_mut().enumerate() {
                let t = x.tanh();
                *x = t;
                if let Some(dv) = &mut dv {
                    dv[i] = 1.0 - t * t;
                }
            }
            dst.write(&out);
            if let (Some(slot), Some(dv)) = (&der, &dv) {
                slot.write(dv);
            }
        }))
    }

    fn sigmoid(
        stream: &CpuStream,
        src: View<CpuStorage>,
        dst: View<CpuStorage>,
        der: Option<View<CpuStorage>>,
    ) -> Result<()> {
        let src = f32_slot(&src)?;
        let dst = f32_slot(&dst)?;
        check_same_len(&src, &dst)?;
        let der = der.map(|d| f32_slot(&d)).transpose()?;
        if let Some(d) = &der {
            check_same_len(d, &dst)?;
        }
        stream.submit(Box::new(move || {
            let mut out = src.read();
            let mut dv = der.as_ref().map(|_| vec![0.0; out.len()]);
            for (i, x) in out.iter_mut().enumerate() {
                let s = sigmoid_val(*x);
                *x = s;
                if let Some(dv) = &mut dv {
                    dv[i] = s * (1.0 - s);
                }
            }
            dst.write(&out);
            if let (Some(slot), Some(dv)) = (&der, &dv) {
                slot.write(dv);
            }
        }))
    }

    fn tanh_sigm(
        stream: &CpuStream,
        src: View<CpuStorage>,
        dst: View<CpuStorage>,
        der: Option<View<CpuStorage>>,
        split: usize,
    ) -> Result<()> {
        let src = f32_slot(&src)?;
        let dst = f32_slot(&dst)?;
        check_same_len(&src, &dst)?;
        let der = der.map(|d| f32_slot(&d)).transpose()?;
        if let Some(d) = &der {
            check_same_len(d, &dst)?;
        }
        if split > dst.len {
            bail!("split index {} exceeds region of {}", split, dst.len);
        }
        stream.submit(Box::new(move || {
            let mut out = src.read();
            let mut dv = der.as_ref().map(|_| vec![0.0; out.len()]);
            for (i, x) in out.iter_mut().enumerate() {
                if i < split {
                    let t = x.tanh();
                    *x = t;
                    if let Some(dv) = &mut dv {
                        dv[i] = 1.0 - t * t;
                    }
                } else {
                    let s = sigmoid_val(*x);
                    *x = s;
                    if let Some(dv) = &mut dv {
                        dv[i] = s * (1.0 - s);
                    }
                }
            }
            dst.write(&out);
            if let (Some(slot), Some(dv)) = (&der, &dv) {
                slot.write(dv);
            }
        }))
    }

    fn hprod_col(
        stream: &CpuStream,
        mask: View<CpuStorage>,
        dst: View<CpuStorage>,
    ) -> Result<()> {
        let mask = f32_slot(&mask)?;
        let dst = f32_slot(&dst)?;
        if mask.len == 0 || dst.len % mask.len != 0 {
            bail!(
                "column broadcast: mask of {} does not divide a region of {}",
                mask.len,
                dst.len
            );
        }
        stream.submit(Box::new(move || {
            let mv = mask.read();
            dst.update(|d| {
                for (i, x) in d.iter_mut().enumerate() {
                    *x *= mv[i % mv.len()];
                }
            });
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn gemm(
        stream: &CpuStream,
        trans_a: Trans,
        trans_b: Trans,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: View<CpuStorage>,
        lda: usize,
        b: View<CpuStorage>,
        ldb: usize,
        beta: f32,
        c: View<CpuStorage>,
        ldc: usize,
    ) -> Result<()> {
        let a = f32_slot(&a)?;
        let b = f32_slot(&b)?;
        let c = f32_slot(&c)?;
        let a_need = match trans_a {
            Trans::N => lda * k,
            Trans::T => lda * m,
        };
        let b_need = match trans_b {
            Trans::N => ldb * n,
            Trans::T => ldb * k,
        };
        if a.len < a_need || b.len < b_need || c.len < ldc * n {
            bail!(
                "gemm operand regions too small for m={m} n={n} k={k} \
                 (a: {}, b: {}, c: {})",
                a.len,
                b.len,
                c.len
            );
        }
        stream.submit(Box::new(move || {
            let av = a.read();
            let bv = b.read();
            c.update(|cv| {
                for j in 0..n {
                    for i in 0..m {
                        let mut acc = 0.0;
                        for l in 0..k {
                            let x = match trans_a {
                                Trans::N => av[l * lda + i],
                                Trans::T => av[i * lda + l],
                            };
                            let y = match trans_b {
                                Trans::N => bv[j * ldb + l],
                                Trans::T => bv[l * ldb + j],
                            };
                            acc += x * y;
                        }
                        cv[j * ldc + i] = alpha * acc + beta * cv[j * ldc + i];
                    }
                }
            });
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use okapi_core::matrix::HostMatrix;

    fn ctx() -> CpuContext {
        Context::new(&CpuDevice::new()).unwrap()
    }

    fn host(m: &CpuMatrix, ctx: &CpuContext) -> Vec<f32> {
        m.to_host(ctx).unwrap().data().as_f32().unwrap().to_vec()
    }

    #[test]
    fn fill_and_read_back() {
        let ctx = ctx();
        let m = CpuMatrix::empty(3, 2, DType::F32, &CpuDevice::new()).unwrap();
        m.fill(&ctx, 2.5).unwrap();
        assert_eq!(host(&m, &ctx), vec![2.5; 6]);
    }

    #[test]
    fn axpy_accumulates() {
        let ctx = ctx();
        let dev = CpuDevice::new();
        let x = CpuMatrix::from_host(&HostMatrix::full(2, 2, 3.0), &dev).unwrap();
        let y = CpuMatrix::from_host(&HostMatrix::full(2, 2, 1.0), &dev).unwrap();
        y.add_scaled(&ctx, 2.0, &x).unwrap();
        assert_eq!(host(&y, &ctx), vec![7.0; 4]);
    }

    #[test]
    fn gemm_no_transpose() {
        let ctx = ctx();
        let dev = CpuDevice::new();
        // a = [[1, 3], [2, 4]] (2x2 col-major), b = [[5], [6]]
        let a = CpuMatrix::from_host(
            &HostMatrix::from_f32(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
            &dev,
        )
        .unwrap();
        let b = CpuMatrix::from_host(&HostMatrix::from_f32(2, 1, vec![5.0, 6.0]).unwrap(), &dev)
            .unwrap();
        let c = CpuMatrix::empty(2, 1, DType::F32, &dev).unwrap();
        c.assign_dot(&ctx, &a, &b, Trans::N, Trans::N).unwrap();
        // [1*5 + 3*6, 2*5 + 4*6]
        assert_eq!(host(&c, &ctx), vec![23.0, 34.0]);
    }

    #[test]
    fn gemm_transposed_a() {
        let ctx = ctx();
        let dev = CpuDevice::new();
        let a = CpuMatrix::from_host(
            &HostMatrix::from_f32(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
            &dev,
        )
        .unwrap();
        let b = CpuMatrix::from_host(&HostMatrix::from_f32(2, 1, vec![5.0, 6.0]).unwrap(), &dev)
            .unwrap();
        let c = CpuMatrix::empty(2, 1, DType::F32, &dev).unwrap();
        c.assign_dot(&ctx, &a, &b, Trans::T, Trans::N).unwrap();
        // a^T = [[1, 2], [3, 4]]: [1*5 + 2*6, 3*5 + 4*6]
        assert_eq!(host(&c, &ctx), vec![17.0, 39.0]);
    }

    #[test]
    fn gemm_into_column_view() {
        let ctx = ctx();
        let dev = CpuDevice::new();
        let a = CpuMatrix::from_host(
            &HostMatrix::from_f32(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap(),
            &dev,
        )
        .unwrap();
        let b = CpuMatrix::from_host(&HostMatrix::from_f32(2, 1, vec![7.0, 8.0]).unwrap(), &dev)
            .unwrap();
        let c = CpuMatrix::from_host(&HostMatrix::zeros(2, 3), &dev).unwrap();
        let col = c.column(1).unwrap();
        col.assign_dot(&ctx, &a, &b, Trans::N, Trans::N).unwrap();
        assert_eq!(host(&c, &ctx), vec![0.0, 0.0, 7.0, 8.0, 0.0, 0.0]);
    }

    #[test]
    fn tanh_sigm_splits_and_captures_derivative() {
        let ctx = ctx();
        let dev = CpuDevice::new();
        // 1 row, 4 cols; split after 1 column
        let m = CpuMatrix::from_host(
            &HostMatrix::from_f32(1, 4, vec![0.5, -1.0, 0.0, 2.0]).unwrap(),
            &dev,
        )
        .unwrap();
        let der = CpuMatrix::empty(1, 4, DType::F32, &dev).unwrap();
        // in place
        m.tanh_sigm(&ctx, &m, Some(&der), 1).unwrap();
        let out = host(&m, &ctx);
        let d = host(&der, &ctx);
        let t = 0.5f32.tanh();
        assert!((out[0] - t).abs() < 1e-6);
        assert!((d[0] - (1.0 - t * t)).abs() < 1e-6);
        for i in 1..4 {
            let s = 1.0 / (1.0 + (-[0.5f32, -1.0, 0.0, 2.0][i]).exp());
            assert!((out[i] - s).abs() < 1e-6);
            assert!((d[i] - s * (1.0 - s)).abs() < 1e-6);
        }
    }

    #[test]
    fn hprod_col_broadcasts_mask() {
        let ctx = ctx();
        let dev = CpuDevice::new();
        let m = CpuMatrix::from_host(&HostMatrix::full(2, 3, 2.0), &dev).unwrap();
        let mask =
            CpuMatrix::from_host(&HostMatrix::from_f32(2, 1, vec![1.0, 0.0]).unwrap(), &dev)
                .unwrap();
        m.hprod_col(&ctx, &mask).unwrap();
        assert_eq!(host(&m, &ctx), vec![2.0, 0.0, 2.0, 0.0, 2.0, 0.0]);
    }

    #[test]
    fn dtoh_async_delivers_after_queued_work() {
        let ctx = ctx();
        let dev = CpuDevice::new();
        let m = CpuMatrix::empty(2, 2, DType::F32, &dev).unwrap();
        m.fill(&ctx, 9.0).unwrap();
        let slot = Arc::new(Mutex::new(None));
        let s = slot.clone();
        m.to_host_async(&ctx, move |h| {
            *s.lock().unwrap() = Some(h);
        })
        .unwrap();
        ctx.synchronize().unwrap();
        let got = slot.lock().unwrap().take().unwrap();
        assert_eq!(got.data().as_f32().unwrap(), &[9.0; 4]);
    }

    #[test]
    fn panicking_callback_does_not_kill_the_stream() {
        let ctx = ctx();
        ctx.add_callback(Box::new(|| panic!("boom"))).unwrap();
        let flag = Arc::new(Mutex::new(false));
        let f = flag.clone();
        ctx.add_callback(Box::new(move || *f.lock().unwrap() = true))
            .unwrap();
        ctx.synchronize().unwrap();
        assert!(*flag.lock().unwrap());
    }

    #[test]
    fn in_place_hprod_on_sibling_views() {
        // z and i are disjoint column views of one buffer; multiplying one
        // into the other must not deadlock.
        let ctx = ctx();
        let dev = CpuDevice::new();
        let m = CpuMatrix::from_host(
            &HostMatrix::from_f32(2, 2, vec![2.0, 3.0, 4.0, 5.0]).unwrap(),
            &dev,
        )
        .unwrap();
        let left = m.column(0).unwrap();
        let right = m.column(1).unwrap();
        left.assign_hprod(&ctx, &left, &right).unwrap();
        assert_eq!(host(&m, &ctx), vec![8.0, 15.0, 4.0, 5.0]);
    }

    #[test]
    fn dtype_mismatch_rejected_at_enqueue() {
        let ctx = ctx();
        let dev = CpuDevice::new();
        let m = CpuMatrix::empty(2, 2, DType::I32, &dev).unwrap();
        assert!(m.fill(&ctx, 1.0).is_err());
    }
}
