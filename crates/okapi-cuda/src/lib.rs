// CUDA backend for okapi, built on cudarc.
//
// Streams map one-to-one onto CUDA streams forked from the device's primary
// stream; each carries its own cuBLAS handle bound to it. Events are raw
// driver events behind an Arc. Host callbacks and device-to-host deliveries
// run on a per-stream waiter thread that synchronizes on an event recorded at
// enqueue time, so no engine stream is ever blocked by a host-side consumer.
//
// All elementwise kernels are compiled from kernels.rs at device creation via
// NVRTC; gemm goes through cuBLAS (the engine is column-major throughout, so
// the sgemm call maps one-to-one).

mod kernels;

use cudarc::cublas::{result as cublas, sys::cublasOperation_t, CudaBlas};
use cudarc::driver::{
    result as driver, sys as cu, CudaFunction, CudaSlice, DevicePtr, DeviceSlice, LaunchAsync,
    LaunchConfig,
};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};
use okapi_core::backend::{
    Backend, BackendDevice, BackendStorage, HostCallback, Trans, TransferCallback, View,
};
use okapi_core::dtype::DType;
use okapi_core::error::{Error, Result};
use okapi_core::matrix::HostData;
use okapi_core::{Context, Matrix};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

//  Device

/// A CUDA device handle: the cudarc device with okapi's kernels loaded.
/// Clonable (Arc internally).
pub struct CudaDevice {
    dev: Arc<cudarc::driver::CudaDevice>,
    ordinal: usize,
}

impl CudaDevice {
    /// Open GPU `ordinal` and compile/load the okapi kernels for it.
    pub fn new(ordinal: usize) -> Result<Self> {
        let dev = cudarc::driver::CudaDevice::new(ordinal)
            .map_err(|e| Error::resource(format!("CUDA device creation failed: {e}")))?;

        // Target the device's own compute capability with native SASS so the
        // PTX version never outruns the installed driver.
        let major = dev
            .attribute(cu::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or(8);
        let minor = dev
            .attribute(cu::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or(9);
        let arch: &'static str = Box::leak(format!("sm_{major}{minor}").into_boxed_str());
        let opts = CompileOptions {
            arch: Some(arch),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(kernels::KERNEL_SOURCE, opts)
            .map_err(|e| Error::resource(format!("NVRTC compilation failed: {e}")))?;
        dev.load_ptx(ptx, kernels::MODULE_NAME, kernels::KERNEL_NAMES)
            .map_err(|e| Error::resource(format!("PTX load failed: {e}")))?;

        tracing::info!(ordinal, "initialized CUDA device");
        Ok(CudaDevice { dev, ordinal })
    }

    fn get_func(&self, name: &str) -> Result<CudaFunction> {
        self.dev
            .get_func(kernels::MODULE_NAME, name)
            .ok_or_else(|| Error::resource(format!("CUDA kernel '{name}' not found")))
    }
}

impl Clone for CudaDevice {
    fn clone(&self) -> Self {
        CudaDevice {
            dev: self.dev.clone(),
            ordinal: self.ordinal,
        }
    }
}

impl fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaDevice(cuda:{})", self.ordinal)
    }
}

impl BackendDevice for CudaDevice {
    fn name(&self) -> String {
        format!("cuda:{}", self.ordinal)
    }

    fn ordinal(&self) -> usize {
        self.ordinal
    }
}

//  Events

struct EventInner {
    event: cu::CUevent,
}

unsafe impl Send for EventInner {}
unsafe impl Sync for EventInner {}

impl Drop for EventInner {
    fn drop(&mut self) {
        unsafe {
            let _ = driver::event::destroy(self.event);
        }
    }
}

/// A recorded point in a stream's queue. Cheap to clone.
#[derive(Clone)]
pub struct CudaEvent {
    inner: Arc<EventInner>,
}

impl CudaEvent {
    fn create() -> Result<Self> {
        let event = driver::event::create(cu::CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map_err(|e| Error::resource(format!("event create: {e}")))?;
        Ok(CudaEvent {
            inner: Arc::new(EventInner { event }),
        })
    }

    fn raw(&self) -> cu::CUevent {
        self.inner.event
    }

    fn synchronize(&self) -> Result<()> {
        unsafe { driver::event::synchronize(self.raw()) }
            .map_err(|e| Error::resource(format!("event sync: {e}")))
    }
}

//  Streams

struct WaiterTask {
    event: CudaEvent,
    run: Box<dyn FnOnce() + Send>,
}

/// One CUDA stream plus its cuBLAS handle and waiter thread.
pub struct CudaStream {
    dev: CudaDevice,
    cu: cudarc::driver::CudaStream,
    blas: CudaBlas,
    waiter: Mutex<mpsc::Sender<WaiterTask>>,
}

unsafe impl Send for CudaStream {}
unsafe impl Sync for CudaStream {}

impl CudaStream {
    fn new(device: &CudaDevice) -> Result<Self> {
        let cu = device
            .dev
            .fork_default_stream()
            .map_err(|e| Error::resource(format!("stream creation: {e}")))?;
        let blas = CudaBlas::new(device.dev.clone())
            .map_err(|e| Error::resource(format!("cuBLAS init: {e}")))?;
        unsafe { blas.set_stream(Some(&cu)) }
            .map_err(|e| Error::resource(format!("cuBLAS set stream: {e}")))?;

        let (tx, rx) = mpsc::channel::<WaiterTask>();
        let dev = device.dev.clone();
        thread::spawn(move || {
            // Event syncs need this thread bound to the device's context.
            if dev.bind_to_thread().is_err() {
                return;
            }
            while let Ok(task) = rx.recv() {
                if let Err(e) = task.event.synchronize() {
                    tracing::warn!(error = %e, "waiter event sync failed, dropping task");
                    continue;
                }
                // A panicking host callback must not kill the waiter.
                if catch_unwind(AssertUnwindSafe(task.run)).is_err() {
                    tracing::warn!("host callback panicked");
                }
            }
        });

        Ok(CudaStream {
            dev: device.clone(),
            cu,
            blas,
            waiter: Mutex::new(tx),
        })
    }

    fn raw(&self) -> cu::CUstream {
        self.cu.stream
    }

    /// Record an event now and hand `run` to the waiter thread; it fires
    /// after everything enqueued so far has completed.
    fn after_pending(&self, run: Box<dyn FnOnce() + Send>) -> Result<()> {
        let event = CudaEvent::create()?;
        unsafe { driver::event::record(event.raw(), self.raw()) }
            .map_err(|e| Error::resource(format!("event record: {e}")))?;
        let tx = self
            .waiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        tx.send(WaiterTask { event, run })
            .map_err(|_| Error::resource("stream waiter terminated"))?;
        Ok(())
    }
}

//  Storage

/// Device memory. Handles are Arc-shared: clones alias the same allocation,
/// matching the engine's shared-mutable storage model.
#[derive(Clone)]
pub enum CudaStorage {
    F32(Arc<CudaSlice<f32>>),
    I32(Arc<CudaSlice<i32>>),
}

unsafe impl Send for CudaStorage {}
unsafe impl Sync for CudaStorage {}

impl BackendStorage for CudaStorage {
    fn dtype(&self) -> DType {
        match self {
            CudaStorage::F32(_) => DType::F32,
            CudaStorage::I32(_) => DType::I32,
        }
    }

    fn len(&self) -> usize {
        match self {
            CudaStorage::F32(s) => s.len(),
            CudaStorage::I32(s) => s.len(),
        }
    }
}

/// Resolve a view to a raw f32 device pointer, validating dtype and bounds at
/// enqueue time.
fn f32_ptr(view: &View<CudaStorage>) -> Result<cu::CUdeviceptr> {
    match view.storage {
        CudaStorage::F32(s) => {
            if view.offset + view.len > s.len() {
                return Err(Error::msg(format!(
                    "view {}..{} out of bounds for storage of {} elements",
                    view.offset,
                    view.offset + view.len,
                    s.len()
                )));
            }
            Ok(*s.device_ptr() + (view.offset * std::mem::size_of::<f32>()) as u64)
        }
        CudaStorage::I32(_) => Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: DType::I32,
        }),
    }
}

fn check_same_len(a: &View<CudaStorage>, b: &View<CudaStorage>) -> Result<()> {
    if a.len != b.len {
        return Err(Error::msg(format!(
            "operand length mismatch: {} vs {}",
            a.len, b.len
        )));
    }
    Ok(())
}

/// Standard launch configuration for `n` elements.
fn launch_cfg(n: usize) -> LaunchConfig {
    const BLOCK: u32 = 256;
    let grid = (n as u32).div_ceil(BLOCK);
    LaunchConfig {
        block_dim: (BLOCK, 1, 1),
        grid_dim: (grid.max(1), 1, 1),
        shared_mem_bytes: 0,
    }
}

fn launch_err(name: &str, e: impl fmt::Display) -> Error {
    Error::resource(format!("launch {name}: {e}"))
}

//  Backend

/// The CUDA backend marker type.
#[derive(Clone, Debug)]
pub struct CudaBackend;

pub type CudaContext = Context<CudaBackend>;
pub type CudaMatrix = Matrix<CudaBackend>;

impl Backend for CudaBackend {
    type Device = CudaDevice;
    type Stream = CudaStream;
    type Event = CudaEvent;
    type Storage = CudaStorage;

    fn new_stream(device: &CudaDevice) -> Result<CudaStream> {
        CudaStream::new(device)
    }

    fn record_event(stream: &CudaStream) -> Result<CudaEvent> {
        let event = CudaEvent::create()?;
        unsafe { driver::event::record(event.raw(), stream.raw()) }
            .map_err(|e| Error::resource(format!("event record: {e}")))?;
        Ok(event)
    }

    fn wait_event(stream: &CudaStream, event: &CudaEvent) -> Result<()> {
        unsafe {
            driver::stream::wait_event(
                stream.raw(),
                event.raw(),
                cu::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
        }
        .map_err(|e| Error::resource(format!("stream wait event: {e}")))
    }

    fn add_callback(stream: &CudaStream, f: HostCallback) -> Result<()> {
        stream.after_pending(f)
    }

    fn synchronize(stream: &CudaStream) -> Result<()> {
        unsafe { driver::stream::synchronize(stream.raw()) }
            .map_err(|e| Error::resource(format!("stream sync: {e}")))?;
        // Drain the waiter so already-enqueued callbacks have run too.
        let (tx, rx) = mpsc::channel();
        stream.after_pending(Box::new(move || {
            let _ = tx.send(());
        }))?;
        rx.recv()
            .map_err(|_| Error::resource("stream waiter terminated"))
    }

    fn alloc(nelems: usize, dtype: DType, device: &CudaDevice) -> Result<CudaStorage> {
        match dtype {
            DType::F32 => {
                let s = unsafe { device.dev.alloc::<f32>(nelems) }
                    .map_err(|e| Error::resource(format!("alloc f32: {e}")))?;
                Ok(CudaStorage::F32(Arc::new(s)))
            }
            DType::I32 => {
                let s = unsafe { device.dev.alloc::<i32>(nelems) }
                    .map_err(|e| Error::resource(format!("alloc i32: {e}")))?;
                Ok(CudaStorage::I32(Arc::new(s)))
            }
        }
    }

    fn from_host(data: &HostData, device: &CudaDevice) -> Result<CudaStorage> {
        match data {
            HostData::F32(v) => {
                let s = device
                    .dev
                    .htod_copy(v.clone())
                    .map_err(|e| Error::resource(format!("htod f32: {e}")))?;
                Ok(CudaStorage::F32(Arc::new(s)))
            }
            HostData::I32(v) => {
                let s = device
                    .dev
                    .htod_copy(v.clone())
                    .map_err(|e| Error::resource(format!("htod i32: {e}")))?;
                Ok(CudaStorage::I32(Arc::new(s)))
            }
        }
    }

    fn to_host(src: View<CudaStorage>, dtype: DType) -> Result<HostData> {
        match (src.storage, dtype) {
            (CudaStorage::F32(s), DType::F32) => {
                let view = s.slice(src.offset..src.offset + src.len);
                let v = s
                    .device()
                    .dtoh_sync_copy(&view)
                    .map_err(|e| Error::resource(format!("dtoh f32: {e}")))?;
                Ok(HostData::F32(v))
            }
            (CudaStorage::I32(s), DType::I32) => {
                let view = s.slice(src.offset..src.offset + src.len);
                let v = s
                    .device()
                    .dtoh_sync_copy(&view)
                    .map_err(|e| Error::resource(format!("dtoh i32: {e}")))?;
                Ok(HostData::I32(v))
            }
            (storage, expected) => Err(Error::DTypeMismatch {
                expected,
                got: storage.dtype(),
            }),
        }
    }

    fn htod_async(stream: &CudaStream, dst: View<CudaStorage>, data: HostData) -> Result<()> {
        if data.len() != dst.len {
            return Err(Error::msg(format!(
                "htod length mismatch: {} host elements into a view of {}",
                data.len(),
                dst.len
            )));
        }
        // The copy is enqueued on the stream; the host buffer is handed to
        // the waiter, which drops it only after the copy has completed.
        match (&data, dst.storage) {
            (HostData::F32(v), CudaStorage::F32(_)) => {
                let ptr = f32_ptr(&dst)?;
                unsafe { driver::memcpy_htod_async(ptr, v, stream.raw()) }
                    .map_err(|e| Error::resource(format!("htod async: {e}")))?;
            }
            (HostData::I32(v), CudaStorage::I32(s)) => {
                if dst.offset + dst.len > s.len() {
                    return Err(Error::msg("htod view out of bounds".to_string()));
                }
                let ptr = *s.device_ptr() + (dst.offset * std::mem::size_of::<i32>()) as u64;
                unsafe { driver::memcpy_htod_async(ptr, v, stream.raw()) }
                    .map_err(|e| Error::resource(format!("htod async: {e}")))?;
            }
            (host, storage) => {
                return Err(Error::DTypeMismatch {
                    expected: storage.dtype(),
                    got: host.dtype(),
                })
            }
        }
        stream.after_pending(Box::new(move || drop(data)))
    }

    fn dtoh_async(
        stream: &CudaStream,
        src: View<CudaStorage>,
        dtype: DType,
        done: TransferCallback,
    ) -> Result<()> {
        // Enqueue the copy into a host buffer on the stream itself, so later
        // device writes to the same region cannot race it. The Vec's heap
        // allocation is stable across the move into the waiter closure.
        match (src.storage, dtype) {
            (CudaStorage::F32(_), DType::F32) => {
                let ptr = f32_ptr(&src)?;
                let mut buf = vec![0f32; src.len];
                unsafe { driver::memcpy_dtoh_async(&mut buf, ptr, stream.raw()) }
                    .map_err(|e| Error::resource(format!("dtoh async: {e}")))?;
                stream.after_pending(Box::new(move || done(HostData::F32(buf))))
            }
            (CudaStorage::I32(s), DType::I32) => {
                if src.offset + src.len > s.len() {
                    return Err(Error::msg("dtoh view out of bounds".to_string()));
                }
                let ptr = *s.device_ptr() + (src.offset * std::mem::size_of::<i32>()) as u64;
                let mut buf = vec![0i32; src.len];
                unsafe { driver::memcpy_dtoh_async(&mut buf, ptr, stream.raw()) }
                    .map_err(|e| Error::resource(format!("dtoh async: {e}")))?;
                stream.after_pending(Box::new(move || done(HostData::I32(buf))))
            }
            (storage, expected) => Err(Error::DTypeMismatch {
                expected,
                got: storage.dtype(),
            }),
        }
    }

    fn copy(stream: &CudaStream, src: View<CudaStorage>, dst: View<CudaStorage>) -> Result<()> {
        check_same_len(&src, &dst)?;
        let src_ptr = f32_ptr(&src)?;
        let dst_ptr = f32_ptr(&dst)?;
        unsafe {
            driver::memcpy_dtod_async(
                dst_ptr,
                src_ptr,
                src.len * std::mem::size_of::<f32>(),
                stream.raw(),
            )
        }
        .map_err(|e| Error::resource(format!("dtod async: {e}")))
    }

    fn fill(stream: &CudaStream, dst: View<CudaStorage>, val: f32) -> Result<()> {
        let ptr = f32_ptr(&dst)?;
        let func = stream.dev.get_func("fill_f32")?;
        unsafe { func.launch_on_stream(&stream.cu, launch_cfg(dst.len), (ptr, val, dst.len as u32)) }
            .map_err(|e| launch_err("fill_f32", e))
    }

    fn scale(
        stream: &CudaStream,
        alpha: f32,
        src: View<CudaStorage>,
        dst: View<CudaStorage>,
    ) -> Result<()> {
        check_same_len(&src, &dst)?;
        let src_ptr = f32_ptr(&src)?;
        let dst_ptr = f32_ptr(&dst)?;
        let func = stream.dev.get_func("scale_f32")?;
        unsafe {
            func.launch_on_stream(
                &stream.cu,
                launch_cfg(dst.len),
                (src_ptr, dst_ptr, alpha, dst.len as u32),
            )
        }
        .map_err(|e| launch_err("scale_f32", e))
    }

    fn axpy(
        stream: &CudaStream,
        alpha: f32,
        x: View<CudaStorage>,
        y: View<CudaStorage>,
    ) -> Result<()> {
        check_same_len(&x, &y)?;
        let x_ptr = f32_ptr(&x)?;
        let y_ptr = f32_ptr(&y)?;
        let func = stream.dev.get_func("axpy_f32")?;
        unsafe {
            func.launch_on_stream(
                &stream.cu,
                launch_cfg(y.len),
                (x_ptr, y_ptr, alpha, y.len as u32),
            )
        }
        .map_err(|e| launch_err("axpy_f32", e))
    }

    fn hprod2(
        stream: &CudaStream,
        a: View<CudaStorage>,
        b: View<CudaStorage>,
        dst: View<CudaStorage>,
    ) -> Result<()> {
        check_same_len(&a, &dst)?;
        check_same_len(&b, &dst)?;
        let a_ptr = f32_ptr(&a)?;
        let b_ptr = f32_ptr(&b)?;
        let dst_ptr = f32_ptr(&dst)?;
        let func = stream.dev.get_func("hprod2_f32")?;
        unsafe {
            func.launch_on_stream(
                &stream.cu,
                launch_cfg(dst.len),
                (a_ptr, b_ptr, dst_ptr, dst.len as u32),
            )
        }
        .map_err(|e| launch_err("hprod2_f32", e))
    }

    fn hprod3(
        stream: &CudaStream,
        a: View<CudaStorage>,
        b: View<CudaStorage>,
        c: View<CudaStorage>,
        dst: View<CudaStorage>,
    ) -> Result<()> {
        check_same_len(&a, &dst)?;
        check_same_len(&b, &dst)?;
        check_same_len(&c, &dst)?;
        let a_ptr = f32_ptr(&a)?;
        let b_ptr = f32_ptr(&b)?;
        let c_ptr = f32_ptr(&c)?;
        let dst_ptr = f32_ptr(&dst)?;
        let func = stream.dev.get_func("hprod3_f32")?;
        unsafe {
            func.launch_on_stream(
                &stream.cu,
                launch_cfg(dst.len),
                (a_ptr, b_ptr, c_ptr, dst_ptr, dst.len as u32),
            )
        }
        .map_err(|e| launch_err("hprod3_f32", e))
    }

    fn add_hprod3(
        stream: &CudaStream,
        a: View<CudaStorage>,
        b: View<CudaStorage>,
        c: View<CudaStorage>,
        dst: View<CudaStorage>,
    ) -> Result<()> {
        check_same_len(&a, &dst)?;
        check_same_len(&b, &dst)?;
        check_same_len(&c, &dst)?;
        let a_ptr = f32_ptr(&a)?;
        let b_ptr = f32_ptr(&b)?;
        let c_ptr = f32_ptr(&c)?;
        let dst_ptr = f32_ptr(&dst)?;
        let func = stream.dev.get_func("add_hprod3_f32")?;
        unsafe {
            func.launch_on_stream(
                &stream.cu,
                launch_cfg(dst.len),
                (a_ptr, b_ptr, c_ptr, dst_ptr, dst.len as u32),
            )
        }
        .map_err(|e| launch_err("add_hprod3_f32", e))
    }

    fn add_hprod(
        stream: &CudaStream,
        a: View<CudaStorage>,
        b: View<CudaStorage>,
        alpha: f32,
        dst: View<CudaStorage>,
    ) -> Result<()> {
        check_same_len(&a, &dst)?;
        check_same_len(&b, &dst)?;
        let a_ptr = f32_ptr(&a)?;
        let b_ptr = f32_ptr(&b)?;
        let dst_ptr = f32_ptr(&dst)?;
        let func = stream.dev.get_func("add_hprod_f32")?;
        unsafe {
            func.launch_on_stream(
                &stream.cu,
                launch_cfg(dst.len),
                (a_ptr, b_ptr, alpha, dst_ptr, dst.len as u32),
            )
        }
        .map_err(|e| launch_err("add_hprod_f32", e))
    }

    fn sum_hprod4(
        stream: &CudaStream,
        a: View<CudaStorage>,
        b: View<CudaStorage>,
        c: View<CudaStorage>,
        d: View<CudaStorage>,
        dst: View<CudaStorage>,
    ) -> Result<()> {
        for v in [&a, &b, &c, &d] {
            check_same_len(v, &dst)?;
        }
        let a_ptr = f32_ptr(&a)?;
        let b_ptr = f32_ptr(&b)?;
        let c_ptr = f32_ptr(&c)?;
        let d_ptr = f32_ptr(&d)?;
        let dst_ptr = f32_ptr(&dst)?;
        let func = stream.dev.get_func("sum_hprod4_f32")?;
        unsafe {
            func.launch_on_stream(
                &stream.cu,
                launch_cfg(dst.len),
                (a_ptr, b_ptr, c_ptr, d_ptr, dst_ptr, dst.len as u32),
            )
        }
        .map_err(|e| launch_err("sum_hprod4_f32", e))
    }

    fn tanh(
        stream: &CudaStream,
        src: View<CudaStorage>,
        dst: View<CudaStorage>,
        der: Option<View<CudaStorage>>,
    ) -> Result<()> {
        check_same_len(&src, &dst)?;
        let src_ptr = f32_ptr(&src)?;
        let dst_ptr = f32_ptr(&dst)?;
        match der {
            None => {
                let func = stream.dev.get_func("tanh_f32")?;
                unsafe {
                    func.launch_on_stream(
                        &stream.cu,
                        launch_cfg(dst.len),
                        (src_ptr, dst_ptr, dst.len as u32),
                    )
                }
                .map_err(|e| launch_err("tanh_f32", e))
            }
            Some(der) => {
                check_same_len(&der, &dst)?;
                let der_ptr = f32_ptr(&der)?;
                let func = stream.dev.get_func("tanh_der_f32")?;
                unsafe {
                    func.launch_on_stream(
                        &stream.cu,
                        launch_cfg(dst.len),
                        (src_ptr, dst_ptr, der_ptr, dst.len as u32),
                    )
                }
                .map_err(|e| launch_err("tanh_der_f32", e))
            }
        }
    }

    fn sigmoid(
        stream: &CudaStream,
        src: View<CudaStorage>,
        dst: View<CudaStorage>,
        der: Option<View<CudaStorage>>,
    ) -> Result<()> {
        check_same_len(&src, &dst)?;
        let src_ptr = f32_ptr(&src)?;
        let dst_ptr = f32_ptr(&dst)?;
        match der {
            None => {
                let func = stream.dev.get_func("sigmoid_f32")?;
                unsafe {
                    func.launch_on_stream(
                        &stream.cu,
                        launch_cfg(dst.len),
                        (src_ptr, dst_ptr, dst.len as u32),
                    )
                }
                .map_err(|e| launch_err("sigmoid_f32", e))
            }
            Some(der) => {
                check_same_len(&der, &dst)?;
                let der_ptr = f32_ptr(&der)?;
                let func = stream.dev.get_func("sigmoid_der_f32")?;
                unsafe {
                    func.launch_on_stream(
                        &stream.cu,
                        launch_cfg(dst.len),
                        (src_ptr, dst_ptr, der_ptr, dst.len as u32),
                    )
                }
                .map_err(|e| launch_err("sigmoid_der_f32", e))
            }
        }
    }

    fn tanh_sigm(
        stream: &CudaStream,
        src: View<CudaStorage>,
        dst: View<CudaStorage>,
        der: Option<View<CudaStorage>>,
        split: usize,
    ) -> Result<()> {
        check_same_len(&src, &dst)?;
        if split > dst.len {
            return Err(Error::msg(format!(
                "tanh_sigm split {split} exceeds {} elements",
                dst.len
            )));
        }
        let src_ptr = f32_ptr(&src)?;
        let dst_ptr = f32_ptr(&dst)?;
        match der {
            None => {
                let func = stream.dev.get_func("tanh_sigm_f32")?;
                unsafe {
                    func.launch_on_stream(
                        &stream.cu,
                        launch_cfg(dst.len),
                        (src_ptr, dst_ptr, split as u32, dst.len as u32),
                    )
                }
                .map_err(|e| launch_err("tanh_sigm_f32", e))
            }
            Some(der) => {
                check_same_len(&der, &dst)?;
                let der_ptr = f32_ptr(&der)?;
                let func = stream.dev.get_func("tanh_sigm_der_f32")?;
                unsafe {
                    func.launch_on_stream(
                        &stream.cu,
                        launch_cfg(dst.len),
                        (src_ptr, dst_ptr, der_ptr, split as u32, dst.len as u32),
                    )
                }
                .map_err(|e| launch_err("tanh_sigm_der_f32", e))
            }
        }
    }

    fn hprod_col(
        stream: &CudaStream,
        mask: View<CudaStorage>,
        dst: View<CudaStorage>,
    ) -> Result<()> {
        if mask.len == 0 || dst.len % mask.len != 0 {
            return Err(Error::msg(format!(
                "hprod_col: {} elements not a multiple of mask length {}",
                dst.len, mask.len
            )));
        }
        let mask_ptr = f32_ptr(&mask)?;
        let dst_ptr = f32_ptr(&dst)?;
        let func = stream.dev.get_func("hprod_col_f32")?;
        unsafe {
            func.launch_on_stream(
                &stream.cu,
                launch_cfg(dst.len),
                (mask_ptr, dst_ptr, mask.len as u32, dst.len as u32),
            )
        }
        .map_err(|e| launch_err("hprod_col_f32", e))
    }

    #[allow(clippy::too_many_arguments)]
    fn gemm(
        stream: &CudaStream,
        trans_a: Trans,
        trans_b: Trans,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: View<CudaStorage>,
        lda: usize,
        b: View<CudaStorage>,
        ldb: usize,
        beta: f32,
        c: View<CudaStorage>,
        ldc: usize,
    ) -> Result<()> {
        let a_ptr = f32_ptr(&a)? as *const f32;
        let b_ptr = f32_ptr(&b)? as *const f32;
        let c_ptr = f32_ptr(&c)? as *mut f32;
        let op = |t: Trans| match t {
            Trans::N => cublasOperation_t::CUBLAS_OP_N,
            Trans::T => cublasOperation_t::CUBLAS_OP_T,
        };
        unsafe {
            cublas::sgemm(
                *stream.blas.handle(),
                op(trans_a),
                op(trans_b),
                m as i32,
                n as i32,
                k as i32,
                (&alpha) as *const f32,
                a_ptr,
                lda as i32,
                b_ptr,
                ldb as i32,
                (&beta) as *const f32,
                c_ptr,
                ldc as i32,
            )
        }
        .map_err(|e| Error::resource(format!("cuBLAS sgemm: {e}")))
    }
}
