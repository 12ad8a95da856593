// CUDA kernel source, compiled to PTX via NVRTC when a device is created.
//
// The engine only ever computes in f32 (i32 matrices are transfer-only), and
// every operand is a contiguous column-major range, so each kernel is a flat
// elementwise loop. Matrix multiplication goes through cuBLAS, not a kernel
// here. Buffers are passed as raw device pointers because storage handles are
// reference-counted and views are (pointer, offset, length) triples.

pub const MODULE_NAME: &str = "okapi";

pub const KERNEL_NAMES: &[&str] = &[
    "fill_f32",
    "scale_f32",
    "axpy_f32",
    "hprod2_f32",
    "hprod3_f32",
    "add_hprod_f32",
    "add_hprod3_f32",
    "sum_hprod4_f32",
    "tanh_f32",
    "tanh_der_f32",
    "sigmoid_f32",
    "sigmoid_der_f32",
    "tanh_sigm_f32",
    "tanh_sigm_der_f32",
    "hprod_col_f32",
];

pub const KERNEL_SOURCE: &str = r#"

extern "C" __global__ void fill_f32(float* out, float val, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) out[idx] = val;
}

// out may alias src.
extern "C" __global__ void scale_f32(const float* src, float* out, float alpha, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) out[idx] = alpha * src[idx];
}

extern "C" __global__ void axpy_f32(const float* x, float* y, float alpha, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) y[idx] += alpha * x[idx];
}

extern "C" __global__ void hprod2_f32(const float* a, const float* b, float* out, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) out[idx] = a[idx] * b[idx];
}

extern "C" __global__ void hprod3_f32(const float* a, const float* b, const float* c, float* out, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) out[idx] = a[idx] * b[idx] * c[idx];
}

// out = a .* b + alpha * out
extern "C" __global__ void add_hprod_f32(const float* a, const float* b, float alpha, float* out, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) out[idx] = a[idx] * b[idx] + alpha * out[idx];
}

// out += a .* b .* c
extern "C" __global__ void add_hprod3_f32(const float* a, const float* b, const float* c, float* out, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) out[idx] += a[idx] * b[idx] * c[idx];
}

// out = a .* b + c .* d
extern "C" __global__ void sum_hprod4_f32(const float* a, const float* b, const float* c, const float* d, float* out, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) out[idx] = a[idx] * b[idx] + c[idx] * d[idx];
}

extern "C" __global__ void tanh_f32(const float* src, float* out, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) out[idx] = tanhf(src[idx]);
}

// der = 1 - tanh(src)^2; out may alias src, so compute before storing.
extern "C" __global__ void tanh_der_f32(const float* src, float* out, float* der, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) {
        float t = tanhf(src[idx]);
        out[idx] = t;
        der[idx] = 1.0f - t * t;
    }
}

extern "C" __global__ void sigmoid_f32(const float* src, float* out, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) out[idx] = 1.0f / (1.0f + expf(-src[idx]));
}

extern "C" __global__ void sigmoid_der_f32(const float* src, float* out, float* der, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) {
        float s = 1.0f / (1.0f + expf(-src[idx]));
        out[idx] = s;
        der[idx] = s * (1.0f - s);
    }
}

// Fused gate nonlinearity: tanh on [0, split), sigmoid on [split, n).
extern "C" __global__ void tanh_sigm_f32(const float* src, float* out, unsigned int split, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= n) return;
    if (idx < split) {
        out[idx] = tanhf(src[idx]);
    } else {
        out[idx] = 1.0f / (1.0f + expf(-src[idx]));
    }
}

extern "C" __global__ void tanh_sigm_der_f32(const float* src, float* out, float* der, unsigned int split, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= n) return;
    if (idx < split) {
        float t = tanhf(src[idx]);
        out[idx] = t;
        der[idx] = 1.0f - t * t;
    } else {
        float s = 1.0f / (1.0f + expf(-src[idx]));
        out[idx] = s;
        der[idx] = s * (1.0f - s);
    }
}

// Broadcast a column over a column-major matrix: out[:, j] *= mask[:].
extern "C" __global__ void hprod_col_f32(const float* mask, float* out, unsigned int nrows, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) out[idx] *= mask[idx % nrows];
}

"#;
