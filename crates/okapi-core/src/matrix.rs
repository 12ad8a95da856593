use crate::backend::{Backend, Trans, View};
use crate::bail;
use crate::context::Context;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use std::ops::Range;

// Matrix — 2-D, column-major device buffer
//
// The engine is built from explicit matrix primitives, not a general tensor
// abstraction. A Matrix is a rectangular block of device memory with a fixed
// column-major layout. Column views alias the owner's storage without owning
// it; because storage handles are reference-counted by the backend, a view
// can never outlive the allocation it points into.
//
// Every arithmetic op takes a Context and is QUEUED on its stream — nothing
// here executes synchronously except the explicit host-transfer calls.

/// Host-side element data for transfers, column-major.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl HostData {
    pub fn dtype(&self) -> DType {
        match self {
            HostData::F32(_) => DType::F32,
            HostData::I32(_) => DType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostData::F32(v) => v.len(),
            HostData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow as f32, failing on integer data.
    pub fn as_f32(&self) -> Result<&[f32]> {
        match self {
            HostData::F32(v) => Ok(v),
            HostData::I32(_) => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: DType::I32,
            }),
        }
    }

    pub fn as_i32(&self) -> Result<&[i32]> {
        match self {
            HostData::I32(v) => Ok(v),
            HostData::F32(_) => Err(Error::DTypeMismatch {
                expected: DType::I32,
                got: DType::F32,
            }),
        }
    }
}

/// A 2-D host array with column-major layout, the unit of host transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct HostMatrix {
    nrows: usize,
    ncols: usize,
    data: HostData,
}

impl HostMatrix {
    /// Build from column-major data of any supported element type; the dtype
    /// is derived from `T`. Fails if the element count does not match the
    /// shape.
    pub fn from_vec<T: WithDType>(nrows: usize, ncols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != nrows * ncols {
            bail!(
                "host matrix: {}x{} needs {} elements, got {}",
                nrows,
                ncols,
                nrows * ncols,
                data.len()
            );
        }
        Ok(HostMatrix {
            nrows,
            ncols,
            data: T::wrap(data),
        })
    }

    /// Build from column-major f32 data.
    pub fn from_f32(nrows: usize, ncols: usize, data: Vec<f32>) -> Result<Self> {
        Self::from_vec(nrows, ncols, data)
    }

    /// Build from column-major i32 data.
    pub fn from_i32(nrows: usize, ncols: usize, data: Vec<i32>) -> Result<Self> {
        Self::from_vec(nrows, ncols, data)
    }

    /// An all-`val` f32 matrix.
    pub fn full(nrows: usize, ncols: usize, val: f32) -> Self {
        HostMatrix {
            nrows,
            ncols,
            data: HostData::F32(vec![val; nrows * ncols]),
        }
    }

    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self::full(nrows, ncols, 0.0)
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn data(&self) -> &HostData {
        &self.data
    }

    pub fn into_data(self) -> HostData {
        self.data
    }

    /// Element accessor (f32 matrices), column-major indexing.
    pub fn get(&self, row: usize, col: usize) -> Result<f32> {
        let v = self.data.as_f32()?;
        if row >= self.nrows || col >= self.ncols {
            bail!(
                "host matrix index ({row}, {col}) out of bounds for {}x{}",
                self.nrows,
                self.ncols
            );
        }
        Ok(v[col * self.nrows + row])
    }
}

/// A matrix on a backend device: shape, element type, and a (possibly
/// aliasing) region of device storage.
pub struct Matrix<B: Backend> {
    storage: B::Storage,
    device: B::Device,
    nrows: usize,
    ncols: usize,
    /// Element offset of column 0 within the storage allocation.
    offset: usize,
    dtype: DType,
    /// True for the allocating matrix, false for column views. Metadata
    /// only — the storage handle keeps the allocation alive either way.
    is_owner: bool,
}

impl<B: Backend> Clone for Matrix<B> {
    fn clone(&self) -> Self {
        Matrix {
            storage: self.storage.clone(),
            device: self.device.clone(),
            nrows: self.nrows,
            ncols: self.ncols,
            offset: self.offset,
            dtype: self.dtype,
            is_owner: self.is_owner,
        }
    }
}

impl<B: Backend> std::fmt::Debug for Matrix<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Matrix({}x{}, {}, {})",
            self.nrows,
            self.ncols,
            self.dtype,
            if self.is_owner { "owner" } else { "view" }
        )
    }
}

impl<B: Backend> Matrix<B> {
    //  Allocation

    /// Allocate an uninitialized `nrows` x `ncols` matrix.
    pub fn empty(nrows: usize, ncols: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let storage = B::alloc(nrows * ncols, dtype, device)?;
        Ok(Matrix {
            storage,
            device: device.clone(),
            nrows,
            ncols,
            offset: 0,
            dtype,
            is_owner: true,
        })
    }

    /// Allocate an uninitialized matrix with the same shape/dtype as `other`.
    pub fn empty_like(other: &Matrix<B>) -> Result<Self> {
        Self::empty(other.nrows, other.ncols, other.dtype, &other.device)
    }

    /// Allocate and synchronously upload a host matrix.
    pub fn from_host(host: &HostMatrix, device: &B::Device) -> Result<Self> {
        let storage = B::from_host(host.data(), device)?;
        Ok(Matrix {
            storage,
            device: device.clone(),
            nrows: host.nrows(),
            ncols: host.ncols(),
            offset: 0,
            dtype: host.dtype(),
            is_owner: true,
        })
    }

    //  Introspection

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nelems(&self) -> usize {
        self.nrows * self.ncols
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn same_shape(&self, other: &Matrix<B>) -> bool {
        self.nrows == other.nrows && self.ncols == other.ncols
    }

    /// The backend view of this matrix's storage region.
    pub fn region(&self) -> View<'_, B::Storage> {
        View::new(&self.storage, self.offset, self.nelems())
    }

    /// A non-owning alias of the whole matrix (same region, `is_owner` off).
    /// This is what Connectors hand to consumers.
    pub fn alias(&self) -> Matrix<B> {
        let mut m = self.clone();
        m.is_owner = false;
        m
    }

    //  Slicing

    /// A non-owning view over a contiguous range of whole columns. This is
    /// the only supported slice pattern: storage is column-major, so a
    /// column range is one contiguous region.
    pub fn columns(&self, range: Range<usize>) -> Result<Matrix<B>> {
        if range.start >= range.end || range.end > self.ncols {
            return Err(Error::UnsupportedSlice(format!(
                "columns {}..{} of a {}x{} matrix",
                range.start, range.end, self.nrows, self.ncols
            )));
        }
        Ok(Matrix {
            storage: self.storage.clone(),
            device: self.device.clone(),
            nrows: self.nrows,
            ncols: range.end - range.start,
            offset: self.offset + range.start * self.nrows,
            dtype: self.dtype,
            is_owner: false,
        })
    }

    /// A single-column view.
    pub fn column(&self, col: usize) -> Result<Matrix<B>> {
        self.columns(col..col + 1)
    }

    /// Row slicing is explicitly unsupported: a row range is strided in
    /// column-major storage. Fails fast so callers never build on it.
    pub fn rows(&self, range: Range<usize>) -> Result<Matrix<B>> {
        Err(Error::UnsupportedSlice(format!(
            "rows {}..{} (row slices are strided in column-major storage)",
            range.start, range.end
        )))
    }

    //  Validation helpers

    fn check_f32(&self) -> Result<()> {
        if self.dtype != DType::F32 {
            return Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: self.dtype,
            });
        }
        Ok(())
    }

    fn check_same_shape(&self, other: &Matrix<B>) -> Result<()> {
        if !self.same_shape(other) {
            return Err(Error::ShapeMismatch {
                expected_rows: self.nrows,
                expected_cols: self.ncols,
                got_rows: other.nrows,
                got_cols: other.ncols,
            });
        }
        Ok(())
    }

    //  Fill / copy

    /// Queue: self[i] = val.
    pub fn fill(&self, ctx: &Context<B>, val: f32) -> Result<()> {
        self.check_f32()?;
        B::fill(ctx.stream(), self.region(), val)
    }

    /// Fill and block until the write has landed. Used at construction time
    /// (e.g. the zero boundary state of a recurrent block) so later streams
    /// need no ordering edge against it.
    pub fn sync_fill(&self, ctx: &Context<B>, val: f32) -> Result<()> {
        self.fill(ctx, val)?;
        ctx.synchronize()
    }

    /// Queue: self = src (same shape, f32).
    pub fn copy_from(&self, ctx: &Context<B>, src: &Matrix<B>) -> Result<()> {
        self.check_f32()?;
        src.check_f32()?;
        self.check_same_shape(src)?;
        B::copy(ctx.stream(), src.region(), self.region())
    }

    //  Elementwise arithmetic (all queued)

    /// Queue: self *= alpha.
    pub fn scale(&self, ctx: &Context<B>, alpha: f32) -> Result<()> {
        self.check_f32()?;
        B::scale(ctx.stream(), alpha, self.region(), self.region())
    }

    /// Queue: self += alpha * a.
    pub fn add_scaled(&self, ctx: &Context<B>, alpha: f32, a: &Matrix<B>) -> Result<()> {
        self.check_f32()?;
        a.check_f32()?;
        self.check_same_shape(a)?;
        B::axpy(ctx.stream(), alpha, a.region(), self.region())
    }

    /// Queue: self += a.
    pub fn add(&self, ctx: &Context<B>, a: &Matrix<B>) -> Result<()> {
        self.add_scaled(ctx, 1.0, a)
    }

    /// Queue: self = a .* b.
    pub fn assign_hprod(&self, ctx: &Context<B>, a: &Matrix<B>, b: &Matrix<B>) -> Result<()> {
        self.check_f32()?;
        self.check_same_shape(a)?;
        self.check_same_shape(b)?;
        B::hprod2(ctx.stream(), a.region(), b.region(), self.region())
    }

    /// Queue: self = a .* b .* c.
    pub fn assign_hprod3(
        &self,
        ctx: &Context<B>,
        a: &Matrix<B>,
        b: &Matrix<B>,
        c: &Matrix<B>,
    ) -> Result<()> {
        self.check_f32()?;
        self.check_same_shape(a)?;
        self.check_same_shape(b)?;
        self.check_same_shape(c)?;
        B::hprod3(ctx.stream(), a.region(), b.region(), c.region(), self.region())
    }

    /// Queue: self = a .* b + self.
    pub fn add_hprod(&self, ctx: &Context<B>, a: &Matrix<B>, b: &Matrix<B>) -> Result<()> {
        self.check_f32()?;
        self.check_same_shape(a)?;
        self.check_same_shape(b)?;
        B::add_hprod(ctx.stream(), a.region(), b.region(), 1.0, self.region())
    }

    /// Queue: self += a .* b .* c.
    pub fn add_hprod3(
        &self,
        ctx: &Context<B>,
        a: &Matrix<B>,
        b: &Matrix<B>,
        c: &Matrix<B>,
    ) -> Result<()> {
        self.check_f32()?;
        self.check_same_shape(a)?;
        self.check_same_shape(b)?;
        self.check_same_shape(c)?;
        B::add_hprod3(ctx.stream(), a.region(), b.region(), c.region(), self.region())
    }

    /// Queue: self = a .* b + c .* d (the cell-state update shape).
    pub fn assign_sum_hprod(
        &self,
        ctx: &Context<B>,
        a: &Matrix<B>,
        b: &Matrix<B>,
        c: &Matrix<B>,
        d: &Matrix<B>,
    ) -> Result<()> {
        self.check_f32()?;
        for m in [a, b, c, d] {
            self.check_same_shape(m)?;
        }
        B::sum_hprod4(
            ctx.stream(),
            a.region(),
            b.region(),
            c.region(),
            d.region(),
            self.region(),
        )
    }

    /// Queue: self[:, j] *= mask[:] for every column j. `mask` must be a
    /// single column with this matrix's row count.
    pub fn hprod_col(&self, ctx: &Context<B>, mask: &Matrix<B>) -> Result<()> {
        self.check_f32()?;
        mask.check_f32()?;
        if mask.ncols != 1 || mask.nrows != self.nrows {
            return Err(Error::ShapeMismatch {
                expected_rows: self.nrows,
                expected_cols: 1,
                got_rows: mask.nrows,
                got_cols: mask.ncols,
            });
        }
        B::hprod_col(ctx.stream(), mask.region(), self.region())
    }

    //  Nonlinearities (with optional derivative capture)

    /// Queue: out = tanh(self); if `der` is given, der = 1 - out^2.
    pub fn tanh(&self, ctx: &Context<B>, out: &Matrix<B>, der: Option<&Matrix<B>>) -> Result<()> {
        self.check_f32()?;
        self.check_same_shape(out)?;
        if let Some(d) = der {
            self.check_same_shape(d)?;
        }
        B::tanh(
            ctx.stream(),
            self.region(),
            out.region(),
            der.map(|d| d.region()),
        )
    }

    /// Queue: out = sigmoid(self); if `der` is given, der = out .* (1 - out).
    pub fn sigmoid(
        &self,
        ctx: &Context<B>,
        out: &Matrix<B>,
        der: Option<&Matrix<B>>,
    ) -> Result<()> {
        self.check_f32()?;
        self.check_same_shape(out)?;
        if let Some(d) = der {
            self.check_same_shape(d)?;
        }
        B::sigmoid(
            ctx.stream(),
            self.region(),
            out.region(),
            der.map(|d| d.region()),
        )
    }

    /// Queue the fused gate nonlinearity: tanh over the first `tanh_ncols`
    /// columns, sigmoid over the rest. `out` (and `der`) may alias `self`
    /// for the in-place gate update.
    pub fn tanh_sigm(
        &self,
        ctx: &Context<B>,
        out: &Matrix<B>,
        der: Option<&Matrix<B>>,
        tanh_ncols: usize,
    ) -> Result<()> {
        self.check_f32()?;
        self.check_same_shape(out)?;
        if let Some(d) = der {
            self.check_same_shape(d)?;
        }
        if tanh_ncols > self.ncols {
            bail!(
                "tanh_sigm split at column {} exceeds {} columns",
                tanh_ncols,
                self.ncols
            );
        }
        B::tanh_sigm(
            ctx.stream(),
            self.region(),
            out.region(),
            der.map(|d| d.region()),
            tanh_ncols * self.nrows,
        )
    }

    //  Gemm

    /// Queue: self = op(a) * op(b).
    pub fn assign_dot(
        &self,
        ctx: &Context<B>,
        a: &Matrix<B>,
        b: &Matrix<B>,
        trans_a: Trans,
        trans_b: Trans,
    ) -> Result<()> {
        self.dot(ctx, a, b, trans_a, trans_b, 1.0, 0.0)
    }

    /// Queue: self += op(a) * op(b).
    pub fn add_dot(
        &self,
        ctx: &Context<B>,
        a: &Matrix<B>,
        b: &Matrix<B>,
        trans_a: Trans,
        trans_b: Trans,
    ) -> Result<()> {
        self.dot(ctx, a, b, trans_a, trans_b, 1.0, 1.0)
    }

    /// Queue: self = alpha * op(a) * op(b) + beta * self.
    pub fn dot(
        &self,
        ctx: &Context<B>,
        a: &Matrix<B>,
        b: &Matrix<B>,
        trans_a: Trans,
        trans_b: Trans,
        alpha: f32,
        beta: f32,
    ) -> Result<()> {
        self.check_f32()?;
        a.check_f32()?;
        b.check_f32()?;

        let (a_rows, a_cols) = match trans_a {
            Trans::N => (a.nrows, a.ncols),
            Trans::T => (a.ncols, a.nrows),
        };
        let (b_rows, b_cols) = match trans_b {
            Trans::N => (b.nrows, b.ncols),
            Trans::T => (b.ncols, b.nrows),
        };
        if a_cols != b_rows {
            return Err(Error::GemmShapeMismatch {
                m: a_rows,
                k1: a_cols,
                k2: b_rows,
                n: b_cols,
            });
        }
        if a_rows != self.nrows || b_cols != self.ncols {
            return Err(Error::ShapeMismatch {
                expected_rows: self.nrows,
                expected_cols: self.ncols,
                got_rows: a_rows,
                got_cols: b_cols,
            });
        }

        B::gemm(
            ctx.stream(),
            trans_a,
            trans_b,
            self.nrows,
            self.ncols,
            a_cols,
            alpha,
            a.region(),
            a.nrows,
            b.region(),
            b.nrows,
            beta,
            self.region(),
            self.nrows,
        )
    }

    //  Horizontal stacking

    /// Queue: copy each part's full column range into disjoint column ranges
    /// of `self`, in input order. Fails if row counts differ or the widths
    /// don't add up.
    pub fn assign_hstack(&self, ctx: &Context<B>, parts: &[&Matrix<B>]) -> Result<()> {
        self.check_f32()?;
        let total: usize = parts.iter().map(|p| p.ncols).sum();
        if total != self.ncols {
            return Err(Error::ShapeMismatch {
                expected_rows: self.nrows,
                expected_cols: self.ncols,
                got_rows: self.nrows,
                got_cols: total,
            });
        }
        let mut col = 0;
        for part in parts {
            part.check_f32()?;
            if part.nrows != self.nrows {
                return Err(Error::ShapeMismatch {
                    expected_rows: self.nrows,
                    expected_cols: part.ncols,
                    got_rows: part.nrows,
                    got_cols: part.ncols,
                });
            }
            let dst = self.columns(col..col + part.ncols)?;
            dst.copy_from(ctx, part)?;
            col += part.ncols;
        }
        Ok(())
    }

    //  Host transfer

    /// Synchronous copy to host: drains `ctx`, then reads the region.
    /// `ctx` must be the stream (or a stream ordered after the stream) that
    /// last wrote this matrix.
    pub fn to_host(&self, ctx: &Context<B>) -> Result<HostMatrix> {
        ctx.synchronize()?;
        let data = B::to_host(self.region(), self.dtype)?;
        Ok(match data {
            HostData::F32(v) => HostMatrix::from_f32(self.nrows, self.ncols, v)?,
            HostData::I32(v) => HostMatrix::from_i32(self.nrows, self.ncols, v)?,
        })
    }

    /// Stream-ordered copy to host: `done` runs on the host with the data
    /// once the transfer (and all work queued before it on `ctx`) completes.
    /// Never blocks the caller or other contexts.
    pub fn to_host_async(
        &self,
        ctx: &Context<B>,
        done: impl FnOnce(HostMatrix) + Send + 'static,
    ) -> Result<()> {
        let nrows = self.nrows;
        let ncols = self.ncols;
        B::dtoh_async(
            ctx.stream(),
            self.region(),
            self.dtype,
            Box::new(move |data| {
                let host = match data {
                    HostData::F32(v) => HostMatrix::from_f32(nrows, ncols, v),
                    HostData::I32(v) => HostMatrix::from_i32(nrows, ncols, v),
                };
                // Shapes were taken from the source matrix; this cannot fail.
                if let Ok(host) = host {
                    done(host);
                }
            }),
        )
    }

    /// Stream-ordered copy from host. Shape and dtype must match exactly.
    pub fn to_device_async(&self, ctx: &Context<B>, host: &HostMatrix) -> Result<()> {
        if host.dtype() != self.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: host.dtype(),
            });
        }
        if host.nrows() != self.nrows || host.ncols() != self.ncols {
            return Err(Error::ShapeMismatch {
                expected_rows: self.nrows,
                expected_cols: self.ncols,
                got_rows: host.nrows(),
                got_cols: host.ncols(),
            });
        }
        B::htod_async(ctx.stream(), self.region(), host.data().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_matrix_shape_check() {
        assert!(HostMatrix::from_f32(2, 3, vec![0.0; 6]).is_ok());
        assert!(HostMatrix::from_f32(2, 3, vec![0.0; 5]).is_err());
    }

    #[test]
    fn host_matrix_dtype_follows_element_type() -> Result<()> {
        assert_eq!(HostMatrix::from_vec(2, 1, vec![0.0f32; 2])?.dtype(), DType::F32);
        assert_eq!(HostMatrix::from_vec(2, 1, vec![0i32; 2])?.dtype(), DType::I32);
        Ok(())
    }

    #[test]
    fn host_matrix_col_major_get() -> Result<()> {
        // [[1, 3], [2, 4]] stored column-major as [1, 2, 3, 4]
        let m = HostMatrix::from_f32(2, 2, vec![1.0, 2.0, 3.0, 4.0])?;
        assert_eq!(m.get(0, 0)?, 1.0);
        assert_eq!(m.get(1, 0)?, 2.0);
        assert_eq!(m.get(0, 1)?, 3.0);
        assert_eq!(m.get(1, 1)?, 4.0);
        Ok(())
    }
}
